use std::collections::{BTreeSet, VecDeque};

use super::*;
use crate::agent::{MovementTask, TaskKind};
use crate::observer_stream::tolerance_cells;
use crate::orgs::KIND_CITY;
use crate::spatial::{dist_xz, CARDINALS};

/// Search depth of the detour fallback.
const DETOUR_MAX_DEPTH: usize = 16;
/// Law reputation below which non-members may not enter a city core.
const WANTED_REP_LAW: i32 = 200;

impl World {
    pub(super) fn system_movement(&mut self, now: u64) {
        for agent_id in self.agent_ids() {
            self.with_agent(&agent_id, |world, agent| world.move_agent(agent, now));
        }
    }

    fn move_agent(&mut self, agent: &mut Agent, now: u64) {
        let Some(task) = agent.move_task.clone() else {
            return;
        };
        let target = match task.kind {
            TaskKind::MoveTo => {
                if dist_xz(agent.pos, task.target) <= tolerance_cells(task.tolerance) {
                    agent.move_task = None;
                    self.record_structure_usage(&agent.id, agent.pos, now);
                    self.fun_on_biome(agent, now);
                    agent.add_event(task_done(now, &task.task_id, task.kind.as_str()));
                    return;
                }
                task.target
            }
            TaskKind::Follow => {
                let Some(target) = self.follow_target_pos(&task.target_id) else {
                    agent.move_task = None;
                    agent.add_event(task_fail(now, &task.task_id, ErrorCode::InvalidTarget, "follow target not found"));
                    return;
                };
                if let Some(slot) = agent.move_task.as_mut() {
                    slot.target = target;
                }
                if dist_xz(agent.pos, target) <= tolerance_cells(task.distance) {
                    return;
                }
                target
            }
            _ => return,
        };

        if self.movement_slowed(agent.pos, now) {
            return;
        }
        if agent.stamina_milli < MOVE_STAMINA_COST {
            return;
        }
        agent.stamina_milli -= MOVE_STAMINA_COST;

        let next = self.next_step(agent.pos, target);
        if let Err((code, message)) = self.check_entry(agent, now, &task, next) {
            agent.move_task = None;
            if code != ErrorCode::Blocked {
                self.stats.denied += 1;
            }
            agent.add_event(task_fail(now, &task.task_id, code, message));
            return;
        }
        agent.pos = next;
        self.record_structure_usage(&agent.id, agent.pos, now);
        self.fun_on_biome(agent, now);
    }

    /// Storms skip every other tick; an active flood skips one tick in three
    /// inside its radius.
    fn movement_slowed(&self, pos: Vec3i, now: u64) -> bool {
        if self.weather == Weather::Storm && now % 2 == 0 {
            return true;
        }
        match &self.active_event {
            Some(ev) if ev.event_id == "FLOOD_WARNING" && ev.radius > 0 && now < ev.ends_tick => {
                dist_xz(pos, ev.center) <= ev.radius && now % 3 == 1
            }
            _ => false,
        }
    }

    /// One cell toward `target`: primary axis, then the secondary axis when the
    /// primary cell is solid, then a bounded detour search.
    fn next_step(&self, from: Vec3i, target: Vec3i) -> Vec3i {
        let dx = (target.x - from.x).signum();
        let dz = (target.z - from.z).signum();
        let primary_x = (target.x - from.x).abs() >= (target.z - from.z).abs();
        let (primary, secondary) = if primary_x {
            (from.offset(dx, 0), from.offset(0, dz))
        } else {
            (from.offset(0, dz), from.offset(dx, 0))
        };
        if !self.is_solid_at(primary) {
            return primary;
        }
        if secondary != from && !self.is_solid_at(secondary) {
            return secondary;
        }
        detour_step(
            from,
            target,
            DETOUR_MAX_DEPTH,
            |p| self.chunks.in_bounds(p),
            |p| self.is_solid_at(p),
        )
        .unwrap_or(primary)
    }

    /// Entry rules for `next`: city-core wanted check, access-pass ticket and
    /// solidity. Charges the ticket when entry succeeds.
    fn check_entry(&mut self, agent: &mut Agent, now: u64, task: &MovementTask, next: Vec3i) -> Result<(), Rejection> {
        let core_radius = self.cfg.access_pass_core_radius;
        if let Some(land) = self.land_at(next) {
            let entering_core = land.core_contains(next, core_radius)
                && !self.is_land_member(&agent.id, land)
                && self
                    .land_at(agent.pos)
                    .map(|from| from.land_id != land.land_id || !land.core_contains(agent.pos, core_radius))
                    .unwrap_or(true);
            if entering_core {
                let city = self
                    .orgs
                    .get(&land.owner)
                    .is_some_and(|org| org.kind == KIND_CITY);
                if city && agent.rep_law > 0 && agent.rep_law < WANTED_REP_LAW {
                    return Err((ErrorCode::NoPermission, "wanted: law reputation too low"));
                }
                if land.access_pass_enabled {
                    let item = land.access_ticket_item.trim().to_string();
                    let cost = land.access_ticket_cost;
                    let land_id = land.land_id.clone();
                    let owner = land.owner.clone();
                    if item.is_empty() || cost <= 0 {
                        return Err((ErrorCode::NoPermission, "access pass required"));
                    }
                    if agent.count(&item) < cost {
                        return Err((ErrorCode::NoResource, "need access ticket"));
                    }
                    if self.is_solid_at(next) {
                        return Err((ErrorCode::Blocked, "blocked"));
                    }
                    agent.take_item(&item, cost);
                    self.credit_owner(&owner, &item, cost);
                    tracing::trace!(world_id = %self.cfg.world_id, agent_id = %agent.id, task_id = %task.task_id, %land_id, "access pass charged");
                    agent.add_event(event(
                        now,
                        "ACCESS_PASS",
                        json!({"land_id": land_id, "item": item, "count": cost}),
                    ));
                    return Ok(());
                }
            }
        }
        if self.is_solid_at(next) {
            return Err((ErrorCode::Blocked, "blocked"));
        }
        Ok(())
    }
}

/// Breadth-first search over passable 4-neighbours up to `max_depth` steps.
/// Returns the first step of the path reaching the cell closest to `target`
/// (ties: shallower, then smaller x, then smaller z), provided that cell is
/// strictly closer than `start`.
pub(super) fn detour_step(
    start: Vec3i,
    target: Vec3i,
    max_depth: usize,
    in_bounds: impl Fn(Vec3i) -> bool,
    solid: impl Fn(Vec3i) -> bool,
) -> Option<Vec3i> {
    if max_depth == 0 {
        return None;
    }
    let start = Vec3i::new(start.x, 0, start.z);
    let target = Vec3i::new(target.x, 0, target.z);
    let start_dist = dist_xz(start, target);
    let passable = |p: Vec3i| in_bounds(p) && !solid(p);

    let mut visited = BTreeSet::from([start]);
    let mut queue = VecDeque::new();
    for (dx, dz) in CARDINALS {
        let p = start.offset(dx, dz);
        if passable(p) && visited.insert(p) {
            queue.push_back((p, 1usize, p));
        }
    }

    let mut best: Option<(i32, usize, Vec3i)> = None;
    while let Some((p, depth, first)) = queue.pop_front() {
        let d = dist_xz(p, target);
        if d < start_dist {
            let better = match best {
                None => true,
                Some((bd, bdepth, bfirst)) => {
                    (d, depth, first.x, first.z) < (bd, bdepth, bfirst.x, bfirst.z)
                }
            };
            if better {
                best = Some((d, depth, first));
            }
        }
        if depth >= max_depth {
            continue;
        }
        for (dx, dz) in CARDINALS {
            let np = p.offset(dx, dz);
            if passable(np) && visited.insert(np) {
                queue.push_back((np, depth + 1, first));
            }
        }
    }
    best.map(|(_, _, first)| first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detour_walks_around_a_wall() {
        // Wall at x=1 for z in -1..=1; target straight ahead.
        let wall = |p: Vec3i| p.x == 1 && (-1..=1).contains(&p.z);
        let step = detour_step(Vec3i::new(0, 0, 0), Vec3i::new(3, 0, 0), 16, |_| true, wall);
        let step = step.expect("detour exists");
        assert_eq!(step.x, 0);
        assert_eq!(step.z.abs(), 1);
    }

    #[test]
    fn detour_gives_up_when_enclosed() {
        let solid = |p: Vec3i| p != Vec3i::new(0, 0, 0);
        assert_eq!(detour_step(Vec3i::new(0, 0, 0), Vec3i::new(5, 0, 0), 16, |_| true, solid), None);
    }

    #[test]
    fn detour_respects_depth_limit() {
        // Long wall forces a path deeper than the limit.
        let wall = |p: Vec3i| p.x == 1 && (-20..=20).contains(&p.z);
        assert_eq!(detour_step(Vec3i::new(0, 0, 0), Vec3i::new(3, 0, 0), 4, |_| true, wall), None);
    }
}
