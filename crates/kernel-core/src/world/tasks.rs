//! Task intake. Each handler validates a request and fills one of the two task
//! slots; the movement and work systems advance them on later phases.

use contracts::TaskReq;

use super::*;
use crate::agent::{MovementTask, TaskKind, WorkTask};
use crate::catalogs::normalize_rotation;
use crate::claims::{default_claim_type_for_world, MAX_CLAIM_RADIUS};
use crate::spatial::parse_positional_id;

const DEFAULT_FOLLOW_DISTANCE: f64 = 2.0;
const MAX_FOLLOW_DISTANCE: f64 = 32.0;
const DEFAULT_CLAIM_RADIUS: i32 = 32;

fn accepted(now: u64, ref_id: &str, task_id: &str) -> Event {
    let mut ev = ok_result(now, ref_id, "");
    ev.insert("task_id".to_string(), json!(task_id));
    ev
}

fn require_ground(pos: [i32; 3]) -> Result<Vec3i, Rejection> {
    if pos[1] != 0 {
        return Err((ErrorCode::InvalidTarget, "2D world requires y==0"));
    }
    Ok(Vec3i::from_array(pos))
}

fn work(kind: TaskKind) -> WorkTask {
    WorkTask {
        kind: Some(kind),
        ..WorkTask::default()
    }
}

impl World {
    /// Current position of whatever FOLLOW can track: agents, item entities
    /// and containers.
    pub(super) fn follow_target_pos(&self, target_id: &str) -> Option<Vec3i> {
        if target_id.is_empty() {
            return None;
        }
        if let Some(agent) = self.agents.get(target_id) {
            return Some(agent.pos);
        }
        if let Some(item) = self.items.get(target_id) {
            return Some(item.pos);
        }
        self.container_by_id(target_id).map(|c| c.pos)
    }

    pub(super) fn container_by_id(&self, container_id: &str) -> Option<&Container> {
        let (kind, pos) = parse_positional_id(container_id)?;
        self.containers.get(&pos).filter(|c| c.kind == kind)
    }

    // -- movement --------------------------------------------------------------

    pub(super) fn task_stop(&mut self, agent: &mut Agent, now: u64, req: &TaskReq) {
        agent.move_task = None;
        agent.add_event(ok_result(now, &req.id, "stopped"));
    }

    fn start_movement(&mut self, agent: &mut Agent, now: u64, req: &TaskReq, task: Result<MovementTask, Rejection>) {
        if agent.move_task.is_some() {
            agent.add_event(fail_result(now, &req.id, ErrorCode::Conflict, "movement task slot occupied"));
            return;
        }
        match task {
            Ok(mut task) => {
                task.task_id = self.next_task_id();
                task.started_tick = now;
                task.start_pos = agent.pos;
                agent.add_event(accepted(now, &req.id, &task.task_id));
                agent.move_task = Some(task);
            }
            Err((code, message)) => agent.add_event(fail_result(now, &req.id, code, message)),
        }
    }

    pub(super) fn task_move_to(&mut self, agent: &mut Agent, now: u64, req: &TaskReq) {
        let target = Vec3i::flat(req.target);
        let task = if self.chunks.in_bounds(target) {
            Ok(MovementTask {
                task_id: String::new(),
                kind: TaskKind::MoveTo,
                target,
                tolerance: req.tolerance,
                target_id: String::new(),
                distance: 0.0,
                start_pos: agent.pos,
                started_tick: now,
            })
        } else {
            Err((ErrorCode::InvalidTarget, "out of bounds"))
        };
        self.start_movement(agent, now, req, task);
    }

    pub(super) fn task_follow(&mut self, agent: &mut Agent, now: u64, req: &TaskReq) {
        let task = if req.target_id.is_empty() {
            Err((ErrorCode::BadRequest, "missing target_id"))
        } else {
            match self.follow_target_pos(&req.target_id) {
                None => Err((ErrorCode::InvalidTarget, "target not found")),
                Some(target) => {
                    let distance = if req.distance > 0.0 {
                        req.distance.min(MAX_FOLLOW_DISTANCE)
                    } else {
                        DEFAULT_FOLLOW_DISTANCE
                    };
                    Ok(MovementTask {
                        task_id: String::new(),
                        kind: TaskKind::Follow,
                        target,
                        tolerance: 0.0,
                        target_id: req.target_id.clone(),
                        distance,
                        start_pos: agent.pos,
                        started_tick: now,
                    })
                }
            }
        };
        self.start_movement(agent, now, req, task);
    }

    // -- work ------------------------------------------------------------------

    fn start_work(&mut self, agent: &mut Agent, now: u64, req: &TaskReq, task: impl FnOnce(&World) -> Result<WorkTask, Rejection>) {
        if agent.work_task.is_some() {
            agent.add_event(fail_result(now, &req.id, ErrorCode::Conflict, "work task slot occupied"));
            return;
        }
        match task(self) {
            Ok(mut task) => {
                task.task_id = self.next_task_id();
                task.started_tick = now;
                agent.add_event(accepted(now, &req.id, &task.task_id));
                agent.work_task = Some(task);
            }
            Err((code, message)) => agent.add_event(fail_result(now, &req.id, code, message)),
        }
    }

    fn world_flag(&self, agent: &mut Agent, now: u64, req: &TaskReq, allowed: bool, message: &str) -> bool {
        if !allowed {
            agent.add_event(fail_result(now, &req.id, ErrorCode::NoPermission, message));
        }
        allowed
    }

    pub(super) fn task_mine(&mut self, agent: &mut Agent, now: u64, req: &TaskReq) {
        if !self.world_flag(agent, now, req, self.cfg.flags.allow_mine, "mining disabled in this world") {
            return;
        }
        self.start_work(agent, now, req, |_| {
            Ok(WorkTask {
                block_pos: require_ground(req.block_pos)?,
                ..work(TaskKind::Mine)
            })
        });
    }

    pub(super) fn task_gather(&mut self, agent: &mut Agent, now: u64, req: &TaskReq) {
        self.start_work(agent, now, req, |world| {
            if req.target_id.is_empty() {
                return Err((ErrorCode::BadRequest, "missing target_id"));
            }
            if !world.items.contains_key(&req.target_id) {
                return Err((ErrorCode::InvalidTarget, "item entity not found"));
            }
            Ok(WorkTask {
                target_id: req.target_id.clone(),
                ..work(TaskKind::Gather)
            })
        });
    }

    pub(super) fn task_place(&mut self, agent: &mut Agent, now: u64, req: &TaskReq) {
        if !self.world_flag(agent, now, req, self.cfg.flags.allow_place, "placing disabled in this world") {
            return;
        }
        self.start_work(agent, now, req, |_| {
            if req.item_id.is_empty() {
                return Err((ErrorCode::BadRequest, "missing item_id"));
            }
            Ok(WorkTask {
                block_pos: require_ground(req.block_pos)?,
                item_id: req.item_id.clone(),
                ..work(TaskKind::Place)
            })
        });
    }

    pub(super) fn task_open(&mut self, agent: &mut Agent, now: u64, req: &TaskReq) {
        self.start_work(agent, now, req, |_| {
            if req.target_id.is_empty() {
                return Err((ErrorCode::BadRequest, "missing target_id"));
            }
            Ok(WorkTask {
                target_id: req.target_id.clone(),
                ..work(TaskKind::Open)
            })
        });
    }

    pub(super) fn task_transfer(&mut self, agent: &mut Agent, now: u64, req: &TaskReq) {
        self.start_work(agent, now, req, |_| {
            if req.src.is_empty() || req.dst.is_empty() || req.item_id.is_empty() || req.count <= 0 {
                return Err((ErrorCode::BadRequest, "missing src/dst/item_id/count"));
            }
            Ok(WorkTask {
                src_container: req.src.clone(),
                dst_container: req.dst.clone(),
                item_id: req.item_id.clone(),
                count: req.count,
                ..work(TaskKind::Transfer)
            })
        });
    }

    pub(super) fn task_craft(&mut self, agent: &mut Agent, now: u64, req: &TaskReq) {
        self.start_work(agent, now, req, |world| {
            if req.recipe_id.is_empty() || req.count <= 0 {
                return Err((ErrorCode::BadRequest, "missing recipe_id/count"));
            }
            if !world.catalogs.recipes.contains_key(&req.recipe_id) {
                return Err((ErrorCode::InvalidTarget, "unknown recipe"));
            }
            Ok(WorkTask {
                recipe_id: req.recipe_id.clone(),
                count: req.count,
                ..work(TaskKind::Craft)
            })
        });
    }

    pub(super) fn task_smelt(&mut self, agent: &mut Agent, now: u64, req: &TaskReq) {
        self.start_work(agent, now, req, |world| {
            if req.item_id.is_empty() || req.count <= 0 {
                return Err((ErrorCode::BadRequest, "missing item_id/count"));
            }
            if !world.catalogs.smelt_by_input.contains_key(&req.item_id) {
                return Err((ErrorCode::InvalidTarget, "unsupported smelt item"));
            }
            Ok(WorkTask {
                item_id: req.item_id.clone(),
                count: req.count,
                ..work(TaskKind::Smelt)
            })
        });
    }

    pub(super) fn task_build_blueprint(&mut self, agent: &mut Agent, now: u64, req: &TaskReq) {
        if !self.world_flag(agent, now, req, self.cfg.flags.allow_build, "blueprint build disabled in this world") {
            return;
        }
        self.start_work(agent, now, req, |world| {
            if req.blueprint_id.is_empty() {
                return Err((ErrorCode::BadRequest, "missing blueprint_id"));
            }
            let anchor = require_ground(req.anchor)?;
            if !world.catalogs.blueprints.contains_key(&req.blueprint_id) {
                return Err((ErrorCode::InvalidTarget, "unknown blueprint"));
            }
            let rotation = normalize_rotation(req.rotation).ok_or((ErrorCode::BadRequest, "bad rotation"))?;
            Ok(WorkTask {
                blueprint_id: req.blueprint_id.clone(),
                anchor,
                rotation,
                build_index: 0,
                ..work(TaskKind::BuildBlueprint)
            })
        });
    }

    // -- claims ----------------------------------------------------------------

    pub(super) fn task_claim_land(&mut self, agent: &mut Agent, now: u64, req: &TaskReq) {
        if !self.world_flag(agent, now, req, self.cfg.flags.allow_claims, "claims disabled in this world") {
            return;
        }
        match self.claim_land(agent, now, req) {
            Ok(land_id) => {
                let mut ev = ok_result(now, &req.id, "");
                ev.insert("land_id".to_string(), json!(land_id));
                agent.add_event(ev);
            }
            Err((code, message)) => agent.add_event(fail_result(now, &req.id, code, message)),
        }
    }

    fn claim_land(&mut self, agent: &mut Agent, now: u64, req: &TaskReq) -> Result<String, Rejection> {
        let radius = if req.radius > 0 {
            req.radius.min(MAX_CLAIM_RADIUS)
        } else {
            DEFAULT_CLAIM_RADIUS
        };
        let anchor = require_ground(req.anchor)?;
        if !self.chunks.in_bounds(anchor) {
            return Err((ErrorCode::InvalidTarget, "out of bounds"));
        }
        if !self.can_build_at(&agent.id, anchor, now) {
            return Err((ErrorCode::NoPermission, "cannot claim here"));
        }
        if agent.count("BATTERY") < 1 || agent.count("CRYSTAL_SHARD") < 1 {
            return Err((ErrorCode::NoResource, "need BATTERY + CRYSTAL_SHARD"));
        }
        let mut claim = LandClaim::new(
            String::new(),
            agent.id.clone(),
            default_claim_type_for_world(&self.cfg.world_type),
            anchor,
            radius,
        );
        if self.claims.values().any(|other| claim.overlaps(other, radius)) {
            return Err((ErrorCode::Conflict, "claim overlaps existing land"));
        }
        if self.block_id_at(anchor) != AIR {
            return Err((ErrorCode::Blocked, "anchor occupied"));
        }
        let totem = self
            .catalogs
            .block_id("CLAIM_TOTEM")
            .ok_or((ErrorCode::Internal, "missing CLAIM_TOTEM block"))?;

        agent.take_item("BATTERY", 1);
        agent.take_item("CRYSTAL_SHARD", 1);
        self.set_block(now, anchor, totem, &agent.id, "CLAIM_LAND");

        self.counters.land += 1;
        let land_id = format!("LAND_{}_{:03}", agent.id, self.counters.land);
        claim.land_id = land_id.clone();
        claim.maintenance_due_tick = now + self.cfg.day_ticks;
        self.claims.insert(land_id.clone(), claim);
        tracing::debug!(world_id = %self.cfg.world_id, agent_id = %agent.id, land_id = %land_id, radius, "land claimed");
        Ok(land_id)
    }
}
