//! Per-agent OBS assembly.
//!
//! Runs in three steps: a mutable prelude (chunk loading, event and memory
//! draining), a read-only parallel composition over agents, and a mutable
//! epilogue that caches the voxel slabs for delta encoding.

use contracts::{
    BoardObs, BoardPostObs, EntityObs, EquipmentObs, FunScoreObs, LocalRulesObs, MemoryKv,
    ReputationObs, SelfObs, TaskObs, WorldObs, MSG_OBS, PROTOCOL_VERSION_1_1,
};
use rayon::prelude::*;

use super::work::mine_params;
use super::*;
use crate::agent::{TaskKind, WorkTask, MAX_STAMINA_MILLI};
use crate::economy::truncate;
use crate::observer_stream::{follow_progress, move_progress};
use crate::spatial::{manhattan, parse_positional_id, positional_id};
use crate::voxels::{encode_slab, read_slab};

/// Manhattan reach of physical bulletin boards listed in OBS.
const PUBLIC_BOARD_RADIUS: i32 = 32;
const BOARD_TOP_POSTS: usize = 5;
const BOARD_SUMMARY_MAX: usize = 120;
/// Wanted-status band of the law reputation.
const WANTED_REP_LAW: std::ops::Range<i32> = 1..200;

/// What the prelude hands to the parallel step for one agent.
struct ObsInput {
    agent_id: String,
    events: Vec<Event>,
    memory: Vec<MemoryKv>,
    previous: Option<Vec<u16>>,
    delta_voxels: bool,
}

impl World {
    pub(super) fn build_observations(&mut self, now: u64) -> Vec<ObsMsg> {
        let radius = self.cfg.obs_radius;
        let mut inputs = Vec::with_capacity(self.clients.len());
        let connected = self.clients.keys().cloned().collect::<Vec<_>>();
        for agent_id in connected {
            let Some(pos) = self.agents.get(&agent_id).map(|a| a.pos) else {
                continue;
            };
            let fresh = self.chunks.load_around(pos, radius);
            self.stats.chunks_discovered += fresh.len() as u64;

            let (events, memory) = match self.agents.get_mut(&agent_id) {
                Some(agent) => (agent.take_events(), std::mem::take(&mut agent.pending_memory)),
                None => continue,
            };
            let (previous, delta_voxels) = match self.clients.get_mut(&agent_id) {
                Some(client) => (client.last_voxels.take(), client.delta_voxels),
                None => (None, false),
            };
            inputs.push(ObsInput {
                agent_id,
                events,
                memory,
                previous,
                delta_voxels,
            });
        }

        let this: &World = self;
        let mut composed = inputs
            .into_par_iter()
            .filter_map(|input| this.compose_obs(now, input))
            .collect::<Vec<_>>();
        composed.sort_by(|(a, _), (b, _)| a.agent_id.cmp(&b.agent_id));

        let mut out = Vec::with_capacity(composed.len());
        for (obs, slab) in composed {
            if let Some(client) = self.clients.get_mut(&obs.agent_id) {
                client.last_voxels = Some(slab);
            }
            out.push(obs);
        }
        out
    }

    /// Returns the OBS and the raw slab it was encoded from.
    fn compose_obs(&self, now: u64, input: ObsInput) -> Option<(ObsMsg, Vec<u16>)> {
        let agent = self.agents.get(&input.agent_id)?;
        let radius = self.cfg.obs_radius;
        let slab = read_slab(agent.pos, radius, |p| self.chunks.get(p));
        let voxels = encode_slab(
            agent.pos,
            radius,
            &slab,
            input.previous.as_deref(),
            input.delta_voxels,
        );

        let (active_event, active_event_ends_tick) = match &self.active_event {
            Some(ev) if now < ev.ends_tick => (ev.event_id.clone(), ev.ends_tick),
            _ => (String::new(), 0),
        };
        let obs = ObsMsg {
            msg_type: MSG_OBS.to_string(),
            protocol_version: PROTOCOL_VERSION_1_1.to_string(),
            tick: now,
            agent_id: agent.id.clone(),
            world_id: self.cfg.world_id.clone(),
            obs_id: format!("{}:{}:{}", agent.id, now, agent.event_cursor),
            world_clock: now,
            events_cursor: agent.event_cursor,
            world: WorldObs {
                time_of_day: self.time_of_day(now),
                weather: self.weather.as_str().to_string(),
                season_day: self.season_day(now),
                biome: self.chunks.biome_at(agent.pos.x, agent.pos.z).to_string(),
                active_event,
                active_event_ends_tick,
            },
            self_state: SelfObs {
                pos: agent.pos.to_array(),
                yaw: agent.yaw,
                hp: agent.hp,
                hunger: agent.hunger,
                stamina: f64::from(agent.stamina_milli) / f64::from(MAX_STAMINA_MILLI),
                status: agent.status(),
                reputation: ReputationObs {
                    trade: f64::from(agent.rep_trade) / 1000.0,
                    build: f64::from(agent.rep_build) / 1000.0,
                    social: f64::from(agent.rep_social) / 1000.0,
                    law: f64::from(agent.rep_law) / 1000.0,
                },
            },
            inventory: agent.inventory_list(),
            equipment: EquipmentObs {
                main_hand: agent.equipment.main_hand.clone(),
                armor: agent.equipment.armor.to_vec(),
            },
            local_rules: self.local_rules(agent),
            voxels,
            entities: self.entities_near(agent),
            events: input.events,
            tasks: self.task_states(agent),
            fun_score: Some(fun_obs(agent)),
            public_boards: self.public_boards(agent.pos),
            memory: input.memory,
        };
        Some((obs, slab))
    }

    fn local_rules(&self, agent: &Agent) -> LocalRulesObs {
        let (land, perms) = self.permissions_for(&agent.id, agent.pos);
        let Some(land) = land else {
            return LocalRulesObs {
                role: "WILD".to_string(),
                permissions: perms.to_map(),
                ..LocalRulesObs::default()
            };
        };
        let role = if land.owner == agent.id {
            "OWNER"
        } else if self.is_land_member(&agent.id, land) {
            "MEMBER"
        } else {
            "VISITOR"
        };
        let mut tax = BTreeMap::new();
        if land.market_tax > 0.0 {
            tax.insert("market".to_string(), land.market_tax);
        }
        LocalRulesObs {
            land_id: land.land_id.clone(),
            owner: land.owner.clone(),
            role: role.to_string(),
            permissions: perms.to_map(),
            tax,
            maintenance_due_tick: land.maintenance_due_tick,
            maintenance_stage: land.maintenance_stage,
        }
    }

    // -- entities --------------------------------------------------------------

    /// Everything within `ENTITY_RADIUS` (Manhattan), grouped by kind and
    /// sorted by id or position inside each group.
    fn entities_near(&self, agent: &Agent) -> Vec<EntityObs> {
        let near = |p: Vec3i| manhattan(p, agent.pos) <= ENTITY_RADIUS;
        let mut out = Vec::new();

        for other in self.agents.values() {
            if other.id == agent.id || !near(other.pos) {
                continue;
            }
            let mut tags = Vec::new();
            if !other.org_id.is_empty() {
                tags.push(format!("org:{}", other.org_id));
            }
            if WANTED_REP_LAW.contains(&other.rep_law) {
                tags.push("wanted".to_string());
            }
            out.push(EntityObs {
                id: other.id.clone(),
                kind: "AGENT".to_string(),
                pos: other.pos.to_array(),
                tags,
                reputation_hint: f64::from(other.rep_trade) / 1000.0,
                ..EntityObs::default()
            });
        }

        for container in self.containers.values().filter(|c| near(c.pos)) {
            out.push(simple_entity(container.id(), &container.kind, container.pos, Vec::new()));
        }

        for board_id in self.boards.keys() {
            if let Some(("BULLETIN_BOARD", pos)) = parse_positional_id(board_id) {
                if near(pos) {
                    out.push(simple_entity(board_id.clone(), "BULLETIN_BOARD", pos, Vec::new()));
                }
            }
        }

        for (pos, sign) in self.signs.iter().filter(|(p, _)| near(**p)) {
            let tags = if sign.text.trim().is_empty() {
                Vec::new()
            } else {
                vec!["has_text".to_string()]
            };
            out.push(simple_entity(positional_id("SIGN", *pos), "SIGN", *pos, tags));
        }

        for (pos, meta) in self.conveyors.iter().filter(|(p, _)| near(**p)) {
            let tags = vec![format!("dir:{}", conveyor_dir_tag(*meta))];
            out.push(simple_entity(positional_id("CONVEYOR", *pos), "CONVEYOR", *pos, tags));
        }

        for (pos, on) in self.switches.iter().filter(|(p, _)| near(**p)) {
            let tags = vec![format!("state:{}", on_off(*on))];
            out.push(simple_entity(positional_id("SWITCH", *pos), "SWITCH", *pos, tags));
        }

        if let Some(sensor) = self.catalogs.block_id("SENSOR") {
            for dz in -ENTITY_RADIUS..=ENTITY_RADIUS {
                let span = ENTITY_RADIUS - dz.abs();
                for dx in -span..=span {
                    let pos = agent.pos.offset(dx, dz);
                    if self.block_id_at(pos) == sensor {
                        let tags = vec![format!("state:{}", on_off(self.sensor_on(pos)))];
                        out.push(simple_entity(positional_id("SENSOR", pos), "SENSOR", pos, tags));
                    }
                }
            }
        }

        for entity in self.items.values() {
            if entity.item.is_empty() || entity.count <= 0 || !near(entity.pos) {
                continue;
            }
            out.push(EntityObs {
                id: entity.entity_id.clone(),
                kind: "ITEM".to_string(),
                pos: entity.pos.to_array(),
                item: entity.item.clone(),
                count: entity.count,
                ..EntityObs::default()
            });
        }
        out
    }

    // -- tasks -----------------------------------------------------------------

    fn task_states(&self, agent: &Agent) -> Vec<TaskObs> {
        let mut out = Vec::new();
        if let Some(task) = &agent.move_task {
            let (target, (progress, eta_ticks)) = match task.kind {
                TaskKind::Follow => {
                    let target = self.follow_target_pos(&task.target_id).unwrap_or(task.target);
                    (target, follow_progress(agent.pos, target, task.distance))
                }
                _ => (
                    task.target,
                    move_progress(task.start_pos, agent.pos, task.target, task.tolerance),
                ),
            };
            out.push(TaskObs {
                task_id: task.task_id.clone(),
                kind: task.kind.as_str().to_string(),
                progress,
                target: Some(target.to_array()),
                eta_ticks,
            });
        }
        if let Some(task) = &agent.work_task {
            let (progress, eta_ticks) = self.work_progress(agent, task);
            let target = matches!(
                task.kind,
                Some(TaskKind::Mine | TaskKind::Place | TaskKind::BuildBlueprint)
            )
            .then(|| {
                if task.kind == Some(TaskKind::BuildBlueprint) {
                    task.anchor.to_array()
                } else {
                    task.block_pos.to_array()
                }
            });
            out.push(TaskObs {
                task_id: task.task_id.clone(),
                kind: task.kind_str().to_string(),
                progress,
                target,
                eta_ticks,
            });
        }
        out
    }

    fn work_progress(&self, agent: &Agent, task: &WorkTask) -> (f64, u64) {
        let ratio = |done: u64, total: u64| {
            if total == 0 {
                (0.0, 0)
            } else {
                let done = done.min(total);
                (done as f64 / total as f64, total - done)
            }
        };
        match task.kind {
            Some(TaskKind::Mine) => {
                let block = self.block_id_at(task.block_pos);
                let family = self
                    .catalogs
                    .block_def(block)
                    .and_then(|def| def.tool.as_deref());
                let (needed, _) = mine_params(self.best_tool_tier(agent, family));
                ratio(u64::from(task.work_ticks), u64::from(needed))
            }
            Some(TaskKind::Craft) => match self.catalogs.recipes.get(&task.recipe_id) {
                Some(recipe) => ratio(u64::from(task.work_ticks), u64::from(recipe.time_ticks)),
                None => (0.0, 0),
            },
            Some(TaskKind::Smelt) => {
                let recipe = self
                    .catalogs
                    .smelt_by_input
                    .get(&task.item_id)
                    .and_then(|id| self.catalogs.recipes.get(id));
                match recipe {
                    Some(recipe) => ratio(u64::from(task.work_ticks), u64::from(recipe.time_ticks)),
                    None => (0.0, 0),
                }
            }
            Some(TaskKind::BuildBlueprint) => match self.catalogs.blueprints.get(&task.blueprint_id) {
                Some(bp) => {
                    let per_tick = self.cfg.blueprint_blocks_per_tick.clamp(1, 64) as u64;
                    let total = bp.blocks.len() as u64;
                    let done = (task.build_index as u64).min(total);
                    let progress = if total == 0 { 1.0 } else { done as f64 / total as f64 };
                    (progress, (total - done).div_ceil(per_tick))
                }
                None => (0.0, 0),
            },
            _ => (0.0, 1),
        }
    }

    // -- boards ----------------------------------------------------------------

    /// Global boards plus physical bulletin boards within
    /// `PUBLIC_BOARD_RADIUS`, each with its newest posts first.
    fn public_boards(&self, pos: Vec3i) -> Vec<BoardObs> {
        self.boards
            .values()
            .filter(|board| !board.posts.is_empty())
            .filter(|board| match parse_positional_id(&board.board_id) {
                Some(("BULLETIN_BOARD", at)) => manhattan(at, pos) <= PUBLIC_BOARD_RADIUS,
                _ => true,
            })
            .map(|board| BoardObs {
                board_id: board.board_id.clone(),
                top_posts: board
                    .posts
                    .iter()
                    .rev()
                    .take(BOARD_TOP_POSTS)
                    .map(|post| BoardPostObs {
                        post_id: post.post_id.clone(),
                        author: post.author.clone(),
                        title: post.title.clone(),
                        summary: truncate(&post.body, BOARD_SUMMARY_MAX),
                    })
                    .collect(),
            })
            .collect()
    }
}

fn simple_entity(id: String, kind: &str, pos: Vec3i, tags: Vec<String>) -> EntityObs {
    EntityObs {
        id,
        kind: kind.to_string(),
        pos: pos.to_array(),
        tags,
        ..EntityObs::default()
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

fn conveyor_dir_tag(meta: ConveyorMeta) -> &'static str {
    match (meta.dx, meta.dz) {
        (1, _) => "+X",
        (-1, _) => "-X",
        (_, -1) => "-Z",
        _ => "+Z",
    }
}

fn fun_obs(agent: &Agent) -> FunScoreObs {
    let f = agent.fun;
    FunScoreObs {
        novelty: f.novelty,
        creation: f.creation,
        social: f.social,
        influence: f.influence,
        narrative: f.narrative,
        risk_rescue: f.risk_rescue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::economy::BoardPost;
    use crate::voxels::{decode_rle, ENCODING_DELTA, ENCODING_RLE};

    fn world() -> World {
        let cfg = WorldConfig {
            seed: 3,
            ..WorldConfig::default()
        };
        let catalogs = Arc::new(Catalogs::builtin(&cfg));
        World::new(cfg, catalogs).expect("world")
    }

    fn join(world: &mut World, name: &str, delta: bool) -> String {
        world
            .join(JoinRequest {
                name: name.to_string(),
                delta_voxels: delta,
                ..JoinRequest::default()
            })
            .agent_id
    }

    #[test]
    fn obs_id_and_slab_shape() {
        let mut w = world();
        let id = join(&mut w, "a", false);
        let out = w.step(Vec::new());
        assert_eq!(out.observations.len(), 1);
        let obs = &out.observations[0];
        let cursor = w.agent(&id).map(|a| a.event_cursor).unwrap_or_default();
        assert_eq!(obs.obs_id, format!("{id}:1:{cursor}"));
        assert_eq!(obs.self_state.pos[1], 0);
        assert_eq!(obs.voxels.encoding, ENCODING_RLE);
        let r = w.config().obs_radius;
        let slab = decode_rle(&obs.voxels.data).expect("rle");
        assert_eq!(slab.len(), ((2 * r + 1) * (2 * r + 1)) as usize);
        assert!(w.loaded_chunks() > 0);
    }

    #[test]
    fn delta_voxels_follow_a_cached_slab() {
        let mut w = world();
        let id = join(&mut w, "a", true);
        w.step(Vec::new());
        let pos = w.agent(&id).map(|a| a.pos).unwrap_or_default();
        w.set_block_named(pos.offset(1, 1), "BRICK");
        let out = w.step(Vec::new());
        let voxels = &out.observations[0].voxels;
        assert_eq!(voxels.encoding, ENCODING_DELTA);
        let brick = w.catalogs().block_id("BRICK").unwrap_or_default();
        assert!(voxels.ops.iter().any(|op| op.d == [1, 0, 1] && op.b == brick));
    }

    #[test]
    fn events_drain_into_exactly_one_obs() {
        let mut w = world();
        let id = join(&mut w, "a", false);
        w.inject_event(&id, event(0, "PING", json!({})));
        let first = w.step(Vec::new());
        assert!(first.observations[0].events.iter().any(|e| e["type"] == "PING"));
        let second = w.step(Vec::new());
        assert!(!second.observations[0].events.iter().any(|e| e["type"] == "PING"));
    }

    #[test]
    fn observations_are_sorted_and_see_each_other() {
        let mut w = world();
        let a = join(&mut w, "a", false);
        let b = join(&mut w, "b", false);
        let out = w.step(Vec::new());
        let ids = out.observations.iter().map(|o| o.agent_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids, vec![a.clone(), b.clone()]);
        assert!(out.observations[0].entities.iter().any(|e| e.id == b && e.kind == "AGENT"));
    }

    #[test]
    fn public_boards_include_global_and_nearby_physical_boards() {
        let mut w = world();
        let id = join(&mut w, "a", false);
        let pos = w.agent(&id).map(|a| a.pos).unwrap_or_default();
        let post = |n: u64| BoardPost {
            post_id: format!("P{n}"),
            author: "A9".to_string(),
            title: "t".to_string(),
            body: "x".repeat(300),
            tick: n,
        };
        let near_id = positional_id("BULLETIN_BOARD", pos.offset(2, 0));
        let far_id = positional_id("BULLETIN_BOARD", pos.offset(100, 0));
        for board_id in ["market".to_string(), near_id.clone(), far_id.clone()] {
            w.boards.insert(
                board_id.clone(),
                Board {
                    board_id,
                    posts: (1..=7).map(post).collect(),
                },
            );
        }
        let boards = w.public_boards(pos);
        let ids = boards.iter().map(|b| b.board_id.clone()).collect::<Vec<_>>();
        assert!(ids.contains(&"market".to_string()));
        assert!(ids.contains(&near_id));
        assert!(!ids.contains(&far_id));
        let market = boards.iter().find(|b| b.board_id == "market").expect("market");
        assert_eq!(market.top_posts.len(), BOARD_TOP_POSTS);
        assert_eq!(market.top_posts[0].post_id, "P7");
        assert_eq!(market.top_posts[0].summary.len(), BOARD_SUMMARY_MAX);
    }

    #[test]
    fn detached_agents_keep_their_events() {
        let mut w = world();
        let id = join(&mut w, "a", false);
        w.leave(&id);
        w.inject_event(&id, event(0, "PING", json!({})));
        let out = w.step(Vec::new());
        assert!(out.observations.is_empty());
        assert!(w.agent(&id).is_some_and(|a| !a.events.is_empty()));
    }
}
