//! Work system: advances each agent's single work task by one tick.

use std::collections::BTreeMap;

use super::*;
use crate::agent::{TaskKind, WorkTask};
use crate::catalogs::{rotate_offset, RecipeDef};
use crate::container::is_container_block;
use crate::economy::encode_item_pairs;
use crate::spatial::{manhattan, parse_positional_id, positional_id};

/// Posts returned when a bulletin board is opened.
const OPEN_BOARD_POSTS: usize = 20;
/// Reach for crafting benches and furnaces.
const STATION_RANGE: i32 = 2;

/// Work ticks and stamina per tick for the best tool tier held (0 = bare hands).
pub fn mine_params(tier: u8) -> (u32, i32) {
    match tier {
        0 => (10, 15),
        1 => (6, 12),
        2 => (4, 10),
        _ => (3, 8),
    }
}

enum WorkStep {
    Pending,
    Done,
}

type WorkResult = Result<WorkStep, (ErrorCode, String)>;

fn reject(code: ErrorCode, message: impl Into<String>) -> WorkResult {
    Err((code, message.into()))
}

impl World {
    pub(super) fn system_work(&mut self, now: u64) {
        for agent_id in self.agent_ids() {
            self.with_agent(&agent_id, |world, agent| world.work_agent(agent, now));
        }
    }

    fn work_agent(&mut self, agent: &mut Agent, now: u64) {
        let Some(mut task) = agent.work_task.take() else {
            return;
        };
        let outcome = match task.kind {
            Some(TaskKind::Mine) => self.tick_mine(agent, &mut task, now),
            Some(TaskKind::Gather) => self.tick_gather(agent, &task, now),
            Some(TaskKind::Place) => self.tick_place(agent, &task, now),
            Some(TaskKind::Open) => self.tick_open(agent, &task, now),
            Some(TaskKind::Transfer) => self.tick_transfer(agent, &task, now),
            Some(TaskKind::Craft) => self.tick_craft(agent, &mut task, now),
            Some(TaskKind::Smelt) => self.tick_smelt(agent, &mut task, now),
            Some(TaskKind::BuildBlueprint) => self.tick_build_blueprint(agent, &mut task, now),
            _ => reject(ErrorCode::BadRequest, "unknown work task"),
        };
        match outcome {
            Ok(WorkStep::Pending) => agent.work_task = Some(task),
            Ok(WorkStep::Done) => agent.add_event(task_done(now, &task.task_id, task.kind_str())),
            Err((code, message)) => agent.add_event(task_fail(now, &task.task_id, code, &message)),
        }
    }

    /// Records a permission denial: law reputation -1 and a director conflict tick.
    fn denied(&mut self, agent: &mut Agent, message: &str) -> WorkResult {
        agent.adjust_rep_law(-1);
        self.stats.denied += 1;
        reject(ErrorCode::NoPermission, message)
    }

    // -- mine ------------------------------------------------------------------

    pub(super) fn best_tool_tier(&self, agent: &Agent, family: Option<&str>) -> u8 {
        let Some(family) = family else {
            return 0;
        };
        agent
            .inventory
            .iter()
            .filter(|(_, n)| **n > 0)
            .filter_map(|(item, _)| self.catalogs.items.get(item))
            .filter(|def| def.tool_family.as_deref() == Some(family))
            .map(|def| def.tool_tier)
            .max()
            .unwrap_or(0)
    }

    /// Fines a visitor whose break was refused by claim flags. Curfew denials
    /// are not fined.
    fn fine_break(&mut self, agent: &mut Agent, pos: Vec3i, now: u64) {
        let (land, perms) = self.permissions_for(&agent.id, pos);
        let Some(land) = land else {
            return;
        };
        if perms.can_break
            || self.is_land_member(&agent.id, land)
            || !land.fine_break_enabled
            || land.fine_break_per_block <= 0
        {
            return;
        }
        let item = land.fine_break_item.trim().to_string();
        if item.is_empty() {
            return;
        }
        let pay = land.fine_break_per_block.min(agent.count(&item));
        let land_id = land.land_id.clone();
        let owner = land.owner.clone();
        if pay <= 0 {
            return;
        }
        agent.take_item(&item, pay);
        self.credit_owner(&owner, &item, pay);
        agent.add_event(event(
            now,
            "FINE",
            json!({"land_id": land_id, "item": item, "count": pay, "reason": "BREAK_DENIED"}),
        ));
    }

    fn tick_mine(&mut self, agent: &mut Agent, task: &mut WorkTask, now: u64) -> WorkResult {
        let pos = task.block_pos;
        if manhattan(agent.pos, pos) > MINE_RANGE {
            return reject(ErrorCode::InvalidTarget, "too far");
        }
        if !self.can_break_at(&agent.id, pos, now) {
            self.fine_break(agent, pos, now);
            return self.denied(agent, "break denied");
        }
        let block = self.block_id_at(pos);
        if block == AIR {
            return reject(ErrorCode::InvalidTarget, "no block");
        }
        let def = self.catalogs.block_def(block).cloned();
        let name = self.block_name_at(pos);
        let family = def.as_ref().and_then(|def| def.tool.as_deref());
        let (work_needed, cost) = mine_params(self.best_tool_tier(agent, family));
        if agent.stamina_milli < cost {
            return Ok(WorkStep::Pending);
        }
        agent.stamina_milli -= cost;
        task.work_ticks += 1;
        if task.work_ticks < work_needed {
            return Ok(WorkStep::Pending);
        }

        if is_container_block(&name) {
            if self.containers.get(&pos).is_some_and(|c| !c.reserved.is_empty()) {
                return reject(ErrorCode::Blocked, "container has reserved items");
            }
            if let Some(mut container) = self.containers.remove(&pos) {
                for (item, n) in &container.inventory {
                    agent.add_item(item, *n);
                }
                for (item, n) in container.claim_owed(&agent.id) {
                    agent.add_item(&item, n);
                }
            }
        }
        self.on_block_removed(now, &agent.id, pos, &name, "MINE");
        self.set_air(now, pos, &agent.id, "MINE");
        if let Some(drop) = def.and_then(|def| def.drop) {
            self.spawn_item_entity(now, &agent.id, pos, &drop, 1, "MINE_DROP");
        }
        self.on_mined_during_event(agent, pos, &name, now);
        Ok(WorkStep::Done)
    }

    // -- gather / place --------------------------------------------------------

    fn tick_gather(&mut self, agent: &mut Agent, task: &WorkTask, now: u64) -> WorkResult {
        if task.target_id.is_empty() {
            return reject(ErrorCode::BadRequest, "missing target_id");
        }
        let Some(entity) = self
            .items
            .get(&task.target_id)
            .filter(|e| !e.item.is_empty() && e.count > 0)
        else {
            return reject(ErrorCode::InvalidTarget, "item entity not found");
        };
        let pos = entity.pos;
        if manhattan(agent.pos, pos) > MINE_RANGE {
            return reject(ErrorCode::Blocked, "too far");
        }
        if !self.can_pickup_at(&agent.id, pos) {
            return self.denied(agent, "pickup denied");
        }
        if let Some(entity) = self.remove_item_entity(now, &agent.id, &task.target_id, "GATHER") {
            agent.add_item(&entity.item, entity.count);
        }
        Ok(WorkStep::Done)
    }

    fn tick_place(&mut self, agent: &mut Agent, task: &WorkTask, now: u64) -> WorkResult {
        let pos = task.block_pos;
        if !self.chunks.in_bounds(pos) {
            return reject(ErrorCode::InvalidTarget, "out of bounds");
        }
        if !self.can_build_at(&agent.id, pos, now) {
            return self.denied(agent, "build denied");
        }
        if self.block_id_at(pos) != AIR {
            return reject(ErrorCode::Blocked, "space occupied");
        }
        if task.item_id.is_empty() || agent.count(&task.item_id) < 1 {
            return reject(ErrorCode::NoResource, "missing item");
        }
        let Some(block) = self.catalogs.place_block_for(&task.item_id) else {
            return reject(ErrorCode::InvalidTarget, "item not placeable");
        };
        agent.take_item(&task.item_id, 1);
        self.set_block(now, pos, block, &agent.id, "PLACE");
        let name = self.block_name_at(pos);
        self.on_block_placed(pos, &name, agent.yaw);
        Ok(WorkStep::Done)
    }

    // -- open / transfer -------------------------------------------------------

    fn tick_open(&mut self, agent: &mut Agent, task: &WorkTask, now: u64) -> WorkResult {
        if let Some(container) = self.container_by_id(&task.target_id) {
            if manhattan(agent.pos, container.pos) > INTERACT_RANGE {
                return reject(ErrorCode::Blocked, "too far");
            }
            let mut ev = event(
                now,
                "CONTAINER",
                json!({
                    "container": container.id(),
                    "container_type": container.kind,
                    "pos": container.pos.to_array(),
                    "inventory": container.inventory_list(),
                }),
            );
            if let Some(owed) = container.owed.get(&agent.id) {
                ev.insert("owed".to_string(), encode_item_pairs(owed));
            }
            if container.kind == "CONTRACT_TERMINAL" {
                let summaries = self
                    .contracts
                    .values()
                    .filter(|c| c.terminal_pos == container.pos)
                    .map(|c| c.summary())
                    .collect::<Vec<_>>();
                ev.insert("contracts".to_string(), json!(summaries));
            }
            let (kind, pos) = (container.kind.clone(), container.pos);
            agent.add_event(ev);
            self.on_container_opened_during_event(agent, &kind, pos, now);
            return Ok(WorkStep::Done);
        }

        match parse_positional_id(&task.target_id) {
            Some(("BULLETIN_BOARD", pos)) => {
                self.fixture_open_check(agent, pos, "BULLETIN_BOARD", "board not found")?;
                let board_id = positional_id("BULLETIN_BOARD", pos);
                let board = self.boards.get(&board_id);
                let total = board.map(|b| b.posts.len()).unwrap_or(0);
                let posts = board
                    .map(|b| {
                        let skip = b.posts.len().saturating_sub(OPEN_BOARD_POSTS);
                        b.posts[skip..]
                            .iter()
                            .map(|p| {
                                json!({
                                    "post_id": p.post_id,
                                    "author": p.author,
                                    "title": p.title,
                                    "body": p.body,
                                    "tick": p.tick,
                                })
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                agent.add_event(event(
                    now,
                    "BOARD",
                    json!({"board_id": board_id, "pos": pos.to_array(), "total_posts": total, "posts": posts}),
                ));
                Ok(WorkStep::Done)
            }
            Some(("SIGN", pos)) => {
                self.fixture_open_check(agent, pos, "SIGN", "sign not found")?;
                let sign = self.signs.get(&pos);
                agent.add_event(event(
                    now,
                    "SIGN",
                    json!({
                        "sign_id": positional_id("SIGN", pos),
                        "pos": pos.to_array(),
                        "text": sign.map(|s| s.text.as_str()).unwrap_or(""),
                        "updated_tick": sign.map(|s| s.updated_tick).unwrap_or(0),
                        "updated_by": sign.map(|s| s.updated_by.as_str()).unwrap_or(""),
                    }),
                ));
                Ok(WorkStep::Done)
            }
            _ => reject(ErrorCode::InvalidTarget, "container not found"),
        }
    }

    fn fixture_open_check(&self, agent: &Agent, pos: Vec3i, block: &str, missing: &str) -> Result<(), (ErrorCode, String)> {
        if self.block_name_at(pos) != block {
            return Err((ErrorCode::InvalidTarget, missing.to_string()));
        }
        if manhattan(agent.pos, pos) > INTERACT_RANGE {
            return Err((ErrorCode::Blocked, "too far".to_string()));
        }
        Ok(())
    }

    /// Resolves one side of a TRANSFER; `SELF` is the agent's inventory.
    fn transfer_side(&self, agent: &Agent, id: &str, which: &str) -> Result<Option<Vec3i>, (ErrorCode, String)> {
        if id == "SELF" {
            return Ok(None);
        }
        let Some(container) = self.container_by_id(id) else {
            return Err((ErrorCode::InvalidTarget, format!("{which} container not found")));
        };
        if manhattan(agent.pos, container.pos) > INTERACT_RANGE {
            return Err((ErrorCode::Blocked, format!("too far from {which}")));
        }
        Ok(Some(container.pos))
    }

    fn tick_transfer(&mut self, agent: &mut Agent, task: &WorkTask, now: u64) -> WorkResult {
        let (item, n) = (task.item_id.as_str(), task.count);
        if task.src_container == "SELF" && task.dst_container == "SELF" {
            return reject(ErrorCode::BadRequest, "no-op transfer");
        }
        let src = self.transfer_side(agent, &task.src_container, "src")?;
        let dst = self.transfer_side(agent, &task.dst_container, "dst")?;

        match src {
            Some(pos) => {
                if !self.can_withdraw_from(&agent.id, pos) {
                    return reject(ErrorCode::NoPermission, "withdraw denied");
                }
                if self.containers.get(&pos).map(|c| c.available(item)).unwrap_or(0) < n {
                    return reject(ErrorCode::NoResource, "insufficient src items");
                }
            }
            None if agent.count(item) < n => return reject(ErrorCode::NoResource, "insufficient self items"),
            None => {}
        }

        match src.and_then(|pos| self.containers.get_mut(&pos)) {
            Some(container) => {
                container.take_available(item, n);
            }
            None => {
                agent.take_item(item, n);
            }
        }
        match dst.and_then(|pos| self.containers.get_mut(&pos)) {
            Some(container) => container.add(item, n),
            None => agent.add_item(item, n),
        }

        let at = dst.or(src).unwrap_or(agent.pos);
        self.audit(
            now,
            &agent.id,
            "TRANSFER",
            at,
            0,
            0,
            "TRANSFER",
            Some(json!({"src": task.src_container, "dst": task.dst_container, "item": item, "count": n})),
        );
        Ok(WorkStep::Done)
    }

    // -- craft / smelt ---------------------------------------------------------

    /// Shared tail of CRAFT and SMELT: wait `time_ticks`, then convert one batch.
    fn run_recipe(&self, agent: &mut Agent, task: &mut WorkTask, recipe: &RecipeDef, now: u64) -> WorkResult {
        task.work_ticks += 1;
        if task.work_ticks < recipe.time_ticks {
            return Ok(WorkStep::Pending);
        }
        task.work_ticks = 0;
        if !agent.has_items(&recipe.inputs) {
            return reject(ErrorCode::NoResource, "missing inputs");
        }
        for (item, n) in &recipe.inputs {
            agent.take_item(item, *n);
        }
        for (item, n) in &recipe.outputs {
            agent.add_item(item, *n);
        }
        self.fun_on_recipe(agent, &recipe.recipe_id, recipe.tier, now);
        task.count -= 1;
        if task.count <= 0 {
            return Ok(WorkStep::Done);
        }
        Ok(WorkStep::Pending)
    }

    fn tick_craft(&mut self, agent: &mut Agent, task: &mut WorkTask, now: u64) -> WorkResult {
        let catalogs = Arc::clone(&self.catalogs);
        let Some(recipe) = catalogs.recipes.get(&task.recipe_id) else {
            return reject(ErrorCode::InvalidTarget, "unknown recipe");
        };
        match recipe.station.as_str() {
            "HAND" => {}
            "CRAFTING_BENCH" => {
                if !self.near_block(agent.pos, "CRAFTING_BENCH", STATION_RANGE) {
                    return reject(ErrorCode::Blocked, "need crafting bench nearby");
                }
            }
            _ => return reject(ErrorCode::InvalidTarget, "unsupported station"),
        }
        self.run_recipe(agent, task, recipe, now)
    }

    fn tick_smelt(&mut self, agent: &mut Agent, task: &mut WorkTask, now: u64) -> WorkResult {
        if !self.near_block(agent.pos, "FURNACE", STATION_RANGE) {
            return reject(ErrorCode::Blocked, "need furnace nearby");
        }
        let catalogs = Arc::clone(&self.catalogs);
        let Some(recipe) = catalogs
            .smelt_by_input
            .get(&task.item_id)
            .and_then(|id| catalogs.recipes.get(id))
        else {
            return reject(ErrorCode::InvalidTarget, "unsupported smelt item");
        };
        self.run_recipe(agent, task, recipe, now)
    }

    // -- blueprints ------------------------------------------------------------

    /// Chests and terminals within the auto-pull range of `anchor`, on the
    /// anchor's land (or all wild when the anchor is wild), that `agent_id` may
    /// withdraw from. Nearest first, then by position and kind.
    fn blueprint_storage(&self, agent_id: &str, anchor: Vec3i) -> Vec<Vec3i> {
        let anchor_land = self.land_at(anchor).map(|land| land.land_id.clone());
        let mut out = self
            .containers
            .values()
            .filter(|c| c.kind == "CHEST" || c.kind == "CONTRACT_TERMINAL")
            .filter(|c| manhattan(c.pos, anchor) <= self.cfg.blueprint_auto_pull_range)
            .filter(|c| self.land_at(c.pos).map(|land| land.land_id.clone()) == anchor_land)
            .filter(|c| self.can_withdraw_from(agent_id, c.pos))
            .map(|c| (manhattan(c.pos, anchor), c.pos, c.kind.clone()))
            .collect::<Vec<_>>();
        out.sort();
        out.into_iter().map(|(_, pos, _)| pos).collect()
    }

    /// Tops up the agent's inventory from nearby storage so that `need` is
    /// covered. Nothing moves unless the whole deficit can be met.
    fn pull_blueprint_materials(&mut self, agent: &mut Agent, anchor: Vec3i, need: &BTreeMap<String, i32>) -> Result<(), String> {
        let storage = self.blueprint_storage(&agent.id, anchor);
        for (item, required) in need {
            let deficit = required - agent.count(item);
            if deficit <= 0 {
                continue;
            }
            let available = storage
                .iter()
                .filter_map(|pos| self.containers.get(pos))
                .map(|c| c.available(item).max(0))
                .sum::<i32>();
            if available < deficit {
                return Err(format!("missing {item} x{}", deficit - available));
            }
        }
        for (item, required) in need {
            let mut deficit = required - agent.count(item);
            for pos in &storage {
                if deficit <= 0 {
                    break;
                }
                let Some(container) = self.containers.get_mut(pos) else {
                    continue;
                };
                let take = container.available(item).min(deficit);
                if take > 0 && container.take_available(item, take) {
                    agent.add_item(item, take);
                    deficit -= take;
                }
            }
        }
        Ok(())
    }

    fn tick_build_blueprint(&mut self, agent: &mut Agent, task: &mut WorkTask, now: u64) -> WorkResult {
        let catalogs = Arc::clone(&self.catalogs);
        let Some(bp) = catalogs.blueprints.get(&task.blueprint_id) else {
            return reject(ErrorCode::InvalidTarget, "unknown blueprint");
        };
        let (anchor, rotation) = (task.anchor, task.rotation);
        let cell = |index: usize| {
            let offset = rotate_offset(bp.blocks[index].pos, rotation);
            Vec3i::new(anchor.x + offset[0], anchor.y + offset[1], anchor.z + offset[2])
        };

        if !task.charged {
            let mut already = BTreeMap::<String, i32>::new();
            for (index, block) in bp.blocks.iter().enumerate() {
                let pos = cell(index);
                if !self.chunks.in_bounds(pos) {
                    return reject(ErrorCode::InvalidTarget, "out of bounds");
                }
                let Some(id) = catalogs.block_id(&block.block) else {
                    return reject(ErrorCode::Internal, "unknown block in blueprint");
                };
                if !self.can_build_at(&agent.id, pos, now) {
                    return self.denied(agent, "build denied");
                }
                match self.block_id_at(pos) {
                    AIR => {}
                    current if current == id => *already.entry(block.block.clone()).or_insert(0) += 1,
                    _ => return reject(ErrorCode::Blocked, "space occupied"),
                }
            }
            if already.values().sum::<i32>() as usize == bp.blocks.len() {
                // Already standing: no charge, no credit.
                return Ok(WorkStep::Done);
            }
            let need = bp
                .cost
                .iter()
                .filter(|(item, n)| !item.is_empty() && **n > 0)
                .map(|(item, n)| (item.clone(), n - already.get(item).copied().unwrap_or(0)))
                .filter(|(_, n)| *n > 0)
                .collect::<BTreeMap<_, _>>();
            if !agent.has_items(&need) {
                if let Err(message) = self.pull_blueprint_materials(agent, task.anchor, &need) {
                    return reject(ErrorCode::NoResource, message);
                }
            }
            for (item, n) in &need {
                agent.take_item(item, *n);
            }
            task.charged = true;
        }

        let limit = self.cfg.blueprint_blocks_per_tick.clamp(1, 64);
        let mut placed = 0;
        while placed < limit && task.build_index < bp.blocks.len() {
            let block = &bp.blocks[task.build_index];
            let pos = cell(task.build_index);
            if !self.chunks.in_bounds(pos) {
                return reject(ErrorCode::InvalidTarget, "out of bounds");
            }
            let Some(id) = catalogs.block_id(&block.block) else {
                return reject(ErrorCode::Internal, "unknown block in blueprint");
            };
            if !self.can_build_at(&agent.id, pos, now) {
                return self.denied(agent, "build denied");
            }
            match self.block_id_at(pos) {
                AIR => {
                    self.set_block(now, pos, id, &agent.id, "BUILD_BLUEPRINT");
                    self.on_block_placed(pos, &block.block, agent.yaw);
                    placed += 1;
                }
                current if current == id => {}
                _ => return reject(ErrorCode::Blocked, "space occupied"),
            }
            task.build_index += 1;
        }
        if task.build_index < bp.blocks.len() {
            return Ok(WorkStep::Pending);
        }

        self.stats.blueprints_complete += 1;
        self.register_structure(now, &agent.id, &task.blueprint_id, task.anchor, task.rotation);
        self.fun_on_blueprint_complete(agent, now);
        let goal = match self.event_running(now) {
            Some("BUILDER_EXPO") => Some(("BUILDER_EXPO", "CREATION", "builder_expo", "creation:builder_expo", 8, "EXPO_BUILD")),
            Some("BLUEPRINT_FAIR") => Some(("BLUEPRINT_FAIR", "INFLUENCE", "blueprint_fair", "influence:blueprint_fair", 6, "FAIR_BUILD")),
            _ => None,
        };
        if let Some((event_id, dim, reason, key, base, kind)) = goal {
            self.award(agent, now, dim, reason, key, base);
            agent.add_event(event(
                now,
                "EVENT_GOAL",
                json!({"event_id": event_id, "kind": kind, "blueprint_id": task.blueprint_id}),
            ));
        }
        Ok(WorkStep::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn better_tools_mine_faster_and_cheaper() {
        let tiers = (0..=3).map(mine_params).collect::<Vec<_>>();
        assert_eq!(tiers[0], (10, 15));
        assert!(tiers.windows(2).all(|w| w[1].0 < w[0].0 && w[1].1 < w[0].1));
        assert_eq!(mine_params(9), mine_params(3));
    }
}
