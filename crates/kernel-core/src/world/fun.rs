//! Fun-score awards. Each award key has its own decay window: the first award
//! in a window counts in full, the k-th is scaled by `fun_decay_base^(k-1)`.
//! Seen-sets gate one-off novelty credit.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::*;
use crate::agent::CountWindow;
use crate::catalogs::{normalize_rotation, rotate_offset, BlueprintDef};

impl World {
    /// Award for the next hit on `key`, advancing its decay window.
    pub(super) fn fun_decay(&self, agent: &mut Agent, key: &str, base: i64, now: u64) -> i64 {
        if base <= 0 {
            return 0;
        }
        let window = self.cfg.fun_decay_window_ticks.max(1);
        let slot = agent
            .fun_decay
            .entry(key.to_string())
            .or_insert(CountWindow {
                start_tick: now,
                count: 0,
            });
        if now.saturating_sub(slot.start_tick) >= window {
            slot.start_tick = now;
            slot.count = 0;
        }
        slot.count += 1;
        let mult = self.cfg.fun_decay_base.powi(slot.count as i32 - 1);
        ((base as f64) * mult).round().max(0.0) as i64
    }

    pub(super) fn add_fun(&self, agent: &mut Agent, now: u64, dim: &str, reason: &str, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Some(total) = agent.fun.add(dim, delta) {
            agent.add_event(event(
                now,
                "FUN",
                json!({"dim": dim, "delta": delta, "total": total, "reason": reason}),
            ));
        }
    }

    pub(super) fn award(&self, agent: &mut Agent, now: u64, dim: &str, reason: &str, key: &str, base: i64) {
        let delta = self.fun_decay(agent, key, base, now);
        self.add_fun(agent, now, dim, reason, delta);
    }

    pub(super) fn event_running(&self, now: u64) -> Option<&str> {
        self.active_event
            .as_ref()
            .filter(|ev| now < ev.ends_tick)
            .map(|ev| ev.event_id.as_str())
    }

    fn hazard_weather(&self) -> bool {
        matches!(self.weather, Weather::Storm | Weather::Cold)
    }

    // -- hooks -----------------------------------------------------------------

    pub(super) fn fun_on_biome(&self, agent: &mut Agent, now: u64) {
        let biome = self.chunks.biome_at(agent.pos.x, agent.pos.z);
        if agent.seen_biomes.insert(biome.to_string()) {
            self.add_fun(agent, now, "NOVELTY", &format!("biome:{biome}"), 10);
        }
    }

    pub(super) fn fun_on_recipe(&self, agent: &mut Agent, recipe_id: &str, tier: u8, now: u64) {
        if recipe_id.is_empty() || !agent.seen_recipes.insert(recipe_id.to_string()) {
            return;
        }
        let pts = match tier {
            0 | 1 => 3,
            2 => 5,
            _ => 8,
        };
        self.add_fun(agent, now, "NOVELTY", &format!("recipe:{recipe_id}"), pts);
    }

    pub(super) fn fun_on_event_participation(&self, agent: &mut Agent, event_id: &str, now: u64) {
        if event_id.is_empty() || !agent.seen_events.insert(event_id.to_string()) {
            return;
        }
        self.add_fun(agent, now, "NOVELTY", &format!("event:{event_id}"), 5);
    }

    pub(super) fn fun_on_trade(&self, agent: &mut Agent, now: u64) {
        let base = (2.0 * social_fun_factor(agent)).round() as i64;
        self.award(agent, now, "SOCIAL", "trade", "social:trade", base);
    }

    pub(super) fn fun_on_contract_complete(&self, agent: &mut Agent, now: u64, kind: &str) {
        let base = if kind == "BUILD" { 7.0 } else { 5.0 };
        let base = (base * social_fun_factor(agent)).round() as i64;
        self.award(agent, now, "SOCIAL", "contract", "social:contract", base);
        if let Some(event_id) = self.event_running(now) {
            self.fun_on_event_participation(agent, event_id, now);
            self.award(agent, now, "NARRATIVE", "event_success", "narrative:event_success", 5);
        }
        if self.hazard_weather() {
            self.award(agent, now, "RISK_RESCUE", "hazard_success", "risk:hazard_success", 8);
        }
    }

    pub(super) fn fun_on_blueprint_complete(&self, agent: &mut Agent, now: u64) {
        if let Some(event_id) = self.event_running(now) {
            self.fun_on_event_participation(agent, event_id, now);
            self.award(agent, now, "NARRATIVE", "event_build", "narrative:event_build", 5);
        }
        if self.hazard_weather() {
            self.award(agent, now, "RISK_RESCUE", "hazard_build", "risk:hazard_build", 8);
        }
    }

    pub(super) fn fun_on_law_active(&self, proposer: &mut Agent, now: u64) {
        self.award(proposer, now, "INFLUENCE", "law_adopted", "influence:law_adopted", 4);
        self.award(proposer, now, "NARRATIVE", "law_adopted", "narrative:law_adopted", 5);
        if self.event_running(now) == Some("CIVIC_VOTE") {
            self.fun_on_event_participation(proposer, "CIVIC_VOTE", now);
            self.award(proposer, now, "NARRATIVE", "civic_vote_law", "narrative:civic_vote_law", 6);
        }
    }

    pub(super) fn fun_on_vote(&self, agent: &mut Agent, now: u64) {
        if self.event_running(now) == Some("CIVIC_VOTE") {
            self.fun_on_event_participation(agent, "CIVIC_VOTE", now);
            self.award(agent, now, "NARRATIVE", "civic_vote_vote", "narrative:civic_vote_vote", 4);
        } else {
            self.award(agent, now, "NARRATIVE", "vote", "narrative:vote", 2);
        }
    }

    // -- structures ------------------------------------------------------------

    pub(super) fn register_structure(&mut self, now: u64, builder: &str, blueprint_id: &str, anchor: Vec3i, rotation: u8) {
        let Some(bp) = self.catalogs.blueprints.get(blueprint_id) else {
            return;
        };
        let cells = footprint(bp, anchor, rotation);
        let mut min = cells.first().copied().unwrap_or(anchor);
        let mut max = min;
        for p in &cells {
            min = Vec3i::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z));
            max = Vec3i::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z));
        }
        let structure_id = format!(
            "STRUCT_{builder}_{now}_{blueprint_id}_{}_{}_{}",
            anchor.x, anchor.y, anchor.z
        );
        self.structures.insert(
            structure_id.clone(),
            Structure {
                structure_id,
                blueprint_id: blueprint_id.to_string(),
                builder_id: builder.to_string(),
                anchor,
                rotation,
                min,
                max,
                completed_tick: now,
                award_due_tick: now + self.cfg.structure_survival_ticks,
                awarded: false,
                used_by: BTreeMap::new(),
                last_influence_day: 0,
            },
        );
    }

    pub(super) fn record_structure_usage(&mut self, agent_id: &str, pos: Vec3i, now: u64) {
        for structure in self.structures.values_mut() {
            if structure.contains(pos) {
                structure.used_by.insert(agent_id.to_string(), now);
            }
        }
    }

    /// True while every blueprint cell still holds its block.
    pub(super) fn blueprint_placed(&self, blueprint_id: &str, anchor: Vec3i, rotation: u8) -> bool {
        let Some(bp) = self.catalogs.blueprints.get(blueprint_id) else {
            return false;
        };
        let rotation = normalize_rotation(i32::from(rotation)).unwrap_or(0);
        bp.blocks.iter().all(|block| {
            let [dx, dy, dz] = rotate_offset(block.pos, rotation);
            let pos = Vec3i::new(anchor.x + dx, anchor.y + dy, anchor.z + dz);
            self.catalogs.block_id(&block.block) == Some(self.chunks.get(pos))
        })
    }

    /// At least 95% of the footprint must connect to the ground layer.
    pub(super) fn structure_stable(&self, bp: &BlueprintDef, anchor: Vec3i, rotation: u8) -> bool {
        let cells = footprint(bp, anchor, rotation);
        if cells.is_empty() {
            return true;
        }
        let index: BTreeMap<Vec3i, usize> = cells.iter().enumerate().map(|(i, p)| (*p, i)).collect();
        let mut visited = vec![false; cells.len()];
        let mut queue = VecDeque::new();
        for (i, p) in cells.iter().enumerate() {
            let below = Vec3i::new(p.x, p.y - 1, p.z);
            let grounded = p.y <= 1
                || (!index.contains_key(&below) && self.chunks.get(below) != AIR);
            if grounded {
                visited[i] = true;
                queue.push_back(i);
            }
        }
        while let Some(i) = queue.pop_front() {
            let p = cells[i];
            for (dx, dy, dz) in [(1, 0, 0), (-1, 0, 0), (0, 1, 0), (0, -1, 0), (0, 0, 1), (0, 0, -1)] {
                let next = Vec3i::new(p.x + dx, p.y + dy, p.z + dz);
                if let Some(&ni) = index.get(&next) {
                    if !visited[ni] {
                        visited[ni] = true;
                        queue.push_back(ni);
                    }
                }
            }
        }
        let connected = visited.iter().filter(|v| **v).count();
        connected > 0 && connected as f64 / visited.len() as f64 >= 0.95
    }

    fn structure_unique_users(structure: &Structure, now: u64, window: u64) -> usize {
        let cutoff = now.saturating_sub(window);
        structure
            .used_by
            .iter()
            .filter(|(agent_id, last)| **agent_id != structure.builder_id && **last >= cutoff)
            .count()
    }

    fn structure_creation_score(&self, bp: &BlueprintDef, structure: &Structure, now: u64) -> i64 {
        let unique: BTreeSet<&str> = bp.blocks.iter().map(|b| b.block.as_str()).collect();
        let has = |names: &[&str]| unique.iter().any(|b| names.contains(b));
        let mut modules = 0;
        for group in [
            &["CHEST"][..],
            &["TORCH"][..],
            &["CRAFTING_BENCH", "FURNACE"][..],
            &["BULLETIN_BOARD", "CONTRACT_TERMINAL", "CLAIM_TOTEM", "SIGN"][..],
        ] {
            if has(group) {
                modules += 2;
            }
        }
        let complexity = ((1.0 + unique.len() as f64).ln() * 2.0).round() as i64;
        let stability = if self.structure_stable(bp, structure.anchor, structure.rotation) {
            3
        } else {
            0
        };
        let users = Self::structure_unique_users(structure, now, self.cfg.day_ticks) as i64;
        5 + complexity + modules + stability + (2 * users).min(10)
    }

    /// Delayed creation awards and the daily influence sweep.
    pub(super) fn system_fun(&mut self, now: u64) {
        let ids: Vec<String> = self.structures.keys().cloned().collect();
        for id in &ids {
            let Some(structure) = self.structures.get(id).cloned() else {
                continue;
            };
            if structure.awarded || now < structure.award_due_tick {
                continue;
            }
            let bp = self.catalogs.blueprints.get(&structure.blueprint_id).cloned();
            let placed = self.blueprint_placed(&structure.blueprint_id, structure.anchor, structure.rotation);
            let (Some(bp), true, true) = (bp, placed, self.agents.contains_key(&structure.builder_id)) else {
                self.structures.remove(id);
                continue;
            };
            let pts = self.structure_creation_score(&bp, &structure, now);
            if let Some(mut builder) = self.agents.remove(&structure.builder_id) {
                if pts > 0 {
                    self.award(&mut builder, now, "CREATION", "structure", "creation:structure", pts);
                }
                self.agents.insert(builder.id.clone(), builder);
            }
            if let Some(structure) = self.structures.get_mut(id) {
                structure.awarded = true;
            }
        }

        let day_ticks = self.cfg.day_ticks;
        if now == 0 || now % day_ticks != 0 {
            return;
        }
        let day = now / day_ticks;
        let ids: Vec<String> = self.structures.keys().cloned().collect();
        for id in &ids {
            let Some(structure) = self.structures.get(id).cloned() else {
                continue;
            };
            if !self.blueprint_placed(&structure.blueprint_id, structure.anchor, structure.rotation) {
                self.structures.remove(id);
                continue;
            }
            if structure.last_influence_day == day {
                continue;
            }
            if let Some(s) = self.structures.get_mut(id) {
                s.last_influence_day = day;
            }
            let users = Self::structure_unique_users(&structure, now, day_ticks);
            if users == 0 {
                continue;
            }
            let pts = (3.0 * (users as f64).sqrt()).min(15.0).round() as i64;
            if let Some(mut builder) = self.agents.remove(&structure.builder_id) {
                self.award(&mut builder, now, "INFLUENCE", "infra_usage_day", "influence:infra_usage_day", pts);
                self.agents.insert(builder.id.clone(), builder);
            }
        }
    }
}

/// Trade reputation below 500 scales social awards down to half.
fn social_fun_factor(agent: &Agent) -> f64 {
    match agent.rep_trade {
        rep if rep >= 500 => 1.0,
        rep if rep <= 0 => 0.5,
        rep => 0.5 + 0.5 * (f64::from(rep) / 500.0),
    }
}

/// World cells covered by a blueprint placed at `anchor`.
pub(super) fn footprint(bp: &BlueprintDef, anchor: Vec3i, rotation: u8) -> Vec<Vec3i> {
    bp.blocks
        .iter()
        .map(|block| {
            let [dx, dy, dz] = rotate_offset(block.pos, rotation);
            Vec3i::new(anchor.x + dx, anchor.y + dy, anchor.z + dz)
        })
        .collect()
}
