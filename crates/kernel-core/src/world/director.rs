//! World director: weather, fleet metrics and scheduled world events.

use std::collections::BTreeMap;

use super::*;
use crate::economy::BoardPost;
use crate::seeded_draw;
use crate::spatial::{dist_xz, positional_id};

/// Events run at the start of days 1..=7 of each season.
const SCRIPTED_WEEK: [&str; 7] = [
    "MARKET_WEEK",
    "CRYSTAL_RIFT",
    "BUILDER_EXPO",
    "FLOOD_WARNING",
    "RUINS_GATE",
    "BANDIT_CAMP",
    "CIVIC_VOTE",
];

/// Radius for events whose catalog entry leaves it unset.
const DEFAULT_EVENT_RADIUS: i32 = 32;
const CENTER_MARGIN: i32 = 64;
const CENTER_ATTEMPTS: u64 = 32;

/// Fleet health in [0, 1] per dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DirectorMetrics {
    pub trade: f64,
    pub conflict: f64,
    pub exploration: f64,
    pub inequality: f64,
    pub public_infra: f64,
}

fn unit(x: f64) -> f64 {
    if x.is_nan() {
        return 1.0;
    }
    x.clamp(0.0, 1.0)
}

/// Director-side valuation of one item, used only for the inequality metric.
fn wealth_unit_value(item: &str) -> f64 {
    match item {
        "CRYSTAL_SHARD" => 50.0,
        "IRON_INGOT" => 10.0,
        "COPPER_INGOT" => 6.0,
        "COAL" | "PLANK" => 1.0,
        _ => 0.5,
    }
}

fn wealth(inventory: &BTreeMap<String, i32>) -> f64 {
    inventory
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(item, n)| f64::from(*n) * wealth_unit_value(item))
        .sum()
}

/// Gini coefficient of `values`, clamped to [0, 1]. Zero for fewer than two
/// values or zero total.
pub fn gini(values: &[f64]) -> f64 {
    let sum = values.iter().sum::<f64>();
    if values.len() <= 1 || sum <= 0.0 {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len() as f64;
    let weighted = sorted
        .iter()
        .enumerate()
        .map(|(i, x)| (i + 1) as f64 * x)
        .sum::<f64>();
    unit(2.0 * weighted / (n * sum) - (n + 1.0) / n)
}

/// Nudges event weights toward what the fleet is missing.
fn apply_feedback(weights: &mut BTreeMap<String, f64>, m: &DirectorMetrics) {
    let mut bump = |id: &str, delta: f64| {
        if let Some(w) = weights.get_mut(id) {
            *w += delta;
        }
    };
    if m.trade < 0.4 {
        bump("MARKET_WEEK", 0.25);
        bump("BLUEPRINT_FAIR", 0.15);
    }
    if m.exploration < 0.3 {
        bump("CRYSTAL_RIFT", 0.20);
        bump("RUINS_GATE", 0.20);
    }
    if m.conflict < 0.10 {
        bump("DEEP_VEIN", 0.15);
        bump("BANDIT_CAMP", 0.10);
    } else if m.conflict > 0.25 {
        bump("CIVIC_VOTE", 0.25);
        bump("MARKET_WEEK", 0.10);
        bump("BUILDER_EXPO", 0.10);
    }
    if m.inequality > 0.50 {
        bump("CIVIC_VOTE", 0.20);
        bump("FLOOD_WARNING", 0.10);
    }
    if m.public_infra < 0.2 {
        bump("BUILDER_EXPO", 0.10);
    }
}

/// Picks an id with probability proportional to its weight. `roll` is mapped
/// onto [0, total) and ids are walked in sorted order.
pub fn sample_weighted(weights: &BTreeMap<String, f64>, roll: u64) -> Option<&str> {
    let live = weights.iter().filter(|(_, w)| **w > 0.0).collect::<Vec<_>>();
    let total = live.iter().map(|(_, w)| **w).sum::<f64>();
    if total <= 0.0 {
        return None;
    }
    let target = (roll % 1_000_000_000) as f64 / 1_000_000_000.0 * total;
    let mut acc = 0.0;
    for (id, w) in &live {
        acc += **w;
        if target <= acc {
            return Some(id.as_str());
        }
    }
    live.last().map(|(id, _)| id.as_str())
}

fn weather_roll(roll: u64) -> Weather {
    match roll % 100 {
        0..=69 => Weather::Clear,
        70..=84 => Weather::Storm,
        _ => Weather::Cold,
    }
}

impl World {
    pub(super) fn system_director(&mut self, now: u64) {
        if self.active_event.as_ref().is_some_and(|ev| now >= ev.ends_tick) {
            self.active_event = None;
        }
        if self.weather_until_tick != 0 && now >= self.weather_until_tick {
            self.weather = Weather::Clear;
            self.weather_until_tick = 0;
        }

        let every = self.cfg.director_every_ticks;
        let evaluate = every > 0 && now > 0 && now % every == 0;
        if evaluate && self.weather_until_tick == 0 {
            let next = weather_roll(seeded_draw(self.cfg.seed, now, "weather", 0));
            if next != Weather::Clear {
                self.weather = next;
                self.weather_until_tick = now + every;
                tracing::debug!(world_id = %self.cfg.world_id, tick = now, weather = next.as_str(), "weather changed");
            }
        }

        if self.active_event.is_some() {
            return;
        }

        let day = self.cfg.day_ticks;
        if day > 0 && now % day == 0 {
            let day_in_season = self.season_day(now);
            if let Some(event_id) = SCRIPTED_WEEK.get(day_in_season.wrapping_sub(1) as usize) {
                self.start_event(now, event_id);
                return;
            }
        }

        if !evaluate {
            return;
        }
        let metrics = self.director_metrics(now);
        let mut weights = self
            .catalogs
            .events
            .keys()
            .map(|id| (id.clone(), 1.0))
            .collect::<BTreeMap<_, _>>();
        apply_feedback(&mut weights, &metrics);
        let picked = sample_weighted(&weights, seeded_draw(self.cfg.seed, now, "director", 0)).map(str::to_string);
        tracing::debug!(
            world_id = %self.cfg.world_id,
            tick = now,
            trade = metrics.trade,
            conflict = metrics.conflict,
            exploration = metrics.exploration,
            inequality = metrics.inequality,
            picked = picked.as_deref().unwrap_or(""),
            "director evaluated"
        );
        self.stats = DirectorStats {
            window_start_tick: now,
            ..DirectorStats::default()
        };
        if let Some(event_id) = picked {
            self.start_event(now, &event_id);
        }
    }

    /// 1-based day within the current season.
    pub(super) fn season_day(&self, now: u64) -> u64 {
        let day = self.cfg.day_ticks.max(1);
        let season = self.cfg.season_length_ticks;
        let in_season = if season > 0 { now % season } else { now };
        in_season / day + 1
    }

    pub fn director_metrics(&self, now: u64) -> DirectorMetrics {
        let agents = self.agents.len();
        if agents == 0 {
            return DirectorMetrics::default();
        }
        let n = agents as f64;
        let window = now.saturating_sub(self.stats.window_start_tick).max(1) as f64;
        let holdings = self.agents.values().map(|a| wealth(&a.inventory)).collect::<Vec<_>>();
        DirectorMetrics {
            trade: unit(self.stats.trades as f64 / n / 5.0),
            conflict: unit(self.stats.denied as f64 / (n * window) * 100.0),
            exploration: unit(self.stats.chunks_discovered as f64 / n / 20.0),
            inequality: gini(&holdings),
            public_infra: unit(self.stats.blueprints_complete as f64 / n / 5.0),
        }
    }

    // -- events ----------------------------------------------------------------

    fn start_event(&mut self, now: u64, event_id: &str) {
        let Some(def) = self.catalogs.events.get(event_id).cloned() else {
            return;
        };
        let duration = if def.duration_ticks > 0 { def.duration_ticks } else { self.cfg.day_ticks };
        let radius = if def.radius > 0 { def.radius } else { DEFAULT_EVENT_RADIUS };
        let center = self.pick_event_center(now, event_id);
        self.active_event = Some(ActiveEvent {
            event_id: event_id.to_string(),
            start_tick: now,
            ends_tick: now + duration,
            center,
            radius,
        });
        self.instantiate_event(now, event_id, center, &def.title);
        tracing::info!(world_id = %self.cfg.world_id, tick = now, event_id, ?center, radius, "world event started");
        if let Some(ev) = self.active_event_notice(now) {
            for agent in self.agents.values_mut() {
                agent.add_event(ev.clone());
            }
        }
    }

    /// WORLD_EVENT notice for the running event, if any.
    pub(super) fn active_event_notice(&self, now: u64) -> Option<Event> {
        let active = self.active_event.as_ref().filter(|ev| now < ev.ends_tick)?;
        let title = self
            .catalogs
            .events
            .get(&active.event_id)
            .map(|def| def.title.clone())
            .unwrap_or_default();
        Some(event(
            now,
            "WORLD_EVENT",
            json!({
                "event_id": active.event_id,
                "title": title,
                "summary": title,
                "ends_tick": active.ends_tick,
                "center": active.center.to_array(),
                "radius": active.radius,
            }),
        ))
    }

    /// Running event whose radius covers `pos`.
    pub(super) fn event_covering(&self, pos: Vec3i, now: u64) -> Option<&str> {
        self.active_event
            .as_ref()
            .filter(|ev| now < ev.ends_tick && ev.radius > 0 && dist_xz(pos, ev.center) <= ev.radius)
            .map(|ev| ev.event_id.as_str())
    }

    /// First unclaimed point drawn from (seed, event, tick, attempt), kept a
    /// margin away from the boundary.
    fn pick_event_center(&self, now: u64, event_id: &str) -> Vec3i {
        let boundary = self.cfg.boundary_r.max(1);
        let (margin, span) = match boundary * 2 - CENTER_MARGIN * 2 {
            span if span > 0 => (CENTER_MARGIN, span),
            _ => (0, boundary * 2),
        };
        let purpose = format!("event_center:{event_id}");
        for attempt in 0..CENTER_ATTEMPTS {
            let hx = seeded_draw(self.cfg.seed, now, &purpose, attempt * 2);
            let hz = seeded_draw(self.cfg.seed, now, &purpose, attempt * 2 + 1);
            let p = Vec3i::new(
                -boundary + margin + (hx % span as u64) as i32,
                0,
                -boundary + margin + (hz % span as u64) as i32,
            );
            if self.land_at(p).is_none() {
                return p;
            }
        }
        Vec3i::default()
    }

    fn fill_square(&mut self, now: u64, center: Vec3i, half: i32, reason: &str, pick: impl Fn(i32, i32) -> Option<&'static str>) {
        for dz in -half..=half {
            for dx in -half..=half {
                let Some(name) = pick(dx, dz) else {
                    continue;
                };
                let Some(id) = self.catalogs.block_id(name) else {
                    continue;
                };
                let pos = center.offset(dx, dz);
                let old = self.block_name_at(pos);
                if old != name {
                    self.on_block_removed(now, "WORLD", pos, &old, reason);
                }
                self.set_block(now, pos, id, "WORLD", reason);
            }
        }
    }

    fn stock_chest(&mut self, now: u64, pos: Vec3i, reason: &str, loot: &[(&str, i32)]) {
        if let Some(id) = self.catalogs.block_id("CHEST") {
            self.set_block(now, pos, id, "WORLD", reason);
        }
        let chest = self
            .containers
            .entry(pos)
            .or_insert_with(|| Container::new("CHEST", pos));
        for (item, n) in loot {
            chest.add(item, *n);
        }
    }

    fn event_sign(&mut self, now: u64, pos: Vec3i, reason: &str, text: &str) {
        let Some(id) = self.catalogs.block_id("SIGN") else {
            return;
        };
        self.set_block(now, pos, id, "WORLD", reason);
        self.signs.insert(
            pos,
            Sign {
                pos,
                text: text.to_string(),
                updated_tick: now,
                updated_by: "WORLD".to_string(),
            },
        );
    }

    /// Bulletin board at `center` with one WORLD post, and a sign beside it.
    fn notice_board(&mut self, now: u64, center: Vec3i, reason: &str, headline: &str, body: &str) {
        let Some(id) = self.catalogs.block_id("BULLETIN_BOARD") else {
            return;
        };
        self.set_block(now, center, id, "WORLD", reason);
        self.counters.post += 1;
        let post_id = format!("P{:06}", self.counters.post);
        let board_id = positional_id("BULLETIN_BOARD", center);
        self.boards
            .entry(board_id.clone())
            .or_insert_with(|| Board {
                board_id,
                posts: Vec::new(),
            })
            .posts
            .push(BoardPost {
                post_id,
                author: "WORLD".to_string(),
                title: headline.to_string(),
                body: body.to_string(),
                tick: now,
            });
        self.event_sign(now, center.offset(1, 0), reason, headline);
    }

    /// Reshapes terrain around `center` for events that leave a physical mark.
    fn instantiate_event(&mut self, now: u64, event_id: &str, center: Vec3i, title: &str) {
        let reason = format!("EVENT:{event_id}");
        let reason = reason.as_str();
        match event_id {
            "CRYSTAL_RIFT" => self.fill_square(now, center, 2, reason, |_, _| Some("CRYSTAL_ORE")),
            "DEEP_VEIN" => self.fill_square(now, center, 3, reason, |dx, dz| {
                Some(if (dx + dz) & 1 == 0 { "COPPER_ORE" } else { "IRON_ORE" })
            }),
            "RUINS_GATE" => {
                self.fill_square(now, center, 1, reason, |dx, dz| (dx != 0 || dz != 0).then_some("BRICK"));
                self.stock_chest(
                    now,
                    center,
                    reason,
                    &[("CRYSTAL_SHARD", 2), ("IRON_INGOT", 4), ("COPPER_INGOT", 4)],
                );
            }
            "BANDIT_CAMP" => {
                self.fill_square(now, center, 2, reason, |dx, dz| match (dx.abs(), dz.abs()) {
                    (0, 0) => None,
                    (2, _) | (_, 2) => Some("BRICK"),
                    _ => Some("AIR"),
                });
                self.stock_chest(
                    now,
                    center,
                    reason,
                    &[("IRON_INGOT", 6), ("COPPER_INGOT", 4), ("CRYSTAL_SHARD", 1), ("BREAD", 2)],
                );
                self.event_sign(now, center.offset(3, 0), reason, "BANDIT CAMP");
            }
            "FLOOD_WARNING" => {
                self.fill_square(now, center, 2, reason, |_, _| Some("WATER"));
                self.notice_board(now, center.offset(0, 4), reason, title, "Low ground may flood. Move storage and raise levees.");
            }
            "BLIGHT_ZONE" => {
                self.fill_square(now, center, 3, reason, |dx, dz| (dx.abs() + dz.abs() <= 4).then_some("GRAVEL"));
                self.notice_board(now, center.offset(0, 5), reason, title, "Blight slows stamina recovery and speeds up hunger.");
            }
            "MARKET_WEEK" => self.notice_board(now, center, reason, title, "Market taxes are halved. Trade and sign contracts."),
            "BLUEPRINT_FAIR" => self.notice_board(now, center, reason, title, "Completed blueprints earn extra influence."),
            "BUILDER_EXPO" => self.notice_board(now, center, reason, title, "Theme: MONUMENT. Build a blueprint and show it off."),
            "CIVIC_VOTE" => self.notice_board(now, center, reason, title, "Propose and vote on laws for extra narrative credit."),
            _ => {}
        }
    }

    // -- event goals -----------------------------------------------------------

    fn event_goal(&self, agent: &mut Agent, now: u64, event_id: &str, kind: &str) {
        agent.add_event(event(now, "EVENT_GOAL", json!({"event_id": event_id, "kind": kind})));
    }

    pub(super) fn on_mined_during_event(&self, agent: &mut Agent, pos: Vec3i, block: &str, now: u64) {
        let Some(event_id) = self.event_covering(pos, now) else {
            return;
        };
        let (bonus, kind) = match (event_id, block) {
            ("CRYSTAL_RIFT", "CRYSTAL_ORE") => ("CRYSTAL_SHARD", "MINE_CRYSTAL"),
            ("DEEP_VEIN", "IRON_ORE") => ("IRON_ORE", "MINE_VEIN"),
            ("DEEP_VEIN", "COPPER_ORE") => ("COPPER_ORE", "MINE_VEIN"),
            _ => return,
        };
        agent.add_item(bonus, 1);
        self.fun_on_event_participation(agent, event_id, now);
        let key = format!("narrative:event_mine:{event_id}");
        self.award(agent, now, "NARRATIVE", "event_mine", &key, 5);
        self.event_goal(agent, now, event_id, kind);
    }

    pub(super) fn on_container_opened_during_event(&self, agent: &mut Agent, kind: &str, pos: Vec3i, now: u64) {
        if kind != "CHEST" {
            return;
        }
        match self.event_covering(pos, now) {
            Some(event_id @ "RUINS_GATE") => {
                self.fun_on_event_participation(agent, event_id, now);
                self.award(agent, now, "NARRATIVE", "ruins_open", "narrative:ruins_open", 12);
                self.event_goal(agent, now, event_id, "OPEN_RUINS");
            }
            Some(event_id @ "BANDIT_CAMP") => {
                self.fun_on_event_participation(agent, event_id, now);
                self.award(agent, now, "RISK_RESCUE", "bandit_loot", "risk:bandit_loot", 10);
                self.award(agent, now, "NARRATIVE", "bandit_loot", "narrative:bandit_loot", 8);
                self.event_goal(agent, now, event_id, "LOOT_BANDITS");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gini_of_equal_wealth_is_zero() {
        assert_eq!(gini(&[5.0, 5.0, 5.0]), 0.0);
        assert_eq!(gini(&[3.0]), 0.0);
        assert_eq!(gini(&[0.0, 0.0]), 0.0);
    }

    #[test]
    fn gini_grows_with_concentration() {
        let spread = gini(&[1.0, 2.0, 3.0, 4.0]);
        let concentrated = gini(&[0.0, 0.0, 0.0, 10.0]);
        assert!(spread > 0.0);
        assert!(concentrated > spread);
        assert!((concentrated - 0.75).abs() < 1e-9);
    }

    #[test]
    fn weighted_sampling_is_deterministic_and_skips_zero_weights() {
        let weights = BTreeMap::from([
            ("A".to_string(), 1.0),
            ("B".to_string(), 0.0),
            ("C".to_string(), 1.0),
        ]);
        assert_eq!(sample_weighted(&weights, 0), Some("A"));
        assert_eq!(sample_weighted(&weights, 999_999_999), Some("C"));
        for roll in [1, 17, 400_000_000, 123_456_789_012] {
            assert_ne!(sample_weighted(&weights, roll), Some("B"));
        }
        assert_eq!(sample_weighted(&BTreeMap::new(), 3), None);
    }

    #[test]
    fn feedback_favours_markets_when_trade_is_low() {
        let mut weights = BTreeMap::from([("MARKET_WEEK".to_string(), 1.0), ("DEEP_VEIN".to_string(), 1.0)]);
        let metrics = DirectorMetrics {
            trade: 0.1,
            conflict: 0.5,
            exploration: 1.0,
            inequality: 0.0,
            public_infra: 1.0,
        };
        apply_feedback(&mut weights, &metrics);
        assert!(weights["MARKET_WEEK"] > 1.3);
        assert_eq!(weights["DEEP_VEIN"], 1.0);
    }

    #[test]
    fn weather_roll_covers_all_kinds() {
        assert_eq!(weather_roll(5), Weather::Clear);
        assert_eq!(weather_roll(75), Weather::Storm);
        assert_eq!(weather_roll(99), Weather::Cold);
    }
}
