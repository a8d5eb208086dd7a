//! Per-world configuration: defaults, validation and derived generator params.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chunks::WorldGenParams;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidHeight(i32),
    Invalid { field: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHeight(height) => write!(f, "height must be 1 (got {height})"),
            Self::Invalid { field, reason } => write!(f, "invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub window_ticks: u64,
    pub max: u32,
}

impl RateLimit {
    const fn new(window_ticks: u64, max: u32) -> Self {
        Self { window_ticks, max }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default)]
    pub say: RateLimit,
    #[serde(default)]
    pub market_say: RateLimit,
    #[serde(default)]
    pub whisper: RateLimit,
    #[serde(default)]
    pub offer_trade: RateLimit,
    #[serde(default)]
    pub post_board: RateLimit,
}

impl RateLimits {
    /// Limit for a rate-limited action kind.
    pub fn for_kind(&self, kind: &str) -> Option<RateLimit> {
        match kind {
            "SAY" => Some(self.say),
            "SAY_MARKET" => Some(self.market_say),
            "WHISPER" => Some(self.whisper),
            "OFFER_TRADE" => Some(self.offer_trade),
            "POST_BOARD" => Some(self.post_board),
            _ => None,
        }
    }

    fn apply_defaults(&mut self) {
        let fill = |limit: &mut RateLimit, default: RateLimit| {
            if limit.window_ticks == 0 {
                limit.window_ticks = default.window_ticks;
            }
            if limit.max == 0 {
                limit.max = default.max;
            }
        };
        fill(&mut self.say, RateLimit::new(50, 5));
        fill(&mut self.market_say, RateLimit::new(50, 2));
        fill(&mut self.whisper, RateLimit::new(50, 5));
        fill(&mut self.offer_trade, RateLimit::new(50, 3));
        fill(&mut self.post_board, RateLimit::new(600, 1));
    }
}

/// Capabilities a world grants; set from the world directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldFlags {
    pub allow_claims: bool,
    pub allow_mine: bool,
    pub allow_place: bool,
    pub allow_laws: bool,
    pub allow_trade: bool,
    pub allow_build: bool,
}

impl Default for WorldFlags {
    fn default() -> Self {
        Self {
            allow_claims: true,
            allow_mine: true,
            allow_place: true,
            allow_laws: true,
            allow_trade: true,
            allow_build: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldConfig {
    pub world_id: String,
    #[serde(default)]
    pub world_type: String,
    #[serde(default)]
    pub tick_rate_hz: u32,
    #[serde(default)]
    pub day_ticks: u64,
    #[serde(default)]
    pub season_length_ticks: u64,
    #[serde(default)]
    pub reset_notice_ticks: u64,
    #[serde(default)]
    pub obs_radius: i32,
    #[serde(default)]
    pub height: i32,
    #[serde(default)]
    pub seed: i64,
    #[serde(default)]
    pub boundary_r: i32,

    #[serde(default)]
    pub biome_region_size: i32,
    #[serde(default)]
    pub spawn_clear_radius: i32,
    #[serde(default)]
    pub ore_cluster_scale_permille: u32,
    #[serde(default)]
    pub terrain_cluster_scale_permille: u32,
    #[serde(default)]
    pub sprinkle_stone_permille: u32,
    #[serde(default)]
    pub sprinkle_dirt_permille: u32,
    #[serde(default)]
    pub sprinkle_log_permille: u32,

    #[serde(default)]
    pub starter_items: BTreeMap<String, i32>,
    #[serde(default)]
    pub snapshot_every_ticks: u64,
    #[serde(default)]
    pub director_every_ticks: u64,
    #[serde(default)]
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub law_notice_ticks: u64,
    #[serde(default)]
    pub law_vote_ticks: u64,
    #[serde(default)]
    pub blueprint_auto_pull_range: i32,
    #[serde(default)]
    pub blueprint_blocks_per_tick: usize,
    #[serde(default)]
    pub access_pass_core_radius: i32,
    #[serde(default)]
    pub maintenance_cost: BTreeMap<String, i32>,
    #[serde(default)]
    pub fun_decay_window_ticks: u64,
    #[serde(default)]
    pub fun_decay_base: f64,
    #[serde(default)]
    pub structure_survival_ticks: u64,

    #[serde(default)]
    pub flags: WorldFlags,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            world_id: "OVERWORLD".to_string(),
            world_type: String::new(),
            tick_rate_hz: 0,
            day_ticks: 0,
            season_length_ticks: 0,
            reset_notice_ticks: 0,
            obs_radius: 0,
            height: 0,
            seed: 0,
            boundary_r: 0,
            biome_region_size: 0,
            spawn_clear_radius: 0,
            ore_cluster_scale_permille: 0,
            terrain_cluster_scale_permille: 0,
            sprinkle_stone_permille: 0,
            sprinkle_dirt_permille: 0,
            sprinkle_log_permille: 0,
            starter_items: BTreeMap::new(),
            snapshot_every_ticks: 0,
            director_every_ticks: 0,
            rate_limits: RateLimits::default(),
            law_notice_ticks: 0,
            law_vote_ticks: 0,
            blueprint_auto_pull_range: 0,
            blueprint_blocks_per_tick: 0,
            access_pass_core_radius: 0,
            maintenance_cost: BTreeMap::new(),
            fun_decay_window_ticks: 0,
            fun_decay_base: 0.0,
            structure_survival_ticks: 0,
            flags: WorldFlags::default(),
        }
    }
}

impl WorldConfig {
    /// Fills every zero-valued field with its default. Idempotent.
    pub fn apply_defaults(&mut self) {
        if self.world_id.is_empty() {
            self.world_id = "OVERWORLD".to_string();
        }
        if self.world_type.is_empty() {
            self.world_type = self.world_id.clone();
        }
        if self.tick_rate_hz == 0 {
            self.tick_rate_hz = 5;
        }
        if self.day_ticks == 0 {
            self.day_ticks = 6000;
        }
        if self.season_length_ticks == 0 {
            self.season_length_ticks = self.day_ticks * 7;
        }
        if self.obs_radius == 0 {
            self.obs_radius = 7;
        }
        if self.height == 0 {
            self.height = 1;
        }
        if self.boundary_r == 0 {
            self.boundary_r = 4000;
        }
        let gen = WorldGenParams::default();
        if self.biome_region_size == 0 {
            self.biome_region_size = gen.biome_region_size;
        }
        if self.spawn_clear_radius == 0 {
            self.spawn_clear_radius = gen.spawn_clear_radius;
        }
        if self.ore_cluster_scale_permille == 0 {
            self.ore_cluster_scale_permille = gen.ore_cluster_scale_permille;
        }
        if self.terrain_cluster_scale_permille == 0 {
            self.terrain_cluster_scale_permille = gen.terrain_cluster_scale_permille;
        }
        if self.sprinkle_stone_permille == 0 {
            self.sprinkle_stone_permille = gen.sprinkle_stone_permille;
        }
        if self.sprinkle_dirt_permille == 0 {
            self.sprinkle_dirt_permille = gen.sprinkle_dirt_permille;
        }
        if self.sprinkle_log_permille == 0 {
            self.sprinkle_log_permille = gen.sprinkle_log_permille;
        }
        if self.starter_items.is_empty() {
            self.starter_items = [("PLANK", 20), ("COAL", 10), ("STONE", 20), ("BERRIES", 10)]
                .into_iter()
                .map(|(item, count)| (item.to_string(), count))
                .collect();
        }
        if self.snapshot_every_ticks == 0 {
            self.snapshot_every_ticks = 3000;
        }
        if self.director_every_ticks == 0 {
            self.director_every_ticks = 3000;
        }
        self.rate_limits.apply_defaults();
        if self.law_notice_ticks == 0 {
            self.law_notice_ticks = 3000;
        }
        if self.law_vote_ticks == 0 {
            self.law_vote_ticks = 3000;
        }
        if self.blueprint_auto_pull_range == 0 {
            self.blueprint_auto_pull_range = 32;
        }
        if self.blueprint_blocks_per_tick == 0 {
            self.blueprint_blocks_per_tick = 2;
        }
        if self.access_pass_core_radius == 0 {
            self.access_pass_core_radius = 16;
        }
        if self.maintenance_cost.is_empty() {
            self.maintenance_cost = [("IRON_INGOT", 1), ("COAL", 1)]
                .into_iter()
                .map(|(item, count)| (item.to_string(), count))
                .collect();
        }
        if self.fun_decay_window_ticks == 0 {
            self.fun_decay_window_ticks = 3000;
        }
        if self.fun_decay_base == 0.0 {
            self.fun_decay_base = 0.70;
        }
        if self.structure_survival_ticks == 0 {
            self.structure_survival_ticks = 3000;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.height != 1 {
            return Err(ConfigError::InvalidHeight(self.height));
        }
        if self.world_id.trim().is_empty() {
            return Err(invalid("world_id", "must not be empty"));
        }
        if self.tick_rate_hz == 0 || self.tick_rate_hz > 100 {
            return Err(invalid("tick_rate_hz", "must be in 1..=100"));
        }
        if self.day_ticks == 0 {
            return Err(invalid("day_ticks", "must be positive"));
        }
        if self.season_length_ticks == 0 {
            return Err(invalid("season_length_ticks", "must be positive"));
        }
        if self.reset_notice_ticks >= self.season_length_ticks {
            return Err(invalid(
                "reset_notice_ticks",
                "must be shorter than the season length",
            ));
        }
        if self.obs_radius <= 0 || self.obs_radius > 32 {
            return Err(invalid("obs_radius", "must be in 1..=32"));
        }
        if self.boundary_r <= 0 {
            return Err(invalid("boundary_r", "must be positive"));
        }
        if !(self.fun_decay_base > 0.0 && self.fun_decay_base <= 1.0) {
            return Err(invalid("fun_decay_base", "must be in (0, 1]"));
        }
        for (item, count) in self
            .starter_items
            .iter()
            .chain(self.maintenance_cost.iter())
        {
            if *count < 0 {
                return Err(invalid("items", format!("negative count for {item}")));
            }
        }
        for kind in ["SAY", "SAY_MARKET", "WHISPER", "OFFER_TRADE", "POST_BOARD"] {
            if let Some(limit) = self.rate_limits.for_kind(kind) {
                if limit.window_ticks == 0 || limit.max == 0 {
                    return Err(invalid("rate_limits", format!("{kind} must be positive")));
                }
            }
        }
        Ok(())
    }

    pub fn gen_params(&self) -> WorldGenParams {
        WorldGenParams {
            seed: self.seed,
            boundary_r: self.boundary_r,
            biome_region_size: self.biome_region_size,
            spawn_clear_radius: self.spawn_clear_radius,
            ore_cluster_scale_permille: self.ore_cluster_scale_permille,
            terrain_cluster_scale_permille: self.terrain_cluster_scale_permille,
            sprinkle_stone_permille: self.sprinkle_stone_permille,
            sprinkle_dirt_permille: self.sprinkle_dirt_permille,
            sprinkle_log_permille: self.sprinkle_log_permille,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_idempotent() {
        let mut cfg = WorldConfig::default();
        cfg.apply_defaults();
        cfg.validate().expect("defaults validate");
        let snapshot = cfg.clone();
        cfg.apply_defaults();
        assert_eq!(cfg, snapshot);
        assert_eq!(cfg.season_length_ticks, 42_000);
        assert_eq!(cfg.rate_limits.say, RateLimit::new(50, 5));
        assert_eq!(cfg.rate_limits.post_board, RateLimit::new(600, 1));
    }

    #[test]
    fn height_other_than_one_is_rejected() {
        let mut cfg = WorldConfig {
            height: 2,
            ..WorldConfig::default()
        };
        cfg.apply_defaults();
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidHeight(2)));
    }

    #[test]
    fn explicit_values_survive_defaults() {
        let mut cfg = WorldConfig {
            season_length_ticks: 3,
            snapshot_every_ticks: 1,
            ..WorldConfig::default()
        };
        cfg.rate_limits.say = RateLimit::new(100, 2);
        cfg.apply_defaults();
        assert_eq!(cfg.season_length_ticks, 3);
        assert_eq!(cfg.snapshot_every_ticks, 1);
        assert_eq!(cfg.rate_limits.say, RateLimit::new(100, 2));
        assert_eq!(cfg.rate_limits.whisper, RateLimit::new(50, 5));
    }

    #[test]
    fn fun_decay_base_must_be_a_fraction() {
        let mut cfg = WorldConfig {
            fun_decay_base: 1.5,
            ..WorldConfig::default()
        };
        cfg.apply_defaults();
        assert!(cfg.validate().is_err());
    }
}
