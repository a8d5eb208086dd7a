//! World directory (`worlds.yaml`) and the environment-driven settings of the
//! durability pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use contracts::WorldRef;
use kernel_core::spatial::chebyshev_xz;
use kernel_core::{Vec3i, WorldConfig, WorldFlags};
use serde::{Deserialize, Serialize};

use crate::ManagerError;

const DEFAULT_ENTRY_RADIUS: i32 = 8;

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// World directory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub id: String,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub z: i32,
    #[serde(default)]
    pub radius: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl EntryPoint {
    fn at_origin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            x: 0,
            z: 0,
            radius: DEFAULT_ENTRY_RADIUS,
            enabled: true,
        }
    }

    pub fn center(&self) -> Vec3i {
        Vec3i::new(self.x, 0, self.z)
    }

    /// Chebyshev containment on the XZ plane.
    pub fn contains(&self, pos: Vec3i) -> bool {
        chebyshev_xz(pos, self.center()) <= self.radius
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSpec {
    pub id: String,
    #[serde(default, rename = "type")]
    pub world_type: String,
    #[serde(default)]
    pub seed_offset: i64,
    #[serde(default)]
    pub boundary_r: i32,
    #[serde(default)]
    pub reset_every_ticks: u64,
    #[serde(default)]
    pub reset_notice_ticks: u64,
    #[serde(default)]
    pub switch_cooldown_ticks: u64,
    #[serde(default)]
    pub entry_point_id: String,
    #[serde(default)]
    pub requires_permit: bool,
    #[serde(default)]
    pub allow_admin_reset: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_points: Vec<EntryPoint>,

    #[serde(default = "default_true")]
    pub allow_claims: bool,
    #[serde(default = "default_true")]
    pub allow_mine: bool,
    #[serde(default = "default_true")]
    pub allow_place: bool,
    #[serde(default = "default_true")]
    pub allow_laws: bool,
    #[serde(default = "default_true")]
    pub allow_trade: bool,
    #[serde(default = "default_true")]
    pub allow_build: bool,
}

impl WorldSpec {
    fn preset(
        id: &str,
        boundary_r: i32,
        reset_every_ticks: u64,
        reset_notice_ticks: u64,
        entry: &str,
        allow_admin_reset: bool,
        flags: WorldFlags,
    ) -> Self {
        Self {
            id: id.to_string(),
            world_type: id.to_string(),
            seed_offset: 0,
            boundary_r,
            reset_every_ticks,
            reset_notice_ticks,
            switch_cooldown_ticks: 150,
            entry_point_id: entry.to_string(),
            requires_permit: false,
            allow_admin_reset,
            entry_points: vec![EntryPoint::at_origin(entry)],
            allow_claims: flags.allow_claims,
            allow_mine: flags.allow_mine,
            allow_place: flags.allow_place,
            allow_laws: flags.allow_laws,
            allow_trade: flags.allow_trade,
            allow_build: flags.allow_build,
        }
    }

    pub fn flags(&self) -> WorldFlags {
        WorldFlags {
            allow_claims: self.allow_claims,
            allow_mine: self.allow_mine,
            allow_place: self.allow_place,
            allow_laws: self.allow_laws,
            allow_trade: self.allow_trade,
            allow_build: self.allow_build,
        }
    }

    pub fn entry_point(&self, entry_id: &str) -> Option<&EntryPoint> {
        self.entry_points.iter().find(|ep| ep.id == entry_id)
    }

    /// Kernel config for this world, layered over `base` (tick rate, cadences,
    /// tuning). The season length follows `reset_every_ticks`.
    pub fn to_world_config(&self, base: &WorldConfig) -> WorldConfig {
        let mut cfg = base.clone();
        cfg.world_id = self.id.clone();
        cfg.world_type = if self.world_type.is_empty() {
            self.id.clone()
        } else {
            self.world_type.clone()
        };
        cfg.seed = base.seed.wrapping_add(self.seed_offset);
        cfg.boundary_r = self.boundary_r;
        cfg.season_length_ticks = self.reset_every_ticks;
        cfg.reset_notice_ticks = self.reset_notice_ticks;
        cfg.flags = self.flags();
        cfg.apply_defaults();
        cfg
    }

    pub fn manifest_ref(&self) -> WorldRef {
        WorldRef {
            world_id: self.id.clone(),
            world_type: self.world_type.clone(),
            entry_point_id: self.entry_point_id.clone(),
            requires_permit: self.requires_permit,
            switch_cooldown_ticks: self.switch_cooldown_ticks,
            reset_every_ticks: self.reset_every_ticks,
            reset_notice_ticks: self.reset_notice_ticks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRoute {
    pub from_world: String,
    pub to_world: String,
    #[serde(default)]
    pub from_entry_id: String,
    #[serde(default)]
    pub to_entry_id: String,
    #[serde(default)]
    pub requires_permit: bool,
}

impl SwitchRoute {
    fn between(from: &WorldSpec, to: &WorldSpec) -> Self {
        Self {
            from_world: from.id.clone(),
            to_world: to.id.clone(),
            from_entry_id: from.entry_point_id.clone(),
            to_entry_id: to.entry_point_id.clone(),
            requires_permit: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiWorldConfig {
    pub default_world_id: String,
    pub worlds: Vec<WorldSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub switch_routes: Vec<SwitchRoute>,
}

impl Default for MultiWorldConfig {
    /// Overworld, three mine levels and a city hub, linked through their gates.
    fn default() -> Self {
        let all = WorldFlags::default();
        let mine = WorldFlags {
            allow_claims: false,
            allow_laws: false,
            allow_trade: false,
            allow_build: false,
            ..all
        };
        let city = WorldFlags {
            allow_mine: false,
            ..all
        };
        let worlds = vec![
            WorldSpec::preset("OVERWORLD", 4000, 42_000, 0, "overworld_spawn", false, all),
            WorldSpec::preset("MINE_L1", 1200, 3000, 300, "mine_l1_gate", true, mine),
            WorldSpec::preset("MINE_L2", 1000, 6000, 300, "mine_l2_gate", true, mine),
            WorldSpec::preset("MINE_L3", 800, 12_000, 300, "mine_l3_gate", true, mine),
            WorldSpec::preset("CITY_HUB", 600, 42_000, 0, "city_gate", false, city),
        ];
        let link = |from: usize, to: usize| SwitchRoute::between(&worlds[from], &worlds[to]);
        let switch_routes = vec![
            link(0, 1),
            link(1, 0),
            link(1, 2),
            link(2, 1),
            link(2, 3),
            link(3, 2),
            link(0, 4),
            link(4, 0),
        ];
        Self {
            default_world_id: "OVERWORLD".to_string(),
            worlds,
            switch_routes,
        }
    }
}

impl MultiWorldConfig {
    /// Reads `path`, or returns the built-in directory when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ManagerError> {
        let mut cfg = match path {
            None => Self::default(),
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&raw)?
            }
        };
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fills implied entry points and, when no routes are listed, links every
    /// pair of worlds through their primary entry points.
    pub fn normalize(&mut self) {
        for world in &mut self.worlds {
            if world.world_type.is_empty() {
                world.world_type = world.id.clone();
            }
            if world.entry_points.is_empty() {
                let id = match world.entry_point_id.trim() {
                    "" => format!("{}_entry", world.id.to_lowercase()),
                    id => id.to_string(),
                };
                world.entry_points.push(EntryPoint::at_origin(id));
            }
            let single = world.entry_points.len() == 1;
            for ep in &mut world.entry_points {
                if ep.radius <= 0 {
                    ep.radius = 1;
                }
                if single {
                    ep.enabled = true;
                }
            }
            if world.entry_point_id.trim().is_empty() {
                world.entry_point_id = world.entry_points[0].id.clone();
            }
        }
        if self.switch_routes.is_empty() {
            for from in &self.worlds {
                for to in self.worlds.iter().filter(|to| to.id != from.id) {
                    self.switch_routes.push(SwitchRoute::between(from, to));
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ManagerError> {
        if self.worlds.is_empty() {
            return Err(invalid("worlds must not be empty"));
        }
        let mut entries: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for world in &self.worlds {
            let id = world.id.as_str();
            if id.trim().is_empty() {
                return Err(invalid("world id must not be empty"));
            }
            if entries.contains_key(id) {
                return Err(invalid(format!("duplicate world id: {id}")));
            }
            if world.boundary_r <= 0 {
                return Err(invalid(format!("world {id} boundary_r must be > 0")));
            }
            if world.reset_every_ticks == 0 {
                return Err(invalid(format!("world {id} reset_every_ticks must be > 0")));
            }
            if world.reset_notice_ticks >= world.reset_every_ticks {
                return Err(invalid(format!(
                    "world {id} reset_notice_ticks must be in [0, reset_every_ticks)"
                )));
            }
            if world.entry_points.is_empty() {
                return Err(invalid(format!("world {id} must define at least one entry point")));
            }
            let mut ids = BTreeSet::new();
            for ep in &world.entry_points {
                let ep_id = ep.id.trim();
                if ep_id.is_empty() {
                    return Err(invalid(format!("world {id} has empty entry point id")));
                }
                if !ids.insert(ep_id) {
                    return Err(invalid(format!("world {id} duplicate entry point id: {ep_id}")));
                }
                if ep.radius <= 0 {
                    return Err(invalid(format!(
                        "world {id} entry point {ep_id} radius must be > 0"
                    )));
                }
            }
            if !ids.contains(world.entry_point_id.as_str()) {
                return Err(invalid(format!(
                    "world {id} entry_point_id {:?} not found in entry_points",
                    world.entry_point_id
                )));
            }
            entries.insert(id, ids);
        }
        if !entries.contains_key(self.default_world_id.as_str()) {
            return Err(invalid(format!(
                "default_world_id {:?} not found in worlds",
                self.default_world_id
            )));
        }
        for (i, route) in self.switch_routes.iter().enumerate() {
            let from = entries
                .get(route.from_world.as_str())
                .ok_or_else(|| invalid(format!("switch_routes[{i}] from_world {:?} not found", route.from_world)))?;
            let to = entries
                .get(route.to_world.as_str())
                .ok_or_else(|| invalid(format!("switch_routes[{i}] to_world {:?} not found", route.to_world)))?;
            if route.from_entry_id.trim().is_empty() || route.to_entry_id.trim().is_empty() {
                return Err(invalid(format!("switch_routes[{i}] missing from_entry_id/to_entry_id")));
            }
            if !from.contains(route.from_entry_id.as_str()) {
                return Err(invalid(format!(
                    "switch_routes[{i}] from_entry_id {:?} not found in {}",
                    route.from_entry_id, route.from_world
                )));
            }
            if !to.contains(route.to_entry_id.as_str()) {
                return Err(invalid(format!(
                    "switch_routes[{i}] to_entry_id {:?} not found in {}",
                    route.to_entry_id, route.to_world
                )));
            }
        }
        Ok(())
    }

    /// Manifest sent with WELCOME, ordered by world id.
    pub fn manifest(&self) -> Vec<WorldRef> {
        let mut out = self
            .worlds
            .iter()
            .map(WorldSpec::manifest_ref)
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.world_id.cmp(&b.world_id));
        out
    }

    pub fn world(&self, world_id: &str) -> Option<&WorldSpec> {
        self.worlds.iter().find(|w| w.id == world_id)
    }

    pub fn entry_point(&self, world_id: &str, entry_id: &str) -> Option<&EntryPoint> {
        self.world(world_id).and_then(|w| w.entry_point(entry_id))
    }

    /// Picks the route for a switch: an explicit source entry wins, then the
    /// route whose source entry contains `pos`, then the first enabled one.
    pub fn select_route(
        &self,
        from: &str,
        to: &str,
        from_entry_id: &str,
        pos: Vec3i,
    ) -> Option<&SwitchRoute> {
        let candidates = self
            .switch_routes
            .iter()
            .filter(|r| r.from_world == from && r.to_world == to)
            .filter(|r| {
                self.entry_point(from, &r.from_entry_id)
                    .is_some_and(|ep| ep.enabled)
            })
            .collect::<Vec<_>>();
        if !from_entry_id.is_empty() {
            return candidates
                .into_iter()
                .find(|r| r.from_entry_id == from_entry_id);
        }
        candidates
            .iter()
            .copied()
            .find(|r| {
                self.entry_point(from, &r.from_entry_id)
                    .is_some_and(|ep| ep.contains(pos))
            })
            .or_else(|| candidates.first().copied())
    }
}

fn invalid(reason: impl Into<String>) -> ManagerError {
    ManagerError::InvalidConfig(reason.into())
}

// ---------------------------------------------------------------------------
// Durability pipeline settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IndexBackend {
    Sqlite,
    Remote { ingest_url: String, token: String },
    #[default]
    Disabled,
}

impl IndexBackend {
    /// `VC_INDEX_BACKEND` = `sqlite` (default) | `d1` | `none`.
    pub fn from_env() -> Result<Self, ManagerError> {
        let raw = env_var("VC_INDEX_BACKEND").unwrap_or_else(|| "sqlite".to_string());
        match raw.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "none" | "off" => Ok(Self::Disabled),
            "d1" => {
                let ingest_url = env_var("VC_INDEX_D1_INGEST_URL").ok_or_else(|| {
                    invalid("VC_INDEX_D1_INGEST_URL is required when VC_INDEX_BACKEND=d1")
                })?;
                Ok(Self::Remote {
                    ingest_url,
                    token: env_var("VC_INDEX_D1_TOKEN").unwrap_or_default(),
                })
            }
            other => Err(invalid(format!("unknown VC_INDEX_BACKEND {other:?}"))),
        }
    }
}

/// Object-store credentials for the snapshot and log mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub prefix: String,
    pub region: String,
}

impl MirrorConfig {
    /// `None` unless endpoint, bucket and both keys are set.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            endpoint: env_var("VC_R2_ENDPOINT")?.trim_end_matches('/').to_string(),
            bucket: env_var("VC_R2_BUCKET")?,
            access_key_id: env_var("VC_R2_ACCESS_KEY_ID")?,
            secret_access_key: env_var("VC_R2_SECRET_ACCESS_KEY")?,
            prefix: env_var("VC_R2_PREFIX")
                .map(|p| p.trim_matches('/').to_string())
                .unwrap_or_default(),
            region: env_var("VC_R2_REGION").unwrap_or_else(|| "auto".to_string()),
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_directory_is_valid() {
        let cfg = MultiWorldConfig::load(None).expect("defaults");
        assert_eq!(cfg.worlds.len(), 5);
        assert_eq!(cfg.switch_routes.len(), 8);
        let ids = cfg
            .manifest()
            .into_iter()
            .map(|w| w.world_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["CITY_HUB", "MINE_L1", "MINE_L2", "MINE_L3", "OVERWORLD"]);
        let mine = cfg.world("MINE_L1").expect("mine");
        assert!(mine.allow_admin_reset);
        assert!(!mine.flags().allow_claims);
        assert!(mine.flags().allow_mine);
    }

    #[test]
    fn yaml_without_routes_links_every_pair() {
        let raw = "
default_world_id: A
worlds:
  - id: A
    boundary_r: 100
    reset_every_ticks: 50
  - id: B
    boundary_r: 100
    reset_every_ticks: 50
    entry_point_id: b_gate
";
        let mut cfg: MultiWorldConfig = serde_yaml::from_str(raw).expect("yaml");
        cfg.normalize();
        cfg.validate().expect("valid");
        assert_eq!(cfg.switch_routes.len(), 2);
        let a = cfg.world("A").expect("A");
        assert_eq!(a.entry_point_id, "a_entry");
        assert_eq!(a.world_type, "A");
        assert!(a.allow_trade);
        assert_eq!(cfg.world("B").map(|b| b.entry_points[0].id.as_str()), Some("b_gate"));
    }

    #[test]
    fn validation_rejects_bad_directories() {
        let mut cfg = MultiWorldConfig::default();
        cfg.default_world_id = "NOWHERE".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = MultiWorldConfig::default();
        cfg.worlds[1].reset_notice_ticks = cfg.worlds[1].reset_every_ticks;
        assert!(cfg.validate().is_err());

        let mut cfg = MultiWorldConfig::default();
        cfg.switch_routes[0].to_entry_id = "missing_gate".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = MultiWorldConfig::default();
        let dup = cfg.worlds[0].clone();
        cfg.worlds.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn world_config_follows_the_directory_entry() {
        let cfg = MultiWorldConfig::default();
        let base = WorldConfig {
            seed: 100,
            ..WorldConfig::default()
        };
        let mut spec = cfg.world("MINE_L2").cloned().expect("mine");
        spec.seed_offset = 7;
        let world = spec.to_world_config(&base);
        assert_eq!(world.world_id, "MINE_L2");
        assert_eq!(world.seed, 107);
        assert_eq!(world.season_length_ticks, 6000);
        assert_eq!(world.reset_notice_ticks, 300);
        assert_eq!(world.boundary_r, 1000);
        assert!(!world.flags.allow_laws);
        assert_eq!(world.height, 1);
    }

    #[test]
    fn route_selection_prefers_explicit_then_containing_entry() {
        let raw = "
default_world_id: A
worlds:
  - id: A
    boundary_r: 100
    reset_every_ticks: 50
    entry_point_id: west
    entry_points:
      - {id: west, x: -40, z: 0, radius: 4}
      - {id: east, x: 40, z: 0, radius: 4}
  - id: B
    boundary_r: 100
    reset_every_ticks: 50
switch_routes:
  - {from_world: A, to_world: B, from_entry_id: west, to_entry_id: b_entry}
  - {from_world: A, to_world: B, from_entry_id: east, to_entry_id: b_entry}
";
        let mut cfg: MultiWorldConfig = serde_yaml::from_str(raw).expect("yaml");
        cfg.normalize();
        cfg.validate().expect("valid");
        let near_east = Vec3i::new(41, 0, 2);
        let pick = |entry: &str, pos: Vec3i| {
            cfg.select_route("A", "B", entry, pos)
                .map(|r| r.from_entry_id.clone())
        };
        assert_eq!(pick("", near_east), Some("east".to_string()));
        assert_eq!(pick("west", near_east), Some("west".to_string()));
        assert_eq!(pick("", Vec3i::new(0, 0, 90)), Some("west".to_string()));
        assert_eq!(pick("north", near_east), None);
        assert!(cfg.select_route("B", "A", "", Vec3i::default()).is_none());
    }
}
