//! Land claims: square regions with per-claim permission flags, law-driven rules
//! (tax, curfew, fines, access pass) and a maintenance stage.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::spatial::Vec3i;

pub const CLAIM_TYPE_DEFAULT: &str = "DEFAULT";
pub const CLAIM_TYPE_HOMESTEAD: &str = "HOMESTEAD";
pub const CLAIM_TYPE_CITY_CORE: &str = "CITY_CORE";

/// Radii UPGRADE_CLAIM may target.
pub const UPGRADE_RADII: [i32; 2] = [64, 128];
pub const MAX_CLAIM_RADIUS: i32 = 128;

/// Maintenance stages.
pub const STAGE_OK: u8 = 0;
pub const STAGE_LATE: u8 = 1;
pub const STAGE_UNPROTECTED: u8 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimFlags {
    pub allow_build: bool,
    pub allow_break: bool,
    pub allow_damage: bool,
    pub allow_trade: bool,
}

impl ClaimFlags {
    /// Applies the keys present in a SET_PERMISSIONS policy.
    pub fn apply_policy(&mut self, policy: &BTreeMap<String, bool>) {
        for (key, value) in policy {
            match key.as_str() {
                "allow_build" => self.allow_build = *value,
                "allow_break" => self.allow_break = *value,
                "allow_damage" => self.allow_damage = *value,
                "allow_trade" => self.allow_trade = *value,
                _ => {}
            }
        }
    }
}

pub fn default_claim_type_for_world(world_type: &str) -> &'static str {
    match world_type {
        "CITY_HUB" => CLAIM_TYPE_CITY_CORE,
        "OVERWORLD" | "" => CLAIM_TYPE_DEFAULT,
        _ => CLAIM_TYPE_HOMESTEAD,
    }
}

pub fn default_flags(claim_type: &str) -> ClaimFlags {
    match claim_type {
        CLAIM_TYPE_CITY_CORE => ClaimFlags {
            allow_build: false,
            allow_break: false,
            allow_damage: false,
            allow_trade: true,
        },
        CLAIM_TYPE_HOMESTEAD => ClaimFlags {
            allow_build: false,
            allow_break: false,
            allow_damage: false,
            allow_trade: false,
        },
        _ => ClaimFlags {
            allow_build: false,
            allow_break: false,
            allow_damage: false,
            allow_trade: true,
        },
    }
}

/// Effective permissions of one agent at one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub can_build: bool,
    pub can_break: bool,
    pub can_damage: bool,
    pub can_trade: bool,
}

impl Permissions {
    pub const WILD: Permissions = Permissions {
        can_build: true,
        can_break: true,
        can_damage: false,
        can_trade: true,
    };

    pub fn to_map(self) -> BTreeMap<String, bool> {
        BTreeMap::from([
            ("can_build".to_string(), self.can_build),
            ("can_break".to_string(), self.can_break),
            ("can_damage".to_string(), self.can_damage),
            ("can_trade".to_string(), self.can_trade),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandClaim {
    pub land_id: String,
    /// Agent id or organization id.
    pub owner: String,
    #[serde(default)]
    pub claim_type: String,
    pub anchor: Vec3i,
    pub radius: i32,
    pub flags: ClaimFlags,
    #[serde(default)]
    pub members: BTreeSet<String>,

    #[serde(default)]
    pub market_tax: f64,
    #[serde(default)]
    pub curfew_enabled: bool,
    #[serde(default)]
    pub curfew_start: f64,
    #[serde(default)]
    pub curfew_end: f64,

    #[serde(default)]
    pub fine_break_enabled: bool,
    #[serde(default)]
    pub fine_break_item: String,
    #[serde(default)]
    pub fine_break_per_block: i32,

    #[serde(default)]
    pub access_pass_enabled: bool,
    #[serde(default)]
    pub access_ticket_item: String,
    #[serde(default)]
    pub access_ticket_cost: i32,

    #[serde(default)]
    pub maintenance_due_tick: u64,
    #[serde(default)]
    pub maintenance_stage: u8,
}

impl LandClaim {
    pub fn new(land_id: String, owner: String, claim_type: &str, anchor: Vec3i, radius: i32) -> Self {
        Self {
            land_id,
            owner,
            claim_type: claim_type.to_string(),
            anchor,
            radius,
            flags: default_flags(claim_type),
            members: BTreeSet::new(),
            market_tax: 0.0,
            curfew_enabled: false,
            curfew_start: 0.0,
            curfew_end: 0.0,
            fine_break_enabled: false,
            fine_break_item: String::new(),
            fine_break_per_block: 0,
            access_pass_enabled: false,
            access_ticket_item: String::new(),
            access_ticket_cost: 0,
            maintenance_due_tick: 0,
            maintenance_stage: STAGE_OK,
        }
    }

    pub fn contains(&self, pos: Vec3i) -> bool {
        (pos.x - self.anchor.x).abs() <= self.radius && (pos.z - self.anchor.z).abs() <= self.radius
    }

    /// Core radius: the configured value (16 when unset) capped by the claim radius.
    pub fn core_radius(&self, configured: i32) -> i32 {
        let r = if configured <= 0 { 16 } else { configured };
        r.min(self.radius).max(0)
    }

    pub fn core_contains(&self, pos: Vec3i, configured: i32) -> bool {
        let r = self.core_radius(configured);
        r > 0 && (pos.x - self.anchor.x).abs() <= r && (pos.z - self.anchor.z).abs() <= r
    }

    /// Permissions for a visitor (`is_member == false`) or a member.
    pub fn permissions(&self, is_member: bool) -> Permissions {
        if is_member {
            return Permissions {
                can_build: true,
                can_break: true,
                can_damage: self.flags.allow_damage,
                can_trade: true,
            };
        }
        if self.maintenance_stage >= STAGE_UNPROTECTED {
            return Permissions::WILD;
        }
        Permissions {
            can_build: self.flags.allow_build,
            can_break: self.flags.allow_break,
            can_damage: self.flags.allow_damage,
            can_trade: self.flags.allow_trade,
        }
    }

    pub fn curfew_active(&self, time_of_day: f64) -> bool {
        self.curfew_enabled && in_window(time_of_day, self.curfew_start, self.curfew_end)
    }

    /// True when the square of `radius` around this anchor would overlap `other`.
    pub fn overlaps(&self, other: &LandClaim, radius: i32) -> bool {
        (self.anchor.x - other.anchor.x).abs() <= radius + other.radius
            && (self.anchor.z - other.anchor.z).abs() <= radius + other.radius
    }
}

/// Closed window on the unit day circle; wraps when `start > end`.
pub fn in_window(t: f64, start: f64, end: f64) -> bool {
    if start <= end {
        t >= start && t <= end
    } else {
        t >= start || t <= end
    }
}

pub fn time_of_day(now: u64, day_ticks: u64) -> f64 {
    if day_ticks == 0 {
        return 0.0;
    }
    (now % day_ticks) as f64 / day_ticks as f64
}

/// Materials to grow a claim from `from` to `to`; each threshold crossed adds
/// its own BATTERY and CRYSTAL_SHARD cost.
pub fn upgrade_cost(from: i32, to: i32) -> BTreeMap<String, i32> {
    let mut cost = BTreeMap::new();
    let mut add = |item: &str, n: i32| *cost.entry(item.to_string()).or_insert(0) += n;
    if from < 64 && to >= 64 {
        add("BATTERY", 1);
        add("CRYSTAL_SHARD", 2);
    }
    if from < 128 && to >= 128 {
        add("BATTERY", 2);
        add("CRYSTAL_SHARD", 4);
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn claim(radius: i32) -> LandClaim {
        LandClaim::new(
            "LAND_A1_001".into(),
            "A1".into(),
            CLAIM_TYPE_DEFAULT,
            Vec3i::new(10, 0, -5),
            radius,
        )
    }

    proptest! {
        #[test]
        fn contains_is_chebyshev_square(radius in 0i32..64, x in -200i32..200, z in -200i32..200) {
            let land = claim(radius);
            let pos = Vec3i::new(x, 0, z);
            let expected = (x - 10).abs() <= radius && (z + 5).abs() <= radius;
            prop_assert_eq!(land.contains(pos), expected);
        }
    }

    #[test]
    fn core_radius_is_capped_by_claim() {
        assert_eq!(claim(8).core_radius(16), 8);
        assert_eq!(claim(32).core_radius(0), 16);
        assert!(claim(32).core_contains(Vec3i::new(26, 0, -5), 16));
        assert!(!claim(32).core_contains(Vec3i::new(27, 0, -5), 16));
    }

    #[test]
    fn unprotected_land_is_wild_for_visitors_only() {
        let mut land = claim(16);
        land.flags.allow_damage = true;
        assert!(!land.permissions(false).can_build);
        land.maintenance_stage = STAGE_UNPROTECTED;
        assert_eq!(land.permissions(false), Permissions::WILD);
        assert!(land.permissions(true).can_damage);
    }

    #[test]
    fn curfew_window_wraps_midnight() {
        assert!(in_window(0.95, 0.9, 0.1));
        assert!(in_window(0.05, 0.9, 0.1));
        assert!(!in_window(0.5, 0.9, 0.1));
        assert!(in_window(0.5, 0.2, 0.6));
    }

    #[test]
    fn policy_updates_only_named_flags() {
        let mut flags = default_flags(CLAIM_TYPE_DEFAULT);
        flags.apply_policy(&BTreeMap::from([("allow_build".to_string(), true)]));
        assert!(flags.allow_build);
        assert!(!flags.allow_break);
        assert!(flags.allow_trade);
    }

    #[test]
    fn upgrade_cost_accumulates_thresholds() {
        assert_eq!(upgrade_cost(32, 64).get("CRYSTAL_SHARD"), Some(&2));
        let full = upgrade_cost(32, 128);
        assert_eq!(full.get("BATTERY"), Some(&3));
        assert_eq!(full.get("CRYSTAL_SHARD"), Some(&6));
        assert!(upgrade_cost(64, 64).is_empty());
    }
}
