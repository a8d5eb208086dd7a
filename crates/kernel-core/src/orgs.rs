//! Organizations (guilds and cities), their per-world treasuries and the
//! last-writer-wins metadata merge used when worlds exchange org state.

use std::collections::BTreeMap;

use contracts::OrgTransfer;
use serde::{Deserialize, Serialize};

pub const ROLE_LEADER: &str = "LEADER";
pub const ROLE_OFFICER: &str = "OFFICER";
pub const ROLE_MEMBER: &str = "MEMBER";

pub const KIND_GUILD: &str = "GUILD";
pub const KIND_CITY: &str = "CITY";

pub fn normalize_org_kind(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_uppercase().as_str() {
        KIND_GUILD => Some(KIND_GUILD),
        KIND_CITY => Some(KIND_CITY),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: String,
    pub kind: String,
    pub name: String,
    pub created_tick: u64,
    #[serde(default)]
    pub meta_version: u64,
    #[serde(default)]
    pub members: BTreeMap<String, String>,
    /// View of the treasury for the world that touched it last.
    #[serde(default)]
    pub treasury: BTreeMap<String, i32>,
    #[serde(default)]
    pub treasury_by_world: BTreeMap<String, BTreeMap<String, i32>>,
}

impl Organization {
    pub fn new(org_id: String, kind: &str, name: String, created_tick: u64) -> Self {
        Self {
            org_id,
            kind: kind.to_string(),
            name,
            created_tick,
            meta_version: 1,
            ..Self::default()
        }
    }

    pub fn is_member(&self, agent_id: &str) -> bool {
        self.members.contains_key(agent_id)
    }

    pub fn is_admin(&self, agent_id: &str) -> bool {
        matches!(
            self.members.get(agent_id).map(String::as_str),
            Some(ROLE_LEADER) | Some(ROLE_OFFICER)
        )
    }

    /// Treasury for `world_id`. The legacy single-world map seeds only the very
    /// first per-world treasury; later worlds start empty.
    pub fn treasury_for(&mut self, world_id: &str) -> &mut BTreeMap<String, i32> {
        let world_id = if world_id.is_empty() { "GLOBAL" } else { world_id };
        if !self.treasury_by_world.contains_key(world_id) {
            let seed = if self.treasury_by_world.is_empty() {
                self.treasury
                    .iter()
                    .filter(|(item, n)| !item.is_empty() && **n > 0)
                    .map(|(item, n)| (item.clone(), *n))
                    .collect()
            } else {
                BTreeMap::new()
            };
            self.treasury_by_world.insert(world_id.to_string(), seed);
        }
        let view = self.treasury_by_world.get(world_id).cloned().unwrap_or_default();
        self.treasury = view;
        self.treasury_by_world.entry(world_id.to_string()).or_default()
    }

    /// Re-syncs the legacy view after a mutation through [`Self::treasury_for`].
    pub fn sync_legacy(&mut self, world_id: &str) {
        let world_id = if world_id.is_empty() { "GLOBAL" } else { world_id };
        if let Some(view) = self.treasury_by_world.get(world_id) {
            self.treasury = view.clone();
        }
    }

    pub fn bump_meta(&mut self) {
        self.meta_version += 1;
    }

    pub fn to_transfer(&self) -> OrgTransfer {
        OrgTransfer {
            org_id: self.org_id.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            created_tick: self.created_tick,
            meta_version: self.meta_version,
            members: self.members.clone(),
        }
    }

    /// Applies incoming metadata when it is not older than ours. Identity fields
    /// are last-writer-wins; members are replaced when `replace_members` is set,
    /// otherwise unioned with incoming roles winning. Treasury stays world-local.
    pub fn apply_meta(&mut self, src: &OrgTransfer, replace_members: bool) -> bool {
        if src.meta_version < self.meta_version {
            return false;
        }
        if !src.kind.is_empty() {
            self.kind = src.kind.clone();
        }
        if !src.name.is_empty() {
            self.name = src.name.clone();
        }
        if self.created_tick == 0 || (src.created_tick != 0 && src.created_tick < self.created_tick) {
            self.created_tick = src.created_tick;
        }
        self.meta_version = self.meta_version.max(src.meta_version);
        let incoming = src
            .members
            .iter()
            .filter(|(id, role)| !id.is_empty() && !role.is_empty())
            .map(|(id, role)| (id.clone(), role.clone()));
        if replace_members {
            self.members = incoming.collect();
        } else {
            self.members.extend(incoming);
        }
        true
    }

    pub fn from_transfer(src: &OrgTransfer) -> Self {
        let mut org = Self {
            org_id: src.org_id.clone(),
            ..Self::default()
        };
        org.apply_meta(src, true);
        org
    }
}

/// Merges per-world org snapshots into one authoritative set. The highest
/// `meta_version` wins outright, members included. Equal versions union their
/// members with the later snapshot's roles winning.
pub fn merge_org_snapshots(snapshots: &[Vec<OrgTransfer>]) -> Vec<OrgTransfer> {
    let mut merged: BTreeMap<String, OrgTransfer> = BTreeMap::new();
    for snapshot in snapshots {
        for org in snapshot {
            if org.org_id.trim().is_empty() {
                continue;
            }
            let candidate = clean_members(org);
            match merged.get_mut(&org.org_id) {
                None => {
                    merged.insert(org.org_id.clone(), candidate);
                }
                Some(current) if candidate.meta_version > current.meta_version => {
                    *current = candidate;
                }
                Some(current) if candidate.meta_version == current.meta_version => {
                    merge_same_version(current, candidate);
                }
                Some(_) => {}
            }
        }
    }
    merged.into_values().collect()
}

fn clean_members(org: &OrgTransfer) -> OrgTransfer {
    let mut out = org.clone();
    out.members
        .retain(|id, role| !id.trim().is_empty() && !role.is_empty());
    out
}

fn merge_same_version(current: &mut OrgTransfer, other: OrgTransfer) {
    if current.kind.is_empty() && !other.kind.is_empty() {
        current.kind = other.kind;
    }
    if current.name.trim().is_empty() && !other.name.trim().is_empty() {
        current.name = other.name;
    }
    if current.created_tick == 0 || (other.created_tick != 0 && other.created_tick < current.created_tick) {
        current.created_tick = other.created_tick;
    }
    current.members.extend(other.members);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org() -> Organization {
        let mut org = Organization::new("ORG000001".into(), KIND_GUILD, "Miners".into(), 5);
        org.members.insert("A1".into(), ROLE_LEADER.into());
        org
    }

    #[test]
    fn legacy_treasury_seeds_only_first_world() {
        let mut org = org();
        org.treasury.insert("COAL".into(), 4);
        assert_eq!(org.treasury_for("OVERWORLD").get("COAL"), Some(&4));
        assert!(org.treasury_for("MINE_L1").is_empty());
        assert!(org.treasury.is_empty());
        assert_eq!(org.treasury_for("OVERWORLD").get("COAL"), Some(&4));
        assert_eq!(org.treasury.get("COAL"), Some(&4));
    }

    #[test]
    fn older_meta_is_ignored() {
        let mut org = org();
        org.meta_version = 3;
        let mut stale = org.to_transfer();
        stale.meta_version = 2;
        stale.name = "Renamed".into();
        assert!(!org.apply_meta(&stale, false));
        assert_eq!(org.name, "Miners");
    }

    #[test]
    fn union_merge_lets_incoming_roles_win() {
        let mut org = org();
        org.members.insert("A2".into(), ROLE_MEMBER.into());
        let mut incoming = org.to_transfer();
        incoming.meta_version = 2;
        incoming.members = BTreeMap::from([
            ("A2".to_string(), ROLE_OFFICER.to_string()),
            ("A3".to_string(), ROLE_MEMBER.to_string()),
        ]);
        assert!(org.apply_meta(&incoming, false));
        assert_eq!(org.members.len(), 3);
        assert!(org.is_admin("A2"));
        assert_eq!(org.meta_version, 2);
    }

    #[test]
    fn snapshot_merge_prefers_newer_meta() {
        let a = org().to_transfer();
        let mut b = a.clone();
        b.meta_version = 5;
        b.name = "Deep Miners".into();
        b.members = BTreeMap::from([("A9".to_string(), ROLE_MEMBER.to_string())]);
        let merged = merge_org_snapshots(&[vec![a], vec![b]]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "Deep Miners");
        assert_eq!(
            merged[0].members.keys().collect::<Vec<_>>(),
            vec!["A9"]
        );
    }

    #[test]
    fn member_removal_survives_reconciliation() {
        let mut stale = org();
        stale.members.insert("A2".into(), ROLE_MEMBER.into());
        let mut left = stale.clone();
        left.members.remove("A2");
        left.bump_meta();

        let merged = merge_org_snapshots(&[vec![left.to_transfer()], vec![stale.to_transfer()]]);
        assert_eq!(merged[0].meta_version, 2);
        assert_eq!(merged[0].members.keys().collect::<Vec<_>>(), vec!["A1"]);

        assert!(left.apply_meta(&merged[0], true));
        assert!(stale.apply_meta(&merged[0], true));
        assert_eq!(left.members.keys().collect::<Vec<_>>(), vec!["A1"]);
        assert_eq!(stale.members.keys().collect::<Vec<_>>(), vec!["A1"]);
    }

    #[test]
    fn equal_versions_union_with_later_roles_winning() {
        let a = org().to_transfer();
        let mut b = a.clone();
        b.members = BTreeMap::from([
            ("A1".to_string(), ROLE_OFFICER.to_string()),
            ("A4".to_string(), ROLE_MEMBER.to_string()),
            (String::new(), ROLE_MEMBER.to_string()),
        ]);
        let merged = merge_org_snapshots(&[vec![a], vec![b]]);
        assert_eq!(merged[0].members.len(), 2);
        assert_eq!(merged[0].members.get("A1").map(String::as_str), Some(ROLE_OFFICER));
        assert_eq!(merged[0].members.get("A4").map(String::as_str), Some(ROLE_MEMBER));
    }
}
