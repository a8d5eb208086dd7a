//! Records moved between worlds when an agent switches. Worlds never share agent structs;
//! they exchange these and rebuild local state on arrival.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrgTransfer {
    pub org_id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_tick: u64,
    #[serde(default)]
    pub meta_version: u64,
    #[serde(default)]
    pub members: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryEntryTransfer {
    pub value: String,
    /// Absolute expiry tick in the source world; 0 means no expiry.
    #[serde(default)]
    pub expiry_tick: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentTransfer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<OrgTransfer>,

    pub from_world_id: String,
    pub current_world_id: String,
    #[serde(default)]
    pub from_entry_id: String,
    #[serde(default)]
    pub to_entry_id: String,
    #[serde(default)]
    pub switch_cooldown_until_tick: u64,

    pub pos: [i32; 3],
    #[serde(default)]
    pub yaw: i32,
    pub hp: i32,
    pub hunger: i32,
    pub stamina_milli: i32,

    pub rep_trade: i32,
    pub rep_build: i32,
    pub rep_social: i32,
    pub rep_law: i32,

    #[serde(default)]
    pub fun: [i64; 6],
    #[serde(default)]
    pub inventory: BTreeMap<String, i32>,
    #[serde(default)]
    pub main_hand: String,
    #[serde(default)]
    pub armor: [String; 4],
    #[serde(default)]
    pub memory: BTreeMap<String, MemoryEntryTransfer>,
    /// Resume token stays valid across worlds so reconnects find the agent.
    #[serde(default)]
    pub resume_token: String,
}
