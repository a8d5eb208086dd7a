//! Client/server message shapes. Every message is a JSON object carrying `type` and
//! `protocol_version`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Event, WorldRef};

pub const MSG_HELLO: &str = "HELLO";
pub const MSG_WELCOME: &str = "WELCOME";
pub const MSG_CATALOG: &str = "CATALOG";
pub const MSG_ACT: &str = "ACT";
pub const MSG_ACK: &str = "ACK";
pub const MSG_OBS: &str = "OBS";
pub const MSG_EVENT_BATCH_REQ: &str = "EVENT_BATCH_REQ";
pub const MSG_EVENT_BATCH: &str = "EVENT_BATCH";

/// Only `type` and `protocol_version`; used to dispatch raw frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaseMessage {
    #[serde(default, rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub protocol_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HelloMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub supported_versions: Vec<String>,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub capabilities: HelloCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub world_preference: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloCapabilities {
    #[serde(default)]
    pub delta_voxels: bool,
    #[serde(default)]
    pub max_queue: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloAuth {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WelcomeMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub protocol_version: String,
    pub selected_version: String,
    pub agent_id: String,
    pub session_id: String,
    pub resume_token: String,
    pub current_world_id: String,
    pub world_params: WorldParams,
    pub world_manifest: Vec<WorldRef>,
    pub catalogs: CatalogDigests,
    pub server_capabilities: ServerCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorldParams {
    pub tick_rate_hz: u32,
    pub chunk_size: [i32; 3],
    pub height: i32,
    pub obs_radius: i32,
    pub day_ticks: u64,
    pub seed: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DigestRef {
    pub digest: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogDigests {
    pub block_palette: DigestRef,
    pub item_palette: DigestRef,
    pub tuning_digest: String,
    pub recipes_digest: String,
    pub blueprints_digest: String,
    pub law_templates_digest: String,
    pub events_digest: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub ack: bool,
    pub event_batch: bool,
    pub idempotency: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub protocol_version: String,
    pub name: String,
    pub digest: String,
    pub part: u32,
    pub total_parts: u32,
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActMsg {
    #[serde(default, rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub tick: u64,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub act_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub based_on_obs_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expected_world_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instants: Vec<InstantReq>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskReq>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel: Vec<String>,
}

impl ActMsg {
    /// True when the ACT would change world state (anything besides an empty envelope).
    pub fn is_mutating(&self) -> bool {
        !self.instants.is_empty() || !self.tasks.is_empty() || !self.cancel.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemStack {
    pub item: String,
    pub count: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstantReq {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offer: Vec<(String, i32)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request: Vec<(String, i32)>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trade_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default)]
    pub ttl_ticks: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(default)]
    pub limit: i32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub board_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub terminal_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub contract_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub contract_kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<ItemStack>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reward: Vec<ItemStack>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposit: Vec<ItemStack>,
    #[serde(default)]
    pub deadline_tick: u64,
    #[serde(default)]
    pub duration_ticks: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub blueprint_id: String,
    #[serde(default)]
    pub anchor: [i32; 3],
    #[serde(default)]
    pub rotation: i32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub land_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub policy: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub member_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub new_owner: String,
    #[serde(default)]
    pub radius: i32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub org_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub org_kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub org_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub item_id: String,
    #[serde(default)]
    pub count: i32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub law_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub choice: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_world_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entry_point_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskReq {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub target: [i32; 3],
    #[serde(default)]
    pub tolerance: f64,
    #[serde(default)]
    pub distance: f64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_id: String,
    #[serde(default, rename = "src_container", skip_serializing_if = "String::is_empty")]
    pub src: String,
    #[serde(default, rename = "dst_container", skip_serializing_if = "String::is_empty")]
    pub dst: String,

    #[serde(default)]
    pub block_pos: [i32; 3],
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recipe_id: String,
    #[serde(default)]
    pub count: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub item_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub blueprint_id: String,
    #[serde(default)]
    pub anchor: [i32; 3],
    #[serde(default)]
    pub rotation: i32,
    #[serde(default)]
    pub radius: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub protocol_version: String,
    pub ack_for: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub server_tick: u64,
    pub world_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventBatchReq {
    #[serde(default, rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub req_id: String,
    #[serde(default)]
    pub since_cursor: u64,
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventBatchMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub protocol_version: String,
    pub req_id: String,
    pub events: Vec<CursorEvent>,
    pub next_cursor: u64,
    pub world_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CursorEvent {
    pub cursor: u64,
    pub event: Event,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObsMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub protocol_version: String,
    pub tick: u64,
    pub agent_id: String,
    pub world_id: String,
    pub obs_id: String,
    pub world_clock: u64,
    pub events_cursor: u64,

    pub world: WorldObs,
    #[serde(rename = "self")]
    pub self_state: SelfObs,
    pub inventory: Vec<ItemStack>,
    pub equipment: EquipmentObs,
    pub local_rules: LocalRulesObs,

    pub voxels: VoxelsObs,
    pub entities: Vec<EntityObs>,
    pub events: Vec<Event>,
    pub tasks: Vec<TaskObs>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fun_score: Option<FunScoreObs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_boards: Vec<BoardObs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memory: Vec<MemoryKv>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorldObs {
    pub time_of_day: f64,
    pub weather: String,
    pub season_day: u64,
    pub biome: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub active_event: String,
    #[serde(default)]
    pub active_event_ends_tick: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SelfObs {
    pub pos: [i32; 3],
    pub yaw: i32,
    pub hp: i32,
    pub hunger: i32,
    pub stamina: f64,
    pub status: Vec<String>,
    pub reputation: ReputationObs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReputationObs {
    pub trade: f64,
    pub build: f64,
    pub social: f64,
    pub law: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EquipmentObs {
    pub main_hand: String,
    pub armor: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LocalRulesObs {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub land_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
    pub role: String,
    pub permissions: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tax: BTreeMap<String, f64>,
    #[serde(default)]
    pub maintenance_due_tick: u64,
    #[serde(default)]
    pub maintenance_stage: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoxelsObs {
    pub center: [i32; 3],
    pub radius: i32,
    pub encoding: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<VoxelDeltaOp>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoxelDeltaOp {
    pub d: [i32; 3],
    pub b: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntityObs {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub pos: [i32; 3],
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub reputation_hint: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub item: String,
    #[serde(default)]
    pub count: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskObs {
    pub task_id: String,
    pub kind: String,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<[i32; 3]>,
    #[serde(default)]
    pub eta_ticks: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardObs {
    pub board_id: String,
    pub top_posts: Vec<BoardPostObs>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardPostObs {
    pub post_id: String,
    pub author: String,
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryKv {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunScoreObs {
    pub novelty: i64,
    pub creation: i64,
    pub social: i64,
    pub influence: i64,
    pub narrative: i64,
    pub risk_rescue: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn act_accepts_sparse_client_payload() {
        let raw = r#"{
            "type":"ACT","protocol_version":"1.1","tick":4,"agent_id":"A1",
            "act_id":"X","based_on_obs_id":"A1:3:0",
            "instants":[{"id":"I1","type":"OFFER_TRADE","to":"A2","offer":[["PLANK",2]],"request":[["COAL",1]]}],
            "tasks":[{"id":"K1","type":"TRANSFER","src_container":"SELF","dst_container":"CHEST@1,0,0","item_id":"COAL","count":1}]
        }"#;
        let act: ActMsg = serde_json::from_str(raw).expect("parse act");
        assert!(act.is_mutating());
        assert_eq!(act.instants[0].offer, vec![("PLANK".to_string(), 2)]);
        assert_eq!(act.tasks[0].src, "SELF");
        assert_eq!(act.tasks[0].dst, "CHEST@1,0,0");
        assert!(act.cancel.is_empty());
    }

    #[test]
    fn obs_self_field_uses_reserved_name() {
        let obs = ObsMsg {
            msg_type: MSG_OBS.to_string(),
            protocol_version: "1.1".to_string(),
            tick: 1,
            agent_id: "A1".to_string(),
            world_id: "OVERWORLD".to_string(),
            obs_id: "A1:1:0".to_string(),
            world_clock: 1,
            events_cursor: 0,
            world: WorldObs::default(),
            self_state: SelfObs::default(),
            inventory: Vec::new(),
            equipment: EquipmentObs::default(),
            local_rules: LocalRulesObs::default(),
            voxels: VoxelsObs::default(),
            entities: Vec::new(),
            events: Vec::new(),
            tasks: Vec::new(),
            fun_score: None,
            public_boards: Vec::new(),
            memory: Vec::new(),
        };
        let value = serde_json::to_value(&obs).expect("serialize obs");
        assert!(value.get("self").is_some());
        assert!(value.get("fun_score").is_none());
    }
}
