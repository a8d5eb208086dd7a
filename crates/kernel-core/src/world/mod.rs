use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

mod conveyor;
mod director;
mod entities;
mod fun;
mod governance;
mod instants;
mod market;
mod movement;
mod observe;
mod season;
mod snapshot;
mod step;
mod survival;
mod tasks;
mod transfer;
mod work;

use contracts::{ActMsg, ErrorCode, Event, ObsMsg, OrgTransfer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::{event, Agent};
use crate::catalogs::{Catalogs, AIR};
use crate::chunks::ChunkStore;
use crate::claims::{time_of_day, LandClaim, Permissions};
use crate::config::{ConfigError, WorldConfig};
use crate::container::Container;
use crate::economy::{Board, ConveyorMeta, Contract, ItemEntity, Sign, Structure, Trade};
use crate::laws::Law;
use crate::orgs::Organization;
use crate::spatial::{Vec3i, Weather};

pub use director::DirectorMetrics;
pub use snapshot::{SnapshotError, SnapshotV1, SNAPSHOT_VERSION};
pub use transfer::TransferError;

/// Reach for OPEN, TRANSFER, boards, switches and terminals.
const INTERACT_RANGE: i32 = 3;
/// Reach for MINE and GATHER.
const MINE_RANGE: i32 = 2;
/// Stamina spent per movement step.
const MOVE_STAMINA_COST: i32 = 8;
/// Radius of the entity list in OBS.
const ENTITY_RADIUS: i32 = 16;

/// Error code and message of a rejected request.
type Rejection = (ErrorCode, &'static str);

// ---------------------------------------------------------------------------
// Public records
// ---------------------------------------------------------------------------

/// One ACT as routed by the session layer; `agent_id` is the session identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub agent_id: String,
    pub act: ActMsg,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinRequest {
    pub name: String,
    pub delta_voxels: bool,
    /// Token presented in HELLO, if any.
    pub resume_token: Option<String>,
    /// Token issued for this session.
    pub new_token: String,
    /// Id reserved by the world manager so ids stay unique across worlds.
    /// Falls back to the world's own counter when absent or taken.
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub agent_id: String,
    pub resume_token: String,
    pub resumed: bool,
    pub pos: Vec3i,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinLog {
    pub agent_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub tick: u64,
    pub actor: String,
    pub action: String,
    pub pos: [i32; 3],
    #[serde(default)]
    pub from: u16,
    #[serde(default)]
    pub to: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickLogEntry {
    pub tick: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<JoinLog>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leaves: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionEnvelope>,
    pub digest: String,
}

/// Everything one tick produced, handed to the runtime in one piece.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub tick: u64,
    pub log: TickLogEntry,
    pub audits: Vec<AuditEntry>,
    pub observations: Vec<ObsMsg>,
    pub snapshot: Option<SnapshotV1>,
    /// End-of-season state captured before a rollover, stamped with the last
    /// tick of the finished season.
    pub season_archive: Option<SnapshotV1>,
}

/// Org metadata as published by one world for manager reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgSnapshot {
    pub world_id: String,
    pub orgs: Vec<OrgTransfer>,
}

// ---------------------------------------------------------------------------
// Internal records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ActiveEvent {
    pub event_id: String,
    pub start_tick: u64,
    pub ends_tick: u64,
    pub center: Vec3i,
    pub radius: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Counters {
    pub agent: u64,
    pub task: u64,
    pub item: u64,
    pub post: u64,
    pub contract: u64,
    pub law: u64,
    pub land: u64,
    pub org: u64,
    pub trade: u64,
}

/// Activity counted since the last director evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DirectorStats {
    pub window_start_tick: u64,
    pub trades: u64,
    pub denied: u64,
    pub chunks_discovered: u64,
    pub blueprints_complete: u64,
}

#[derive(Debug, Clone, Default)]
struct ClientState {
    delta_voxels: bool,
    last_voxels: Option<Vec<u16>>,
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// One world's complete simulation state. Every mutation happens through
/// [`World::step`] or the tick-boundary calls (join, leave, transfer, reset).
#[derive(Debug)]
pub struct World {
    cfg: WorldConfig,
    catalogs: Arc<Catalogs>,
    chunks: ChunkStore,
    tick: u64,
    weather: Weather,
    weather_until_tick: u64,
    active_event: Option<ActiveEvent>,

    agents: BTreeMap<String, Agent>,
    clients: BTreeMap<String, ClientState>,
    claims: BTreeMap<String, LandClaim>,
    containers: BTreeMap<Vec3i, Container>,
    items: BTreeMap<String, ItemEntity>,
    /// Item entity ids per cell, kept in step with `items`.
    items_at: BTreeMap<Vec3i, BTreeSet<String>>,
    trades: BTreeMap<String, Trade>,
    contracts: BTreeMap<String, Contract>,
    laws: BTreeMap<String, Law>,
    orgs: BTreeMap<String, Organization>,
    boards: BTreeMap<String, Board>,
    signs: BTreeMap<Vec3i, Sign>,
    conveyors: BTreeMap<Vec3i, ConveyorMeta>,
    switches: BTreeMap<Vec3i, bool>,
    structures: BTreeMap<String, Structure>,

    counters: Counters,
    stats: DirectorStats,
    reset_total: u64,

    audits: Vec<AuditEntry>,
    pending_joins: Vec<JoinLog>,
    pending_leaves: Vec<String>,
}

impl World {
    pub fn new(mut cfg: WorldConfig, catalogs: Arc<Catalogs>) -> Result<Self, ConfigError> {
        cfg.apply_defaults();
        cfg.validate()?;
        let chunks = ChunkStore::new(cfg.gen_params(), &catalogs);
        Ok(Self {
            cfg,
            catalogs,
            chunks,
            tick: 0,
            weather: Weather::Clear,
            weather_until_tick: 0,
            active_event: None,
            agents: BTreeMap::new(),
            clients: BTreeMap::new(),
            claims: BTreeMap::new(),
            containers: BTreeMap::new(),
            items: BTreeMap::new(),
            items_at: BTreeMap::new(),
            trades: BTreeMap::new(),
            contracts: BTreeMap::new(),
            laws: BTreeMap::new(),
            orgs: BTreeMap::new(),
            boards: BTreeMap::new(),
            signs: BTreeMap::new(),
            conveyors: BTreeMap::new(),
            switches: BTreeMap::new(),
            structures: BTreeMap::new(),
            counters: Counters::default(),
            stats: DirectorStats::default(),
            reset_total: 0,
            audits: Vec::new(),
            pending_joins: Vec::new(),
            pending_leaves: Vec::new(),
        })
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn world_id(&self) -> &str {
        &self.cfg.world_id
    }

    pub fn config(&self) -> &WorldConfig {
        &self.cfg
    }

    pub fn catalogs(&self) -> &Arc<Catalogs> {
        &self.catalogs
    }

    pub fn agent(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.get(agent_id)
    }

    pub fn agent_mut(&mut self, agent_id: &str) -> Option<&mut Agent> {
        self.agents.get_mut(agent_id)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn reset_total(&self) -> u64 {
        self.reset_total
    }

    pub fn weather(&self) -> Weather {
        self.weather
    }

    pub fn active_event_id(&self) -> Option<&str> {
        self.active_event.as_ref().map(|ev| ev.event_id.as_str())
    }

    pub fn loaded_chunks(&self) -> usize {
        self.chunks.loaded_count()
    }

    pub fn container(&self, pos: Vec3i) -> Option<&Container> {
        self.containers.get(&pos)
    }

    pub fn claim(&self, land_id: &str) -> Option<&LandClaim> {
        self.claims.get(land_id)
    }

    pub fn org(&self, org_id: &str) -> Option<&Organization> {
        self.orgs.get(org_id)
    }

    pub fn item_entities(&self) -> impl Iterator<Item = &ItemEntity> {
        self.items.values()
    }

    pub fn block_at(&self, pos: Vec3i) -> &str {
        self.catalogs.block_name(self.chunks.get(pos))
    }

    /// Writes a block directly. Used by tools and tests to stage terrain.
    pub fn set_block_named(&mut self, pos: Vec3i, block: &str) -> bool {
        let Some(id) = self.catalogs.block_id(block) else {
            return false;
        };
        self.chunks.set(pos, id);
        true
    }

    // -- joins and leaves ------------------------------------------------------

    /// Attaches a session. A matching resume token reattaches the existing agent
    /// and rotates its token; otherwise a fresh agent joins with starter items.
    pub fn join(&mut self, req: JoinRequest) -> JoinOutcome {
        let resumed_id = req
            .resume_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .and_then(|token| {
                self.agents
                    .values()
                    .find(|agent| agent.resume_token == token)
                    .map(|agent| agent.id.clone())
            });
        let now = self.tick;
        let (agent_id, resumed) = match resumed_id {
            Some(id) => (id, true),
            None => {
                let reserved = req
                    .agent_id
                    .as_deref()
                    .filter(|id| agent_number(id) > 0 && !self.agents.contains_key(*id));
                let (id, n) = match reserved {
                    Some(id) => {
                        let n = agent_number(id);
                        self.counters.agent = self.counters.agent.max(n);
                        (id.to_string(), n)
                    }
                    None => {
                        self.counters.agent += 1;
                        (format!("A{}", self.counters.agent), self.counters.agent)
                    }
                };
                let name = if req.name.trim().is_empty() {
                    id.clone()
                } else {
                    req.name.trim().to_string()
                };
                let pos = self.spawn_pos_for(n);
                let mut agent = Agent::new(id.clone(), name, pos);
                agent.current_world_id = self.cfg.world_id.clone();
                for (item, count) in &self.cfg.starter_items {
                    agent.add_item(item, *count);
                }
                self.agents.insert(id.clone(), agent);
                (id, false)
            }
        };
        let active = self.active_event_notice(now);
        let Some(agent) = self.agents.get_mut(&agent_id) else {
            return JoinOutcome {
                agent_id,
                resume_token: String::new(),
                resumed: false,
                pos: Vec3i::default(),
            };
        };
        agent.resume_token = req.new_token.clone();
        if let Some(ev) = active {
            agent.add_event(ev);
        }
        let pos = agent.pos;
        let name = agent.name.clone();
        self.clients.insert(
            agent_id.clone(),
            ClientState {
                delta_voxels: req.delta_voxels,
                last_voxels: None,
            },
        );
        self.pending_joins.push(JoinLog {
            agent_id: agent_id.clone(),
            name,
        });
        tracing::debug!(world_id = %self.cfg.world_id, agent_id = %agent_id, resumed, "agent joined");
        JoinOutcome {
            agent_id,
            resume_token: req.new_token,
            resumed,
            pos,
        }
    }

    /// Detaches a session. The agent stays in the world and can be resumed.
    pub fn leave(&mut self, agent_id: &str) {
        if self.clients.remove(agent_id).is_some() {
            self.pending_leaves.push(agent_id.to_string());
        }
    }

    /// Agent id currently holding `token`.
    pub fn agent_for_token(&self, token: &str) -> Option<&str> {
        if token.is_empty() {
            return None;
        }
        self.agents
            .values()
            .find(|agent| agent.resume_token == token)
            .map(|agent| agent.id.as_str())
    }

    /// Queues an event on one agent's log outside of ACT processing.
    pub fn inject_event(&mut self, agent_id: &str, ev: Event) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.add_event(ev);
                true
            }
            None => false,
        }
    }

    /// Retained events after `since` for EVENT_BATCH.
    pub fn events_since(&self, agent_id: &str, since: u64, limit: usize) -> Option<(Vec<(u64, Event)>, u64)> {
        self.agents
            .get(agent_id)
            .map(|agent| agent.events_since(since, limit))
    }

    // -- shared helpers --------------------------------------------------------

    fn spawn_pos_for(&self, n: u64) -> Vec3i {
        let n = n as i32;
        let around = Vec3i::new(n.wrapping_mul(2), 0, n.wrapping_mul(-2));
        let catalogs = &self.catalogs;
        self.chunks
            .find_spawn_air(around, 8, |block| catalogs.is_solid(block))
    }

    fn block_id_at(&self, pos: Vec3i) -> u16 {
        self.chunks.get(pos)
    }

    fn block_name_at(&self, pos: Vec3i) -> String {
        self.catalogs.block_name(self.chunks.get(pos)).to_string()
    }

    fn is_solid_at(&self, pos: Vec3i) -> bool {
        self.catalogs.is_solid(self.chunks.get(pos))
    }

    fn time_of_day(&self, now: u64) -> f64 {
        time_of_day(now, self.cfg.day_ticks)
    }

    fn next_task_id(&mut self) -> String {
        self.counters.task += 1;
        format!("T{:06}", self.counters.task)
    }

    fn audit(
        &mut self,
        now: u64,
        actor: &str,
        action: &str,
        pos: Vec3i,
        from: u16,
        to: u16,
        reason: &str,
        details: Option<Value>,
    ) {
        self.audits.push(AuditEntry {
            tick: now,
            actor: actor.to_string(),
            action: action.to_string(),
            pos: pos.to_array(),
            from,
            to,
            reason: reason.to_string(),
            details,
        });
    }

    /// Replaces a block and records a SET_BLOCK audit.
    fn set_block(&mut self, now: u64, pos: Vec3i, block: u16, actor: &str, reason: &str) {
        let from = self.chunks.get(pos);
        self.chunks.set(pos, block);
        self.audit(now, actor, "SET_BLOCK", pos, from, block, reason, None);
    }

    fn set_air(&mut self, now: u64, pos: Vec3i, actor: &str, reason: &str) {
        self.set_block(now, pos, AIR, actor, reason);
    }

    fn broadcast(&mut self, ev: Event) {
        for agent in self.agents.values_mut() {
            agent.add_event(ev.clone());
        }
    }

    /// Broadcast while `agent` is detached from the agent map.
    fn broadcast_with(&mut self, agent: &mut Agent, ev: Event) {
        agent.add_event(ev.clone());
        self.broadcast(ev);
    }

    /// Runs `f` with `agent_id` detached so world helpers can borrow `self`.
    fn with_agent<R>(&mut self, agent_id: &str, f: impl FnOnce(&mut World, &mut Agent) -> R) -> Option<R> {
        let mut agent = self.agents.remove(agent_id)?;
        let out = f(self, &mut agent);
        self.agents.insert(agent.id.clone(), agent);
        Some(out)
    }

    /// First claim in land id order containing `pos`.
    fn land_at(&self, pos: Vec3i) -> Option<&LandClaim> {
        self.claims.values().find(|land| land.contains(pos))
    }

    fn is_land_member(&self, agent_id: &str, land: &LandClaim) -> bool {
        land.owner == agent_id
            || land.members.contains(agent_id)
            || self
                .orgs
                .get(&land.owner)
                .map(|org| org.is_member(agent_id))
                .unwrap_or(false)
    }

    fn permissions_for(&self, agent_id: &str, pos: Vec3i) -> (Option<&LandClaim>, Permissions) {
        match self.land_at(pos) {
            None => (None, Permissions::WILD),
            Some(land) => (Some(land), land.permissions(self.is_land_member(agent_id, land))),
        }
    }

    fn curfew_blocks(&self, land: Option<&LandClaim>, now: u64) -> bool {
        land.map(|land| land.curfew_active(self.time_of_day(now)))
            .unwrap_or(false)
    }

    fn can_build_at(&self, agent_id: &str, pos: Vec3i, now: u64) -> bool {
        let (land, perms) = self.permissions_for(agent_id, pos);
        perms.can_build && !self.curfew_blocks(land, now)
    }

    fn can_break_at(&self, agent_id: &str, pos: Vec3i, now: u64) -> bool {
        let (land, perms) = self.permissions_for(agent_id, pos);
        perms.can_break && !self.curfew_blocks(land, now)
    }

    /// Withdrawal from a container: wild land, members, or unprotected land.
    fn can_withdraw_from(&self, agent_id: &str, pos: Vec3i) -> bool {
        match self.land_at(pos) {
            None => true,
            Some(land) => {
                self.is_land_member(agent_id, land)
                    || land.maintenance_stage >= crate::claims::STAGE_UNPROTECTED
            }
        }
    }

    fn can_pickup_at(&self, agent_id: &str, pos: Vec3i) -> bool {
        match self.land_at(pos) {
            None => true,
            Some(land) => {
                self.is_land_member(agent_id, land)
                    || land.maintenance_stage >= crate::claims::STAGE_UNPROTECTED
                    || land.flags.allow_break
            }
        }
    }

    /// Treasury-or-agent credit used by fines, tickets and taxes.
    fn credit_owner(&mut self, owner: &str, item: &str, count: i32) {
        if count <= 0 {
            return;
        }
        if let Some(agent) = self.agents.get_mut(owner) {
            agent.add_item(item, count);
            return;
        }
        let world_id = self.cfg.world_id.clone();
        if let Some(org) = self.orgs.get_mut(owner) {
            *org.treasury_for(&world_id).entry(item.to_string()).or_insert(0) += count;
            org.sync_legacy(&world_id);
        }
    }

    fn deny(&mut self, agent: &mut Agent, now: u64, ref_id: &str, code: ErrorCode, message: &str) {
        self.stats.denied += 1;
        agent.add_event(fail_result(now, ref_id, code, message));
    }
}

// ---------------------------------------------------------------------------
// Event builders
// ---------------------------------------------------------------------------

fn ok_result(now: u64, ref_id: &str, message: &str) -> Event {
    let mut ev = event(now, "ACTION_RESULT", json!({"ref": ref_id, "ok": true}));
    if !message.is_empty() {
        ev.insert("message".to_string(), json!(message));
    }
    ev
}

fn fail_result(now: u64, ref_id: &str, code: ErrorCode, message: &str) -> Event {
    event(
        now,
        "ACTION_RESULT",
        json!({"ref": ref_id, "ok": false, "code": code.as_str(), "message": message}),
    )
}

fn task_done(now: u64, task_id: &str, kind: &str) -> Event {
    event(now, "TASK_DONE", json!({"task_id": task_id, "kind": kind}))
}

fn task_fail(now: u64, task_id: &str, code: ErrorCode, message: &str) -> Event {
    event(
        now,
        "TASK_FAIL",
        json!({"task_id": task_id, "code": code.as_str(), "message": message}),
    )
}

/// Numeric suffix of an agent id (`A12` -> 12).
fn agent_number(agent_id: &str) -> u64 {
    agent_id
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests;
