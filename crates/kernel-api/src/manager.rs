//! Multi-world manager: owns the world runtimes, routes ACTs to the world an
//! agent lives in, runs SWITCH_WORLD and admin moves, reconciles org
//! metadata across worlds and keeps `global/state.json`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use contracts::{ActMsg, AgentTransfer, ErrorCode, Event, OrgTransfer, WorldRef};
use kernel_core::agent::event;
use kernel_core::orgs::merge_org_snapshots;
use kernel_core::{ActionEnvelope, ConfigError, JoinRequest, SnapshotError, WorldConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::{IndexBackend, MirrorConfig, MultiWorldConfig};
use crate::index::IndexStatsView;
use crate::mirror::{Mirror, MirrorStatsView, DEFAULT_MIRROR_WORKERS};
use crate::outbound::Outbound;
use crate::persistence::PersistenceError;
use crate::runtime::{
    ResetReport, RuntimeError, RuntimeOptions, SessionLink, WorldHandle, WorldRuntime, WorldStatus,
};

pub const STATE_VERSION: u32 = 2;
pub const PERSIST_DEBOUNCE: Duration = Duration::from_millis(200);
pub const ORG_REFRESH_DEBOUNCE: Duration = Duration::from_millis(150);
const ORG_MUTATIONS: [&str; 3] = ["CREATE_ORG", "JOIN_ORG", "LEAVE_ORG"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ManagerError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    Json(serde_json::Error),
    InvalidConfig(String),
    Config(ConfigError),
    Snapshot(SnapshotError),
    Persistence(PersistenceError),
    Runtime(RuntimeError),
    BadRequest(String),
    WorldNotFound(String),
    AgentNotFound(String),
    ResetNotAllowed(String),
    Transfer(String),
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Yaml(err) => write!(f, "worlds config error: {err}"),
            Self::Json(err) => write!(f, "state file error: {err}"),
            Self::InvalidConfig(msg) => write!(f, "invalid worlds config: {msg}"),
            Self::Config(err) => write!(f, "invalid world config: {err}"),
            Self::Snapshot(err) => write!(f, "snapshot error: {err}"),
            Self::Persistence(err) => write!(f, "persistence error: {err}"),
            Self::Runtime(err) => write!(f, "{err}"),
            Self::BadRequest(msg) => write!(f, "{msg}"),
            Self::WorldNotFound(id) => write!(f, "world not found: {id}"),
            Self::AgentNotFound(id) => write!(f, "agent not found: {id}"),
            Self::ResetNotAllowed(id) => write!(f, "world {id} does not allow admin reset"),
            Self::Transfer(msg) => write!(f, "transfer failed: {msg}"),
        }
    }
}

impl std::error::Error for ManagerError {}

impl From<std::io::Error> for ManagerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_yaml::Error> for ManagerError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Yaml(value)
    }
}

impl From<serde_json::Error> for ManagerError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<ConfigError> for ManagerError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<SnapshotError> for ManagerError {
    fn from(value: SnapshotError) -> Self {
        Self::Snapshot(value)
    }
}

impl From<PersistenceError> for ManagerError {
    fn from(value: PersistenceError) -> Self {
        Self::Persistence(value)
    }
}

impl From<RuntimeError> for ManagerError {
    fn from(value: RuntimeError) -> Self {
        Self::Runtime(value)
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

static MINTED: AtomicU64 = AtomicU64::new(0);

/// `prefix` followed by `len` hex characters that are unique per process.
pub fn mint_id(prefix: &str, len: usize) -> String {
    let n = MINTED.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let digest = hex::encode(Sha256::digest(format!("{nanos}:{n}:{}", std::process::id())));
    format!("{prefix}{}", &digest[..len.min(digest.len())])
}

fn agent_number(agent_id: &str) -> u64 {
    agent_id
        .strip_prefix('A')
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Persisted state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwitchMetric {
    pub from: String,
    pub to: String,
    pub result: String,
    pub count: u64,
}

/// `global/state.json`. Also reads the residency-only `agent_residency.json`
/// layout, whose fields are a subset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub agent_to_world: BTreeMap<String, String>,
    #[serde(default)]
    pub resume_to_world: BTreeMap<String, String>,
    #[serde(default)]
    pub org_meta: BTreeMap<String, OrgTransfer>,
    #[serde(default)]
    pub switch_metrics: Vec<SwitchMetric>,
    /// Older name of `switch_metrics`; read, never written.
    #[serde(default, skip_serializing)]
    pub switch_totals: Vec<SwitchMetric>,
}

impl StateFile {
    fn is_empty(&self) -> bool {
        self.agent_to_world.is_empty()
            && self.resume_to_world.is_empty()
            && self.org_meta.is_empty()
            && self.switch_metrics.is_empty()
            && self.switch_totals.is_empty()
    }

    /// Reads `path`, falling back to `agent_residency.json` beside it.
    pub fn load(path: &Path) -> Option<Self> {
        let legacy = path.with_file_name("agent_residency.json");
        let found = [path, legacy.as_path()].into_iter().find_map(|candidate| {
            let bytes = std::fs::read(candidate).ok()?;
            match serde_json::from_slice::<Self>(&bytes) {
                Ok(state) if !state.is_empty() => Some(state),
                Ok(_) => None,
                Err(err) => {
                    tracing::warn!(path = %candidate.display(), error = %err, "unreadable manager state");
                    None
                }
            }
        });
        found
    }

    /// Pretty JSON through a temp file and rename.
    pub fn write(&self, path: &Path) -> Result<(), ManagerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Shared {
    agent_to_world: BTreeMap<String, String>,
    resume_to_world: BTreeMap<String, String>,
    org_meta: BTreeMap<String, OrgTransfer>,
    switch_totals: BTreeMap<(String, String, String), u64>,
}

impl Shared {
    fn from_file(file: StateFile) -> Self {
        let keep = |(k, v): (String, String)| (!k.trim().is_empty() && !v.trim().is_empty()).then_some((k, v));
        let mut switch_totals = BTreeMap::new();
        for m in file.switch_metrics.into_iter().chain(file.switch_totals) {
            if m.from.is_empty() || m.to.is_empty() || m.result.is_empty() || m.count == 0 {
                continue;
            }
            switch_totals.insert((m.from, m.to, m.result), m.count);
        }
        Self {
            agent_to_world: file.agent_to_world.into_iter().filter_map(keep).collect(),
            resume_to_world: file.resume_to_world.into_iter().filter_map(keep).collect(),
            org_meta: file
                .org_meta
                .into_iter()
                .filter(|(id, _)| !id.trim().is_empty())
                .map(|(id, mut org)| {
                    org.org_id = id.clone();
                    (id, clean_org(org))
                })
                .collect(),
            switch_totals,
        }
    }

    fn to_file(&self) -> StateFile {
        StateFile {
            version: STATE_VERSION,
            agent_to_world: self.agent_to_world.clone(),
            resume_to_world: self.resume_to_world.clone(),
            org_meta: self.org_meta.clone(),
            switch_metrics: self.switch_metrics(),
            switch_totals: Vec::new(),
        }
    }

    /// Sorted by (from, to, result).
    fn switch_metrics(&self) -> Vec<SwitchMetric> {
        self.switch_totals
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|((from, to, result), count)| SwitchMetric {
                from: from.clone(),
                to: to.clone(),
                result: result.clone(),
                count: *count,
            })
            .collect()
    }
}

fn clean_org(mut org: OrgTransfer) -> OrgTransfer {
    org.members
        .retain(|id, role| !id.trim().is_empty() && !role.trim().is_empty());
    org
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// Root of `worlds/` and `global/`; `None` runs in memory.
    pub data_dir: Option<PathBuf>,
    pub seed: i64,
    pub index: IndexBackend,
    pub mirror: Option<MirrorConfig>,
    pub load_latest_snapshot: bool,
}

/// Session side of a HELLO.
#[derive(Debug, Clone)]
pub struct JoinParams {
    pub name: String,
    pub delta_voxels: bool,
    pub resume_token: String,
    pub world_preference: String,
    pub session_id: String,
    pub protocol_version: String,
    pub outbound: Outbound,
}

#[derive(Debug, Clone)]
pub struct Joined {
    pub agent_id: String,
    pub resume_token: String,
    pub resumed: bool,
    pub world: WorldHandle,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorldState {
    #[serde(flatten)]
    pub status: WorldStatus,
    pub allow_admin_reset: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexStatsView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerState {
    pub default_world_id: String,
    pub worlds: Vec<WorldState>,
    pub switch_metrics: Vec<SwitchMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror: Option<MirrorStatsView>,
}

#[derive(Debug)]
pub struct WorldManager {
    directory: MultiWorldConfig,
    manifest: Vec<WorldRef>,
    worlds: BTreeMap<String, WorldHandle>,
    runtimes: Mutex<Vec<WorldRuntime>>,
    shared: Mutex<Shared>,
    next_agent: AtomicU64,
    state_file: Option<PathBuf>,
    mirror: Option<Arc<Mirror>>,
    persist_wake: Arc<Notify>,
    org_wake: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorldManager {
    /// Starts every world in `directory`. Must be called inside a tokio runtime.
    pub fn start(directory: MultiWorldConfig, opts: ManagerOptions) -> Result<Arc<Self>, ManagerError> {
        directory.validate()?;
        let mirror = match (&opts.mirror, &opts.data_dir) {
            (Some(cfg), Some(data_dir)) => Some(Mirror::start(
                cfg.clone(),
                data_dir.clone(),
                DEFAULT_MIRROR_WORKERS,
            )?),
            _ => None,
        };
        let base = WorldConfig {
            seed: opts.seed,
            ..WorldConfig::default()
        };

        let mut runtimes = Vec::new();
        let mut worlds = BTreeMap::new();
        for spec in &directory.worlds {
            let runtime = WorldRuntime::start(
                spec.to_world_config(&base),
                RuntimeOptions {
                    world_dir: opts
                        .data_dir
                        .as_ref()
                        .map(|dir| dir.join("worlds").join(&spec.id)),
                    index: opts.index.clone(),
                    mirror: mirror.clone(),
                    load_latest_snapshot: opts.load_latest_snapshot,
                },
            )?;
            worlds.insert(spec.id.clone(), runtime.handle().clone());
            runtimes.push(runtime);
        }

        let state_file = opts
            .data_dir
            .as_ref()
            .map(|dir| dir.join("global").join("state.json"));
        let shared = state_file
            .as_deref()
            .and_then(StateFile::load)
            .map(Shared::from_file)
            .unwrap_or_default();
        let next_agent = shared
            .agent_to_world
            .keys()
            .map(|id| agent_number(id))
            .max()
            .unwrap_or(0);

        let manager = Arc::new(Self {
            manifest: directory.manifest(),
            directory,
            worlds,
            runtimes: Mutex::new(runtimes),
            shared: Mutex::new(shared),
            next_agent: AtomicU64::new(next_agent),
            state_file,
            mirror,
            persist_wake: Arc::new(Notify::new()),
            org_wake: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        });
        let tasks = vec![
            tokio::spawn(persist_loop(
                Arc::downgrade(&manager),
                Arc::clone(&manager.persist_wake),
            )),
            tokio::spawn(org_refresh_loop(
                Arc::downgrade(&manager),
                Arc::clone(&manager.org_wake),
            )),
        ];
        *manager
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = tasks;
        tracing::info!(
            worlds = manager.worlds.len(),
            default_world = %manager.directory.default_world_id,
            "world manager started"
        );
        Ok(manager)
    }

    pub fn directory(&self) -> &MultiWorldConfig {
        &self.directory
    }

    pub fn manifest(&self) -> &[WorldRef] {
        &self.manifest
    }

    pub fn world(&self, world_id: &str) -> Option<&WorldHandle> {
        self.worlds.get(world_id)
    }

    pub fn world_ids(&self) -> Vec<String> {
        self.worlds.keys().cloned().collect()
    }

    pub fn agent_world(&self, agent_id: &str) -> Option<String> {
        self.lock().agent_to_world.get(agent_id).cloned()
    }

    pub fn switch_metrics(&self) -> Vec<SwitchMetric> {
        self.lock().switch_metrics()
    }

    // -- sessions --------------------------------------------------------------

    /// Resumes the agent holding `resume_token` in the world it was last seen
    /// in, otherwise joins a fresh agent in the preferred or default world.
    pub async fn join(&self, params: JoinParams) -> Result<Joined, ManagerError> {
        let token = params.resume_token.trim().to_string();
        let resume_world = (!token.is_empty())
            .then(|| self.lock().resume_to_world.get(&token).cloned())
            .flatten()
            .filter(|id| self.worlds.contains_key(id));
        let world_id = match resume_world {
            Some(id) => id,
            None => {
                let pref = params.world_preference.trim();
                if self.worlds.contains_key(pref) {
                    pref.to_string()
                } else {
                    self.directory.default_world_id.clone()
                }
            }
        };
        let handle = self
            .worlds
            .get(&world_id)
            .ok_or_else(|| ManagerError::WorldNotFound(world_id.clone()))?;

        let reserved = self.next_agent.fetch_add(1, Ordering::Relaxed) + 1;
        let new_token = format!("resume_{world_id}_{}", mint_id("", 16));
        let outcome = handle
            .join(
                JoinRequest {
                    name: params.name,
                    delta_voxels: params.delta_voxels,
                    resume_token: (!token.is_empty()).then(|| token.clone()),
                    new_token,
                    agent_id: Some(format!("A{reserved}")),
                },
                SessionLink {
                    session_id: params.session_id,
                    protocol_version: params.protocol_version,
                    delta_voxels: params.delta_voxels,
                    outbound: params.outbound,
                },
            )
            .await?;
        self.next_agent
            .fetch_max(agent_number(&outcome.agent_id), Ordering::Relaxed);

        {
            let mut shared = self.lock();
            if outcome.resumed {
                shared.resume_to_world.remove(&token);
            }
            shared
                .agent_to_world
                .insert(outcome.agent_id.clone(), world_id.clone());
            shared
                .resume_to_world
                .insert(outcome.resume_token.clone(), world_id.clone());
        }
        self.schedule_persist();
        tracing::info!(
            agent_id = %outcome.agent_id,
            world_id = %world_id,
            resumed = outcome.resumed,
            "session attached"
        );
        Ok(Joined {
            agent_id: outcome.agent_id,
            resume_token: outcome.resume_token,
            resumed: outcome.resumed,
            world: handle.clone(),
        })
    }

    /// Detaches the session from whichever world the agent is in now.
    pub async fn leave(&self, agent_id: &str, session_id: &str) {
        let Some(handle) = self
            .agent_world(agent_id)
            .and_then(|id| self.worlds.get(&id))
        else {
            return;
        };
        if let Err(err) = handle.leave(agent_id, session_id).await {
            tracing::debug!(agent_id, error = %err, "leave not delivered");
        }
    }

    // -- routing ---------------------------------------------------------------

    /// Delivers an ACT to the agent's world, or runs its SWITCH_WORLD here.
    pub async fn route_act(&self, agent_id: &str, mut act: ActMsg) -> Result<(), ManagerError> {
        let world_id = self
            .agent_world(agent_id)
            .ok_or_else(|| ManagerError::AgentNotFound(agent_id.to_string()))?;
        if !act.expected_world_id.is_empty() && act.expected_world_id != world_id {
            return self
                .inject_result(&world_id, agent_id, "ACT", Err((ErrorCode::WorldBusy, "expected_world_id mismatch".to_string())))
                .await;
        }

        // Only the last SWITCH_WORLD counts; the rest of the ACT is dropped.
        if let Some(switch) = act
            .instants
            .iter()
            .rev()
            .find(|inst| inst.kind == "SWITCH_WORLD")
        {
            let (target, entry, reference) = (
                switch.target_world_id.clone(),
                switch.entry_point_id.clone(),
                switch.id.clone(),
            );
            return self
                .switch_world(agent_id, &world_id, &target, &entry, &reference)
                .await;
        }

        let handle = self
            .worlds
            .get(&world_id)
            .ok_or_else(|| ManagerError::WorldNotFound(world_id.clone()))?;
        let org_mutation = act
            .instants
            .iter()
            .any(|inst| ORG_MUTATIONS.contains(&inst.kind.as_str()));
        act.agent_id = agent_id.to_string();
        let envelope = ActionEnvelope {
            agent_id: agent_id.to_string(),
            act,
        };
        if let Err(err) = handle.submit(envelope).await {
            tracing::warn!(agent_id, world_id = %world_id, error = %err, "ACT not delivered");
            return self
                .inject_result(&world_id, agent_id, "ACT", Err((ErrorCode::WorldBusy, "world inbox busy".to_string())))
                .await;
        }
        if org_mutation {
            self.org_wake.notify_one();
        }
        Ok(())
    }

    async fn switch_world(
        &self,
        agent_id: &str,
        src_id: &str,
        target: &str,
        entry_point_id: &str,
        reference: &str,
    ) -> Result<(), ManagerError> {
        let target = target.trim();
        let deny = |code: ErrorCode, msg: &str| -> Result<&'static str, (ErrorCode, String)> {
            Err((code, msg.to_string()))
        };
        if target.is_empty() {
            self.record_switch(src_id, target, "invalid_target");
            return self
                .inject_result(src_id, agent_id, reference, deny(ErrorCode::WorldNotFound, "missing target world"))
                .await;
        }
        if target == src_id {
            self.record_switch(src_id, target, "noop");
            return self
                .inject_result(src_id, agent_id, reference, Ok("already in target world"))
                .await;
        }
        let (Some(src), Some(dst), Some(dst_spec)) = (
            self.worlds.get(src_id),
            self.worlds.get(target),
            self.directory.world(target),
        ) else {
            self.record_switch(src_id, target, "world_not_found");
            return self
                .inject_result(src_id, agent_id, reference, deny(ErrorCode::WorldNotFound, "target world not found"))
                .await;
        };

        let pos = match src.agent_pos(agent_id).await {
            Ok(Some(pos)) => pos,
            Ok(None) => {
                self.record_switch(src_id, target, "source_busy");
                return self
                    .inject_result(src_id, agent_id, reference, deny(ErrorCode::WorldBusy, "agent not in source world"))
                    .await;
            }
            Err(err) => {
                self.record_switch(src_id, target, "source_busy");
                return self
                    .inject_result(src_id, agent_id, reference, deny(ErrorCode::WorldBusy, &err.to_string()))
                    .await;
            }
        };
        let Some(route) = self
            .directory
            .select_route(src_id, target, entry_point_id, pos)
        else {
            self.record_switch(src_id, target, "denied");
            return self
                .inject_result(src_id, agent_id, reference, deny(ErrorCode::WorldDenied, "entry point required"))
                .await;
        };
        if route.requires_permit || dst_spec.requires_permit {
            self.record_switch(src_id, target, "denied");
            return self
                .inject_result(src_id, agent_id, reference, deny(ErrorCode::WorldDenied, "permit required"))
                .await;
        }
        let entries = (
            self.directory.entry_point(src_id, &route.from_entry_id),
            self.directory.entry_point(target, &route.to_entry_id),
        );
        let (Some(src_entry), Some(dst_entry)) = entries else {
            self.record_switch(src_id, target, "denied");
            return self
                .inject_result(src_id, agent_id, reference, deny(ErrorCode::WorldDenied, "entry point required"))
                .await;
        };
        if !src_entry.contains(pos) {
            self.record_switch(src_id, target, "denied");
            return self
                .inject_result(src_id, agent_id, reference, deny(ErrorCode::WorldDenied, "entry point required"))
                .await;
        }

        let departure = match src.transfer_out(agent_id, target).await {
            Ok(Ok(departure)) => departure,
            Ok(Err(err)) => {
                self.record_switch(src_id, target, "source_busy");
                return self
                    .inject_result(src_id, agent_id, reference, deny(ErrorCode::WorldBusy, &err.to_string()))
                    .await;
            }
            Err(err) => {
                self.record_switch(src_id, target, "source_busy");
                return self
                    .inject_result(src_id, agent_id, reference, deny(ErrorCode::WorldBusy, &err.to_string()))
                    .await;
            }
        };
        let link = departure.link;
        let original = departure.transfer;

        let now_dst = dst.tick();
        let until = original.switch_cooldown_until_tick;
        if until != 0 && now_dst < until {
            self.roll_back(src, &original, link).await;
            self.record_switch(src_id, target, "cooldown");
            return self
                .inject_result(src_id, agent_id, reference, deny(ErrorCode::WorldCooldown, "switch cooldown active"))
                .await;
        }

        let mut transfer = original.clone();
        self.merge_org_from_transfer(transfer.org.as_ref());
        self.attach_org_meta(&mut transfer);
        transfer.pos = [dst_entry.x, 0, dst_entry.z];
        transfer.from_world_id = src_id.to_string();
        transfer.current_world_id = target.to_string();
        transfer.from_entry_id = src_entry.id.clone();
        transfer.to_entry_id = dst_entry.id.clone();
        transfer.switch_cooldown_until_tick = now_dst + dst_spec.switch_cooldown_ticks;
        let resume_token = transfer.resume_token.clone();

        let failure = match dst
            .transfer_in(transfer, Some(dst_entry.center()), link.clone())
            .await
        {
            Ok(Ok(_)) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(err) => Some(err.to_string()),
        };
        if let Some(reason) = failure {
            self.roll_back(src, &original, link).await;
            self.record_switch(src_id, target, "target_busy");
            return self
                .inject_result(src_id, agent_id, reference, Err((ErrorCode::WorldBusy, format!("switch failed: {reason}"))))
                .await;
        }

        self.update_residency(agent_id, target, &resume_token);
        self.record_switch(src_id, target, "ok");
        tracing::info!(agent_id, from = src_id, to = target, "agent switched worlds");
        let ev = event(
            dst.tick(),
            "ACTION_RESULT",
            json!({
                "ref": reference,
                "ok": true,
                "world_id": target,
                "from": src_id,
                "from_entry_id": src_entry.id,
                "to_entry_id": dst_entry.id,
            }),
        );
        dst.inject_event(agent_id, ev).await?;
        Ok(())
    }

    /// Puts a departed agent back where it was, without a WORLD_SWITCH event.
    async fn roll_back(&self, src: &WorldHandle, original: &AgentTransfer, link: Option<SessionLink>) {
        let mut transfer = original.clone();
        transfer.from_world_id.clear();
        transfer.current_world_id = src.world_id().to_string();
        match src.transfer_in(transfer, None, link).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::warn!(agent_id = %original.id, world_id = %src.world_id(), error = %err, "switch rollback failed");
            }
            Err(err) => {
                tracing::warn!(agent_id = %original.id, world_id = %src.world_id(), error = %err, "switch rollback failed");
            }
        }
    }

    /// Admin move. The session, if any, follows the agent; position is kept.
    pub async fn move_agent_world(&self, agent_id: &str, target: &str) -> Result<(), ManagerError> {
        let (agent_id, target) = (agent_id.trim(), target.trim());
        if agent_id.is_empty() || target.is_empty() {
            return Err(ManagerError::BadRequest(
                "missing agent_id/target_world_id".to_string(),
            ));
        }
        let src_id = self
            .agent_world(agent_id)
            .ok_or_else(|| ManagerError::AgentNotFound(agent_id.to_string()))?;
        if src_id == target {
            self.record_switch(&src_id, target, "admin_noop");
            return Ok(());
        }
        let (Some(src), Some(dst), Some(dst_spec)) = (
            self.worlds.get(&src_id),
            self.worlds.get(target),
            self.directory.world(target),
        ) else {
            self.record_switch(&src_id, target, "admin_world_not_found");
            return Err(ManagerError::WorldNotFound(target.to_string()));
        };

        let departure = match src.transfer_out(agent_id, target).await {
            Ok(Ok(departure)) => departure,
            Ok(Err(err)) => {
                self.record_switch(&src_id, target, "admin_source_busy");
                return Err(ManagerError::Transfer(err.to_string()));
            }
            Err(err) => {
                self.record_switch(&src_id, target, "admin_source_busy");
                return Err(err.into());
            }
        };
        let link = departure.link;
        let original = departure.transfer;
        let mut transfer = original.clone();
        self.merge_org_from_transfer(transfer.org.as_ref());
        self.attach_org_meta(&mut transfer);
        transfer.from_world_id = src_id.clone();
        transfer.current_world_id = target.to_string();
        transfer.switch_cooldown_until_tick = dst.tick() + dst_spec.switch_cooldown_ticks;
        let resume_token = transfer.resume_token.clone();

        let failure = match dst.transfer_in(transfer, None, link.clone()).await {
            Ok(Ok(_)) => None,
            Ok(Err(err)) => Some(ManagerError::Transfer(err.to_string())),
            Err(err) => Some(err.into()),
        };
        if let Some(err) = failure {
            self.roll_back(src, &original, link).await;
            self.record_switch(&src_id, target, "admin_target_busy");
            return Err(err);
        }
        self.update_residency(agent_id, target, &resume_token);
        self.record_switch(&src_id, target, "admin_ok");
        tracing::info!(agent_id, from = %src_id, to = target, "agent moved by admin");
        Ok(())
    }

    async fn inject_result(
        &self,
        world_id: &str,
        agent_id: &str,
        reference: &str,
        result: Result<&str, (ErrorCode, String)>,
    ) -> Result<(), ManagerError> {
        let handle = self
            .worlds
            .get(world_id)
            .ok_or_else(|| ManagerError::WorldNotFound(world_id.to_string()))?;
        let fields = match result {
            Ok(message) => json!({"ref": reference, "ok": true, "message": message}),
            Err((code, message)) => {
                json!({"ref": reference, "ok": false, "code": code.as_str(), "message": message})
            }
        };
        handle
            .inject_event(agent_id, event(handle.tick(), "ACTION_RESULT", fields))
            .await?;
        Ok(())
    }

    pub async fn inject_event(&self, agent_id: &str, ev: Event) -> Result<bool, ManagerError> {
        let world_id = self
            .agent_world(agent_id)
            .ok_or_else(|| ManagerError::AgentNotFound(agent_id.to_string()))?;
        let handle = self
            .worlds
            .get(&world_id)
            .ok_or(ManagerError::WorldNotFound(world_id))?;
        Ok(handle.inject_event(agent_id, ev).await?)
    }

    // -- org metadata ----------------------------------------------------------

    /// Collects every world's orgs, merges them by meta version and pushes the
    /// merged set back to every world.
    pub async fn refresh_org_meta(&self) -> Result<(), ManagerError> {
        let mut snapshots = Vec::new();
        let mut first_err = None;
        for handle in self.worlds.values() {
            match handle.org_snapshot().await {
                Ok(snapshot) => snapshots.push(snapshot.orgs),
                Err(err) => {
                    first_err.get_or_insert(ManagerError::Runtime(err));
                }
            }
        }
        let merged = merge_org_snapshots(&snapshots)
            .into_iter()
            .map(clean_org)
            .collect::<Vec<_>>();
        let changed = {
            let mut shared = self.lock();
            let next = merged
                .iter()
                .map(|org| (org.org_id.clone(), org.clone()))
                .collect::<BTreeMap<_, _>>();
            let changed = shared.org_meta != next;
            shared.org_meta = next;
            changed
        };
        if changed {
            self.schedule_persist();
        }
        for handle in self.worlds.values() {
            if let Err(err) = handle.apply_org_meta(merged.clone()).await {
                first_err.get_or_insert(ManagerError::Runtime(err));
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn merge_org_from_transfer(&self, org: Option<&OrgTransfer>) {
        let Some(org) = org.filter(|org| !org.org_id.trim().is_empty()) else {
            return;
        };
        let candidate = clean_org(org.clone());
        {
            let mut shared = self.lock();
            let merged = match shared.org_meta.get(&candidate.org_id) {
                Some(current) => merge_org_snapshots(&[vec![current.clone()], vec![candidate]]),
                None => vec![candidate],
            };
            for org in merged {
                shared.org_meta.insert(org.org_id.clone(), org);
            }
        }
        self.schedule_persist();
    }

    fn attach_org_meta(&self, transfer: &mut AgentTransfer) {
        if transfer.org_id.trim().is_empty() {
            return;
        }
        if let Some(meta) = self.lock().org_meta.get(&transfer.org_id) {
            transfer.org = Some(clean_org(meta.clone()));
        }
    }

    // -- admin -----------------------------------------------------------------

    pub async fn reset_world(&self, world_id: &str) -> Result<ResetReport, ManagerError> {
        let spec = self
            .directory
            .world(world_id)
            .ok_or_else(|| ManagerError::WorldNotFound(world_id.to_string()))?;
        if !spec.allow_admin_reset {
            return Err(ManagerError::ResetNotAllowed(world_id.to_string()));
        }
        let handle = self
            .worlds
            .get(world_id)
            .ok_or_else(|| ManagerError::WorldNotFound(world_id.to_string()))?;
        let report = handle.admin_reset().await??;
        tracing::info!(world_id, tick = report.tick, reset_total = report.reset_total, "world reset");
        Ok(report)
    }

    pub fn state(&self) -> ManagerState {
        ManagerState {
            default_world_id: self.directory.default_world_id.clone(),
            worlds: self
                .worlds
                .values()
                .map(|handle| WorldState {
                    status: handle.status(),
                    allow_admin_reset: self
                        .directory
                        .world(handle.world_id())
                        .is_some_and(|w| w.allow_admin_reset),
                    index: handle.index_stats().map(|stats| stats.view()),
                })
                .collect(),
            switch_metrics: self.switch_metrics(),
            mirror: self.mirror.as_ref().map(|m| m.stats()),
        }
    }

    // -- bookkeeping -----------------------------------------------------------

    fn record_switch(&self, from: &str, to: &str, result: &str) {
        let or_unknown = |s: &str| if s.is_empty() { "UNKNOWN".to_string() } else { s.to_string() };
        *self
            .lock()
            .switch_totals
            .entry((or_unknown(from), or_unknown(to), result.to_string()))
            .or_default() += 1;
        self.schedule_persist();
    }

    fn update_residency(&self, agent_id: &str, world_id: &str, resume_token: &str) {
        {
            let mut shared = self.lock();
            shared
                .agent_to_world
                .insert(agent_id.to_string(), world_id.to_string());
            if !resume_token.trim().is_empty() {
                shared
                    .resume_to_world
                    .insert(resume_token.to_string(), world_id.to_string());
            }
        }
        self.schedule_persist();
    }

    fn schedule_persist(&self) {
        if self.state_file.is_some() {
            self.persist_wake.notify_one();
        }
    }

    /// Writes `global/state.json` now.
    pub fn persist_now(&self) -> Result<(), ManagerError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let file = self.lock().to_file();
        file.write(path)
    }

    /// Stops every world, flushes its writers and the state file.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        let runtimes = std::mem::take(&mut *self.runtimes.lock().unwrap_or_else(PoisonError::into_inner));
        for runtime in runtimes {
            runtime.stop().await;
        }
        if let Err(err) = self.persist_now() {
            tracing::warn!(error = %err, "manager state not written");
        }
        if let Some(mirror) = self.mirror.clone() {
            if tokio::task::spawn_blocking(move || mirror.close()).await.is_err() {
                tracing::warn!("mirror shutdown panicked");
            }
        }
        tracing::info!("world manager stopped");
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Waits for quiet: each wake restarts the delay.
async fn settle(wake: &Notify, delay: Duration) {
    loop {
        tokio::select! {
            _ = wake.notified() => continue,
            _ = tokio::time::sleep(delay) => return,
        }
    }
}

async fn persist_loop(manager: Weak<WorldManager>, wake: Arc<Notify>) {
    loop {
        wake.notified().await;
        settle(&wake, PERSIST_DEBOUNCE).await;
        let Some(manager) = manager.upgrade() else {
            return;
        };
        if let Err(err) = manager.persist_now() {
            tracing::warn!(error = %err, "manager state not written");
        }
    }
}

async fn org_refresh_loop(manager: Weak<WorldManager>, wake: Arc<Notify>) {
    loop {
        wake.notified().await;
        settle(&wake, ORG_REFRESH_DEBOUNCE).await;
        let Some(manager) = manager.upgrade() else {
            return;
        };
        if let Err(err) = manager.refresh_org_meta().await {
            tracing::warn!(error = %err, "org refresh incomplete");
        }
    }
}

#[cfg(test)]
mod tests {
    use contracts::{InstantReq, PROTOCOL_VERSION_1_1};
    use serde_json::Value;

    use super::*;

    fn start(data_dir: Option<PathBuf>) -> Arc<WorldManager> {
        WorldManager::start(
            MultiWorldConfig::default(),
            ManagerOptions {
                data_dir,
                seed: 1337,
                ..ManagerOptions::default()
            },
        )
        .expect("manager")
    }

    fn params(name: &str, token: &str) -> JoinParams {
        JoinParams {
            name: name.to_string(),
            delta_voxels: false,
            resume_token: token.to_string(),
            world_preference: String::new(),
            session_id: mint_id("sess_", 16),
            protocol_version: PROTOCOL_VERSION_1_1.to_string(),
            outbound: Outbound::new(8),
        }
    }

    fn switch_act(target: &str) -> ActMsg {
        ActMsg {
            act_id: "act-1".to_string(),
            instants: vec![
                InstantReq {
                    id: "I1".to_string(),
                    kind: "SAY".to_string(),
                    text: "dropped".to_string(),
                    ..InstantReq::default()
                },
                InstantReq {
                    id: "I2".to_string(),
                    kind: "SWITCH_WORLD".to_string(),
                    target_world_id: target.to_string(),
                    ..InstantReq::default()
                },
            ],
            ..ActMsg::default()
        }
    }

    async fn results(manager: &WorldManager, world_id: &str, agent_id: &str) -> Vec<Event> {
        let (events, _) = manager
            .world(world_id)
            .expect("world")
            .events_since(agent_id, 0, 1000)
            .await
            .expect("runtime")
            .expect("agent");
        events
            .into_iter()
            .map(|(_, ev)| ev)
            .filter(|ev| ev.get("type").and_then(Value::as_str) == Some("ACTION_RESULT"))
            .collect()
    }

    fn count(manager: &WorldManager, from: &str, to: &str, result: &str) -> u64 {
        manager
            .switch_metrics()
            .into_iter()
            .find(|m| m.from == from && m.to == to && m.result == result)
            .map_or(0, |m| m.count)
    }

    #[tokio::test]
    async fn switch_moves_agent_then_cooldown_blocks_return() {
        let manager = start(None);
        let joined = manager.join(params("miner", "")).await.expect("join");
        assert_eq!(joined.world.world_id(), "OVERWORLD");
        let id = joined.agent_id.clone();

        manager.route_act(&id, switch_act("MINE_L1")).await.expect("route");
        assert_eq!(manager.agent_world(&id).as_deref(), Some("MINE_L1"));
        assert_eq!(count(&manager, "OVERWORLD", "MINE_L1", "ok"), 1);
        let arrived = results(&manager, "MINE_L1", &id).await;
        let ok = arrived
            .iter()
            .find(|ev| ev.get("ref") == Some(&json!("I2")))
            .expect("switch result");
        assert_eq!(ok.get("ok"), Some(&json!(true)));
        assert_eq!(ok.get("from"), Some(&json!("OVERWORLD")));
        assert_eq!(ok.get("to_entry_id"), Some(&json!("mine_l1_gate")));

        manager.route_act(&id, switch_act("OVERWORLD")).await.expect("route");
        assert_eq!(manager.agent_world(&id).as_deref(), Some("MINE_L1"));
        assert_eq!(count(&manager, "MINE_L1", "OVERWORLD", "cooldown"), 1);
        let blocked = results(&manager, "MINE_L1", &id).await;
        assert!(blocked.iter().any(|ev| ev.get("code") == Some(&json!("E_WORLD_COOLDOWN"))));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn bad_targets_are_reported_in_the_source_world() {
        let manager = start(None);
        let id = manager.join(params("scout", "")).await.expect("join").agent_id;

        manager.route_act(&id, switch_act("")).await.expect("route");
        manager.route_act(&id, switch_act("OVERWORLD")).await.expect("route");
        manager.route_act(&id, switch_act("NOWHERE")).await.expect("route");
        manager.route_act(&id, switch_act("MINE_L2")).await.expect("route");

        assert_eq!(count(&manager, "OVERWORLD", "UNKNOWN", "invalid_target"), 1);
        assert_eq!(count(&manager, "OVERWORLD", "OVERWORLD", "noop"), 1);
        assert_eq!(count(&manager, "OVERWORLD", "NOWHERE", "world_not_found"), 1);
        assert_eq!(count(&manager, "OVERWORLD", "MINE_L2", "denied"), 1);
        let codes = results(&manager, "OVERWORLD", &id)
            .await
            .into_iter()
            .filter_map(|ev| ev.get("code").and_then(Value::as_str).map(str::to_string))
            .collect::<Vec<_>>();
        assert_eq!(
            codes,
            vec!["E_WORLD_NOT_FOUND", "E_WORLD_NOT_FOUND", "E_WORLD_DENIED"]
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn expected_world_mismatch_is_refused() {
        let manager = start(None);
        let id = manager.join(params("late", "")).await.expect("join").agent_id;
        let act = ActMsg {
            act_id: "a".to_string(),
            expected_world_id: "CITY_HUB".to_string(),
            ..ActMsg::default()
        };
        manager.route_act(&id, act).await.expect("route");
        let events = results(&manager, "OVERWORLD", &id).await;
        assert!(events.iter().any(|ev| {
            ev.get("ref") == Some(&json!("ACT"))
                && ev.get("code") == Some(&json!("E_WORLD_BUSY"))
                && ev.get("message") == Some(&json!("expected_world_id mismatch"))
        }));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn resume_token_finds_the_agent_after_an_admin_move() {
        let manager = start(None);
        let first = manager.join(params("nomad", "")).await.expect("join");
        manager
            .move_agent_world(&first.agent_id, "CITY_HUB")
            .await
            .expect("move");
        assert_eq!(count(&manager, "OVERWORLD", "CITY_HUB", "admin_ok"), 1);

        let again = manager
            .join(params("nomad", &first.resume_token))
            .await
            .expect("resume");
        assert!(again.resumed);
        assert_eq!(again.agent_id, first.agent_id);
        assert_eq!(again.world.world_id(), "CITY_HUB");
        assert_ne!(again.resume_token, first.resume_token);

        let fresh = manager.join(params("other", "")).await.expect("join");
        assert_ne!(fresh.agent_id, first.agent_id);
        assert!(matches!(
            manager.move_agent_world("A999", "CITY_HUB").await,
            Err(ManagerError::AgentNotFound(_))
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn admin_reset_honours_the_world_flag() {
        let manager = start(None);
        assert!(matches!(
            manager.reset_world("OVERWORLD").await,
            Err(ManagerError::ResetNotAllowed(_))
        ));
        let report = manager.reset_world("MINE_L1").await.expect("reset");
        assert_eq!(report.reset_total, 1);
        let state = manager.state();
        let mine = state
            .worlds
            .iter()
            .find(|w| w.status.world_id == "MINE_L1")
            .expect("mine");
        assert_eq!(mine.status.reset_total, 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn state_file_survives_a_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = start(Some(dir.path().to_path_buf()));
        let id = manager.join(params("keeper", "")).await.expect("join").agent_id;
        manager.route_act(&id, switch_act("MINE_L1")).await.expect("route");
        manager.shutdown().await;

        let path = dir.path().join("global").join("state.json");
        let file = StateFile::load(&path).expect("state");
        assert_eq!(file.version, STATE_VERSION);
        assert_eq!(file.agent_to_world.get(&id).map(String::as_str), Some("MINE_L1"));
        assert_eq!(file.resume_to_world.values().filter(|w| *w == "MINE_L1").count(), 1);
        assert_eq!(
            file.switch_metrics,
            vec![SwitchMetric {
                from: "OVERWORLD".to_string(),
                to: "MINE_L1".to_string(),
                result: "ok".to_string(),
                count: 1,
            }]
        );

        let reloaded = start(Some(dir.path().to_path_buf()));
        assert_eq!(reloaded.agent_world(&id).as_deref(), Some("MINE_L1"));
        assert_eq!(count(&reloaded, "OVERWORLD", "MINE_L1", "ok"), 1);
        let next = reloaded.join(params("newcomer", "")).await.expect("join");
        assert!(agent_number(&next.agent_id) > agent_number(&id));
        reloaded.shutdown().await;
    }

    #[test]
    fn legacy_residency_file_is_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let global = dir.path().join("global");
        std::fs::create_dir_all(&global).expect("mkdir");
        std::fs::write(
            global.join("agent_residency.json"),
            r#"{"agent_to_world":{"A3":"MINE_L2","":"X"},"resume_to_world":{"tok":"MINE_L2"}}"#,
        )
        .expect("write");
        let file = StateFile::load(&global.join("state.json")).expect("legacy");
        let shared = Shared::from_file(file);
        assert_eq!(shared.agent_to_world.len(), 1);
        assert_eq!(shared.resume_to_world.get("tok").map(String::as_str), Some("MINE_L2"));
        assert_eq!(shared.to_file().version, STATE_VERSION);
    }

    #[test]
    fn minted_ids_are_unique_and_sized() {
        let a = mint_id("sess_", 16);
        let b = mint_id("sess_", 16);
        assert_ne!(a, b);
        assert_eq!(a.len(), "sess_".len() + 16);
        assert!(a["sess_".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
