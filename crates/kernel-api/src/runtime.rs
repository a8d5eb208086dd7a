//! One tick task per world. Every mutation of a [`World`] happens on its task;
//! sessions and the manager talk to it through the inbox (ACTs) and the
//! control channel (joins, transfers, admin). Durable output leaves the tick
//! path through two worker threads so disk and index latency never stall a
//! tick.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use contracts::{
    AckMsg, AgentTransfer, Event, OrgTransfer, WorldParams, CHUNK_SIZE_X, CHUNK_SIZE_Z, WORLD_HEIGHT,
};
use kernel_core::{
    ActionEnvelope, AuditEntry, Catalogs, JoinOutcome, JoinRequest, OrgSnapshot, SnapshotV1,
    StepOutput, TickLogEntry, TransferError, Vec3i, World, WorldConfig,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};

use crate::config::IndexBackend;
use crate::index::{
    AuditSequencer, IndexRecord, IndexStats, IndexWriter, SnapshotRow, SnapshotStateRow,
};
use crate::mirror::Mirror;
use crate::outbound::Outbound;
use crate::persistence::{
    latest_snapshot, read_snapshot, write_snapshot, JsonlZstdWriter, PersistenceError,
    SeasonArchiver, SeasonRecord, SegmentClosed,
};
use crate::ManagerError;

pub const INBOX_CAPACITY: usize = 1024;
pub const CONTROL_CAPACITY: usize = 64;
/// Session to world inbox send budget.
pub const INBOX_SEND_TIMEOUT: Duration = Duration::from_secs(3);
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(3);
pub const LEAVE_TIMEOUT: Duration = Duration::from_millis(300);
pub const RESET_TIMEOUT: Duration = Duration::from_secs(30);
const SNAPSHOT_QUEUE_CAPACITY: usize = 4;
/// Most ACTs applied in one tick; the rest wait for the next one.
pub const MAX_ACTIONS_PER_TICK: usize = INBOX_CAPACITY;
/// Accepted ACTs held between ticks. The inbox is not read past this.
const PENDING_CAPACITY: usize = 2 * MAX_ACTIONS_PER_TICK;
/// How long an ACK stays remembered per (agent, world, act_id).
pub const ACT_DEDUPE_TTL_TICKS: u64 = 3000;
/// Ceiling for draining the inbox on shutdown.
const DRAIN_CEILING: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Where a world delivers OBS for one attached agent.
#[derive(Debug, Clone)]
pub struct SessionLink {
    pub session_id: String,
    pub protocol_version: String,
    pub delta_voxels: bool,
    pub outbound: Outbound,
}

/// An agent leaving a world, with its session when one was attached.
#[derive(Debug)]
pub struct Departure {
    pub transfer: AgentTransfer,
    pub link: Option<SessionLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub world_id: String,
    pub tick: u64,
    pub reset_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<SeasonRecord>,
}

pub type EventPage = (Vec<(u64, Event)>, u64);

#[derive(Debug)]
pub enum Control {
    Join {
        req: JoinRequest,
        link: SessionLink,
        reply: oneshot::Sender<JoinOutcome>,
    },
    /// Detaches `agent_id` only while `session_id` still owns it.
    Leave {
        agent_id: String,
        session_id: String,
        reply: oneshot::Sender<()>,
    },
    TransferOut {
        agent_id: String,
        to_world: String,
        reply: oneshot::Sender<Result<Departure, TransferError>>,
    },
    TransferIn {
        transfer: Box<AgentTransfer>,
        entry: Option<Vec3i>,
        link: Option<SessionLink>,
        reply: oneshot::Sender<Result<JoinOutcome, TransferError>>,
    },
    InjectEvent {
        agent_id: String,
        event: Event,
        reply: oneshot::Sender<bool>,
    },
    OrgSnapshot {
        reply: oneshot::Sender<OrgSnapshot>,
    },
    ApplyOrgMeta {
        orgs: Vec<OrgTransfer>,
    },
    AdminReset {
        reply: oneshot::Sender<Result<ResetReport, PersistenceError>>,
    },
    AgentPos {
        agent_id: String,
        reply: oneshot::Sender<Option<Vec3i>>,
    },
    EventsSince {
        agent_id: String,
        since: u64,
        limit: usize,
        reply: oneshot::Sender<Option<EventPage>>,
    },
    /// Replies with the remembered ACK and `true`, or stores `proposed`.
    CheckAck {
        agent_id: String,
        act_id: String,
        proposed: AckMsg,
        reply: oneshot::Sender<(AckMsg, bool)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeError {
    /// The world did not take or answer the request in time.
    Busy,
    Closed,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "world busy"),
            Self::Closed => write!(f, "world stopped"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Published after every tick and control message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorldStatus {
    pub world_id: String,
    pub world_type: String,
    pub tick: u64,
    pub season: u64,
    pub agents: usize,
    pub clients: usize,
    pub reset_total: u64,
    pub weather: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub active_event_id: String,
    pub loaded_chunks: usize,
    pub dropped_snapshots: u64,
}

impl WorldStatus {
    fn of(world: &World, dropped_snapshots: u64) -> Self {
        Self {
            world_id: world.world_id().to_string(),
            world_type: world.config().world_type.clone(),
            tick: world.tick(),
            season: world.season_index(world.tick()),
            agents: world.agent_count(),
            clients: world.client_count(),
            reset_total: world.reset_total(),
            weather: world.weather().as_str().to_string(),
            active_event_id: world.active_event_id().unwrap_or_default().to_string(),
            loaded_chunks: world.loaded_chunks(),
            dropped_snapshots,
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable address of a running world.
#[derive(Debug, Clone)]
pub struct WorldHandle {
    world_id: String,
    catalogs: Arc<Catalogs>,
    params: WorldParams,
    inbox: mpsc::Sender<ActionEnvelope>,
    control: mpsc::Sender<Control>,
    status: watch::Receiver<WorldStatus>,
    index_stats: Option<Arc<IndexStats>>,
}

impl WorldHandle {
    pub fn world_id(&self) -> &str {
        &self.world_id
    }

    pub fn catalogs(&self) -> &Arc<Catalogs> {
        &self.catalogs
    }

    pub fn params(&self) -> &WorldParams {
        &self.params
    }

    pub fn status(&self) -> WorldStatus {
        self.status.borrow().clone()
    }

    pub fn tick(&self) -> u64 {
        self.status.borrow().tick
    }

    pub fn index_stats(&self) -> Option<&Arc<IndexStats>> {
        self.index_stats.as_ref()
    }

    /// Queues an ACT for the next tick.
    pub async fn submit(&self, envelope: ActionEnvelope) -> Result<(), RuntimeError> {
        match timeout(INBOX_SEND_TIMEOUT, self.inbox.send(envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RuntimeError::Closed),
            Err(_) => Err(RuntimeError::Busy),
        }
    }

    pub async fn join(&self, req: JoinRequest, link: SessionLink) -> Result<JoinOutcome, RuntimeError> {
        self.call(CONTROL_TIMEOUT, |reply| Control::Join { req, link, reply })
            .await
    }

    pub async fn leave(&self, agent_id: &str, session_id: &str) -> Result<(), RuntimeError> {
        let agent_id = agent_id.to_string();
        let session_id = session_id.to_string();
        self.call(LEAVE_TIMEOUT, |reply| Control::Leave {
            agent_id,
            session_id,
            reply,
        })
        .await
    }

    pub async fn transfer_out(
        &self,
        agent_id: &str,
        to_world: &str,
    ) -> Result<Result<Departure, TransferError>, RuntimeError> {
        let agent_id = agent_id.to_string();
        let to_world = to_world.to_string();
        self.call(CONTROL_TIMEOUT, |reply| Control::TransferOut {
            agent_id,
            to_world,
            reply,
        })
        .await
    }

    pub async fn transfer_in(
        &self,
        transfer: AgentTransfer,
        entry: Option<Vec3i>,
        link: Option<SessionLink>,
    ) -> Result<Result<JoinOutcome, TransferError>, RuntimeError> {
        self.call(CONTROL_TIMEOUT, |reply| Control::TransferIn {
            transfer: Box::new(transfer),
            entry,
            link,
            reply,
        })
        .await
    }

    pub async fn inject_event(&self, agent_id: &str, event: Event) -> Result<bool, RuntimeError> {
        let agent_id = agent_id.to_string();
        self.call(CONTROL_TIMEOUT, |reply| Control::InjectEvent {
            agent_id,
            event,
            reply,
        })
        .await
    }

    pub async fn org_snapshot(&self) -> Result<OrgSnapshot, RuntimeError> {
        self.call(CONTROL_TIMEOUT, |reply| Control::OrgSnapshot { reply })
            .await
    }

    pub async fn apply_org_meta(&self, orgs: Vec<OrgTransfer>) -> Result<(), RuntimeError> {
        match timeout(CONTROL_TIMEOUT, self.control.send(Control::ApplyOrgMeta { orgs })).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RuntimeError::Closed),
            Err(_) => Err(RuntimeError::Busy),
        }
    }

    pub async fn admin_reset(&self) -> Result<Result<ResetReport, PersistenceError>, RuntimeError> {
        self.call(RESET_TIMEOUT, |reply| Control::AdminReset { reply })
            .await
    }

    pub async fn agent_pos(&self, agent_id: &str) -> Result<Option<Vec3i>, RuntimeError> {
        let agent_id = agent_id.to_string();
        self.call(CONTROL_TIMEOUT, |reply| Control::AgentPos { agent_id, reply })
            .await
    }

    pub async fn events_since(
        &self,
        agent_id: &str,
        since: u64,
        limit: usize,
    ) -> Result<Option<EventPage>, RuntimeError> {
        let agent_id = agent_id.to_string();
        self.call(CONTROL_TIMEOUT, |reply| Control::EventsSince {
            agent_id,
            since,
            limit,
            reply,
        })
        .await
    }

    /// World-side idempotency for `act_id`, shared by every session of the
    /// agent: returns the first ACK seen for it and whether this is a repeat.
    pub async fn check_or_remember_ack(
        &self,
        agent_id: &str,
        proposed: AckMsg,
    ) -> Result<(AckMsg, bool), RuntimeError> {
        if agent_id.trim().is_empty() || proposed.ack_for.trim().is_empty() {
            return Ok((proposed, false));
        }
        let agent_id = agent_id.to_string();
        let act_id = proposed.ack_for.clone();
        self.call(CONTROL_TIMEOUT, |reply| Control::CheckAck {
            agent_id,
            act_id,
            proposed,
            reply,
        })
        .await
    }

    async fn call<T>(
        &self,
        budget: Duration,
        make: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        match timeout(budget, self.control.send(make(tx))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(RuntimeError::Closed),
            Err(_) => return Err(RuntimeError::Busy),
        }
        match timeout(budget, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(RuntimeError::Closed),
            Err(_) => Err(RuntimeError::Busy),
        }
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// `<data>/worlds/<id>`; `None` keeps the world in memory only.
    pub world_dir: Option<PathBuf>,
    pub index: IndexBackend,
    pub mirror: Option<Arc<Mirror>>,
    pub load_latest_snapshot: bool,
}

/// A running world: its handle plus what is needed to stop it.
#[derive(Debug)]
pub struct WorldRuntime {
    handle: WorldHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorldRuntime {
    /// Builds (or restores) the world and spawns its tick task. Must be called
    /// inside a tokio runtime.
    pub fn start(mut cfg: WorldConfig, opts: RuntimeOptions) -> Result<Self, ManagerError> {
        cfg.apply_defaults();
        cfg.validate()?;
        let catalogs = Arc::new(Catalogs::builtin(&cfg));
        let world = match restore(&cfg, &catalogs, &opts)? {
            Some(world) => world,
            None => World::new(cfg, Arc::clone(&catalogs))?,
        };
        let world_id = world.world_id().to_string();

        let sinks = match &opts.world_dir {
            Some(dir) => Some(Sinks::start(&world_id, dir, &catalogs, &opts)?),
            None => None,
        };
        let index_stats = sinks.as_ref().and_then(|s| s.index_stats.clone());

        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(WorldStatus::of(&world, 0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cfg = world.config();
        let params = WorldParams {
            tick_rate_hz: cfg.tick_rate_hz,
            chunk_size: [CHUNK_SIZE_X, WORLD_HEIGHT, CHUNK_SIZE_Z],
            height: cfg.height,
            obs_radius: cfg.obs_radius,
            day_ticks: cfg.day_ticks,
            seed: cfg.seed,
        };
        let handle = WorldHandle {
            world_id: world_id.clone(),
            catalogs: Arc::clone(world.catalogs()),
            params,
            inbox: inbox_tx,
            control: control_tx,
            status: status_rx,
            index_stats,
        };

        let runner = Runner {
            world,
            links: HashMap::new(),
            pending: VecDeque::new(),
            acks: ActDedupe::default(),
            status: status_tx,
            sinks,
            dropped_snapshots: 0,
        };
        tracing::info!(world_id = %world_id, tick = handle.tick(), "world runtime started");
        let task = tokio::spawn(runner.run(inbox_rx, control_rx, shutdown_rx));
        Ok(Self {
            handle,
            shutdown: shutdown_tx,
            task,
        })
    }

    pub fn handle(&self) -> &WorldHandle {
        &self.handle
    }

    /// Signals shutdown and waits for the tick task and its writers to finish.
    pub async fn stop(self) {
        let world_id = self.handle.world_id.clone();
        self.shutdown.send_replace(true);
        if let Err(err) = self.task.await {
            tracing::warn!(world_id = %world_id, error = %err, "world task ended abnormally");
        }
    }
}

fn restore(
    cfg: &WorldConfig,
    catalogs: &Arc<Catalogs>,
    opts: &RuntimeOptions,
) -> Result<Option<World>, ManagerError> {
    let Some(dir) = opts.world_dir.as_ref().filter(|_| opts.load_latest_snapshot) else {
        return Ok(None);
    };
    let Some(path) = latest_snapshot(&dir.join("snapshots"))? else {
        return Ok(None);
    };
    let snap = read_snapshot(&path)?;
    if snap.world_id() != cfg.world_id {
        tracing::warn!(
            world_id = %cfg.world_id,
            found = %snap.world_id(),
            path = %path.display(),
            "snapshot belongs to another world, starting fresh"
        );
        return Ok(None);
    }
    let tick = snap.tick();
    let world = World::from_snapshot(snap, Arc::clone(catalogs))?;
    tracing::info!(world_id = %cfg.world_id, tick, path = %path.display(), "world restored from snapshot");
    Ok(Some(world))
}

// ---------------------------------------------------------------------------
// Tick task
// ---------------------------------------------------------------------------

/// ACKs remembered per (agent, act_id) until their expiry tick.
#[derive(Debug, Default)]
struct ActDedupe {
    entries: HashMap<(String, String), (AckMsg, u64)>,
}

impl ActDedupe {
    fn check_or_remember(&mut self, now: u64, agent_id: String, act_id: String, proposed: AckMsg) -> (AckMsg, bool) {
        self.entries.retain(|_, (_, expires)| now < *expires);
        let key = (agent_id, act_id);
        if let Some((ack, _)) = self.entries.get(&key) {
            return (ack.clone(), true);
        }
        self.entries
            .insert(key, (proposed.clone(), now + ACT_DEDUPE_TTL_TICKS));
        (proposed, false)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Runner {
    world: World,
    links: HashMap<String, SessionLink>,
    pending: VecDeque<ActionEnvelope>,
    acks: ActDedupe,
    status: watch::Sender<WorldStatus>,
    sinks: Option<Sinks>,
    dropped_snapshots: u64,
}

impl Runner {
    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<ActionEnvelope>,
        mut control: mpsc::Receiver<Control>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let hz = u64::from(self.world.config().tick_rate_hz.max(1));
        let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / hz));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick completes immediately.
        ticker.tick().await;

        loop {
            // The ticker goes before the queues so a busy inbox cannot hold
            // the tick back.
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.step().await,
                Some(cmd) = control.recv() => self.handle(cmd).await,
                Some(envelope) = inbox.recv(), if self.pending.len() < PENDING_CAPACITY => {
                    self.pending.push_back(envelope);
                }
            }
        }

        self.drain(&mut inbox).await;
        self.finish().await;
    }

    async fn step(&mut self) {
        let take = self.pending.len().min(MAX_ACTIONS_PER_TICK);
        let actions: Vec<ActionEnvelope> = self.pending.drain(..take).collect();
        let StepOutput {
            log,
            audits,
            observations,
            snapshot,
            season_archive,
            ..
        } = self.world.step(actions);

        for mut obs in observations {
            let Some(link) = self.links.get(&obs.agent_id) else {
                continue;
            };
            obs.protocol_version = link.protocol_version.clone();
            match serde_json::to_string(&obs) {
                Ok(text) => {
                    link.outbound.push_obs(text);
                }
                Err(err) => {
                    tracing::warn!(agent_id = %obs.agent_id, error = %err, "OBS encode failed");
                }
            }
        }

        if let Some(sinks) = &self.sinks {
            // The pre-rollover state is archived, never dropped.
            if let Some(snap) = season_archive {
                if sinks.snapshots.send(SnapshotJob::Write(Box::new(snap))).await.is_err() {
                    tracing::warn!(world_id = %self.world.world_id(), "snapshot worker gone");
                }
            }
            if sinks.logs.send(LogJob { log, audits }).is_err() {
                tracing::warn!(world_id = %self.world.world_id(), "log worker gone");
            }
            if let Some(snap) = snapshot {
                if sinks.snapshots.try_send(SnapshotJob::Write(Box::new(snap))).is_err() {
                    self.dropped_snapshots += 1;
                    if self.dropped_snapshots == 1 || self.dropped_snapshots % 100 == 0 {
                        tracing::warn!(
                            world_id = %self.world.world_id(),
                            tick = self.world.tick(),
                            dropped = self.dropped_snapshots,
                            "snapshot queue full, snapshot dropped"
                        );
                    }
                }
            }
        }
        self.publish();
    }

    async fn handle(&mut self, cmd: Control) {
        match cmd {
            Control::Join { req, link, reply } => {
                let outcome = self.world.join(req);
                if let Some(old) = self.links.insert(outcome.agent_id.clone(), link) {
                    // A resumed agent drops the stale session.
                    old.outbound.close();
                }
                let _ = reply.send(outcome);
            }
            Control::Leave {
                agent_id,
                session_id,
                reply,
            } => {
                let owned = self
                    .links
                    .get(&agent_id)
                    .is_some_and(|link| link.session_id == session_id);
                if owned {
                    self.links.remove(&agent_id);
                    self.world.leave(&agent_id);
                }
                let _ = reply.send(());
            }
            Control::TransferOut {
                agent_id,
                to_world,
                reply,
            } => {
                let link = self.links.remove(&agent_id);
                let result = match self.world.transfer_out(&agent_id, &to_world) {
                    Ok(transfer) => Ok(Departure { transfer, link }),
                    Err(err) => {
                        if let Some(link) = link {
                            self.links.insert(agent_id, link);
                        }
                        Err(err)
                    }
                };
                let _ = reply.send(result);
            }
            Control::TransferIn {
                transfer,
                entry,
                link,
                reply,
            } => {
                let attach = link.as_ref().map(|l| l.delta_voxels);
                let result = self.world.transfer_in(*transfer, entry, attach);
                if let (Ok(outcome), Some(link)) = (&result, link) {
                    self.links.insert(outcome.agent_id.clone(), link);
                }
                let _ = reply.send(result);
            }
            Control::InjectEvent {
                agent_id,
                event,
                reply,
            } => {
                let _ = reply.send(self.world.inject_event(&agent_id, event));
            }
            Control::OrgSnapshot { reply } => {
                let _ = reply.send(self.world.org_snapshot());
            }
            Control::ApplyOrgMeta { orgs } => self.world.apply_org_meta(&orgs),
            Control::AdminReset { reply } => self.admin_reset(reply).await,
            Control::AgentPos { agent_id, reply } => {
                let _ = reply.send(self.world.agent(&agent_id).map(|a| a.pos));
            }
            Control::EventsSince {
                agent_id,
                since,
                limit,
                reply,
            } => {
                let _ = reply.send(self.world.events_since(&agent_id, since, limit));
            }
            Control::CheckAck {
                agent_id,
                act_id,
                proposed,
                reply,
            } => {
                let now = self.world.tick();
                let _ = reply.send(self.acks.check_or_remember(now, agent_id, act_id, proposed));
            }
        }
        self.publish();
    }

    async fn admin_reset(&mut self, reply: oneshot::Sender<Result<ResetReport, PersistenceError>>) {
        let tick = self.world.tick();
        let season = self.world.season_index(tick);
        let before = self.world.admin_reset();
        self.publish();
        let report = ResetReport {
            world_id: self.world.world_id().to_string(),
            tick,
            reset_total: self.world.reset_total(),
            archive: None,
        };
        match &self.sinks {
            Some(sinks) => {
                let job = SnapshotJob::Reset {
                    before: Box::new(before),
                    after: Box::new(self.world.export_snapshot()),
                    season,
                    report,
                    reply,
                };
                if let Err(mpsc::error::SendError(job)) = sinks.snapshots.send(job).await {
                    if let SnapshotJob::Reset { reply, .. } = job {
                        let _ = reply.send(Err(PersistenceError::Corrupt(
                            "snapshot worker gone".to_string(),
                        )));
                    }
                }
            }
            None => {
                let _ = reply.send(Ok(report));
            }
        }
    }

    fn publish(&self) {
        self.status
            .send_replace(WorldStatus::of(&self.world, self.dropped_snapshots));
    }

    /// Applies ACTs that were already accepted before exiting.
    async fn drain(&mut self, inbox: &mut mpsc::Receiver<ActionEnvelope>) {
        inbox.close();
        let deadline = Instant::now() + DRAIN_CEILING;
        while Instant::now() < deadline {
            match inbox.try_recv() {
                Ok(envelope) => self.pending.push_back(envelope),
                Err(_) => break,
            }
        }
        while !self.pending.is_empty() {
            self.step().await;
        }
    }

    async fn finish(mut self) {
        for link in self.links.values() {
            link.outbound.close();
        }
        let world_id = self.world.world_id().to_string();
        if let Some(sinks) = self.sinks.take() {
            if sinks
                .snapshots
                .send(SnapshotJob::Write(Box::new(self.world.export_snapshot())))
                .await
                .is_err()
            {
                tracing::warn!(world_id = %world_id, "final snapshot not written");
            }
            sinks.join().await;
        }
        tracing::info!(world_id = %world_id, tick = self.world.tick(), "world runtime stopped");
    }
}

// ---------------------------------------------------------------------------
// Durable sinks
// ---------------------------------------------------------------------------

struct LogJob {
    log: TickLogEntry,
    audits: Vec<AuditEntry>,
}

enum SnapshotJob {
    Write(Box<SnapshotV1>),
    Reset {
        before: Box<SnapshotV1>,
        after: Box<SnapshotV1>,
        season: u64,
        report: ResetReport,
        reply: oneshot::Sender<Result<ResetReport, PersistenceError>>,
    },
}

struct Sinks {
    logs: mpsc::UnboundedSender<LogJob>,
    snapshots: mpsc::Sender<SnapshotJob>,
    index_stats: Option<Arc<IndexStats>>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl Sinks {
    fn start(
        world_id: &str,
        world_dir: &Path,
        catalogs: &Catalogs,
        opts: &RuntimeOptions,
    ) -> Result<Self, ManagerError> {
        std::fs::create_dir_all(world_dir)?;
        let index = match &opts.index {
            IndexBackend::Sqlite => Some(IndexWriter::sqlite(
                world_id,
                &world_dir.join("index").join("world.sqlite"),
            )?),
            IndexBackend::Remote { ingest_url, token } => {
                Some(IndexWriter::remote(world_id, ingest_url, token)?)
            }
            IndexBackend::Disabled => None,
        }
        .map(Arc::new);
        let index_stats = index.as_ref().map(|w| w.stats());
        if let Some(index) = &index {
            for msg in catalogs.messages(contracts::PROTOCOL_VERSION_1_1) {
                index.enqueue(IndexRecord::Catalog {
                    name: msg.name,
                    digest: msg.digest,
                    data: msg.data,
                });
            }
        }

        let (logs, log_rx) = mpsc::unbounded_channel();
        let log_worker = LogWorker {
            world_id: world_id.to_string(),
            events: segment_writer(JsonlZstdWriter::tick_log(world_dir), &opts.mirror),
            audit: segment_writer(JsonlZstdWriter::audit_log(world_dir), &opts.mirror),
            index: index.clone(),
            sequencer: AuditSequencer::default(),
            failures: 0,
        };
        let (snapshots, snapshot_rx) = mpsc::channel(SNAPSHOT_QUEUE_CAPACITY);
        let snapshot_worker = SnapshotWorker {
            world_id: world_id.to_string(),
            snapshot_dir: world_dir.join("snapshots"),
            archiver: SeasonArchiver::new(world_dir),
            index,
            mirror: opts.mirror.clone(),
        };

        let threads = vec![
            std::thread::Builder::new()
                .name(format!("log-{world_id}"))
                .spawn(move || log_worker.run(log_rx))?,
            std::thread::Builder::new()
                .name(format!("snapshot-{world_id}"))
                .spawn(move || snapshot_worker.run(snapshot_rx))?,
        ];
        Ok(Self {
            logs,
            snapshots,
            index_stats,
            threads,
        })
    }

    /// Closes both queues and waits for the workers to flush.
    async fn join(self) {
        let Self {
            logs,
            snapshots,
            threads,
            ..
        } = self;
        drop(logs);
        drop(snapshots);
        let joined = tokio::task::spawn_blocking(move || {
            threads.into_iter().all(|thread| thread.join().is_ok())
        })
        .await;
        if !matches!(joined, Ok(true)) {
            tracing::warn!("durable writer thread panicked");
        }
    }
}

fn segment_writer(writer: JsonlZstdWriter, mirror: &Option<Arc<Mirror>>) -> JsonlZstdWriter {
    match mirror {
        Some(mirror) => {
            let mirror = Arc::clone(mirror);
            let hook: SegmentClosed = Box::new(move |path: &Path| mirror.enqueue(path));
            writer.with_on_close(hook)
        }
        None => writer,
    }
}

struct LogWorker {
    world_id: String,
    events: JsonlZstdWriter,
    audit: JsonlZstdWriter,
    index: Option<Arc<IndexWriter>>,
    sequencer: AuditSequencer,
    failures: u64,
}

impl LogWorker {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<LogJob>) {
        while let Some(job) = rx.blocking_recv() {
            // Audits of tick T land before the tick entry of T.
            for entry in job.audits {
                let written = self.audit.write(&entry);
                self.note(written, "audit");
                if let Some(index) = &self.index {
                    let seq = self.sequencer.next(entry.tick);
                    index.enqueue(IndexRecord::Audit { seq, entry });
                }
            }
            let written = self.events.write(&job.log);
            self.note(written, "tick");
            if let Some(index) = &self.index {
                index.enqueue(IndexRecord::Tick(job.log));
            }
        }
        let closed = self.events.close();
        self.note(closed, "tick");
        let closed = self.audit.close();
        self.note(closed, "audit");
    }

    fn note(&mut self, result: Result<(), PersistenceError>, stream: &'static str) {
        if let Err(err) = result {
            self.failures += 1;
            if self.failures == 1 || self.failures % 100 == 0 {
                tracing::warn!(
                    world_id = %self.world_id,
                    stream,
                    failures = self.failures,
                    error = %err,
                    "log write failed"
                );
            }
        }
    }
}

struct SnapshotWorker {
    world_id: String,
    snapshot_dir: PathBuf,
    archiver: SeasonArchiver,
    index: Option<Arc<IndexWriter>>,
    mirror: Option<Arc<Mirror>>,
}

impl SnapshotWorker {
    fn run(self, mut rx: mpsc::Receiver<SnapshotJob>) {
        while let Some(job) = rx.blocking_recv() {
            match job {
                SnapshotJob::Write(snap) => {
                    if let Err(err) = self.persist(&snap) {
                        tracing::warn!(
                            world_id = %self.world_id,
                            tick = snap.tick(),
                            error = %err,
                            "snapshot write failed"
                        );
                    }
                }
                SnapshotJob::Reset {
                    before,
                    after,
                    season,
                    report,
                    reply,
                } => {
                    let _ = reply.send(self.reset(&before, &after, season, report));
                }
            }
        }
    }

    fn persist(&self, snap: &SnapshotV1) -> Result<PathBuf, PersistenceError> {
        let path = write_snapshot(&self.snapshot_dir, snap)?;
        self.index_snapshot(snap, &path);
        self.mirror(&path);
        if let Some(record) = self.archiver.archive_if_season_end(snap, &path)? {
            tracing::info!(world_id = %self.world_id, season = record.season, tick = snap.tick(), "season archived");
            self.mirror_archive(&self.archiver.season_dir(record.season), &path);
            if let Some(index) = &self.index {
                index.enqueue(IndexRecord::Season(record));
            }
        }
        Ok(path)
    }

    fn reset(
        &self,
        before: &SnapshotV1,
        after: &SnapshotV1,
        season: u64,
        mut report: ResetReport,
    ) -> Result<ResetReport, PersistenceError> {
        let path = write_snapshot(&self.snapshot_dir, before)?;
        let record = self.archiver.archive_reset(season, before, &path)?;
        self.mirror_archive(&self.archiver.reset_dir(before.tick()), &path);
        if let Some(index) = &self.index {
            index.enqueue(IndexRecord::Season(record.clone()));
        }
        // The post-reset state replaces the snapshot of the same tick.
        self.persist(after)?;
        report.archive = Some(record);
        Ok(report)
    }

    fn index_snapshot(&self, snap: &SnapshotV1, path: &Path) {
        if let Some(index) = &self.index {
            index.enqueue(IndexRecord::Snapshot(SnapshotRow::new(snap, path)));
            index.enqueue(IndexRecord::SnapshotState(Box::new(SnapshotStateRow::new(snap))));
        }
    }

    fn mirror(&self, path: &Path) {
        if let Some(mirror) = &self.mirror {
            mirror.enqueue(path);
        }
    }

    fn mirror_archive(&self, dir: &Path, snapshot_path: &Path) {
        if let Some(name) = snapshot_path.file_name() {
            self.mirror(&dir.join(name));
        }
        self.mirror(&dir.join("meta.json"));
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use contracts::{PROTOCOL_VERSION_1_0, PROTOCOL_VERSION_1_1};
    use serde_json::Value;

    use super::*;
    use crate::config::MultiWorldConfig;
    use crate::outbound::Frame;

    fn world_config(id: &str) -> WorldConfig {
        let directory = MultiWorldConfig::default();
        let mut cfg = directory
            .world(id)
            .expect("world")
            .to_world_config(&WorldConfig::default());
        cfg.tick_rate_hz = 50;
        cfg
    }

    fn link(session_id: &str, version: &str) -> SessionLink {
        SessionLink {
            session_id: session_id.to_string(),
            protocol_version: version.to_string(),
            delta_voxels: false,
            outbound: Outbound::new(8),
        }
    }

    fn join_req(name: &str, token: &str) -> JoinRequest {
        JoinRequest {
            name: name.to_string(),
            delta_voxels: false,
            resume_token: None,
            new_token: token.to_string(),
            agent_id: None,
        }
    }

    async fn next_frame(out: &Outbound) -> Frame {
        timeout(Duration::from_secs(5), out.recv())
            .await
            .expect("frame in time")
            .expect("open queue")
    }

    #[tokio::test]
    async fn attached_agent_receives_obs_in_its_version() {
        let runtime = WorldRuntime::start(world_config("OVERWORLD"), RuntimeOptions::default())
            .expect("start");
        let session = link("sess_a", PROTOCOL_VERSION_1_0);
        let outcome = runtime
            .handle()
            .join(join_req("alice", "tok_a"), session.clone())
            .await
            .expect("join");
        assert_eq!(outcome.agent_id, "A1");

        let frame = next_frame(&session.outbound).await;
        let obs: Value = serde_json::from_str(&frame.text).expect("json");
        assert_eq!(obs["type"], "OBS");
        assert_eq!(obs["protocol_version"], PROTOCOL_VERSION_1_0);
        assert_eq!(obs["agent_id"], "A1");
        assert!(obs["tick"].as_u64().expect("tick") >= 1);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn stale_session_cannot_detach_a_resumed_agent() {
        let runtime = WorldRuntime::start(world_config("OVERWORLD"), RuntimeOptions::default())
            .expect("start");
        let handle = runtime.handle().clone();
        let first = link("sess_1", PROTOCOL_VERSION_1_1);
        handle.join(join_req("bob", "tok_1"), first.clone()).await.expect("join");

        let mut resume = join_req("bob", "tok_2");
        resume.resume_token = Some("tok_1".to_string());
        let second = link("sess_2", PROTOCOL_VERSION_1_1);
        let outcome = handle.join(resume, second.clone()).await.expect("resume");
        assert!(outcome.resumed);
        assert!(first.outbound.is_closed());

        handle.leave("A1", "sess_1").await.expect("leave");
        let frame = next_frame(&second.outbound).await;
        assert!(frame.text.contains("\"OBS\""));
        assert_eq!(handle.status().clients, 1);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn transfer_moves_agent_and_session_between_runtimes() {
        let source = WorldRuntime::start(world_config("OVERWORLD"), RuntimeOptions::default())
            .expect("source");
        let target = WorldRuntime::start(world_config("MINE_L1"), RuntimeOptions::default())
            .expect("target");
        let session = link("sess_t", PROTOCOL_VERSION_1_1);
        source
            .handle()
            .join(join_req("carol", "tok_c"), session.clone())
            .await
            .expect("join");

        let departure = source
            .handle()
            .transfer_out("A1", "MINE_L1")
            .await
            .expect("runtime")
            .expect("transfer out");
        assert!(departure.link.is_some());
        let mut transfer = departure.transfer;
        transfer.from_world_id = "OVERWORLD".to_string();
        transfer.current_world_id = "MINE_L1".to_string();
        let outcome = target
            .handle()
            .transfer_in(transfer, Some(Vec3i::new(0, 0, 0)), departure.link)
            .await
            .expect("runtime")
            .expect("transfer in");
        assert_eq!(outcome.agent_id, "A1");
        assert_eq!(source.handle().agent_pos("A1").await.expect("pos"), None);
        assert!(target.handle().agent_pos("A1").await.expect("pos").is_some());

        let (events, _) = target
            .handle()
            .events_since("A1", 0, 100)
            .await
            .expect("runtime")
            .expect("agent");
        assert!(events
            .iter()
            .any(|(_, ev)| ev.get("type").and_then(Value::as_str) == Some("WORLD_SWITCH")));

        // Drain whatever the source queued, then OBS must come from the target.
        loop {
            let frame = next_frame(&session.outbound).await;
            let obs: Value = serde_json::from_str(&frame.text).expect("json");
            if obs["world_id"] == "MINE_L1" {
                break;
            }
        }
        source.stop().await;
        target.stop().await;
    }

    fn ack(act_id: &str, tick: u64) -> AckMsg {
        AckMsg {
            msg_type: contracts::MSG_ACK.to_string(),
            protocol_version: PROTOCOL_VERSION_1_1.to_string(),
            ack_for: act_id.to_string(),
            accepted: true,
            code: String::new(),
            message: String::new(),
            server_tick: tick,
            world_id: "OVERWORLD".to_string(),
        }
    }

    #[test]
    fn remembered_acks_expire_after_their_ttl() {
        let mut acks = ActDedupe::default();
        let (first, dup) = acks.check_or_remember(10, "A1".into(), "act-1".into(), ack("act-1", 10));
        assert!(!dup);
        assert_eq!(first.server_tick, 10);

        let (again, dup) = acks.check_or_remember(20, "A1".into(), "act-1".into(), ack("act-1", 20));
        assert!(dup);
        assert_eq!(again.server_tick, 10);

        let (other, dup) = acks.check_or_remember(20, "A2".into(), "act-1".into(), ack("act-1", 20));
        assert!(!dup);
        assert_eq!(other.server_tick, 20);
        assert_eq!(acks.len(), 2);

        let later = 10 + ACT_DEDUPE_TTL_TICKS;
        let (fresh, dup) = acks.check_or_remember(later, "A1".into(), "act-1".into(), ack("act-1", later));
        assert!(!dup);
        assert_eq!(fresh.server_tick, later);
        assert_eq!(acks.len(), 2);
    }

    #[tokio::test]
    async fn world_remembers_the_first_ack_for_an_act() {
        let runtime = WorldRuntime::start(world_config("OVERWORLD"), RuntimeOptions::default())
            .expect("start");
        let handle = runtime.handle();
        let (first, dup) = handle
            .check_or_remember_ack("A1", ack("act-7", 3))
            .await
            .expect("runtime");
        assert!(!dup);
        let (second, dup) = handle
            .check_or_remember_ack("A1", ack("act-7", 9))
            .await
            .expect("runtime");
        assert!(dup);
        assert_eq!(second, first);

        let (blank, dup) = handle
            .check_or_remember_ack("A1", ack("", 9))
            .await
            .expect("runtime");
        assert!(!dup);
        assert_eq!(blank.server_tick, 9);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn flooded_inbox_does_not_stall_ticks() {
        let runtime = WorldRuntime::start(world_config("OVERWORLD"), RuntimeOptions::default())
            .expect("start");
        let handle = runtime.handle().clone();
        let flooders: Vec<_> = (0..8)
            .map(|n| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    loop {
                        let envelope = ActionEnvelope {
                            agent_id: format!("A{}", 900 + n),
                            act: contracts::ActMsg::default(),
                        };
                        if handle.submit(envelope).await.is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let start = handle.tick();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(handle.tick() >= start + 5, "ticks stalled at {}", handle.tick());

        for flooder in flooders {
            flooder.abort();
        }
        runtime.stop().await;
    }

    #[tokio::test]
    async fn unknown_agents_are_reported() {
        let runtime = WorldRuntime::start(world_config("CITY_HUB"), RuntimeOptions::default())
            .expect("start");
        let handle = runtime.handle();
        assert!(!handle.inject_event("A9", Event::new()).await.expect("runtime"));
        assert!(handle.events_since("A9", 0, 10).await.expect("runtime").is_none());
        let err = handle.transfer_out("A9", "OVERWORLD").await.expect("runtime");
        assert!(matches!(err, Err(TransferError::AgentNotFound(_))));
        runtime.stop().await;
    }

    #[tokio::test]
    async fn stopped_world_writes_logs_and_restores_from_its_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let world_dir = dir.path().join("worlds").join("OVERWORLD");
        let opts = RuntimeOptions {
            world_dir: Some(world_dir.clone()),
            index: IndexBackend::Sqlite,
            mirror: None,
            load_latest_snapshot: true,
        };
        let runtime = WorldRuntime::start(world_config("OVERWORLD"), opts.clone()).expect("start");
        let session = link("sess_p", PROTOCOL_VERSION_1_1);
        runtime
            .handle()
            .join(join_req("dora", "tok_d"), session.clone())
            .await
            .expect("join");
        next_frame(&session.outbound).await;
        next_frame(&session.outbound).await;
        runtime.stop().await;

        let snapshots = fs::read_dir(world_dir.join("snapshots")).expect("snapshots").count();
        assert!(snapshots >= 1);
        let segments = fs::read_dir(world_dir.join("events")).expect("events").count();
        assert!(segments >= 1);
        assert!(world_dir.join("index").join("world.sqlite").exists());

        let restored = WorldRuntime::start(world_config("OVERWORLD"), opts).expect("restart");
        assert!(restored.handle().tick() >= 2);
        assert_eq!(restored.handle().status().agents, 1);
        restored.stop().await;
    }

    #[tokio::test]
    async fn admin_reset_archives_the_previous_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let world_dir = dir.path().join("worlds").join("MINE_L1");
        let opts = RuntimeOptions {
            world_dir: Some(world_dir.clone()),
            index: IndexBackend::Disabled,
            mirror: None,
            load_latest_snapshot: false,
        };
        let runtime = WorldRuntime::start(world_config("MINE_L1"), opts).expect("start");
        let report = runtime
            .handle()
            .admin_reset()
            .await
            .expect("runtime")
            .expect("reset");
        assert_eq!(report.world_id, "MINE_L1");
        assert_eq!(report.reset_total, 1);
        let archive = report.archive.expect("archive");
        assert_eq!(archive.reason, "ADMIN_RESET");
        let reset_dir = world_dir.join("archives").join(format!("reset_{}", report.tick));
        assert!(reset_dir.join("meta.json").exists());
        assert_eq!(runtime.handle().status().reset_total, 1);
        runtime.stop().await;
    }
}
