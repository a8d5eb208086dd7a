//! Queryable index of the durable logs. Producers never block: records go
//! through a bounded queue to a worker thread that writes them in batches, and
//! a full queue drops the record and counts it. The JSONL logs and snapshot
//! files stay the source of truth.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use kernel_core::{AuditEntry, SnapshotV1, TickLogEntry};
use rusqlite::{params, Connection, Transaction};
use serde::Serialize;
use serde_json::{json, Value};

use crate::persistence::{PersistenceError, SeasonRecord};

pub const SQLITE_QUEUE_CAPACITY: usize = 262_144;
pub const REMOTE_QUEUE_CAPACITY: usize = 32_768;
const REMOTE_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const REMOTE_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRow {
    pub tick: u64,
    pub path: String,
    pub seed: i64,
    pub height: i32,
    pub chunks: usize,
    pub agents: usize,
    pub claims: usize,
    pub containers: usize,
    pub contracts: usize,
    pub laws: usize,
    pub orgs: usize,
}

impl SnapshotRow {
    pub fn new(snap: &SnapshotV1, path: &Path) -> Self {
        Self {
            tick: snap.tick(),
            path: path.display().to_string(),
            seed: snap.config.seed,
            height: snap.config.height,
            chunks: snap.chunks.len(),
            agents: snap.agents.len(),
            claims: snap.claims.len(),
            containers: snap.containers.len(),
            contracts: snap.contracts.len(),
            laws: snap.laws.len(),
            orgs: snap.orgs.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRow {
    pub agent_id: String,
    pub name: String,
    pub org_id: String,
    pub x: i32,
    pub z: i32,
    pub hp: i32,
    pub hunger: i32,
    pub stamina_milli: i32,
    pub rep_trade: i32,
    pub rep_build: i32,
    pub rep_social: i32,
    pub rep_law: i32,
    pub inventory: BTreeMap<String, i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrgRow {
    pub org_id: String,
    pub kind: String,
    pub name: String,
    pub meta_version: u64,
    pub members: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimRow {
    pub land_id: String,
    pub owner: String,
    pub claim_type: String,
    pub x: i32,
    pub z: i32,
    pub radius: i32,
}

/// Queryable slice of a snapshot: world header plus per-agent, per-org and
/// per-claim rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotStateRow {
    pub tick: u64,
    pub world_id: String,
    pub weather: String,
    pub weather_until_tick: u64,
    pub active_event_id: String,
    pub reset_total: u64,
    pub agents: Vec<AgentRow>,
    pub orgs: Vec<OrgRow>,
    pub claims: Vec<ClaimRow>,
}

impl SnapshotStateRow {
    pub fn new(snap: &SnapshotV1) -> Self {
        Self {
            tick: snap.tick(),
            world_id: snap.world_id().to_string(),
            weather: snap.weather.as_str().to_string(),
            weather_until_tick: snap.weather_until_tick,
            active_event_id: snap.active_event_id().unwrap_or_default().to_string(),
            reset_total: snap.reset_total,
            agents: snap
                .agents
                .iter()
                .map(|a| AgentRow {
                    agent_id: a.id.clone(),
                    name: a.name.clone(),
                    org_id: a.org_id.clone(),
                    x: a.pos.x,
                    z: a.pos.z,
                    hp: a.hp,
                    hunger: a.hunger,
                    stamina_milli: a.stamina_milli,
                    rep_trade: a.rep_trade,
                    rep_build: a.rep_build,
                    rep_social: a.rep_social,
                    rep_law: a.rep_law,
                    inventory: a.inventory.clone(),
                })
                .collect(),
            orgs: snap
                .orgs
                .iter()
                .map(|o| OrgRow {
                    org_id: o.org_id.clone(),
                    kind: o.kind.clone(),
                    name: o.name.clone(),
                    meta_version: o.meta_version,
                    members: o.members.clone(),
                })
                .collect(),
            claims: snap
                .claims
                .iter()
                .map(|c| ClaimRow {
                    land_id: c.land_id.clone(),
                    owner: c.owner.clone(),
                    claim_type: c.claim_type.clone(),
                    x: c.anchor.x,
                    z: c.anchor.z,
                    radius: c.radius,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexRecord {
    Tick(TickLogEntry),
    /// `seq` numbers audits within their tick, starting at 0.
    Audit { seq: u32, entry: AuditEntry },
    Snapshot(SnapshotRow),
    SnapshotState(Box<SnapshotStateRow>),
    Season(SeasonRecord),
    Catalog { name: String, digest: String, data: Value },
}

impl IndexRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Tick(_) => RecordKind::Tick,
            Self::Audit { .. } => RecordKind::Audit,
            Self::Snapshot(_) => RecordKind::Snapshot,
            Self::SnapshotState(_) => RecordKind::SnapshotState,
            Self::Season(_) => RecordKind::Season,
            Self::Catalog { .. } => RecordKind::Catalog,
        }
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Tick(entry) => serde_json::to_value(entry),
            Self::Audit { seq, entry } => Ok(json!({
                "tick": entry.tick,
                "seq": seq,
                "actor": entry.actor,
                "action": entry.action,
                "pos": entry.pos,
                "from": entry.from,
                "to": entry.to,
                "reason": entry.reason,
                "raw": entry,
            })),
            Self::Snapshot(row) => serde_json::to_value(row),
            Self::SnapshotState(row) => serde_json::to_value(row),
            Self::Season(record) => Ok(json!({
                "season": record.season,
                "end_tick": record.end_tick,
                "path": record.snapshot,
                "seed": record.seed,
                "recorded_at": record.created_at,
            })),
            Self::Catalog { name, digest, data } => Ok(json!({
                "name": name,
                "digest": digest,
                "json": data.to_string(),
                "updated_at": now_rfc3339(),
            })),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordKind {
    Tick,
    Audit,
    Snapshot,
    SnapshotState,
    Season,
    Catalog,
}

impl RecordKind {
    pub const ALL: [RecordKind; 6] = [
        Self::Tick,
        Self::Audit,
        Self::Snapshot,
        Self::SnapshotState,
        Self::Season,
        Self::Catalog,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::Audit => "audit",
            Self::Snapshot => "snapshot",
            Self::SnapshotState => "snapshot_state",
            Self::Season => "season",
            Self::Catalog => "catalog",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Assigns per-tick audit sequence numbers on the producer side.
#[derive(Debug, Default)]
pub struct AuditSequencer {
    tick: Option<u64>,
    next: u32,
}

impl AuditSequencer {
    pub fn next(&mut self, tick: u64) -> u32 {
        if self.tick != Some(tick) {
            self.tick = Some(tick);
            self.next = 0;
        }
        let seq = self.next;
        self.next += 1;
        seq
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct IndexStats {
    enqueued: AtomicU64,
    dropped: [AtomicU64; 6],
    flushed: AtomicU64,
    flush_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStatsView {
    pub enqueued: u64,
    pub dropped_total: u64,
    pub dropped: BTreeMap<&'static str, u64>,
    pub flushed_batches: u64,
    pub flush_failures: u64,
}

impl IndexStats {
    pub fn dropped(&self, kind: RecordKind) -> u64 {
        self.dropped[kind.slot()].load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        RecordKind::ALL.iter().map(|k| self.dropped(*k)).sum()
    }

    pub fn view(&self) -> IndexStatsView {
        IndexStatsView {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped_total: self.dropped_total(),
            dropped: RecordKind::ALL
                .iter()
                .map(|k| (k.as_str(), self.dropped(*k)))
                .collect(),
            flushed_batches: self.flushed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Destination of record batches; runs on the index worker thread.
pub trait IndexSink: Send + 'static {
    fn write_batch(&mut self, batch: &[IndexRecord]) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_ops: usize,
    pub max_wait: Duration,
}

impl BatchPolicy {
    pub const SQLITE: Self = Self {
        max_ops: 2000,
        max_wait: Duration::from_secs(2),
    };
    pub const REMOTE: Self = Self {
        max_ops: 128,
        max_wait: Duration::from_millis(500),
    };
}

#[derive(Debug)]
pub struct IndexWriter {
    world_id: String,
    tx: Option<SyncSender<IndexRecord>>,
    stats: Arc<IndexStats>,
    worker: Option<JoinHandle<()>>,
}

impl IndexWriter {
    pub fn spawn<S: IndexSink>(
        world_id: &str,
        sink: S,
        capacity: usize,
        policy: BatchPolicy,
    ) -> Result<Self, PersistenceError> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let stats = Arc::new(IndexStats::default());
        let worker_stats = Arc::clone(&stats);
        let name = world_id.to_string();
        let worker = std::thread::Builder::new()
            .name(format!("index-{world_id}"))
            .spawn(move || run_batches(&name, rx, sink, policy, &worker_stats))?;
        Ok(Self {
            world_id: world_id.to_string(),
            tx: Some(tx),
            stats,
            worker: Some(worker),
        })
    }

    /// SQLite index at `path` (schema created on open).
    pub fn sqlite(world_id: &str, path: &Path) -> Result<Self, PersistenceError> {
        let sink = SqliteIndex::open(world_id, path)?;
        Self::spawn(world_id, sink, SQLITE_QUEUE_CAPACITY, BatchPolicy::SQLITE)
    }

    pub fn remote(world_id: &str, ingest_url: &str, token: &str) -> Result<Self, PersistenceError> {
        let sink = RemoteIngest::new(world_id, ingest_url, token);
        Self::spawn(world_id, sink, REMOTE_QUEUE_CAPACITY, BatchPolicy::REMOTE)
    }

    pub fn stats(&self) -> Arc<IndexStats> {
        Arc::clone(&self.stats)
    }

    /// Never blocks. Returns false when the record was dropped.
    pub fn enqueue(&self, record: IndexRecord) -> bool {
        let kind = record.kind();
        let outcome = match self.tx.as_ref() {
            Some(tx) => tx.try_send(record),
            None => Err(TrySendError::Disconnected(record)),
        };
        match outcome {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                let dropped = self.stats.dropped[kind.slot()].fetch_add(1, Ordering::Relaxed) + 1;
                let total = self.stats.dropped_total();
                if total == 1 || total % 100 == 0 {
                    tracing::warn!(
                        world_id = %self.world_id,
                        kind = kind.as_str(),
                        dropped,
                        total,
                        "index queue full, record dropped"
                    );
                }
                false
            }
        }
    }

    /// Flushes what is queued and stops the worker.
    pub fn close(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(world_id = %self.world_id, "index worker panicked");
            }
        }
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_batches<S: IndexSink>(
    world_id: &str,
    rx: Receiver<IndexRecord>,
    mut sink: S,
    policy: BatchPolicy,
    stats: &IndexStats,
) {
    let mut flush = |batch: &mut Vec<IndexRecord>| {
        if batch.is_empty() {
            return;
        }
        match sink.write_batch(batch) {
            Ok(()) => {
                stats.flushed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(world_id, records = batch.len(), error = %err, "index batch failed");
            }
        }
        batch.clear();
    };

    let mut batch = Vec::with_capacity(policy.max_ops);
    while let Ok(first) = rx.recv() {
        batch.push(first);
        let deadline = Instant::now() + policy.max_wait;
        while batch.len() < policy.max_ops {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(record) => batch.push(record),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    flush(&mut batch);
                    return;
                }
            }
        }
        flush(&mut batch);
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SqliteIndex {
    conn: Connection,
}

impl SqliteIndex {
    pub fn open(world_id: &str, path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mut index = Self { conn };
        index.configure()?;
        index.migrate()?;
        index.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('world_id', ?1)",
            params![world_id],
        )?;
        Ok(index)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn configure(&mut self) -> Result<(), PersistenceError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.pragma_update(None, "busy_timeout", 5000)?;
        self.conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS catalogs (
                name TEXT PRIMARY KEY,
                digest TEXT NOT NULL,
                json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ticks (
                tick INTEGER PRIMARY KEY,
                digest TEXT NOT NULL,
                joins INTEGER NOT NULL,
                leaves INTEGER NOT NULL,
                actions INTEGER NOT NULL,
                raw_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS joins (
                tick INTEGER NOT NULL,
                agent_id TEXT NOT NULL,
                name TEXT NOT NULL,
                PRIMARY KEY (tick, agent_id)
            );

            CREATE TABLE IF NOT EXISTS leaves (
                tick INTEGER NOT NULL,
                agent_id TEXT NOT NULL,
                PRIMARY KEY (tick, agent_id)
            );

            CREATE TABLE IF NOT EXISTS actions (
                tick INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                agent_id TEXT NOT NULL,
                act_json TEXT NOT NULL,
                PRIMARY KEY (tick, seq)
            );

            CREATE TABLE IF NOT EXISTS audits (
                tick INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                x INTEGER NOT NULL,
                y INTEGER NOT NULL,
                z INTEGER NOT NULL,
                from_block INTEGER NOT NULL,
                to_block INTEGER NOT NULL,
                reason TEXT NOT NULL,
                raw_json TEXT NOT NULL,
                PRIMARY KEY (tick, seq)
            );

            CREATE TABLE IF NOT EXISTS snapshots (
                tick INTEGER PRIMARY KEY,
                path TEXT NOT NULL,
                seed INTEGER NOT NULL,
                height INTEGER NOT NULL,
                chunks INTEGER NOT NULL,
                agents INTEGER NOT NULL,
                claims INTEGER NOT NULL,
                containers INTEGER NOT NULL,
                contracts INTEGER NOT NULL,
                laws INTEGER NOT NULL,
                orgs INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshot_world (
                tick INTEGER PRIMARY KEY,
                world_id TEXT NOT NULL,
                weather TEXT NOT NULL,
                weather_until_tick INTEGER NOT NULL,
                active_event_id TEXT NOT NULL,
                reset_total INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshot_agents (
                tick INTEGER NOT NULL,
                agent_id TEXT NOT NULL,
                name TEXT NOT NULL,
                org_id TEXT NOT NULL,
                x INTEGER NOT NULL,
                z INTEGER NOT NULL,
                hp INTEGER NOT NULL,
                hunger INTEGER NOT NULL,
                stamina_milli INTEGER NOT NULL,
                rep_trade INTEGER NOT NULL,
                rep_build INTEGER NOT NULL,
                rep_social INTEGER NOT NULL,
                rep_law INTEGER NOT NULL,
                inventory_json TEXT NOT NULL,
                PRIMARY KEY (tick, agent_id)
            );

            CREATE TABLE IF NOT EXISTS snapshot_orgs (
                tick INTEGER NOT NULL,
                org_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                meta_version INTEGER NOT NULL,
                members_json TEXT NOT NULL,
                PRIMARY KEY (tick, org_id)
            );

            CREATE TABLE IF NOT EXISTS snapshot_claims (
                tick INTEGER NOT NULL,
                land_id TEXT NOT NULL,
                owner TEXT NOT NULL,
                claim_type TEXT NOT NULL,
                x INTEGER NOT NULL,
                z INTEGER NOT NULL,
                radius INTEGER NOT NULL,
                PRIMARY KEY (tick, land_id)
            );

            CREATE TABLE IF NOT EXISTS seasons (
                season INTEGER PRIMARY KEY,
                end_tick INTEGER NOT NULL,
                seed INTEGER NOT NULL,
                snapshot_path TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audits_actor_tick ON audits(actor, tick);
            CREATE INDEX IF NOT EXISTS idx_actions_agent_tick ON actions(agent_id, tick);
            CREATE INDEX IF NOT EXISTS idx_snapshot_agents_agent ON snapshot_agents(agent_id, tick);
            ",
        )?;
        Ok(())
    }
}

impl IndexSink for SqliteIndex {
    fn write_batch(&mut self, batch: &[IndexRecord]) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;
        for record in batch {
            insert_record(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn insert_record(tx: &Transaction<'_>, record: &IndexRecord) -> Result<(), PersistenceError> {
    match record {
        IndexRecord::Tick(entry) => insert_tick(tx, entry),
        IndexRecord::Audit { seq, entry } => {
            tx.execute(
                "INSERT OR REPLACE INTO audits (
                    tick, seq, actor, action, x, y, z, from_block, to_block, reason, raw_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    sql_u64(entry.tick),
                    seq,
                    entry.actor,
                    entry.action,
                    entry.pos[0],
                    entry.pos[1],
                    entry.pos[2],
                    entry.from,
                    entry.to,
                    entry.reason,
                    serde_json::to_string(entry)?,
                ],
            )?;
            Ok(())
        }
        IndexRecord::Snapshot(row) => {
            tx.execute(
                "INSERT OR REPLACE INTO snapshots (
                    tick, path, seed, height, chunks, agents, claims, containers, contracts, laws, orgs
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    sql_u64(row.tick),
                    row.path,
                    row.seed,
                    row.height,
                    sql_usize(row.chunks),
                    sql_usize(row.agents),
                    sql_usize(row.claims),
                    sql_usize(row.containers),
                    sql_usize(row.contracts),
                    sql_usize(row.laws),
                    sql_usize(row.orgs),
                ],
            )?;
            Ok(())
        }
        IndexRecord::SnapshotState(row) => insert_snapshot_state(tx, row),
        IndexRecord::Season(record) => {
            tx.execute(
                "INSERT OR REPLACE INTO seasons (season, end_tick, seed, snapshot_path, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    sql_u64(record.season),
                    sql_u64(record.end_tick),
                    record.seed,
                    record.snapshot,
                    record.created_at,
                ],
            )?;
            Ok(())
        }
        IndexRecord::Catalog { name, digest, data } => {
            tx.execute(
                "INSERT OR REPLACE INTO catalogs (name, digest, json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, digest, data.to_string(), now_rfc3339()],
            )?;
            Ok(())
        }
    }
}

fn insert_tick(tx: &Transaction<'_>, entry: &TickLogEntry) -> Result<(), PersistenceError> {
    let tick = sql_u64(entry.tick);
    tx.execute(
        "INSERT OR REPLACE INTO ticks (tick, digest, joins, leaves, actions, raw_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            tick,
            entry.digest,
            sql_usize(entry.joins.len()),
            sql_usize(entry.leaves.len()),
            sql_usize(entry.actions.len()),
            serde_json::to_string(entry)?,
        ],
    )?;
    for join in &entry.joins {
        tx.execute(
            "INSERT OR REPLACE INTO joins (tick, agent_id, name) VALUES (?1, ?2, ?3)",
            params![tick, join.agent_id, join.name],
        )?;
    }
    for agent_id in &entry.leaves {
        tx.execute(
            "INSERT OR REPLACE INTO leaves (tick, agent_id) VALUES (?1, ?2)",
            params![tick, agent_id],
        )?;
    }
    for (seq, action) in entry.actions.iter().enumerate() {
        tx.execute(
            "INSERT OR REPLACE INTO actions (tick, seq, agent_id, act_json) VALUES (?1, ?2, ?3, ?4)",
            params![
                tick,
                sql_usize(seq),
                action.agent_id,
                serde_json::to_string(&action.act)?,
            ],
        )?;
    }
    Ok(())
}

fn insert_snapshot_state(
    tx: &Transaction<'_>,
    row: &SnapshotStateRow,
) -> Result<(), PersistenceError> {
    let tick = sql_u64(row.tick);
    tx.execute(
        "INSERT OR REPLACE INTO snapshot_world (
            tick, world_id, weather, weather_until_tick, active_event_id, reset_total
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            tick,
            row.world_id,
            row.weather,
            sql_u64(row.weather_until_tick),
            row.active_event_id,
            sql_u64(row.reset_total),
        ],
    )?;
    for agent in &row.agents {
        tx.execute(
            "INSERT OR REPLACE INTO snapshot_agents (
                tick, agent_id, name, org_id, x, z, hp, hunger, stamina_milli,
                rep_trade, rep_build, rep_social, rep_law, inventory_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                tick,
                agent.agent_id,
                agent.name,
                agent.org_id,
                agent.x,
                agent.z,
                agent.hp,
                agent.hunger,
                agent.stamina_milli,
                agent.rep_trade,
                agent.rep_build,
                agent.rep_social,
                agent.rep_law,
                serde_json::to_string(&agent.inventory)?,
            ],
        )?;
    }
    for org in &row.orgs {
        tx.execute(
            "INSERT OR REPLACE INTO snapshot_orgs (tick, org_id, kind, name, meta_version, members_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tick,
                org.org_id,
                org.kind,
                org.name,
                sql_u64(org.meta_version),
                serde_json::to_string(&org.members)?,
            ],
        )?;
    }
    for claim in &row.claims {
        tx.execute(
            "INSERT OR REPLACE INTO snapshot_claims (tick, land_id, owner, claim_type, x, z, radius)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                tick,
                claim.land_id,
                claim.owner,
                claim.claim_type,
                claim.x,
                claim.z,
                claim.radius,
            ],
        )?;
    }
    Ok(())
}

fn sql_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn sql_usize(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ---------------------------------------------------------------------------
// Remote ingest
// ---------------------------------------------------------------------------

/// Posts batches as `{"events":[{kind, world_id, payload}]}` to an ingest
/// endpoint. A batch that fails every attempt is dropped. The blocking client
/// is built on first use so it lives entirely on the worker thread.
pub struct RemoteIngest {
    world_id: String,
    url: String,
    token: String,
    client: Option<reqwest::blocking::Client>,
}

impl RemoteIngest {
    pub fn new(world_id: &str, url: &str, token: &str) -> Self {
        Self {
            world_id: world_id.to_string(),
            url: url.to_string(),
            token: token.to_string(),
            client: None,
        }
    }

    pub fn body(&self, batch: &[IndexRecord]) -> Result<Value, PersistenceError> {
        let events = batch
            .iter()
            .map(|record| {
                Ok(json!({
                    "kind": record.kind().as_str(),
                    "world_id": self.world_id,
                    "payload": record.payload()?,
                }))
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        Ok(json!({ "events": events }))
    }

    fn client(&mut self) -> Result<reqwest::blocking::Client, PersistenceError> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(REMOTE_HTTP_TIMEOUT)
            .build()
            .map_err(|err| PersistenceError::Http(err.to_string()))?;
        self.client = Some(client.clone());
        Ok(client)
    }

    fn post_once(
        &self,
        client: &reqwest::blocking::Client,
        body: &Value,
    ) -> Result<(), PersistenceError> {
        let mut request = client
            .post(&self.url)
            .header("content-type", "application/json")
            .json(body);
        if !self.token.is_empty() {
            request = request.header("x-vc-index-token", &self.token);
        }
        let response = request
            .send()
            .map_err(|err| PersistenceError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PersistenceError::Http(format!(
                "ingest returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

impl IndexSink for RemoteIngest {
    fn write_batch(&mut self, batch: &[IndexRecord]) -> Result<(), PersistenceError> {
        let body = self.body(batch)?;
        let client = self.client()?;
        let mut last = None;
        for attempt in 0..REMOTE_ATTEMPTS {
            match self.post_once(&client, &body) {
                Ok(()) => return Ok(()),
                Err(err) => last = Some(err),
            }
            if attempt + 1 < REMOTE_ATTEMPTS {
                std::thread::sleep(Duration::from_millis(100 * (1_u64 << attempt)));
            }
        }
        Err(last.unwrap_or_else(|| PersistenceError::Http("no attempt made".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use contracts::ActMsg;
    use kernel_core::world::JoinLog;
    use kernel_core::ActionEnvelope;

    use super::*;

    fn audit(tick: u64, action: &str) -> AuditEntry {
        AuditEntry {
            tick,
            actor: "A1".to_string(),
            action: action.to_string(),
            pos: [1, 0, 2],
            from: 1,
            to: 0,
            reason: String::new(),
            details: None,
        }
    }

    fn tick_entry(tick: u64) -> TickLogEntry {
        TickLogEntry {
            tick,
            joins: vec![JoinLog {
                agent_id: "A1".to_string(),
                name: "scout".to_string(),
            }],
            leaves: Vec::new(),
            actions: vec![ActionEnvelope {
                agent_id: "A1".to_string(),
                act: ActMsg::default(),
            }],
            digest: "ab".repeat(32),
        }
    }

    struct Recording(Arc<Mutex<Vec<usize>>>);

    impl IndexSink for Recording {
        fn write_batch(&mut self, batch: &[IndexRecord]) -> Result<(), PersistenceError> {
            self.0.lock().expect("lock").push(batch.len());
            Ok(())
        }
    }

    #[test]
    fn audit_sequence_restarts_each_tick() {
        let mut seq = AuditSequencer::default();
        assert_eq!(seq.next(4), 0);
        assert_eq!(seq.next(4), 1);
        assert_eq!(seq.next(5), 0);
        assert_eq!(seq.next(5), 1);
    }

    #[test]
    fn sqlite_batch_writes_every_record_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = SqliteIndex::open("MINE_L1", &dir.path().join("index/world.sqlite")).expect("open");
        let mut seq = AuditSequencer::default();
        let batch = vec![
            IndexRecord::Tick(tick_entry(7)),
            IndexRecord::Audit {
                seq: seq.next(7),
                entry: audit(7, "SET_BLOCK"),
            },
            IndexRecord::Audit {
                seq: seq.next(7),
                entry: audit(7, "SET_BLOCK"),
            },
            IndexRecord::Season(SeasonRecord {
                season: 1,
                end_tick: 2,
                seed: 42,
                snapshot: "archives/season_001/2.snap.zst".to_string(),
                created_at: now_rfc3339(),
                day_ticks: 10,
                season_length_ticks: 3,
                reason: String::new(),
            }),
            IndexRecord::Catalog {
                name: "recipes".to_string(),
                digest: "d".to_string(),
                data: json!([]),
            },
        ];
        index.write_batch(&batch).expect("batch");
        // Replays replace rather than duplicate.
        index.write_batch(&batch).expect("batch again");

        let conn = index.connection();
        let count = |sql: &str| -> i64 { conn.query_row(sql, [], |row| row.get(0)).expect("count") };
        assert_eq!(count("SELECT COUNT(*) FROM ticks"), 1);
        assert_eq!(count("SELECT COUNT(*) FROM joins"), 1);
        assert_eq!(count("SELECT COUNT(*) FROM actions"), 1);
        assert_eq!(count("SELECT COUNT(*) FROM audits"), 2);
        assert_eq!(count("SELECT MAX(seq) FROM audits WHERE tick = 7"), 1);
        assert_eq!(count("SELECT seed FROM seasons WHERE season = 1"), 42);
        assert_eq!(count("SELECT COUNT(*) FROM catalogs"), 1);
        let world: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'world_id'", [], |row| row.get(0))
            .expect("meta");
        assert_eq!(world, "MINE_L1");
    }

    #[test]
    fn writer_batches_and_flushes_on_close() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let policy = BatchPolicy {
            max_ops: 4,
            max_wait: Duration::from_secs(5),
        };
        let mut writer =
            IndexWriter::spawn("OVERWORLD", Recording(Arc::clone(&batches)), 64, policy).expect("spawn");
        for tick in 0..10 {
            assert!(writer.enqueue(IndexRecord::Tick(tick_entry(tick))));
        }
        writer.close();
        let sizes = batches.lock().expect("lock").clone();
        assert_eq!(sizes.iter().sum::<usize>(), 10);
        assert!(sizes.iter().all(|n| *n <= 4));
        assert_eq!(writer.stats().view().enqueued, 10);
    }

    #[test]
    fn closed_writer_counts_drops_per_kind() {
        let mut writer = IndexWriter::spawn(
            "OVERWORLD",
            Recording(Arc::new(Mutex::new(Vec::new()))),
            8,
            BatchPolicy::SQLITE,
        )
        .expect("spawn");
        writer.close();
        assert!(!writer.enqueue(IndexRecord::Tick(tick_entry(1))));
        assert!(!writer.enqueue(IndexRecord::Audit {
            seq: 0,
            entry: audit(1, "SET_BLOCK"),
        }));
        assert!(!writer.enqueue(IndexRecord::Audit {
            seq: 1,
            entry: audit(1, "SET_BLOCK"),
        }));
        let stats = writer.stats();
        assert_eq!(stats.dropped(RecordKind::Tick), 1);
        assert_eq!(stats.dropped(RecordKind::Audit), 2);
        assert_eq!(stats.view().dropped_total, 3);
        assert_eq!(stats.view().dropped.get("snapshot"), Some(&0));
    }

    #[test]
    fn remote_body_wraps_records_with_kind_and_world() {
        let ingest = RemoteIngest::new("MINE_L1", "http://127.0.0.1:9/ingest", "tok");
        let body = ingest
            .body(&[
                IndexRecord::Audit {
                    seq: 3,
                    entry: audit(9, "SET_BLOCK"),
                },
                IndexRecord::Tick(tick_entry(9)),
            ])
            .expect("body");
        let events = body["events"].as_array().expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["kind"], "audit");
        assert_eq!(events[0]["world_id"], "MINE_L1");
        assert_eq!(events[0]["payload"]["seq"], 3);
        assert_eq!(events[1]["payload"]["tick"], 9);
    }
}
