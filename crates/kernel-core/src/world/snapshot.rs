//! SnapshotV1 export/import and the per-tick state digest.
//!
//! A snapshot is the complete serializable state of one world at the end of a
//! tick. Position-keyed tables are flattened into vectors in key order so the
//! JSON form is stable. Resume tokens, session client state and the retained
//! event history are never captured.

use std::fmt;

use sha2::{Digest, Sha256};

use super::*;
use crate::chunks::ChunkKey;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    UnsupportedVersion(u32),
    WorldMismatch { expected: String, found: String },
    Config(ConfigError),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVersion(v) => write!(f, "unsupported snapshot version {v}"),
            Self::WorldMismatch { expected, found } => {
                write!(f, "snapshot belongs to world {found}, expected {expected}")
            }
            Self::Config(err) => write!(f, "snapshot config: {err}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<ConfigError> for SnapshotError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub version: u32,
    pub world_id: String,
    pub tick: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkV1 {
    pub cx: i32,
    pub cz: i32,
    pub blocks: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConveyorV1 {
    pub pos: Vec3i,
    pub dx: i8,
    pub dz: i8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchV1 {
    pub pos: Vec3i,
    pub on: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotV1 {
    pub header: SnapshotHeader,
    /// Tick rate, day length, season length, radius, height, seed, boundary and
    /// every operational parameter needed for a faithful resume.
    pub config: WorldConfig,

    pub weather: Weather,
    pub weather_until_tick: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) active_event: Option<ActiveEvent>,

    pub chunks: Vec<ChunkV1>,
    pub agents: Vec<Agent>,
    pub claims: Vec<LandClaim>,
    pub containers: Vec<Container>,
    #[serde(default)]
    pub items: Vec<ItemEntity>,
    #[serde(default)]
    pub signs: Vec<Sign>,
    #[serde(default)]
    pub conveyors: Vec<ConveyorV1>,
    #[serde(default)]
    pub switches: Vec<SwitchV1>,
    pub trades: Vec<Trade>,
    pub boards: Vec<Board>,
    pub contracts: Vec<Contract>,
    pub laws: Vec<Law>,
    pub orgs: Vec<Organization>,
    #[serde(default)]
    pub structures: Vec<Structure>,

    #[serde(default)]
    pub(crate) counters: Counters,
    #[serde(default)]
    pub(crate) stats: DirectorStats,
    #[serde(default)]
    pub reset_total: u64,
}

impl SnapshotV1 {
    pub fn tick(&self) -> u64 {
        self.header.tick
    }

    pub fn world_id(&self) -> &str {
        &self.header.world_id
    }

    pub fn active_event_id(&self) -> Option<&str> {
        self.active_event.as_ref().map(|ev| ev.event_id.as_str())
    }
}

impl World {
    pub fn export_snapshot(&self) -> SnapshotV1 {
        let mut snap = self.export_state();
        snap.chunks = self
            .chunks
            .chunks()
            .map(|(key, chunk)| ChunkV1 {
                cx: key.cx,
                cz: key.cz,
                blocks: chunk.blocks.clone(),
            })
            .collect();
        snap
    }

    /// Everything except chunk payloads.
    fn export_state(&self) -> SnapshotV1 {
        SnapshotV1 {
            header: SnapshotHeader {
                version: SNAPSHOT_VERSION,
                world_id: self.cfg.world_id.clone(),
                tick: self.tick,
            },
            config: self.cfg.clone(),
            weather: self.weather,
            weather_until_tick: self.weather_until_tick,
            active_event: self.active_event.clone(),
            chunks: Vec::new(),
            agents: self.agents.values().cloned().collect(),
            claims: self.claims.values().cloned().collect(),
            containers: self.containers.values().cloned().collect(),
            items: self.items.values().cloned().collect(),
            signs: self.signs.values().cloned().collect(),
            conveyors: self
                .conveyors
                .iter()
                .map(|(pos, meta)| ConveyorV1 {
                    pos: *pos,
                    dx: meta.dx,
                    dz: meta.dz,
                })
                .collect(),
            switches: self
                .switches
                .iter()
                .map(|(pos, on)| SwitchV1 { pos: *pos, on: *on })
                .collect(),
            trades: self.trades.values().cloned().collect(),
            boards: self.boards.values().cloned().collect(),
            contracts: self.contracts.values().cloned().collect(),
            laws: self.laws.values().cloned().collect(),
            orgs: self.orgs.values().cloned().collect(),
            structures: self.structures.values().cloned().collect(),
            counters: self.counters.clone(),
            stats: self.stats.clone(),
            reset_total: self.reset_total,
        }
    }

    /// Rebuilds a world from a snapshot. Sessions are not restored; agents
    /// stay in the world until a client joins or resumes them.
    pub fn from_snapshot(snap: SnapshotV1, catalogs: Arc<Catalogs>) -> Result<Self, SnapshotError> {
        if snap.header.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snap.header.version));
        }
        if snap.config.world_id != snap.header.world_id {
            return Err(SnapshotError::WorldMismatch {
                expected: snap.header.world_id,
                found: snap.config.world_id,
            });
        }
        let mut world = World::new(snap.config, catalogs)?;
        world.tick = snap.header.tick;
        world.weather = snap.weather;
        world.weather_until_tick = snap.weather_until_tick;
        world.active_event = snap.active_event;
        for chunk in snap.chunks {
            world
                .chunks
                .insert_chunk(ChunkKey { cx: chunk.cx, cz: chunk.cz }, chunk.blocks);
        }
        world.agents = snap
            .agents
            .into_iter()
            .map(|agent| (agent.id.clone(), agent))
            .collect();
        world.claims = snap
            .claims
            .into_iter()
            .map(|land| (land.land_id.clone(), land))
            .collect();
        world.containers = snap.containers.into_iter().map(|c| (c.pos, c)).collect();
        world.items = snap
            .items
            .into_iter()
            .map(|e| (e.entity_id.clone(), e))
            .collect();
        world.reindex_items();
        world.signs = snap.signs.into_iter().map(|s| (s.pos, s)).collect();
        world.conveyors = snap
            .conveyors
            .into_iter()
            .map(|c| (c.pos, ConveyorMeta::from_dir(i32::from(c.dx), i32::from(c.dz))))
            .collect();
        world.switches = snap.switches.into_iter().map(|s| (s.pos, s.on)).collect();
        world.trades = snap
            .trades
            .into_iter()
            .map(|t| (t.trade_id.clone(), t))
            .collect();
        world.boards = snap
            .boards
            .into_iter()
            .map(|b| (b.board_id.clone(), b))
            .collect();
        world.contracts = snap
            .contracts
            .into_iter()
            .map(|c| (c.contract_id.clone(), c))
            .collect();
        world.laws = snap
            .laws
            .into_iter()
            .map(|l| (l.law_id.clone(), l))
            .collect();
        world.orgs = snap
            .orgs
            .into_iter()
            .map(|o| (o.org_id.clone(), o))
            .collect();
        world.structures = snap
            .structures
            .into_iter()
            .map(|s| (s.structure_id.clone(), s))
            .collect();
        world.counters = snap.counters;
        world.stats = snap.stats;
        world.reset_total = snap.reset_total;
        tracing::info!(
            world_id = %world.cfg.world_id,
            tick = world.tick,
            agents = world.agents.len(),
            chunks = world.chunks.loaded_count(),
            "world restored from snapshot"
        );
        Ok(world)
    }

    /// SHA-256 over the loaded chunk digests followed by the canonical JSON of
    /// every other snapshot field.
    pub fn state_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tick.to_le_bytes());
        hasher.update(self.cfg.seed.to_le_bytes());
        for (key, chunk) in self.chunks.chunks() {
            hasher.update(key.cx.to_le_bytes());
            hasher.update(key.cz.to_le_bytes());
            hasher.update(chunk.digest());
        }
        match serde_json::to_vec(&self.export_state()) {
            Ok(bytes) => hasher.update(&bytes),
            Err(err) => {
                tracing::warn!(world_id = %self.cfg.world_id, error = %err, "state digest serialization failed");
            }
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> World {
        let cfg = WorldConfig {
            seed: 7,
            ..WorldConfig::default()
        };
        let catalogs = Arc::new(Catalogs::builtin(&cfg));
        World::new(cfg, catalogs).expect("world")
    }

    #[test]
    fn export_import_export_is_identical() {
        let mut world = world();
        world.join(JoinRequest {
            name: "a".to_string(),
            new_token: "tok".to_string(),
            ..JoinRequest::default()
        });
        let pos = Vec3i::new(3, 0, 3);
        world.set_block_named(pos, "CHEST");
        world.on_block_placed(pos, "CHEST", 0);
        if let Some(chest) = world.containers.get_mut(&pos) {
            chest.add("COAL", 4);
            chest.reserve("COAL", 1);
        }
        world.conveyors.insert(Vec3i::new(4, 0, 3), ConveyorMeta { dx: 1, dz: 0 });
        world.switches.insert(Vec3i::new(5, 0, 3), true);
        world.step(Vec::new());

        let first = world.export_snapshot();
        let catalogs = Arc::clone(world.catalogs());
        let restored = World::from_snapshot(first.clone(), catalogs).expect("import");
        assert_eq!(restored.export_snapshot(), first);
        assert_eq!(restored.state_digest(), world.state_digest());
    }

    #[test]
    fn resume_tokens_are_not_captured() {
        let mut world = world();
        world.join(JoinRequest {
            name: "a".to_string(),
            new_token: "secret-token".to_string(),
            ..JoinRequest::default()
        });
        let json = serde_json::to_string(&world.export_snapshot()).expect("serialize");
        assert!(!json.contains("secret-token"));

        let catalogs = Arc::clone(world.catalogs());
        let restored = World::from_snapshot(world.export_snapshot(), catalogs).expect("import");
        assert_eq!(restored.agent_for_token("secret-token"), None);
        assert_eq!(restored.state_digest(), world.state_digest());
    }

    #[test]
    fn digest_tracks_block_changes() {
        let mut world = world();
        world.chunks.load_around(Vec3i::new(0, 0, 0), 4);
        let before = world.state_digest();
        world.set_block_named(Vec3i::new(1, 0, 1), "BRICK");
        assert_ne!(world.state_digest(), before);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let world = world();
        let mut snap = world.export_snapshot();
        snap.header.version = 9;
        let err = World::from_snapshot(snap, Arc::clone(world.catalogs())).unwrap_err();
        assert_eq!(err, SnapshotError::UnsupportedVersion(9));
    }

    #[test]
    fn json_roundtrip_preserves_snapshot() {
        let mut world = world();
        world.join(JoinRequest {
            name: "b".to_string(),
            ..JoinRequest::default()
        });
        world.step(Vec::new());
        let snap = world.export_snapshot();
        let bytes = serde_json::to_vec(&snap).expect("encode");
        let back: SnapshotV1 = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(back, snap);
    }
}
