use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use kernel_core::SnapshotV1;
use serde::{Deserialize, Serialize};

const ZSTD_LEVEL: i32 = 3;
pub const SNAPSHOT_SUFFIX: &str = ".snap.zst";

#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    Serde(serde_json::Error),
    Sqlite(rusqlite::Error),
    Http(String),
    Corrupt(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Serde(err) => write!(f, "serde error: {err}"),
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::Http(msg) => write!(f, "http error: {msg}"),
            Self::Corrupt(msg) => write!(f, "corrupt file: {msg}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<std::io::Error> for PersistenceError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

// ---------------------------------------------------------------------------
// Hourly JSONL segments
// ---------------------------------------------------------------------------

/// Called with the path of every segment that was closed cleanly.
pub type SegmentClosed = Box<dyn FnMut(&Path) + Send>;

struct OpenSegment {
    hour: String,
    path: PathBuf,
    encoder: zstd::stream::write::Encoder<'static, BufWriter<File>>,
}

/// Append-only JSONL stream compressed into one zstd segment per UTC hour:
/// `<dir>/<prefix>-<YYYY-MM-DD-HH>.jsonl.zst`. Reopening an existing hour
/// appends a new zstd frame to the same file.
pub struct JsonlZstdWriter {
    dir: PathBuf,
    prefix: String,
    current: Option<OpenSegment>,
    on_close: Option<SegmentClosed>,
}

impl fmt::Debug for JsonlZstdWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlZstdWriter")
            .field("dir", &self.dir)
            .field("prefix", &self.prefix)
            .field("segment", &self.current.as_ref().map(|s| &s.path))
            .finish()
    }
}

impl JsonlZstdWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            current: None,
            on_close: None,
        }
    }

    /// Tick log of one world: `<world_dir>/events/events-*.jsonl.zst`.
    pub fn tick_log(world_dir: &Path) -> Self {
        Self::new(world_dir.join("events"), "events")
    }

    /// Audit log of one world: `<world_dir>/audit/audit-*.jsonl.zst`.
    pub fn audit_log(world_dir: &Path) -> Self {
        Self::new(world_dir.join("audit"), "audit")
    }

    pub fn with_on_close(mut self, on_close: SegmentClosed) -> Self {
        self.on_close = Some(on_close);
        self
    }

    pub fn segment_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{}-{}.jsonl.zst", self.prefix, hour_key(at)))
    }

    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<(), PersistenceError> {
        self.write_at(Utc::now(), value)
    }

    /// Appends one line, rotating first when `at` falls in a new hour.
    pub fn write_at<T: Serialize>(
        &mut self,
        at: DateTime<Utc>,
        value: &T,
    ) -> Result<(), PersistenceError> {
        let hour = hour_key(at);
        if self.current.as_ref().is_some_and(|seg| seg.hour != hour) {
            self.close()?;
        }
        if self.current.is_none() {
            fs::create_dir_all(&self.dir)?;
            let path = self.segment_path(at);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let encoder = zstd::stream::write::Encoder::new(BufWriter::new(file), ZSTD_LEVEL)?;
            self.current = Some(OpenSegment {
                hour,
                path,
                encoder,
            });
        }
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        if let Some(seg) = self.current.as_mut() {
            seg.encoder.write_all(&line)?;
            seg.encoder.flush()?;
        }
        Ok(())
    }

    /// Ends the current zstd frame and hands the segment to the close hook.
    pub fn close(&mut self) -> Result<(), PersistenceError> {
        let Some(seg) = self.current.take() else {
            return Ok(());
        };
        let mut inner = seg.encoder.finish()?;
        inner.flush()?;
        drop(inner);
        if let Some(hook) = self.on_close.as_mut() {
            hook(&seg.path);
        }
        Ok(())
    }
}

impl Drop for JsonlZstdWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(dir = %self.dir.display(), error = %err, "closing log segment failed");
        }
    }
}

fn hour_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d-%H").to_string()
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// First line of a snapshot file; lets tools identify a file without parsing
/// the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFileHeader {
    pub version: u32,
    pub world_id: String,
    pub tick: u64,
}

pub fn snapshot_file_name(tick: u64) -> String {
    format!("{tick}{SNAPSHOT_SUFFIX}")
}

/// Writes `<dir>/<tick>.snap.zst` (header line, then the JSON body) through a
/// temporary file so readers never see a partial snapshot.
pub fn write_snapshot(dir: &Path, snap: &SnapshotV1) -> Result<PathBuf, PersistenceError> {
    fs::create_dir_all(dir)?;
    let header = SnapshotFileHeader {
        version: snap.header.version,
        world_id: snap.world_id().to_string(),
        tick: snap.tick(),
    };
    let mut raw = serde_json::to_vec(&header)?;
    raw.push(b'\n');
    serde_json::to_writer(&mut raw, snap)?;
    let compressed = zstd::stream::encode_all(raw.as_slice(), ZSTD_LEVEL)?;

    let path = dir.join(snapshot_file_name(snap.tick()));
    let tmp = path.with_extension("zst.tmp");
    fs::write(&tmp, compressed)?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

pub fn read_snapshot(path: &Path) -> Result<SnapshotV1, PersistenceError> {
    let raw = zstd::stream::decode_all(File::open(path)?)?;
    let split = raw
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| PersistenceError::Corrupt(format!("{}: missing header", path.display())))?;
    let header: SnapshotFileHeader = serde_json::from_slice(&raw[..split])?;
    let snap: SnapshotV1 = serde_json::from_slice(&raw[split + 1..])?;
    if header.tick != snap.tick() || header.world_id != snap.world_id() {
        return Err(PersistenceError::Corrupt(format!(
            "{}: header does not match body",
            path.display()
        )));
    }
    Ok(snap)
}

/// Highest-tick snapshot in `dir`, if any.
pub fn latest_snapshot(dir: &Path) -> Result<Option<PathBuf>, PersistenceError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in entries {
        let path = entry?.path();
        let Some(tick) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(SNAPSHOT_SUFFIX))
            .and_then(|tick| tick.parse::<u64>().ok())
        else {
            continue;
        };
        if best.as_ref().map_or(true, |(t, _)| tick > *t) {
            best = Some((tick, path));
        }
    }
    Ok(best.map(|(_, path)| path))
}

// ---------------------------------------------------------------------------
// Season archive
// ---------------------------------------------------------------------------

/// `meta.json` of one archived season.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonRecord {
    pub season: u64,
    pub end_tick: u64,
    pub seed: i64,
    pub snapshot: String,
    pub created_at: String,
    pub day_ticks: u64,
    pub season_length_ticks: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// Copies end-of-season snapshots into `<world_dir>/archives/`.
#[derive(Debug, Clone)]
pub struct SeasonArchiver {
    root: PathBuf,
}

impl SeasonArchiver {
    pub fn new(world_dir: &Path) -> Self {
        Self {
            root: world_dir.join("archives"),
        }
    }

    pub fn season_dir(&self, season: u64) -> PathBuf {
        self.root.join(format!("season_{season:03}"))
    }

    pub fn reset_dir(&self, tick: u64) -> PathBuf {
        self.root.join(format!("reset_{tick}"))
    }

    /// Season that ends at `tick`: the snapshot of tick T closes season
    /// (T+1)/len when (T+1) is a multiple of the season length.
    pub fn season_ending_at(tick: u64, season_length_ticks: u64) -> Option<u64> {
        if season_length_ticks == 0 {
            return None;
        }
        let next = tick.checked_add(1)?;
        (next % season_length_ticks == 0).then_some(next / season_length_ticks)
    }

    /// Archives `snapshot_path` when `snap` closes a season. Rewriting the same
    /// tick replaces the earlier copy.
    pub fn archive_if_season_end(
        &self,
        snap: &SnapshotV1,
        snapshot_path: &Path,
    ) -> Result<Option<SeasonRecord>, PersistenceError> {
        let Some(season) = Self::season_ending_at(snap.tick(), snap.config.season_length_ticks)
        else {
            return Ok(None);
        };
        let dir = self.season_dir(season);
        self.copy_with_meta(&dir, season, snap, snapshot_path, "")
            .map(Some)
    }

    /// Archives the state a world had before an admin reset under
    /// `archives/reset_<tick>/`.
    pub fn archive_reset(
        &self,
        season: u64,
        snap: &SnapshotV1,
        snapshot_path: &Path,
    ) -> Result<SeasonRecord, PersistenceError> {
        let dir = self.reset_dir(snap.tick());
        self.copy_with_meta(&dir, season, snap, snapshot_path, "ADMIN_RESET")
    }

    fn copy_with_meta(
        &self,
        dir: &Path,
        season: u64,
        snap: &SnapshotV1,
        snapshot_path: &Path,
        reason: &str,
    ) -> Result<SeasonRecord, PersistenceError> {
        fs::create_dir_all(dir)?;
        let file_name = snapshot_path
            .file_name()
            .ok_or_else(|| PersistenceError::Corrupt(format!("{}: no file name", snapshot_path.display())))?;
        let target = dir.join(file_name);
        fs::copy(snapshot_path, &target)?;

        let record = SeasonRecord {
            season,
            end_tick: snap.tick(),
            seed: snap.config.seed,
            snapshot: target.display().to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            day_ticks: snap.config.day_ticks,
            season_length_ticks: snap.config.season_length_ticks,
            reason: reason.to_string(),
        };
        fs::write(dir.join("meta.json"), serde_json::to_vec_pretty(&record)?)?;
        tracing::info!(
            world_id = %snap.world_id(),
            season,
            tick = snap.tick(),
            path = %target.display(),
            "season archived"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::{Arc, Mutex};

    use chrono::TimeZone;
    use kernel_core::{Catalogs, JoinRequest, World, WorldConfig};

    use super::*;

    fn world(season: u64) -> World {
        let cfg = WorldConfig {
            world_id: "MINE_L1".to_string(),
            seed: 9,
            season_length_ticks: season,
            snapshot_every_ticks: 1,
            ..WorldConfig::default()
        };
        let catalogs = Arc::new(Catalogs::builtin(&cfg));
        World::new(cfg, catalogs).expect("world")
    }

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        let mut decoder = zstd::stream::read::Decoder::new(File::open(path).expect("open")).expect("decoder");
        let mut text = String::new();
        decoder.read_to_string(&mut text).expect("decode");
        text.lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect()
    }

    #[test]
    fn jsonl_rotates_per_hour_and_reports_closed_segments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let closed = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&closed);
        let mut writer = JsonlZstdWriter::tick_log(dir.path()).with_on_close(Box::new(move |path: &Path| {
            seen.lock().expect("lock").push(path.to_path_buf());
        }));
        let ten = Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).single().expect("time");
        let ten_late = Utc.with_ymd_and_hms(2026, 3, 1, 10, 59, 0).single().expect("time");
        let eleven = Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).single().expect("time");

        writer.write_at(ten, &serde_json::json!({"tick": 1})).expect("write");
        writer.write_at(ten_late, &serde_json::json!({"tick": 2})).expect("write");
        writer.write_at(eleven, &serde_json::json!({"tick": 3})).expect("write");
        writer.close().expect("close");

        let first = dir.path().join("events/events-2026-03-01-10.jsonl.zst");
        let second = dir.path().join("events/events-2026-03-01-11.jsonl.zst");
        assert_eq!(read_lines(&first).len(), 2);
        assert_eq!(read_lines(&second), vec![serde_json::json!({"tick": 3})]);
        assert_eq!(*closed.lock().expect("lock"), vec![first, second]);
    }

    #[test]
    fn reopening_an_hour_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().expect("time");
        for tick in 1..=2 {
            let mut writer = JsonlZstdWriter::audit_log(dir.path());
            writer.write_at(at, &serde_json::json!({"tick": tick})).expect("write");
        }
        let path = dir.path().join("audit/audit-2026-03-01-10.jsonl.zst");
        assert_eq!(read_lines(&path).len(), 2);
    }

    #[test]
    fn snapshot_files_round_trip_and_latest_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut w = world(100);
        w.join(JoinRequest::default());
        let mut written = Vec::new();
        for _ in 0..3 {
            let out = w.step(Vec::new());
            let snap = out.snapshot.expect("snapshot every tick");
            written.push(write_snapshot(dir.path(), &snap).expect("write"));
        }
        fs::write(dir.path().join("notes.txt"), "x").expect("write");

        let latest = latest_snapshot(dir.path()).expect("scan").expect("some");
        assert_eq!(latest, dir.path().join("3.snap.zst"));
        let snap = read_snapshot(&latest).expect("read");
        assert_eq!(snap.tick(), 3);
        let restored = World::from_snapshot(snap, Arc::clone(w.catalogs())).expect("restore");
        assert_eq!(restored.state_digest(), w.state_digest());

        let missing = dir.path().join("nothing-here");
        assert_eq!(latest_snapshot(&missing).expect("scan"), None);
    }

    #[test]
    fn season_boundaries() {
        assert_eq!(SeasonArchiver::season_ending_at(2, 3), Some(1));
        assert_eq!(SeasonArchiver::season_ending_at(5, 3), Some(2));
        assert_eq!(SeasonArchiver::season_ending_at(3, 3), None);
        assert_eq!(SeasonArchiver::season_ending_at(0, 3), None);
        assert_eq!(SeasonArchiver::season_ending_at(2, 0), None);
    }

    #[test]
    fn snapshot_closing_a_season_is_archived_with_meta() {
        let dir = tempfile::tempdir().expect("tempdir");
        let snaps = dir.path().join("snapshots");
        let archiver = SeasonArchiver::new(dir.path());
        let mut w = world(3);
        let mut archived = Vec::new();
        for _ in 0..2 {
            let out = w.step(Vec::new());
            if let Some(snap) = out.snapshot {
                let path = write_snapshot(&snaps, &snap).expect("write");
                if let Some(record) = archiver.archive_if_season_end(&snap, &path).expect("archive") {
                    archived.push(record);
                }
            }
        }
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].season, 1);
        assert_eq!(archived[0].end_tick, 2);
        let season_dir = dir.path().join("archives/season_001");
        assert!(season_dir.join("2.snap.zst").exists());
        let meta: SeasonRecord =
            serde_json::from_slice(&fs::read(season_dir.join("meta.json")).expect("meta")).expect("json");
        assert_eq!(meta.seed, 9);
        assert_eq!(meta.season_length_ticks, 3);
        assert!(!dir.path().join("archives/season_000").exists());
    }

    #[test]
    fn admin_reset_archive_lands_in_its_own_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archiver = SeasonArchiver::new(dir.path());
        let mut w = world(100);
        w.step(Vec::new());
        let before = w.admin_reset();
        let path = write_snapshot(&dir.path().join("snapshots"), &before).expect("write");
        let record = archiver.archive_reset(1, &before, &path).expect("archive");
        assert_eq!(record.reason, "ADMIN_RESET");
        assert!(dir.path().join("archives/reset_1/1.snap.zst").exists());
    }
}
