//! Mirrors closed log segments, snapshots and season archives to an
//! S3-compatible object store with SigV4-signed PUTs.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::MirrorConfig;
use crate::persistence::PersistenceError;

pub const MIRROR_QUEUE_CAPACITY: usize = 2048;
pub const DEFAULT_MIRROR_WORKERS: usize = 2;
const UPLOAD_ATTEMPTS: u32 = 4;
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const SERVICE: &str = "s3";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// SigV4
// ---------------------------------------------------------------------------

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts keys of any length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// `HMAC("AWS4"+secret, date) -> region -> service -> "aws4_request"`.
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Percent-encodes each path segment, keeping `/` and the unreserved set.
pub fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(char::from(byte));
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPut {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
}

/// Signs a single-object PUT of a payload whose SHA-256 is `payload_hash`.
pub fn sign_put(
    cfg: &MirrorConfig,
    key: &str,
    payload_hash: &str,
    now: DateTime<Utc>,
) -> SignedPut {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let host = cfg
        .endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string();
    let uri = format!("/{}/{}", escape_key(&cfg.bucket), escape_key(key));

    let canonical_headers =
        format!("host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n");
    let canonical_request =
        format!("PUT\n{uri}\n\n{canonical_headers}\n{SIGNED_HEADERS}\n{payload_hash}");
    let scope = format!("{date}/{}/{SERVICE}/aws4_request", cfg.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );
    let key_bytes = signing_key(&cfg.secret_access_key, &date, &cfg.region, SERVICE);
    let signature = hex::encode(hmac_sha256(&key_bytes, string_to_sign.as_bytes()));
    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
        cfg.access_key_id
    );

    SignedPut {
        url: format!("{}{uri}", cfg.endpoint.trim_end_matches('/')),
        headers: vec![
            ("host", host),
            ("x-amz-content-sha256", payload_hash.to_string()),
            ("x-amz-date", amz_date),
            ("authorization", authorization),
            ("content-type", "application/octet-stream".to_string()),
        ],
    }
}

/// `prefix/<path relative to data_dir>`; paths outside the data dir are refused.
pub fn object_key(data_dir: &Path, path: &Path, prefix: &str) -> Result<String, PersistenceError> {
    let rel = path
        .strip_prefix(data_dir)
        .map_err(|_| PersistenceError::Corrupt(format!("{} is outside the data dir", path.display())))?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(PersistenceError::Corrupt(format!(
                    "{} escapes the data dir",
                    path.display()
                )))
            }
        }
    }
    if parts.is_empty() {
        return Err(PersistenceError::Corrupt("empty object key".to_string()));
    }
    let rel = parts.join("/");
    Ok(if prefix.is_empty() {
        rel
    } else {
        format!("{prefix}/{rel}")
    })
}

// ---------------------------------------------------------------------------
// Uploader
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MirrorStats {
    enqueued: AtomicU64,
    saturated: AtomicU64,
    dropped: AtomicU64,
    success: AtomicU64,
    fail: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MirrorStatsView {
    pub enqueued: u64,
    pub saturated: u64,
    pub dropped: u64,
    pub success: u64,
    pub fail: u64,
}

impl MirrorStats {
    pub fn view(&self) -> MirrorStatsView {
        MirrorStatsView {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            saturated: self.saturated.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            fail: self.fail.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Uploader {
    cfg: MirrorConfig,
    data_dir: PathBuf,
    stats: MirrorStats,
}

impl Uploader {
    fn client() -> Result<reqwest::blocking::Client, PersistenceError> {
        reqwest::blocking::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|err| PersistenceError::Http(err.to_string()))
    }

    fn put(&self, client: &reqwest::blocking::Client, path: &Path) -> Result<(), PersistenceError> {
        let key = object_key(&self.data_dir, path, &self.cfg.prefix)?;
        let body = std::fs::read(path)?;
        let mut last = None;
        for attempt in 0..UPLOAD_ATTEMPTS {
            if attempt > 0 {
                std::thread::sleep(Duration::from_millis(200 * u64::from(attempt * attempt)));
            }
            let signed = sign_put(&self.cfg, &key, &sha256_hex(&body), Utc::now());
            let mut request = client.put(&signed.url).body(body.clone());
            for (name, value) in &signed.headers {
                if *name != "host" {
                    request = request.header(*name, value);
                }
            }
            match request.send() {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last = Some(PersistenceError::Http(format!("PUT {key}: {}", response.status())));
                }
                Err(err) => last = Some(PersistenceError::Http(format!("PUT {key}: {err}"))),
            }
        }
        Err(last.unwrap_or_else(|| PersistenceError::Http(format!("PUT {key}: no attempt made"))))
    }

    fn upload(&self, client: &reqwest::blocking::Client, path: &Path) {
        match self.put(client, path) {
            Ok(()) => {
                self.stats.success.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(path = %path.display(), "mirrored");
            }
            Err(err) => {
                self.stats.fail.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(path = %path.display(), error = %err, "mirror upload failed");
            }
        }
    }
}

fn run_worker(uploader: Arc<Uploader>, rx: Arc<Mutex<Receiver<PathBuf>>>) {
    let client = match Uploader::client() {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(error = %err, "mirror worker could not build an http client");
            return;
        }
    };
    loop {
        let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
        match next {
            Ok(path) => uploader.upload(&client, &path),
            Err(_) => return,
        }
    }
}

/// Worker pool fed by a bounded queue. A saturated queue uploads on the
/// caller's thread instead of dropping the file.
#[derive(Debug)]
pub struct Mirror {
    uploader: Arc<Uploader>,
    tx: Mutex<Option<SyncSender<PathBuf>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Mirror {
    pub fn start(cfg: MirrorConfig, data_dir: PathBuf, workers: usize) -> Result<Arc<Self>, PersistenceError> {
        let uploader = Arc::new(Uploader {
            cfg,
            data_dir,
            stats: MirrorStats::default(),
        });
        let (tx, rx) = mpsc::sync_channel(MIRROR_QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::new();
        for n in 0..workers.max(1) {
            let uploader = Arc::clone(&uploader);
            let rx = Arc::clone(&rx);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("mirror-{n}"))
                    .spawn(move || run_worker(uploader, rx))?,
            );
        }
        Ok(Arc::new(Self {
            uploader,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }))
    }

    pub fn stats(&self) -> MirrorStatsView {
        self.uploader.stats.view()
    }

    /// Must be called from a plain thread: the saturation fallback blocks.
    pub fn enqueue(&self, path: &Path) {
        let stats = &self.uploader.stats;
        let sent = {
            let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
            match tx.as_ref() {
                Some(tx) => tx.try_send(path.to_path_buf()),
                None => Err(TrySendError::Disconnected(path.to_path_buf())),
            }
        };
        match sent {
            Ok(()) => {
                stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(path)) => {
                stats.saturated.fetch_add(1, Ordering::Relaxed);
                match Uploader::client() {
                    Ok(client) => self.uploader.upload(&client, &path),
                    Err(err) => {
                        stats.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(path = %path.display(), error = %err, "mirror fallback failed");
                    }
                }
            }
            Err(TrySendError::Disconnected(path)) => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(path = %path.display(), "mirror closed, upload dropped");
            }
        }
    }

    /// Uploads what is queued, then stops the workers.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("mirror worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn config() -> MirrorConfig {
        MirrorConfig {
            endpoint: "https://acct.r2.example.com".to_string(),
            bucket: "worlds".to_string(),
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            prefix: "prod".to_string(),
            region: "auto".to_string(),
        }
    }

    #[test]
    fn signing_key_matches_the_published_vector() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn signed_put_carries_scope_and_headers() {
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("time");
        let hash = sha256_hex(b"payload");
        let signed = sign_put(&config(), "prod/worlds/MINE_L1/snapshots/12.snap.zst", &hash, now);
        assert_eq!(
            signed.url,
            "https://acct.r2.example.com/worlds/prod/worlds/MINE_L1/snapshots/12.snap.zst"
        );
        let header = |name: &str| {
            signed
                .headers
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
                .expect("header")
        };
        assert_eq!(header("host"), "acct.r2.example.com");
        assert_eq!(header("x-amz-date"), "20260102T030405Z");
        assert_eq!(header("x-amz-content-sha256"), hash);
        let auth = header("authorization");
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260102/auto/s3/aws4_request, \
             SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature="
        ));
        let signature = auth.rsplit("Signature=").next().expect("signature");
        assert_eq!(signature.len(), 64);

        // Same inputs, same signature.
        assert_eq!(signed, sign_put(&config(), "prod/worlds/MINE_L1/snapshots/12.snap.zst", &hash, now));
    }

    #[test]
    fn keys_are_relative_to_the_data_dir() {
        let data = Path::new("/srv/data");
        assert_eq!(
            object_key(data, Path::new("/srv/data/worlds/OVERWORLD/audit/a.jsonl.zst"), "prod")
                .expect("key"),
            "prod/worlds/OVERWORLD/audit/a.jsonl.zst"
        );
        assert_eq!(
            object_key(data, Path::new("/srv/data/global/state.json"), "").expect("key"),
            "global/state.json"
        );
        assert!(object_key(data, Path::new("/etc/passwd"), "prod").is_err());
        assert!(object_key(data, Path::new("/srv/data/../etc/passwd"), "prod").is_err());
    }

    #[test]
    fn escaping_keeps_slashes_and_unreserved() {
        assert_eq!(escape_key("a/b c/d~e.f"), "a/b%20c/d~e.f");
        assert_eq!(escape_key("season_001/+x"), "season_001/%2Bx");
    }
}
