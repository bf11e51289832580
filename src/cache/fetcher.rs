//! Lookup strategies evaluated in order by [`CacheManager`](super::CacheManager).

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use super::{CacheEntry, CacheKey, CacheTier};
use crate::error::{PipelineError, PipelineResult};
use crate::fsio;
use uuid::Uuid;

/// One fallible step of the cascading lookup.
///
/// `fetch` returns `Ok(None)` for a miss. Writable tiers also implement
/// `store`; read-only strategies keep the default.
pub trait Fetcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn fetch(&self, tier: CacheTier, key: &CacheKey, ttl: Duration)
    -> PipelineResult<Option<Vec<u8>>>;

    /// Returns `Ok(true)` when the payload was stored.
    fn store(
        &self,
        _tier: CacheTier,
        _key: &CacheKey,
        _payload: &[u8],
        _ttl: Duration,
    ) -> PipelineResult<bool> {
        Ok(false)
    }
}

struct MemoryEntry {
    payload: Vec<u8>,
    created_at: chrono::DateTime<Utc>,
    ttl: Duration,
}

struct MemoryState {
    entries: HashMap<(CacheTier, String), MemoryEntry>,
    order: VecDeque<(CacheTier, String)>,
}

/// Bounded in-process tier with FIFO eviction.
pub struct MemoryTier {
    state: Mutex<MemoryState>,
    capacity: usize,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops entries past the TTL they were stored with; returns how many
    /// were removed.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let now = Utc::now();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| !is_older_than(e.created_at, e.ttl, now));
        let MemoryState { entries, order } = &mut *state;
        order.retain(|k| entries.contains_key(k));
        before - state.entries.len()
    }
}

impl Fetcher for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn fetch(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        ttl: Duration,
    ) -> PipelineResult<Option<Vec<u8>>> {
        let state = self
            .state
            .lock()
            .map_err(|_| std::io::Error::other("memory cache lock poisoned"))?;
        let hit = state
            .entries
            .get(&(tier, key.hash.clone()))
            .filter(|e| !is_older_than(e.created_at, ttl, Utc::now()))
            .map(|e| e.payload.clone());
        Ok(hit)
    }

    fn store(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        payload: &[u8],
        ttl: Duration,
    ) -> PipelineResult<bool> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| std::io::Error::other("memory cache lock poisoned"))?;
        let id = (tier, key.hash.clone());
        let entry = MemoryEntry {
            payload: payload.to_vec(),
            created_at: Utc::now(),
            ttl,
        };
        if state.entries.insert(id.clone(), entry).is_none() {
            state.order.push_back(id);
        }
        while state.entries.len() > self.capacity {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.entries.remove(&oldest);
                }
                None => break,
            }
        }
        Ok(true)
    }
}

/// Persistent tier: `<root>/<tier>/<kk>/<key>.bin` plus `<key>.json` metadata.
pub struct DiskTier {
    root: PathBuf,
}

impl DiskTier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_dir(&self, tier: CacheTier, hash: &str) -> PathBuf {
        let shard = hash.get(..2).unwrap_or("00");
        self.root.join(tier.dir_name()).join(shard)
    }

    pub fn payload_path(&self, tier: CacheTier, key: &CacheKey) -> PathBuf {
        self.shard_dir(tier, &key.hash).join(format!("{}.bin", key.hash))
    }

    pub fn entry_path(&self, tier: CacheTier, key: &CacheKey) -> PathBuf {
        self.shard_dir(tier, &key.hash).join(format!("{}.json", key.hash))
    }

    /// Loads entry metadata and checks it against the requested key.
    pub fn read_entry(&self, tier: CacheTier, key: &CacheKey) -> PipelineResult<Option<CacheEntry>> {
        let path = self.entry_path(tier, key);
        if !path.exists() {
            return Ok(None);
        }
        let entry: CacheEntry = serde_json::from_slice(&fs::read(&path)?)?;
        entry.verify_key(key)?;
        Ok(Some(entry))
    }

    // A foreign or expired entry reads as a miss.
    fn live_entry(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        ttl: Duration,
    ) -> PipelineResult<Option<CacheEntry>> {
        let entry = match self.read_entry(tier, key) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(err @ PipelineError::CacheKeyMismatch { .. }) => {
                warn!(tier = %tier, key = %key.hash, error = %err, "cache key mismatch, treating as miss");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if is_older_than(entry.created_at, ttl, Utc::now()) {
            debug!(tier = %tier, key = %key.hash, "disk entry expired");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Path of a live, intact payload. The digest is computed by streaming
    /// the file, so large artifacts are never loaded whole.
    pub fn file_hit(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        ttl: Duration,
    ) -> PipelineResult<Option<PathBuf>> {
        let Some(entry) = self.live_entry(tier, key, ttl)? else {
            return Ok(None);
        };
        let path = self.payload_path(tier, key);
        let digest = match fsio::sha256_file(&path) {
            Ok(digest) => digest,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if digest != entry.payload_sha256 {
            warn!(tier = %tier, key = %key.hash, "cache payload corrupted, treating as miss");
            return Ok(None);
        }
        Ok(Some(path))
    }

    /// Temp location in the entry's shard that [`install`](Self::install)
    /// can rename from; skipped by listings until then.
    pub fn staging_path(&self, tier: CacheTier, key: &CacheKey) -> PipelineResult<PathBuf> {
        let dir = self.shard_dir(tier, &key.hash);
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!(".{}.bin.{}.tmp", key.hash, Uuid::new_v4().simple())))
    }

    /// Moves a fully written staging file into place and records its entry.
    pub fn install(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        staging: &Path,
        ttl: Duration,
    ) -> PipelineResult<PathBuf> {
        let payload_sha256 = fsio::sha256_file(staging)?;
        let size_bytes = fs::metadata(staging)?.len();
        let path = self.payload_path(tier, key);
        fs::rename(staging, &path)?;
        let entry = CacheEntry {
            key: key.hash.clone(),
            tier,
            identity: key.identity.clone(),
            created_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            payload_file: format!("{}.bin", key.hash),
            payload_sha256,
            size_bytes,
        };
        fsio::atomic_write_json(&self.entry_path(tier, key), &entry)?;
        Ok(path)
    }
}

impl Fetcher for DiskTier {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn fetch(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        ttl: Duration,
    ) -> PipelineResult<Option<Vec<u8>>> {
        let Some(entry) = self.live_entry(tier, key, ttl)? else {
            return Ok(None);
        };
        let payload_path = self.payload_path(tier, key);
        let payload = match fs::read(&payload_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let digest = fsio::sha256_bytes(&payload);
        if digest != entry.payload_sha256 {
            let err = PipelineError::CacheKeyMismatch {
                expected: entry.payload_sha256.clone(),
                found: digest,
            };
            warn!(tier = %tier, key = %key.hash, error = %err, "cache payload corrupted, treating as miss");
            return Ok(None);
        }
        Ok(Some(payload))
    }

    fn store(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        payload: &[u8],
        ttl: Duration,
    ) -> PipelineResult<bool> {
        fs::create_dir_all(self.shard_dir(tier, &key.hash))?;
        // Payload first; the metadata file appearing marks the entry complete.
        fsio::atomic_write(&self.payload_path(tier, key), payload)?;
        let entry = CacheEntry {
            key: key.hash.clone(),
            tier,
            identity: key.identity.clone(),
            created_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            payload_file: format!("{}.bin", key.hash),
            payload_sha256: fsio::sha256_bytes(payload),
            size_bytes: payload.len() as u64,
        };
        fsio::atomic_write_json(&self.entry_path(tier, key), &entry)?;
        Ok(true)
    }
}

/// Read-only curated dataset, e.g. bundled language metadata used when the
/// remote source is absent or rate-limited.
///
/// Looks for `<root>/<tier>/<key>.bin`, then `<root>/<tier>/<content>.bin`,
/// then `<root>/<tier>/<content>` for files kept under their own name.
pub struct CuratedDataset {
    root: PathBuf,
}

impl CuratedDataset {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn candidates(&self, tier: CacheTier, key: &CacheKey) -> Vec<PathBuf> {
        let dir = self.root.join(tier.dir_name());
        let mut paths = vec![dir.join(format!("{}.bin", key.hash))];
        let content = sanitize_file_stem(&key.identity.content);
        if !content.is_empty() {
            paths.push(dir.join(format!("{content}.bin")));
            paths.push(dir.join(content));
        }
        paths
    }

    /// First existing candidate file for `key`.
    pub fn locate(&self, tier: CacheTier, key: &CacheKey) -> Option<PathBuf> {
        self.candidates(tier, key).into_iter().find(|path| path.is_file())
    }
}

impl Fetcher for CuratedDataset {
    fn name(&self) -> &'static str {
        "curated"
    }

    fn fetch(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        _ttl: Duration,
    ) -> PipelineResult<Option<Vec<u8>>> {
        match self.locate(tier, key) {
            Some(path) => Ok(Some(fs::read(path)?)),
            None => Ok(None),
        }
    }
}

fn sanitize_file_stem(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

pub(crate) fn is_older_than(
    created_at: chrono::DateTime<Utc>,
    ttl: Duration,
    now: chrono::DateTime<Utc>,
) -> bool {
    let age = now.signed_duration_since(created_at);
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => age > ttl,
        // TTL too large to represent: never expires.
        Err(_) => false,
    }
}
