//! Tiered, content-addressed cache shared by every job on the host.
//!
//! [`CacheManager::get_or_fetch`] walks an ordered chain of [`Fetcher`]s
//! (memory, disk, curated dataset) and stops at the first hit. On a full miss
//! the caller's fetch function runs and its result is written back into the
//! writable tiers. Expired entries read as misses but stay on disk until
//! [`CacheManager::evict_expired`] runs.

mod fetcher;

pub use fetcher::{CuratedDataset, DiskTier, Fetcher, MemoryTier};

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::JobSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::fsio::{self, FileLock};

/// How long [`CacheManager::update`] waits for a concurrent writer.
const UPDATE_LOCK_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Model,
    Fingerprint,
    InferenceResult,
    DerivedText,
    /// Outcome history the predictor learns from.
    History,
}

impl CacheTier {
    pub const ALL: [CacheTier; 5] = [
        CacheTier::Model,
        CacheTier::Fingerprint,
        CacheTier::InferenceResult,
        CacheTier::DerivedText,
        CacheTier::History,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            CacheTier::Model => "model",
            CacheTier::Fingerprint => "fingerprint",
            CacheTier::InferenceResult => "inference_result",
            CacheTier::DerivedText => "derived_text",
            CacheTier::History => "history",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// The parts a cache key is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIdentity {
    pub content: String,
    pub model_version: String,
    pub params: BTreeMap<String, String>,
}

impl KeyIdentity {
    pub fn digest(&self) -> PipelineResult<String> {
        fsio::sha256_json(self)
    }
}

/// Deterministic key: SHA-256 over (content identity, model version, params).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub hash: String,
    pub identity: KeyIdentity,
}

impl CacheKey {
    pub fn derive(
        content: impl Into<String>,
        model_version: impl Into<String>,
        params: &BTreeMap<String, String>,
    ) -> PipelineResult<Self> {
        let identity = KeyIdentity {
            content: content.into(),
            model_version: model_version.into(),
            params: params.clone(),
        };
        Ok(Self {
            hash: identity.digest()?,
            identity,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

/// On-disk metadata for one cached payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub tier: CacheTier,
    pub identity: KeyIdentity,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub payload_file: String,
    pub payload_sha256: String,
    pub size_bytes: u64,
}

impl CacheEntry {
    /// The stored key must equal both the requested key and the key
    /// re-derived from the stored identity.
    pub fn verify_key(&self, requested: &CacheKey) -> PipelineResult<()> {
        if self.key != requested.hash {
            return Err(PipelineError::CacheKeyMismatch {
                expected: requested.hash.clone(),
                found: self.key.clone(),
            });
        }
        let recomputed = self.identity.digest()?;
        if recomputed != self.key {
            return Err(PipelineError::CacheKeyMismatch {
                expected: recomputed,
                found: self.key.clone(),
            });
        }
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        fetcher::is_older_than(self.created_at, Duration::from_secs(self.ttl_secs), now)
    }
}

/// Where a payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Tier(&'static str),
    Fetched,
}

#[derive(Debug, Clone)]
pub struct Lookup {
    pub payload: Vec<u8>,
    pub source: CacheSource,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self.source, CacheSource::Tier(_))
    }
}

/// A payload resolved to a file rather than loaded into memory.
#[derive(Debug, Clone)]
pub struct FileLookup {
    pub path: PathBuf,
    pub source: CacheSource,
}

/// Result of an explicit eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub scanned: u64,
    pub removed: u64,
    pub bytes_reclaimed: u64,
}

pub struct CacheManager {
    chain: Vec<Arc<dyn Fetcher>>,
    memory: Arc<MemoryTier>,
    disk: Arc<DiskTier>,
    curated: Option<Arc<CuratedDataset>>,
}

impl CacheManager {
    /// Memory, then disk at `root`, then the optional curated dataset.
    pub fn new(root: impl Into<PathBuf>, memory_capacity: usize, curated: Option<PathBuf>) -> Self {
        let memory = Arc::new(MemoryTier::new(memory_capacity));
        let disk = Arc::new(DiskTier::new(root));
        let curated = curated.map(|root| Arc::new(CuratedDataset::new(root)));
        let mut chain: Vec<Arc<dyn Fetcher>> = vec![memory.clone(), disk.clone()];
        if let Some(curated) = &curated {
            chain.push(curated.clone());
        }
        Self {
            chain,
            memory,
            disk,
            curated,
        }
    }

    pub fn from_settings(settings: &JobSettings) -> Self {
        Self::new(
            settings.cache_root.clone(),
            settings.memory_capacity,
            settings.curated_root.clone(),
        )
    }

    /// Appends a strategy after the built-in tiers.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.chain.push(fetcher);
        self
    }

    pub fn root(&self) -> PathBuf {
        self.disk.root().to_path_buf()
    }

    /// Directory stage programs use for model weights.
    pub fn model_dir(&self) -> PathBuf {
        self.disk.root().join(CacheTier::Model.dir_name())
    }

    /// Directory stage programs use for intermediate results.
    pub fn intermediate_dir(&self) -> PathBuf {
        self.disk.root().join(CacheTier::InferenceResult.dir_name())
    }

    /// Entries currently held by the in-process tier.
    pub fn memory_entries(&self) -> usize {
        self.memory.len()
    }

    /// Disk location of a cached payload, if one is stored.
    pub fn payload_path(&self, tier: CacheTier, key: &CacheKey) -> Option<PathBuf> {
        let path = self.disk.payload_path(tier, key);
        path.is_file().then_some(path)
    }

    /// Tier-only lookup; never fetches.
    pub fn get(&self, tier: CacheTier, key: &CacheKey, ttl: Duration) -> PipelineResult<Option<Lookup>> {
        for (idx, fetcher) in self.chain.iter().enumerate() {
            match fetcher.fetch(tier, key, ttl) {
                Ok(Some(payload)) => {
                    debug!(tier = %tier, key = %key.hash, source = fetcher.name(), "cache hit");
                    self.promote(idx, tier, key, &payload, ttl);
                    return Ok(Some(Lookup {
                        payload,
                        source: CacheSource::Tier(fetcher.name()),
                    }));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(tier = %tier, source = fetcher.name(), error = %err, "cache tier failed, trying next");
                }
            }
        }
        Ok(None)
    }

    /// Cascading lookup; `fetch` only runs when every tier misses.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        ttl: Duration,
        fetch: F,
    ) -> PipelineResult<Lookup>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<Vec<u8>>>,
    {
        if let Some(hit) = self.get(tier, key, ttl)? {
            return Ok(hit);
        }
        debug!(tier = %tier, key = %key.hash, "cache miss, fetching");
        let payload = fetch().await?;
        self.put(tier, key, &payload, ttl)?;
        Ok(Lookup {
            payload,
            source: CacheSource::Fetched,
        })
    }

    /// File-backed variant of [`get_or_fetch`](Self::get_or_fetch) for large
    /// payloads such as model weights. Disk and curated hits are returned as
    /// paths; on a miss `download` writes into a staging file that is then
    /// moved into the disk tier. The memory tier is bypassed throughout.
    pub async fn get_or_fetch_file<F, Fut>(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        ttl: Duration,
        download: F,
    ) -> PipelineResult<FileLookup>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = PipelineResult<()>>,
    {
        match self.disk.file_hit(tier, key, ttl) {
            Ok(Some(path)) => {
                debug!(tier = %tier, key = %key.hash, source = "disk", "cache hit");
                return Ok(FileLookup {
                    path,
                    source: CacheSource::Tier("disk"),
                });
            }
            Ok(None) => {}
            Err(err) => warn!(tier = %tier, source = "disk", error = %err, "cache tier failed, trying next"),
        }
        if let Some(path) = self.curated.as_ref().and_then(|c| c.locate(tier, key)) {
            debug!(tier = %tier, key = %key.hash, source = "curated", "cache hit");
            return Ok(FileLookup {
                path,
                source: CacheSource::Tier("curated"),
            });
        }

        debug!(tier = %tier, key = %key.hash, "cache miss, downloading");
        let staging = self.disk.staging_path(tier, key)?;
        if let Err(err) = download(staging.clone()).await {
            discard_staging(&staging);
            return Err(err);
        }
        match self.disk.install(tier, key, &staging, ttl) {
            Ok(path) => Ok(FileLookup {
                path,
                source: CacheSource::Fetched,
            }),
            Err(err) => {
                discard_staging(&staging);
                Err(err)
            }
        }
    }

    /// Read-modify-write of one entry under an exclusive lock, so concurrent
    /// writers (threads or processes sharing the root) never drop each
    /// other's updates. `apply` sees the current disk payload, if any.
    pub fn update<F>(&self, tier: CacheTier, key: &CacheKey, ttl: Duration, apply: F) -> PipelineResult<()>
    where
        F: FnOnce(Option<Vec<u8>>) -> PipelineResult<Vec<u8>>,
    {
        let _lock = FileLock::acquire(&self.lock_path(tier, key), UPDATE_LOCK_WAIT)?;
        let current = self.disk.fetch(tier, key, ttl)?;
        let next = apply(current)?;
        self.put(tier, key, &next, ttl)
    }

    /// Disk-only read. Use for entries other processes may rewrite, where
    /// the memory tier could be stale.
    pub fn get_persistent(&self, tier: CacheTier, key: &CacheKey, ttl: Duration) -> PipelineResult<Option<Vec<u8>>> {
        self.disk.fetch(tier, key, ttl)
    }

    fn lock_path(&self, tier: CacheTier, key: &CacheKey) -> PathBuf {
        self.disk
            .root()
            .join("locks")
            .join(format!("{}-{}.lock", tier.dir_name(), key.hash))
    }

    /// JSON convenience wrapper around [`get_or_fetch`](Self::get_or_fetch).
    pub async fn get_or_fetch_json<T, F, Fut>(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        ttl: Duration,
        fetch: F,
    ) -> PipelineResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let lookup = self
            .get_or_fetch(tier, key, ttl, move || async move {
                let value = fetch().await?;
                Ok(serde_json::to_vec(&value)?)
            })
            .await?;
        Ok(serde_json::from_slice(&lookup.payload)?)
    }

    /// Writes into every writable tier.
    pub fn put(&self, tier: CacheTier, key: &CacheKey, payload: &[u8], ttl: Duration) -> PipelineResult<()> {
        for fetcher in &self.chain {
            fetcher.store(tier, key, payload, ttl)?;
        }
        Ok(())
    }

    // A hit in a later tier is copied into the writable tiers before it.
    fn promote(&self, hit_idx: usize, tier: CacheTier, key: &CacheKey, payload: &[u8], ttl: Duration) {
        for fetcher in &self.chain[..hit_idx] {
            if let Err(err) = fetcher.store(tier, key, payload, ttl) {
                warn!(tier = %tier, source = fetcher.name(), error = %err, "cache promotion failed");
            }
        }
    }

    /// Removes every disk entry older than its own TTL.
    pub fn evict_expired(&self) -> PipelineResult<EvictionReport> {
        let mut report = EvictionReport::default();
        let now = Utc::now();
        for tier in CacheTier::ALL {
            let tier_dir = self.disk.root().join(tier.dir_name());
            for path in fsio::list_files(&tier_dir)? {
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                report.scanned += 1;
                let entry = match read_entry_file(&path) {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "unreadable cache entry skipped");
                        continue;
                    }
                };
                if !entry.is_expired(now) {
                    continue;
                }
                let payload = path.with_file_name(&entry.payload_file);
                let mut reclaimed = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                if let Ok(meta) = fs::metadata(&payload) {
                    reclaimed += meta.len();
                    fs::remove_file(&payload)?;
                }
                fs::remove_file(&path)?;
                report.removed += 1;
                report.bytes_reclaimed += reclaimed;
            }
        }
        let purged = self.memory.purge_expired();
        info!(
            scanned = report.scanned,
            removed = report.removed,
            bytes = report.bytes_reclaimed,
            memory_purged = purged,
            "cache eviction finished"
        );
        Ok(report)
    }
}

fn read_entry_file(path: &Path) -> PipelineResult<CacheEntry> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

fn discard_staging(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove staging file");
        }
    }
}
