// Artifact & Cache Store
// Immutable per-job artifacts with expiry, plus layered caches shared across pipelines

pub mod backend;
pub mod bundle;

pub use backend::{default_store_dir, BlobBackend, FsBackend, MemoryBackend};
pub use bundle::{digest, Bundle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Error types for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Artifact already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid store path: {0}")]
    InvalidPath(String),

    #[error("Invalid artifact pattern: {0}")]
    InvalidPattern(String),

    #[error("Digest mismatch for {key}: expected {expected}, found {actual}")]
    Corrupted {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// What an artifact blob contains
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "report")]
pub enum ArtifactKind {
    /// Files declared under `artifacts.paths`
    Generic,
    /// A declared report (`junit`, `dotenv`, ...)
    Report(String),
    /// The `coverage_report` report
    Coverage,
    /// Job trace (stdout followed by stderr)
    Trace,
}

impl ArtifactKind {
    /// Suffix used in store keys
    pub fn key_suffix(&self) -> String {
        match self {
            ArtifactKind::Generic => "artifacts".to_string(),
            ArtifactKind::Report(kind) => format!("report-{}", kind),
            ArtifactKind::Coverage => "coverage".to_string(),
            ArtifactKind::Trace => "trace".to_string(),
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Generic => write!(f, "artifacts"),
            ArtifactKind::Report(kind) => write!(f, "report:{}", kind),
            ArtifactKind::Coverage => write!(f, "coverage"),
            ArtifactKind::Trace => write!(f, "trace"),
        }
    }
}

/// The JobRun that wrote an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Producer {
    pub pipeline_id: String,
    pub job: String,
}

impl Producer {
    pub fn new(pipeline_id: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            job: job.into(),
        }
    }

    /// Store key for one of this producer's artifacts
    pub fn artifact_key(&self, kind: &ArtifactKind) -> String {
        artifact_key(&self.pipeline_id, &self.job, kind)
    }
}

/// Artifact metadata kept in the store index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub key: String,
    pub kind: ArtifactKind,
    pub producer: Producer,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// SHA-256 of the blob, lowercase hex
    pub digest: String,
    pub size: usize,
}

impl ArtifactMeta {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A stored artifact with its blob
#[derive(Debug, Clone)]
pub struct Artifact {
    pub meta: ArtifactMeta,
    pub blob: Vec<u8>,
}

impl Artifact {
    /// Decode the blob as a file bundle
    pub fn bundle(&self) -> Result<Bundle, StoreError> {
        Bundle::from_tar(&self.blob)
    }
}

/// Result of a cache merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub files: usize,
    pub digest: String,
}

/// Store key for a job's artifact of the given kind: `{pipeline}/{job}/{kind}`
pub fn artifact_key(pipeline_id: &str, job: &str, kind: &ArtifactKind) -> String {
    format!(
        "{}/{}/{}",
        sanitize_segment(pipeline_id),
        sanitize_segment(job),
        kind.key_suffix()
    )
}

fn cache_blob_key(key: &str) -> String {
    format!("cache/{}", sanitize_segment(key))
}

/// Escape a user-supplied name into one path segment. `%` and both path
/// separators are percent-encoded so distinct names never share a segment.
fn sanitize_segment(segment: &str) -> String {
    match segment {
        "" => "%".to_string(),
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        _ => {
            let mut escaped = String::with_capacity(segment.len());
            for c in segment.chars() {
                match c {
                    '%' => escaped.push_str("%25"),
                    '/' => escaped.push_str("%2F"),
                    '\\' => escaped.push_str("%5C"),
                    _ => escaped.push(c),
                }
            }
            escaped
        }
    }
}

/// Artifact and cache store shared by every job of a pipeline run.
///
/// Artifacts are immutable once written and addressed by
/// `{pipeline}/{job}/{kind}`. Caches are addressed by their stable cache key
/// and survive across pipelines; concurrent merges into one key are
/// serialized while merges into different keys proceed in parallel.
#[derive(Clone)]
pub struct ArtifactStore {
    backend: Arc<dyn BlobBackend>,
    index: Arc<RwLock<HashMap<String, ArtifactMeta>>>,
    cache_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("backend", &self.backend.describe())
            .finish_non_exhaustive()
    }
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ArtifactStore {
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self {
            backend,
            index: Arc::new(RwLock::new(HashMap::new())),
            cache_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Store rooted at a directory on disk
    pub fn on_disk(root: impl Into<std::path::PathBuf>) -> Self {
        Self::new(Arc::new(FsBackend::with_root(root)))
    }

    pub fn backend(&self) -> &Arc<dyn BlobBackend> {
        &self.backend
    }

    /// Write an artifact. Keys are write-once.
    pub async fn put(
        &self,
        key: &str,
        blob: Vec<u8>,
        kind: ArtifactKind,
        producer: Producer,
        expiry: Option<Duration>,
    ) -> Result<ArtifactMeta, StoreError> {
        // Hold the index write lock across the blob write so two writers of
        // the same key cannot both pass the existence check.
        let mut index = self.index.write().await;
        if index.contains_key(key) || self.backend.exists(key).await? {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }

        self.backend.write(key, &blob).await?;

        let created_at = Utc::now();
        let expires_at = expiry
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .and_then(|d| created_at.checked_add_signed(d));

        let meta = ArtifactMeta {
            key: key.to_string(),
            kind,
            producer,
            created_at,
            expires_at,
            digest: digest(&blob),
            size: blob.len(),
        };
        index.insert(key.to_string(), meta.clone());

        debug!(key, size = meta.size, kind = %meta.kind, "stored artifact");
        Ok(meta)
    }

    /// Read an artifact. Expired artifacts are reported as `NotFound`.
    pub async fn get(&self, key: &str) -> Result<Artifact, StoreError> {
        let meta = {
            let index = self.index.read().await;
            index
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?
        };

        if meta.is_expired(Utc::now()) {
            return Err(StoreError::NotFound(key.to_string()));
        }

        let blob = self.backend.read(key).await?;
        let actual = digest(&blob);
        if actual != meta.digest {
            return Err(StoreError::Corrupted {
                key: key.to_string(),
                expected: meta.digest,
                actual,
            });
        }

        Ok(Artifact { meta, blob })
    }

    /// Metadata for an artifact, expired or not
    pub async fn meta(&self, key: &str) -> Option<ArtifactMeta> {
        self.index.read().await.get(key).cloned()
    }

    /// All live artifacts whose key starts with `prefix`, ordered by key
    pub async fn list(&self, prefix: &str) -> Vec<ArtifactMeta> {
        let now = Utc::now();
        let index = self.index.read().await;
        let mut metas: Vec<ArtifactMeta> = index
            .values()
            .filter(|m| m.key.starts_with(prefix) && !m.is_expired(now))
            .cloned()
            .collect();
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        metas
    }

    /// Remove every artifact that expired at or before `now`.
    ///
    /// Returns the removed keys in sorted order.
    pub async fn invalidate_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let mut index = self.index.write().await;
        let mut expired: Vec<String> = index
            .values()
            .filter(|m| m.is_expired(now))
            .map(|m| m.key.clone())
            .collect();
        expired.sort();

        for key in &expired {
            self.backend.delete(key).await?;
            index.remove(key);
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "removed expired artifacts");
        }
        Ok(expired)
    }

    /// Lay `bundle` over the cache stored under `key`.
    ///
    /// Files of `bundle` replace files at the same path; other cached files
    /// are kept. With `reset` the cache is replaced by `bundle` entirely.
    pub async fn merge_cache(
        &self,
        key: &str,
        bundle: Bundle,
        reset: bool,
    ) -> Result<CacheEntry, StoreError> {
        let lock = self.cache_lock(key).await;
        let _guard = lock.lock().await;

        let blob_key = cache_blob_key(key);
        let merged = if reset {
            bundle
        } else {
            let mut current = self.read_cache(&blob_key).await?.unwrap_or_default();
            current.overlay(bundle);
            current
        };

        let blob = merged.to_tar()?;
        self.backend.write(&blob_key, &blob).await?;

        let entry = CacheEntry {
            key: key.to_string(),
            files: merged.len(),
            digest: digest(&blob),
        };
        debug!(key, files = entry.files, reset, "merged cache");
        Ok(entry)
    }

    /// Current content of a cache, `None` when nothing was cached under `key`
    pub async fn get_cache(&self, key: &str) -> Result<Option<Bundle>, StoreError> {
        let lock = self.cache_lock(key).await;
        let _guard = lock.lock().await;
        self.read_cache(&cache_blob_key(key)).await
    }

    async fn read_cache(&self, blob_key: &str) -> Result<Option<Bundle>, StoreError> {
        match self.backend.read(blob_key).await {
            Ok(blob) => Ok(Some(Bundle::from_tar(&blob)?)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn cache_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.cache_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn producer() -> Producer {
        Producer::new("p1", "build")
    }

    fn bundle(files: &[(&str, &str)]) -> Bundle {
        let mut b = Bundle::new();
        for (path, content) in files {
            b.insert(*path, *content);
        }
        b
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = ArtifactStore::in_memory();
        let key = artifact_key("p1", "build", &ArtifactKind::Generic);
        assert_eq!(key, "p1/build/artifacts");

        let meta = store
            .put(&key, b"blob".to_vec(), ArtifactKind::Generic, producer(), None)
            .await
            .unwrap();
        assert_eq!(meta.size, 4);
        assert_eq!(meta.digest, digest(b"blob"));
        assert!(meta.expires_at.is_none());

        let artifact = store.get(&key).await.unwrap();
        assert_eq!(artifact.blob, b"blob");
        assert_eq!(artifact.meta.producer.job, "build");
    }

    #[tokio::test]
    async fn test_put_is_write_once() {
        let store = ArtifactStore::in_memory();
        store
            .put("p1/build/trace", b"a".to_vec(), ArtifactKind::Trace, producer(), None)
            .await
            .unwrap();

        let err = store
            .put("p1/build/trace", b"b".to_vec(), ArtifactKind::Trace, producer(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.get("p1/build/trace").await.unwrap().blob, b"a");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = ArtifactStore::in_memory();
        let err = store.get("p1/nope/artifacts").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_expired_artifacts() {
        let store = ArtifactStore::in_memory();
        store
            .put(
                "p1/build/artifacts",
                b"x".to_vec(),
                ArtifactKind::Generic,
                producer(),
                Some(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        store
            .put("p1/build/trace", b"t".to_vec(), ArtifactKind::Trace, producer(), None)
            .await
            .unwrap();

        let removed = store
            .invalidate_expired(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, vec!["p1/build/artifacts".to_string()]);

        let err = store.get("p1/build/artifacts").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.get("p1/build/trace").await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_expiry_reads_as_not_found() {
        let store = ArtifactStore::in_memory();
        store
            .put(
                "p1/build/artifacts",
                b"x".to_vec(),
                ArtifactKind::Generic,
                producer(),
                Some(Duration::ZERO),
            )
            .await
            .unwrap();

        let err = store.get("p1/build/artifacts").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.list("p1/").await.is_empty());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = ArtifactStore::in_memory();
        for job in ["build", "lint"] {
            let key = artifact_key("p1", job, &ArtifactKind::Trace);
            store
                .put(&key, Vec::new(), ArtifactKind::Trace, Producer::new("p1", job), None)
                .await
                .unwrap();
        }
        store
            .put("p2/build/trace", Vec::new(), ArtifactKind::Trace, producer(), None)
            .await
            .unwrap();

        let keys: Vec<String> = store.list("p1/").await.into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["p1/build/trace", "p1/lint/trace"]);
    }

    #[tokio::test]
    async fn test_cache_merge_layers_files() {
        let store = ArtifactStore::in_memory();
        assert!(store.get_cache("deps").await.unwrap().is_none());

        store
            .merge_cache("deps", bundle(&[("a", "1"), ("b", "1")]), false)
            .await
            .unwrap();
        let entry = store
            .merge_cache("deps", bundle(&[("b", "2"), ("c", "2")]), false)
            .await
            .unwrap();
        assert_eq!(entry.files, 3);

        let cached = store.get_cache("deps").await.unwrap().unwrap();
        assert_eq!(cached.get("a"), Some(&b"1"[..]));
        assert_eq!(cached.get("b"), Some(&b"2"[..]));
        assert_eq!(cached.get("c"), Some(&b"2"[..]));
    }

    #[tokio::test]
    async fn test_cache_reset_replaces() {
        let store = ArtifactStore::in_memory();
        store
            .merge_cache("deps", bundle(&[("a", "1")]), false)
            .await
            .unwrap();
        store
            .merge_cache("deps", bundle(&[("b", "1")]), true)
            .await
            .unwrap();

        let cached = store.get_cache("deps").await.unwrap().unwrap();
        assert_eq!(cached.paths().collect::<Vec<_>>(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_concurrent_cache_merges() {
        let store = ArtifactStore::in_memory();
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut b = Bundle::new();
                b.insert(format!("file-{}", i), "x");
                store.merge_cache("shared", b, false).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let cached = store.get_cache("shared").await.unwrap().unwrap();
        assert_eq!(cached.len(), 8);
    }

    #[tokio::test]
    async fn test_cache_keys_with_slashes_stay_inside_store() {
        let temp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::on_disk(temp.path());
        store
            .merge_cache("../feature/x", bundle(&[("a", "1")]), false)
            .await
            .unwrap();

        assert!(temp.path().join("cache").join("..%2Ffeature%2Fx").exists());
        assert!(store.get_cache("../feature/x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_similar_cache_keys_do_not_collide() {
        let temp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::on_disk(temp.path());

        store
            .merge_cache("feature/x", bundle(&[("slash", "1")]), false)
            .await
            .unwrap();
        store
            .merge_cache("feature_x", bundle(&[("underscore", "1")]), false)
            .await
            .unwrap();
        store
            .merge_cache("feature%2Fx", bundle(&[("percent", "1")]), false)
            .await
            .unwrap();

        let slash = store.get_cache("feature/x").await.unwrap().unwrap();
        let underscore = store.get_cache("feature_x").await.unwrap().unwrap();
        let percent = store.get_cache("feature%2Fx").await.unwrap().unwrap();
        assert_eq!(slash.paths().collect::<Vec<_>>(), vec!["slash"]);
        assert_eq!(underscore.paths().collect::<Vec<_>>(), vec!["underscore"]);
        assert_eq!(percent.paths().collect::<Vec<_>>(), vec!["percent"]);
    }

    #[test]
    fn test_sanitize_segment_escapes_separators() {
        assert_eq!(sanitize_segment("feature/x"), "feature%2Fx");
        assert_eq!(sanitize_segment("feature_x"), "feature_x");
        assert_eq!(sanitize_segment("a\\b%c"), "a%5Cb%25c");
        assert_eq!(sanitize_segment(".."), "%2E%2E");
        assert_eq!(sanitize_segment(""), "%");
    }

    fn file_set() -> impl Strategy<Value = Vec<(String, String)>> {
        prop::collection::vec(("[a-z]{1,6}", "[a-z0-9]{0,8}"), 0..6)
    }

    fn to_bundle(files: &[(String, String)], tag: &str) -> Bundle {
        let mut b = Bundle::new();
        for (path, content) in files {
            b.insert(format!("{}/{}", tag, path), content.as_str());
        }
        b
    }

    async fn merged(store: &ArtifactStore, key: &str, bundles: Vec<Bundle>) -> Bundle {
        for b in bundles {
            store.merge_cache(key, b, false).await.unwrap();
        }
        store.get_cache(key).await.unwrap().unwrap_or_default()
    }

    proptest! {
        #[test]
        fn test_cache_merge_is_commutative(a in file_set(), b in file_set()) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            // Distinct prefixes keep the two bundles free of path conflicts
            let left = to_bundle(&a, "left");
            let right = to_bundle(&b, "right");

            let (ab, ba) = rt.block_on(async {
                let store = ArtifactStore::in_memory();
                let ab = merged(&store, "ab", vec![left.clone(), right.clone()]).await;
                let ba = merged(&store, "ba", vec![right, left]).await;
                (ab, ba)
            });
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn test_cache_merge_is_idempotent(a in file_set()) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let bundle = to_bundle(&a, "deps");

            let (once, twice) = rt.block_on(async {
                let store = ArtifactStore::in_memory();
                let first = store.merge_cache("once", bundle.clone(), false).await.unwrap();
                let second = store.merge_cache("once", bundle.clone(), false).await.unwrap();
                (first, second)
            });
            prop_assert_eq!(once.digest, twice.digest);
            prop_assert_eq!(once.files, bundle.len());
        }
    }
}
