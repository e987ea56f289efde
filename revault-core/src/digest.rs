//! Content digest cache
//!
//! Maps `(archive, revision)` to the SHA-256 of the revision's content. A
//! miss fetches the revision into the scratch directory and hashes it.
//!
//! The cache is persisted as a bincode snapshot. Writes are debounced: every
//! mutation cancels the pending save task and schedules a new one after
//! `digest_save_delay_ms`, so a burst of mutations costs a single write.

use crate::archive::{GetRevisionArgs, RevisionSelector};
use crate::config::EngineConfig;
use crate::controller::ArchiveAccessController;
use crate::error::{ArchiveError, Result};
use crate::listener::{ArchiveAction, ArchiveEvent, ArchiveListener};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SNAPSHOT_VERSION: u32 = 1;

/// SHA-256 of a revision's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Digest of a file's content, read in a streaming fashion.
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(Self(hasher.finalize().into()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DigestKey {
    pub archive: PathBuf,
    pub revision: String,
}

#[derive(Serialize, Deserialize)]
struct DigestSnapshot {
    version: u32,
    /// Least recently used first.
    entries: Vec<(DigestKey, ContentDigest)>,
}

fn load_snapshot(path: &Path) -> Result<Vec<(DigestKey, ContentDigest)>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ArchiveError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    let snapshot: DigestSnapshot = bincode::deserialize(&data)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(ArchiveError::Serialization(format!(
            "unsupported digest snapshot version {}",
            snapshot.version
        )));
    }
    Ok(snapshot.entries)
}

pub struct DigestCache {
    me: Weak<DigestCache>,
    entries: Mutex<LruCache<DigestKey, ContentDigest>>,
    /// Pending save task; guarded separately so cancel-and-reschedule is atomic.
    pending: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
    scratch_dir: PathBuf,
    snapshot_path: PathBuf,
    save_delay: Duration,
    dirty: AtomicBool,
    snapshot_writes: AtomicU64,
}

impl DigestCache {
    /// Open the cache, loading the snapshot if it is readable.
    ///
    /// Must be called from within a tokio runtime; debounced saves run on it.
    /// A missing or unreadable snapshot yields an empty cache, which is
    /// written out immediately.
    pub fn open(config: &EngineConfig) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| ArchiveError::Config(format!("digest cache needs a tokio runtime: {}", e)))?;
        let capacity = NonZeroUsize::new(config.digest_capacity)
            .ok_or_else(|| ArchiveError::Config("digest_capacity must be positive".to_string()))?;

        let mut entries = LruCache::new(capacity);
        let loaded = match load_snapshot(&config.digest_snapshot_path) {
            Ok(list) => {
                debug!("Loaded {} digests from {:?}", list.len(), config.digest_snapshot_path);
                for (key, digest) in list {
                    entries.put(key, digest);
                }
                true
            }
            Err(ArchiveError::NotFound(path)) => {
                info!("No digest snapshot at {:?}, starting empty", path);
                false
            }
            Err(e) => {
                warn!(
                    "Unreadable digest snapshot {:?}, starting empty: {}",
                    config.digest_snapshot_path, e
                );
                false
            }
        };

        let cache = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            entries: Mutex::new(entries),
            pending: Mutex::new(None),
            runtime,
            scratch_dir: config.scratch_dir.clone(),
            snapshot_path: config.digest_snapshot_path.clone(),
            save_delay: config.digest_save_delay(),
            dirty: AtomicBool::new(false),
            snapshot_writes: AtomicU64::new(0),
        });
        if !loaded {
            cache.write_snapshot()?;
        }
        Ok(cache)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of snapshot files written by this instance.
    pub fn snapshot_writes(&self) -> u64 {
        self.snapshot_writes.load(Ordering::SeqCst)
    }

    pub fn get(&self, archive: &Path, revision: &str) -> Option<ContentDigest> {
        let key = DigestKey {
            archive: archive.to_path_buf(),
            revision: revision.to_string(),
        };
        self.entries.lock().get(&key).copied()
    }

    pub fn insert(&self, archive: &Path, revision: &str, digest: ContentDigest) {
        let key = DigestKey {
            archive: archive.to_path_buf(),
            revision: revision.to_string(),
        };
        self.entries.lock().put(key, digest);
        self.schedule_save();
    }

    /// Digest of `revision` in the archive behind `controller`, computing and
    /// caching it on a miss. `None` when the revision cannot be fetched.
    pub fn digest(
        &self,
        controller: &ArchiveAccessController,
        revision: &str,
    ) -> Result<Option<ContentDigest>> {
        let archive = controller.path();
        if let Some(digest) = self.get(&archive, revision) {
            return Ok(Some(digest));
        }

        fs::create_dir_all(&self.scratch_dir)?;
        let scratch = self.scratch_dir.join(format!("{}.digest", Uuid::new_v4()));
        let mut args = GetRevisionArgs::new(RevisionSelector::Revision(revision.to_string()));
        let computed = match controller.get_revision(&mut args, &scratch) {
            Ok(true) => ContentDigest::of_file(&scratch)
                .map(Some)
                .map_err(ArchiveError::from),
            Ok(false) => {
                debug!(
                    "No digest for {} of {:?}: {}",
                    revision,
                    archive,
                    args.failure_reason.unwrap_or_default()
                );
                Ok(None)
            }
            Err(e) => Err(e),
        };
        let _ = fs::remove_file(&scratch);

        let digest = computed?;
        if let Some(digest) = digest {
            self.insert(&archive, revision, digest);
        }
        Ok(digest)
    }

    /// Drop every digest of `archive`. Returns how many were removed.
    pub fn remove_archive(&self, archive: &Path) -> usize {
        let removed = {
            let mut entries = self.entries.lock();
            let keys: Vec<DigestKey> = entries
                .iter()
                .filter(|(k, _)| k.archive == archive)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                entries.pop(key);
            }
            keys.len()
        };
        if removed > 0 {
            self.schedule_save();
        }
        removed
    }

    fn schedule_save(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        let mut pending = self.pending.lock();
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        let me = self.me.clone();
        let delay = self.save_delay;
        *pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(cache) = me.upgrade() else {
                return;
            };
            match tokio::task::spawn_blocking(move || cache.save_if_dirty()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to write digest snapshot: {}", e),
                Err(e) => warn!("Digest snapshot task failed: {}", e),
            }
        }));
    }

    fn save_if_dirty(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.write_snapshot().inspect_err(|_| {
            self.dirty.store(true, Ordering::SeqCst);
        })
    }

    /// Cancel the pending save and write now if anything changed.
    pub fn flush(&self) -> Result<()> {
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
        self.save_if_dirty()
    }

    fn write_snapshot(&self) -> Result<()> {
        let entries: Vec<(DigestKey, ContentDigest)> = {
            let cache = self.entries.lock();
            cache.iter().rev().map(|(k, v)| (k.clone(), *v)).collect()
        };
        let count = entries.len();
        let data = bincode::serialize(&DigestSnapshot {
            version: SNAPSHOT_VERSION,
            entries,
        })?;

        if let Some(parent) = self.snapshot_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.snapshot_path.with_extension("tmp");
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &self.snapshot_path)?;

        self.snapshot_writes.fetch_add(1, Ordering::SeqCst);
        info!("Wrote {} digests to {:?}", count, self.snapshot_path);
        Ok(())
    }
}

/// Drops digests of archives that were removed, renamed or moved.
impl ArchiveListener for DigestCache {
    fn notify(&self, event: &ArchiveEvent) -> anyhow::Result<()> {
        match event.action {
            ArchiveAction::Remove { .. }
            | ArchiveAction::Rename { .. }
            | ArchiveAction::MoveFile { .. } => {
                let removed = self.remove_archive(&event.archive);
                debug!("Invalidated {} digests of {:?}", removed, event.archive);
            }
            _ => {}
        }
        Ok(())
    }
}

impl Drop for DigestCache {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::CheckInArgs;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> EngineConfig {
        let mut config = EngineConfig::rooted_at(tmp.path());
        config.digest_save_delay_ms = 50;
        config
    }

    #[test]
    fn test_hex_roundtrip() {
        let d = ContentDigest::of(b"A");
        assert_eq!(ContentDigest::from_hex(&d.to_hex()).unwrap(), d);
        assert!(ContentDigest::from_hex("abcd").is_err());
        assert_eq!(d.to_string().len(), 64);
    }

    #[test]
    fn test_open_requires_runtime() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            DigestCache::open(&config(&tmp)),
            Err(ArchiveError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_burst_is_written_once() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let cache = DigestCache::open(&config).unwrap();
        // Missing snapshot is written immediately.
        assert_eq!(cache.snapshot_writes(), 1);

        for i in 0..20 {
            cache.insert(
                Path::new("foo.txt"),
                &format!("1.{}", i),
                ContentDigest::of(format!("{}", i).as_bytes()),
            );
        }
        assert_eq!(cache.snapshot_writes(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(cache.snapshot_writes(), 2);

        let reopened = DigestCache::open(&config).unwrap();
        assert_eq!(reopened.len(), 20);
        assert_eq!(reopened.snapshot_writes(), 0);
        assert_eq!(
            reopened.get(Path::new("foo.txt"), "1.7"),
            Some(ContentDigest::of(b"7"))
        );
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        fs::write(&config.digest_snapshot_path, b"not a snapshot").unwrap();

        let cache = DigestCache::open(&config).unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.snapshot_writes(), 1);
        assert!(load_snapshot(&config.digest_snapshot_path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_digest_miss_fetches_and_hashes() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let controller = ArchiveAccessController::new(tmp.path().join("foo.txt"), &config);
        controller
            .check_in_content(&mut CheckInArgs::new("alice", "init"), b"A", false)
            .unwrap();

        let cache = DigestCache::open(&config).unwrap();
        let digest = cache.digest(&controller, "1.0").unwrap();
        assert_eq!(digest, Some(ContentDigest::of(b"A")));
        assert_eq!(cache.len(), 1);
        assert_eq!(fs::read_dir(&config.scratch_dir).unwrap().count(), 0);

        assert_eq!(cache.digest(&controller, "1.5").unwrap(), None);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.remove_archive(&controller.path()), 1);
        assert!(cache.is_empty());
        cache.flush().unwrap();
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(&tmp);
        config.digest_capacity = 2;
        let cache = DigestCache::open(&config).unwrap();
        for rev in ["1.0", "1.1", "1.2"] {
            cache.insert(Path::new("foo.txt"), rev, ContentDigest::of(rev.as_bytes()));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(Path::new("foo.txt"), "1.0").is_none());
    }

    #[tokio::test]
    async fn test_flush_writes_pending_changes() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(&tmp);
        config.digest_save_delay_ms = 60_000;
        let cache = DigestCache::open(&config).unwrap();
        cache.insert(Path::new("foo.txt"), "1.0", ContentDigest::of(b"A"));
        cache.flush().unwrap();
        assert_eq!(cache.snapshot_writes(), 2);
        cache.flush().unwrap();
        assert_eq!(cache.snapshot_writes(), 2);
    }

    #[tokio::test]
    async fn test_archive_events_invalidate_digests() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let controller = ArchiveAccessController::new(tmp.path().join("foo.txt"), &config);
        controller
            .check_in_content(&mut CheckInArgs::new("alice", "init"), b"A", false)
            .unwrap();

        let cache = DigestCache::open(&config).unwrap();
        controller.add_listener(cache.clone());
        cache.digest(&controller, "1.0").unwrap();
        cache.insert(Path::new("other.txt"), "1.0", ContentDigest::of(b"B"));
        assert_eq!(cache.len(), 2);

        let mut args = crate::archive::EditArgs::new("alice");
        assert!(controller.rename_archive(&mut args, "bar.txt").unwrap());
        assert_eq!(cache.len(), 1);
        assert!(cache.get(Path::new("other.txt"), "1.0").is_some());
        cache.flush().unwrap();
    }
}
