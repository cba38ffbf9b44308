//! JSON file store with atomic replace

use super::{AllocationStore, PoolSnapshot};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

/// Stores one `<pool>.json` file per pool under `<data_dir>/pools`
///
/// Writes run on the blocking pool and finish even when the caller stops
/// waiting. Writes of one pool are numbered and serialized; one that lost
/// the race against a later write is dropped instead of replacing its file.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    sequence: Arc<AtomicU64>,
    /// Number of the last write applied, per pool
    applied: Arc<DashMap<String, Arc<Mutex<u64>>>>,
}

impl FileStore {
    /// Sub-directory holding pool snapshots
    pub const POOLS_DIR: &'static str = "pools";

    /// Open (and create) the store under a data directory
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join(Self::POOLS_DIR);
        fs::create_dir_all(&dir).await.map_err(|e| {
            Error::PersistenceFailure(format!(
                "Failed to create store directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir,
            sequence: Arc::new(AtomicU64::new(0)),
            applied: Arc::new(DashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_snapshot(path: &Path) -> Result<PoolSnapshot> {
        let content = fs::read(path).await.map_err(|e| {
            Error::PersistenceFailure(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let snapshot: PoolSnapshot = serde_json::from_slice(&content).map_err(|e| {
            Error::PersistenceFailure(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        if snapshot.version > PoolSnapshot::CURRENT_VERSION {
            return Err(Error::PersistenceFailure(format!(
                "Snapshot {} has version {}, newer than supported version {}",
                path.display(),
                snapshot.version,
                PoolSnapshot::CURRENT_VERSION
            )));
        }
        Ok(snapshot)
    }

    /// Run one numbered write of a pool on the blocking pool
    async fn run_write<F>(&self, pool: &str, write: F) -> Result<()>
    where
        F: FnOnce(&Path, u64) -> Result<()> + Send + 'static,
    {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let applied = self
            .applied
            .entry(pool.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .value()
            .clone();
        let dir = self.dir.clone();
        let pool_name = pool.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut last = applied.lock();
            if *last > seq {
                return Err(Error::PersistenceFailure(format!(
                    "write {} of pool {} superseded by write {}",
                    seq, pool_name, *last
                )));
            }
            write(&dir, seq)?;
            *last = seq;
            Ok(())
        })
        .await
        .map_err(|e| Error::PersistenceFailure(format!("Store write task failed: {}", e)))?
    }
}

fn snapshot_path(dir: &Path, pool: &str) -> PathBuf {
    dir.join(format!("{}.json", pool))
}

/// Write a snapshot to a temp file of its own and rename it into place
fn replace_snapshot(dir: &Path, pool: &str, seq: u64, content: &[u8]) -> Result<()> {
    let path = snapshot_path(dir, pool);
    let temp_path = dir.join(format!("{}.json.{}.tmp", pool, seq));

    let written = std::fs::File::create(&temp_path)
        .and_then(|mut file| {
            file.write_all(content)?;
            file.sync_all()
        })
        .and_then(|()| std::fs::rename(&temp_path, &path));
    if let Err(e) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(Error::PersistenceFailure(format!(
            "Failed to write {}: {}",
            path.display(),
            e
        )));
    }
    sync_dir(dir)
}

/// Make the directory entry of a rename durable
fn sync_dir(dir: &Path) -> Result<()> {
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| Error::PersistenceFailure(format!("Failed to sync {}: {}", dir.display(), e)))
}

#[async_trait]
impl AllocationStore for FileStore {
    async fn load(&self) -> Result<Vec<PoolSnapshot>> {
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| {
            Error::PersistenceFailure(format!("Failed to list {}: {}", self.dir.display(), e))
        })?;

        let mut snapshots = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?
        {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => snapshots.push(Self::read_snapshot(&path).await?),
                Some("tmp") => {
                    // leftover of an interrupted commit; the previous snapshot is intact
                    warn!(path = %path.display(), "Removing incomplete snapshot write");
                    let _ = fs::remove_file(&path).await;
                }
                _ => {}
            }
        }

        snapshots.sort_by(|a, b| a.pool.cmp(&b.pool));
        info!(
            dir = %self.dir.display(),
            pools = snapshots.len(),
            "Loaded allocation store"
        );
        Ok(snapshots)
    }

    async fn commit(&self, snapshot: &PoolSnapshot) -> Result<()> {
        let content = serde_json::to_vec_pretty(snapshot).map_err(|e| {
            Error::PersistenceFailure(format!("Failed to serialize snapshot: {}", e))
        })?;

        let pool = snapshot.pool.clone();
        self.run_write(&snapshot.pool, move |dir, seq| {
            replace_snapshot(dir, &pool, seq, &content)
        })
        .await?;

        debug!(
            pool = %snapshot.pool,
            allocations = snapshot.allocations.len(),
            "Committed pool snapshot"
        );
        Ok(())
    }

    async fn remove(&self, pool: &str) -> Result<()> {
        let pool_name = pool.to_string();
        self.run_write(pool, move |dir, _| {
            let path = snapshot_path(dir, &pool_name);
            match std::fs::remove_file(&path) {
                Ok(()) => sync_dir(dir),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::PersistenceFailure(format!(
                    "Failed to remove {}: {}",
                    path.display(),
                    e
                ))),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Allocation, AllocationKey};
    use std::time::Duration;

    #[tokio::test]
    async fn test_commit_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let snapshot = PoolSnapshot::new("p1").with_allocation(Allocation::new(
            &AllocationKey::new("c1", "eth0"),
            "10.0.0.1".parse().unwrap(),
            None,
        ));
        store.commit(&snapshot).await.unwrap();

        let reopened = FileStore::open(dir.path()).await.unwrap();
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded, vec![snapshot]);
    }

    #[tokio::test]
    async fn test_leftover_temp_file_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.commit(&PoolSnapshot::new("p1")).await.unwrap();

        tokio::fs::write(store.dir().join("p1.json.7.tmp"), b"{ truncated")
            .await
            .unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!store.dir().join("p1.json.7.tmp").exists());
    }

    #[tokio::test]
    async fn test_abandoned_commit_never_replaces_newer_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let older = PoolSnapshot::new("p1").with_allocation(Allocation::new(
            &AllocationKey::new("c1", "eth0"),
            "10.0.0.1".parse().unwrap(),
            None,
        ));
        let newer = older.clone().with_allocation(Allocation::new(
            &AllocationKey::new("c2", "eth0"),
            "10.0.0.2".parse().unwrap(),
            None,
        ));

        // the caller gives up once the write is handed to the blocking pool
        let _ = tokio::time::timeout(Duration::ZERO, store.commit(&older)).await;
        store.commit(&newer).await.unwrap();

        assert_eq!(store.load().await.unwrap(), vec![newer]);
        let temp_files = std::fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|e| e == "tmp"))
            .count();
        assert_eq!(temp_files, 0);
    }

    #[tokio::test]
    async fn test_late_write_after_remove_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let _ = tokio::time::timeout(Duration::ZERO, store.commit(&PoolSnapshot::new("p1"))).await;
        store.remove("p1").await.unwrap();

        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        tokio::fs::write(store.dir().join("p1.json"), b"not json")
            .await
            .unwrap();

        assert!(matches!(
            store.load().await,
            Err(Error::PersistenceFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let mut snapshot = PoolSnapshot::new("p1");
        snapshot.version = PoolSnapshot::CURRENT_VERSION + 1;
        store.commit(&snapshot).await.unwrap();

        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.commit(&PoolSnapshot::new("p1")).await.unwrap();
        store.remove("p1").await.unwrap();
        store.remove("p1").await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }
}
