//! Status store
//!
//! Manages the `.stackflow/state.json` file, the persisted mirror of every
//! cluster's metadata, last applied spec and reconciled status.

use crate::error::{CloudError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stackflow_core::{ClusterSpec, ClusterStatus, ClusterTopology, MachineStatus, ObjectMeta};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

const STATE_VERSION: u32 = 1;
const STATE_DIR: &str = ".stackflow";
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const LOCK_FILE: &str = "lock.json";

/// Global state containing every known cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalState {
    /// State file version
    pub version: u32,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Clusters indexed by name
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterRecord>,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            clusters: BTreeMap::new(),
        }
    }
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_cluster(&self, name: &str) -> Option<&ClusterRecord> {
        self.clusters.get(name)
    }

    pub fn get_cluster_mut(&mut self, name: &str) -> Option<&mut ClusterRecord> {
        self.clusters.get_mut(name)
    }

    /// Add or update a cluster record
    pub fn set_cluster(&mut self, record: ClusterRecord) {
        self.clusters.insert(record.metadata.name.clone(), record);
        self.updated_at = Utc::now();
    }

    /// Remove a cluster record
    pub fn remove_cluster(&mut self, name: &str) -> Option<ClusterRecord> {
        let result = self.clusters.remove(name);
        if result.is_some() {
            self.updated_at = Utc::now();
        }
        result
    }
}

/// Persisted record of a single cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub metadata: ObjectMeta,

    /// Spec as of the last reconcile, used for update validation
    #[serde(default)]
    pub spec: ClusterSpec,

    #[serde(default)]
    pub status: ClusterStatus,

    /// Machine name → status
    #[serde(default)]
    pub machines: BTreeMap<String, MachineStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

impl ClusterRecord {
    pub fn from_topology(topology: &ClusterTopology) -> Self {
        Self {
            metadata: topology.metadata.clone(),
            spec: topology.spec.clone(),
            status: topology.status.clone(),
            machines: BTreeMap::new(),
            last_reconciled_at: None,
        }
    }

    /// Rebuild the topology object with a freshly declared spec
    pub fn to_topology(&self, spec: ClusterSpec) -> ClusterTopology {
        ClusterTopology {
            metadata: self.metadata.clone(),
            spec,
            status: self.status.clone(),
        }
    }

    /// Write back metadata and status after a reconcile pass
    pub fn update_from(&mut self, topology: &ClusterTopology) {
        self.metadata = topology.metadata.clone();
        self.spec = topology.spec.clone();
        self.status = topology.status.clone();
        self.last_reconciled_at = Some(Utc::now());
    }
}

/// Status store for reading/writing the state file
pub struct StatusStore {
    /// Project root directory
    project_root: PathBuf,
}

impl StatusStore {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR)
    }

    /// Get the state file path
    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join(STATE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.state_dir().join(STATE_BACKUP)
    }

    fn lock_path(&self) -> PathBuf {
        self.state_dir().join(LOCK_FILE)
    }

    async fn ensure_state_dir(&self) -> Result<()> {
        let dir = self.state_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
            tracing::debug!("Created state directory: {}", dir.display());
        }
        Ok(())
    }

    /// Load the current state
    pub async fn load(&self) -> Result<GlobalState> {
        let path = self.state_path();
        if !path.exists() {
            tracing::debug!("State file not found, returning empty state");
            return Ok(GlobalState::new());
        }

        let content = fs::read_to_string(&path).await?;
        let state: GlobalState = serde_json::from_str(&content)?;

        if state.version > STATE_VERSION {
            return Err(CloudError::StateError(format!(
                "State file version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }

        tracing::debug!("Loaded state with {} clusters", state.clusters.len());
        Ok(state)
    }

    /// Save the state, keeping the previous file as a backup
    pub async fn save(&self, state: &GlobalState) -> Result<()> {
        self.ensure_state_dir().await?;

        let path = self.state_path();
        let backup = self.backup_path();

        if path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
            tracing::debug!("Created state backup");
        }

        let content = serde_json::to_string_pretty(state)?;
        fs::write(&path, content).await?;

        tracing::debug!("Saved state with {} clusters", state.clusters.len());
        Ok(())
    }

    /// Acquire a lock for exclusive access
    ///
    /// A lock older than one hour is treated as stale and taken over.
    pub async fn acquire_lock(&self) -> Result<StateLock> {
        self.ensure_state_dir().await?;

        let lock_path = self.lock_path();

        if lock_path.exists() {
            let content = fs::read_to_string(&lock_path).await?;
            let lock_info: LockInfo = serde_json::from_str(&content)?;

            let age = Utc::now().signed_duration_since(lock_info.acquired_at);
            if age.num_hours() < 1 {
                return Err(CloudError::LockError(format!(
                    "State is locked by {} since {}",
                    lock_info.holder, lock_info.acquired_at
                )));
            }

            tracing::warn!("Removing stale lock from {}", lock_info.holder);
        }

        LockInfo::now().write(&lock_path).await?;

        tracing::debug!("Acquired state lock");
        Ok(StateLock {
            lock_path,
            released: false,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn now() -> Self {
        Self {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: Utc::now(),
        }
    }

    async fn write(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }
}

/// RAII guard for the state lock
pub struct StateLock {
    lock_path: PathBuf,
    released: bool,
}

impl StateLock {
    /// Re-stamp the lock so long-running holders are never seen as stale
    pub async fn refresh(&self) -> Result<()> {
        if !self.released {
            LockInfo::now().write(&self.lock_path).await?;
            tracing::trace!("Refreshed state lock");
        }
        Ok(())
    }

    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if self.lock_path.exists() {
                fs::remove_file(&self.lock_path).await?;
                tracing::debug!("Released state lock");
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released && self.lock_path.exists() {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackflow_core::CLUSTER_FINALIZER;
    use tempfile::tempdir;

    fn record(name: &str) -> ClusterRecord {
        let mut topology = ClusterTopology::new(name, ClusterSpec::default());
        topology.metadata.uid = "uid-1".to_string();
        topology.metadata.add_finalizer(CLUSTER_FINALIZER);
        topology.status.network_id = Some("net-1".to_string());
        ClusterRecord::from_topology(&topology)
    }

    #[tokio::test]
    async fn test_state_save_load() {
        let temp_dir = tempdir().unwrap();
        let store = StatusStore::new(temp_dir.path());

        let mut state = GlobalState::new();
        state.set_cluster(record("prod"));

        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap();
        let prod = loaded.get_cluster("prod").unwrap();
        assert_eq!(prod.metadata.uid, "uid-1");
        assert!(prod.metadata.has_finalizer(CLUSTER_FINALIZER));
        assert_eq!(prod.status.network_id.as_deref(), Some("net-1"));
    }

    #[tokio::test]
    async fn test_empty_state() {
        let temp_dir = tempdir().unwrap();
        let store = StatusStore::new(temp_dir.path());

        let state = store.load().await.unwrap();
        assert!(state.clusters.is_empty());
    }

    #[tokio::test]
    async fn test_save_creates_backup() {
        let temp_dir = tempdir().unwrap();
        let store = StatusStore::new(temp_dir.path());

        store.save(&GlobalState::new()).await.unwrap();
        store.save(&GlobalState::new()).await.unwrap();

        assert!(temp_dir.path().join(".stackflow/state.json.backup").exists());
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp_dir = tempdir().unwrap();
        let store = StatusStore::new(temp_dir.path());

        let mut state = GlobalState::new();
        state.version = STATE_VERSION + 1;
        store.save(&state).await.unwrap();

        assert!(matches!(
            store.load().await,
            Err(CloudError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let temp_dir = tempdir().unwrap();
        let store = StatusStore::new(temp_dir.path());

        let lock = store.acquire_lock().await.unwrap();
        assert!(matches!(
            store.acquire_lock().await,
            Err(CloudError::LockError(_))
        ));

        lock.release().await.unwrap();
        let again = store.acquire_lock().await.unwrap();
        drop(again);
        assert!(!temp_dir.path().join(".stackflow/lock.json").exists());
    }

    #[tokio::test]
    async fn test_stale_lock_taken_over() {
        let temp_dir = tempdir().unwrap();
        let store = StatusStore::new(temp_dir.path());
        std::fs::create_dir_all(temp_dir.path().join(STATE_DIR)).unwrap();

        let stale = LockInfo {
            holder: "old-host".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        std::fs::write(
            temp_dir.path().join(STATE_DIR).join(LOCK_FILE),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        assert!(store.acquire_lock().await.is_ok());
    }

    #[tokio::test]
    async fn test_refreshed_lock_is_not_taken_over() {
        let temp_dir = tempdir().unwrap();
        let store = StatusStore::new(temp_dir.path());
        let lock_path = temp_dir.path().join(STATE_DIR).join(LOCK_FILE);

        let lock = store.acquire_lock().await.unwrap();
        // as written by a holder that has been running for two hours
        let old = LockInfo {
            holder: "watcher".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        std::fs::write(&lock_path, serde_json::to_string(&old).unwrap()).unwrap();

        lock.refresh().await.unwrap();
        assert!(matches!(
            store.acquire_lock().await,
            Err(CloudError::LockError(_))
        ));

        lock.release().await.unwrap();
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_remove_cluster() {
        let mut state = GlobalState::new();
        state.set_cluster(record("prod"));
        assert!(state.remove_cluster("prod").is_some());
        assert!(state.remove_cluster("prod").is_none());
    }
}
