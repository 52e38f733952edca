//! State management for provisioned resources
//!
//! The state store is the single source of truth for what was last applied.
//! [`FileStateStore`] keeps it in `.stackflow/state.json` next to a backup
//! and a lock file; [`MemoryStateStore`] keeps it in process.
//!
//! Every mutation requires the session's [`StateLock`], so two apply
//! sessions can never interleave writes.

use crate::error::{Result, StackError};
use crate::provider::Outputs;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::fs;
use tokio::sync::Mutex;

pub const STATE_VERSION: u32 = 1;
const STATE_DIR: &str = ".stackflow";
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const STATE_TEMP: &str = "state.json.tmp";
const LOCK_FILE: &str = "lock.json";
const TAKEOVER_FILE: &str = "lock.json.takeover";

/// Locks older than this are considered abandoned
pub const DEFAULT_STALE_LOCK_AFTER: chrono::Duration = chrono::Duration::hours(1);

/// Last applied state of a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Logical node id
    pub id: String,

    pub resource_type: String,

    /// SHA-256 of the resolved configuration
    pub config_hash: String,

    /// Resolved configuration as applied
    pub config: serde_json::Value,

    /// Attributes returned by the provider (id, arn, endpoint, ...)
    #[serde(default)]
    pub outputs: Outputs,

    /// Producer ids at the time of apply
    #[serde(default)]
    pub dependencies: Vec<String>,

    pub last_applied_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn output(&self, attribute: &str) -> Option<&serde_json::Value> {
        self.outputs.get(attribute)
    }
}

/// Persisted state of a whole stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    /// State file version
    pub version: u32,

    /// Incremented on every write
    #[serde(default)]
    pub serial: u64,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Records keyed by node id
    pub resources: BTreeMap<String, StateRecord>,
}

impl Default for StackState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
        }
    }
}

impl StackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&StateRecord> {
        self.resources.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Add or replace a record
    pub fn set_record(&mut self, record: StateRecord) {
        self.resources.insert(record.id.clone(), record);
        self.touch();
    }

    /// Remove a record
    pub fn remove_record(&mut self, id: &str) -> Option<StateRecord> {
        let result = self.resources.remove(id);
        if result.is_some() {
            self.touch();
        }
        result
    }

    fn touch(&mut self) {
        self.serial += 1;
        self.updated_at = Utc::now();
    }
}

/// Lock information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub session: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn new(session: &str) -> Self {
        Self {
            session: session.to_string(),
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: Utc::now(),
        }
    }

    fn locked_error(&self) -> StackError {
        StackError::StateLocked {
            holder: format!("{} (session {})", self.holder, self.session),
            since: self.acquired_at,
        }
    }
}

/// Persistent store for [`StackState`]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the current state; never requires the lock
    async fn load(&self) -> Result<StackState>;

    /// Acquire the session lock, failing fast with `StateLocked` if held
    async fn lock(&self, session: &str) -> Result<StateLock>;

    /// Atomically insert or replace one record
    async fn put_record(&self, lock: &StateLock, record: StateRecord) -> Result<()>;

    /// Atomically remove one record
    async fn remove_record(&self, lock: &StateLock, id: &str) -> Result<()>;
}

enum Acquire {
    Acquired,
    HeldBy(LockInfo),
}

#[derive(Debug)]
enum LockRelease {
    File(PathBuf),
    Memory(Arc<StdMutex<Option<LockInfo>>>),
}

/// RAII guard for the session lock
#[derive(Debug)]
pub struct StateLock {
    info: LockInfo,
    release: LockRelease,
    released: bool,
}

impl StateLock {
    pub fn session(&self) -> &str {
        &self.info.session
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if let LockRelease::File(path) = &self.release
                && self.owns_file(path)
            {
                fs::remove_file(path).await?;
                tracing::debug!(session = %self.info.session, "Released state lock");
            }
            self.release_sync();
        }
        Ok(())
    }

    /// A lock taken over as stale must not remove its successor's file
    fn owns_file(&self, path: &Path) -> bool {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str::<LockInfo>(&content).ok())
            .is_some_and(|current| current.session == self.info.session)
    }

    fn release_sync(&mut self) {
        if self.released {
            return;
        }
        match &self.release {
            LockRelease::File(path) => {
                if self.owns_file(path) {
                    let _ = std::fs::remove_file(path);
                }
            }
            LockRelease::Memory(slot) => {
                if let Ok(mut held) = slot.lock()
                    && held.as_ref().is_some_and(|i| i.session == self.info.session)
                {
                    *held = None;
                }
            }
        }
        self.released = true;
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        // Synchronous cleanup in drop
        self.release_sync();
    }
}

/// State store backed by `<root>/.stackflow/state.json`
pub struct FileStateStore {
    project_root: PathBuf,
    stale_after: chrono::Duration,
    write_guard: Mutex<()>,
}

impl FileStateStore {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
            stale_after: DEFAULT_STALE_LOCK_AFTER,
            write_guard: Mutex::new(()),
        }
    }

    pub fn with_stale_lock_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Get the state directory path
    fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR)
    }

    /// Get the state file path
    fn state_path(&self) -> PathBuf {
        self.state_dir().join(STATE_FILE)
    }

    /// Get the backup file path
    fn backup_path(&self) -> PathBuf {
        self.state_dir().join(STATE_BACKUP)
    }

    /// Get the lock file path
    fn lock_path(&self) -> PathBuf {
        self.state_dir().join(LOCK_FILE)
    }

    /// Ensure the state directory exists
    async fn ensure_state_dir(&self) -> Result<()> {
        let dir = self.state_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
            tracing::debug!("Created state directory: {}", dir.display());
        }
        Ok(())
    }

    /// Write the state through a temp file so readers never see a torn file
    async fn save(&self, state: &StackState) -> Result<()> {
        self.ensure_state_dir().await?;

        let path = self.state_path();
        let temp = self.state_dir().join(STATE_TEMP);

        let content = serde_json::to_string_pretty(state)?;
        fs::write(&temp, content).await?;

        if path.exists() {
            fs::copy(&path, self.backup_path()).await?;
        }
        fs::rename(&temp, &path).await?;

        tracing::debug!(
            serial = state.serial,
            resources = state.resources.len(),
            "Saved state"
        );
        Ok(())
    }

    fn takeover_path(&self) -> PathBuf {
        self.state_dir().join(TAKEOVER_FILE)
    }

    fn is_stale(&self, info: &LockInfo) -> bool {
        Utc::now().signed_duration_since(info.acquired_at) >= self.stale_after
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        read_lock_file(&self.lock_path()).await
    }

    async fn try_create_lock(&self, info: &LockInfo) -> Result<bool> {
        create_lock_file(&self.lock_path(), info).await
    }

    async fn acquire(&self, info: &LockInfo) -> Result<Acquire> {
        if self.try_create_lock(info).await? {
            return Ok(Acquire::Acquired);
        }
        match self.read_lock().await? {
            Some(existing) if self.is_stale(&existing) => self.take_over(&existing, info).await,
            Some(existing) => Ok(Acquire::HeldBy(existing)),
            // released in between
            None => self.retry_create(info, None).await,
        }
    }

    /// Replace a stale lock
    ///
    /// Takeovers are serialized through a marker file and the lock is only
    /// removed while it still carries the stale session, so a session that
    /// judged the same lock stale can never delete its successor.
    async fn take_over(&self, stale: &LockInfo, info: &LockInfo) -> Result<Acquire> {
        let marker = self.takeover_path();
        if !create_lock_file(&marker, info).await? {
            let taker = read_lock_file(&marker).await?;
            if let Some(taker) = &taker
                && self.is_stale(taker)
            {
                tracing::warn!(session = %taker.session, "Removing abandoned lock takeover");
                let _ = fs::remove_file(&marker).await;
            }
            return Ok(Acquire::HeldBy(taker.unwrap_or_else(|| stale.clone())));
        }

        let result = self.replace_stale(stale, info).await;
        let _ = fs::remove_file(&marker).await;
        result
    }

    async fn replace_stale(&self, stale: &LockInfo, info: &LockInfo) -> Result<Acquire> {
        match self.read_lock().await? {
            Some(current) if current == *stale => {
                tracing::warn!(
                    holder = %stale.holder,
                    session = %stale.session,
                    "Removing stale state lock"
                );
                match fs::remove_file(self.lock_path()).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Some(current) => return Ok(Acquire::HeldBy(current)),
            None => {}
        }
        self.retry_create(info, Some(stale)).await
    }

    /// One more attempt, reporting whoever holds the lock if it fails
    async fn retry_create(&self, info: &LockInfo, fallback: Option<&LockInfo>) -> Result<Acquire> {
        if self.try_create_lock(info).await? {
            return Ok(Acquire::Acquired);
        }
        match self.read_lock().await? {
            Some(holder) => Ok(Acquire::HeldBy(holder)),
            None => fallback
                .cloned()
                .map(Acquire::HeldBy)
                .ok_or_else(|| StackError::State("Could not acquire state lock".into())),
        }
    }

    async fn verify_lock(&self, lock: &StateLock) -> Result<()> {
        match self.read_lock().await? {
            Some(current) if current.session == lock.session() => Ok(()),
            _ => Err(StackError::State(format!(
                "State lock for session {} is no longer held",
                lock.session()
            ))),
        }
    }

    async fn mutate<F>(&self, lock: &StateLock, f: F) -> Result<()>
    where
        F: FnOnce(&mut StackState) + Send,
    {
        let _guard = self.write_guard.lock().await;
        self.verify_lock(lock).await?;
        let mut state = self.load().await?;
        f(&mut state);
        self.save(&state).await
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<StackState> {
        let path = self.state_path();
        if !path.exists() {
            tracing::debug!("State file not found, returning empty state");
            return Ok(StackState::new());
        }

        let content = fs::read_to_string(&path).await?;
        let state: StackState = serde_json::from_str(&content)?;

        // Version check
        if state.version > STATE_VERSION {
            return Err(StackError::State(format!(
                "State file version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }

        tracing::debug!("Loaded state with {} resources", state.resources.len());
        Ok(state)
    }

    async fn lock(&self, session: &str) -> Result<StateLock> {
        self.ensure_state_dir().await?;

        let info = LockInfo::new(session);
        if let Acquire::HeldBy(holder) = self.acquire(&info).await? {
            return Err(holder.locked_error());
        }

        tracing::debug!(session = %session, "Acquired state lock");
        Ok(StateLock {
            info,
            release: LockRelease::File(self.lock_path()),
            released: false,
        })
    }

    async fn put_record(&self, lock: &StateLock, record: StateRecord) -> Result<()> {
        self.mutate(lock, move |state| state.set_record(record)).await
    }

    async fn remove_record(&self, lock: &StateLock, id: &str) -> Result<()> {
        self.mutate(lock, |state| {
            state.remove_record(id);
        })
        .await
    }
}

async fn read_lock_file(path: &Path) -> Result<Option<LockInfo>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Publish `info` at `path` unless a file is already there
///
/// The content is written to a private temp file and hard-linked into
/// place, so the file appears atomically and is never read half-written.
async fn create_lock_file(path: &Path, info: &LockInfo) -> Result<bool> {
    let temp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
    fs::write(&temp, serde_json::to_string_pretty(info)?).await?;

    let linked = fs::hard_link(&temp, path).await;
    let _ = fs::remove_file(&temp).await;
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// In-process state store
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<StackState>,
    held: Arc<StdMutex<Option<LockInfo>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: StackState) -> Self {
        Self {
            state: Mutex::new(state),
            held: Arc::default(),
        }
    }

    fn verify_lock(&self, lock: &StateLock) -> Result<()> {
        let held = self
            .held
            .lock()
            .map_err(|_| StackError::State("State lock poisoned".into()))?;
        match held.as_ref() {
            Some(info) if info.session == lock.session() => Ok(()),
            _ => Err(StackError::State(format!(
                "State lock for session {} is no longer held",
                lock.session()
            ))),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<StackState> {
        Ok(self.state.lock().await.clone())
    }

    async fn lock(&self, session: &str) -> Result<StateLock> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| StackError::State("State lock poisoned".into()))?;
        if let Some(existing) = held.as_ref() {
            return Err(existing.locked_error());
        }

        let info = LockInfo::new(session);
        *held = Some(info.clone());
        Ok(StateLock {
            info,
            release: LockRelease::Memory(Arc::clone(&self.held)),
            released: false,
        })
    }

    async fn put_record(&self, lock: &StateLock, record: StateRecord) -> Result<()> {
        self.verify_lock(lock)?;
        self.state.lock().await.set_record(record);
        Ok(())
    }

    async fn remove_record(&self, lock: &StateLock, id: &str) -> Result<()> {
        self.verify_lock(lock)?;
        self.state.lock().await.remove_record(id);
        Ok(())
    }
}
