//! Secret storage
//!
//! A store keeps, per secret, the [`RotationState`] and every live
//! [`SecretVersion`]. [`FileSecretStore`] writes one JSON document per
//! secret through a temp file and a rename.

use crate::error::{Result, RotationError};
use crate::model::{RotationState, SecretVersion, VersionLabel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// Rotation state and secret versions
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn load_state(&self, secret_id: &str) -> Result<Option<RotationState>>;

    async fn save_state(&self, state: &RotationState) -> Result<()>;

    async fn get_version(
        &self,
        secret_id: &str,
        version_id: &str,
    ) -> Result<Option<SecretVersion>>;

    /// Store a new version; replaces a version with the same id
    async fn put_version(&self, secret_id: &str, version: SecretVersion) -> Result<()>;

    async fn delete_version(&self, secret_id: &str, version_id: &str) -> Result<()>;

    /// Make `version_id` current, demote current to previous and drop the
    /// older previous version. Promoting the current version is a no-op.
    async fn promote(&self, secret_id: &str, version_id: &str) -> Result<()>;

    /// Ids of every secret with a rotation state
    async fn list_secrets(&self) -> Result<Vec<String>>;
}

/// Everything stored for one secret
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SecretDocument {
    state: Option<RotationState>,
    #[serde(default)]
    versions: Vec<SecretVersion>,
}

impl SecretDocument {
    fn version(&self, version_id: &str) -> Option<&SecretVersion> {
        self.versions.iter().find(|v| v.version_id == version_id)
    }

    fn put(&mut self, version: SecretVersion) {
        self.versions.retain(|v| v.version_id != version.version_id);
        self.versions.push(version);
    }

    fn promote(&mut self, secret_id: &str, version_id: &str) -> Result<()> {
        let target = self
            .version(version_id)
            .ok_or_else(|| {
                RotationError::Store(format!(
                    "version {} of '{}' does not exist",
                    version_id, secret_id
                ))
            })?;
        if target.has_label(VersionLabel::Current) {
            return Ok(());
        }

        self.versions
            .retain(|v| v.version_id == version_id || !v.has_label(VersionLabel::Previous));
        for version in &mut self.versions {
            version.labels.remove(&VersionLabel::Previous);
            if version.version_id == version_id {
                version.labels.remove(&VersionLabel::Pending);
                version.labels.insert(VersionLabel::Current);
            } else if version.labels.remove(&VersionLabel::Current) {
                version.labels.insert(VersionLabel::Previous);
            }
        }
        Ok(())
    }
}

/// In-process secret store
#[derive(Default)]
pub struct MemorySecretStore {
    documents: Mutex<HashMap<String, SecretDocument>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn load_state(&self, secret_id: &str) -> Result<Option<RotationState>> {
        let documents = self.documents.lock().await;
        Ok(documents.get(secret_id).and_then(|d| d.state.clone()))
    }

    async fn save_state(&self, state: &RotationState) -> Result<()> {
        let mut documents = self.documents.lock().await;
        documents.entry(state.secret_id.clone()).or_default().state = Some(state.clone());
        Ok(())
    }

    async fn get_version(
        &self,
        secret_id: &str,
        version_id: &str,
    ) -> Result<Option<SecretVersion>> {
        let documents = self.documents.lock().await;
        Ok(documents
            .get(secret_id)
            .and_then(|d| d.version(version_id).cloned()))
    }

    async fn put_version(&self, secret_id: &str, version: SecretVersion) -> Result<()> {
        let mut documents = self.documents.lock().await;
        documents
            .entry(secret_id.to_string())
            .or_default()
            .put(version);
        Ok(())
    }

    async fn delete_version(&self, secret_id: &str, version_id: &str) -> Result<()> {
        let mut documents = self.documents.lock().await;
        if let Some(document) = documents.get_mut(secret_id) {
            document.versions.retain(|v| v.version_id != version_id);
        }
        Ok(())
    }

    async fn promote(&self, secret_id: &str, version_id: &str) -> Result<()> {
        let mut documents = self.documents.lock().await;
        documents
            .get_mut(secret_id)
            .ok_or_else(|| RotationError::NotRegistered(secret_id.to_string()))?
            .promote(secret_id, version_id)
    }

    async fn list_secrets(&self) -> Result<Vec<String>> {
        let documents = self.documents.lock().await;
        let mut ids: Vec<String> = documents
            .iter()
            .filter(|(_, d)| d.state.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Secret store backed by one JSON document per secret
pub struct FileSecretStore {
    dir: PathBuf,
    write_guard: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_guard: Mutex::new(()),
        }
    }

    fn document_path(&self, secret_id: &str) -> Result<PathBuf> {
        let valid = !secret_id.is_empty()
            && secret_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !secret_id.starts_with('.');
        if !valid {
            return Err(RotationError::InvalidSecretId(secret_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", secret_id)))
    }

    async fn read(&self, secret_id: &str) -> Result<SecretDocument> {
        let path = self.document_path(secret_id)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SecretDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, secret_id: &str, document: &SecretDocument) -> Result<()> {
        let path = self.document_path(secret_id)?;
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
        }

        let temp = path.with_extension("json.tmp");
        fs::write(&temp, serde_json::to_string_pretty(document)?).await?;
        fs::rename(&temp, &path).await?;
        tracing::debug!(secret = %secret_id, "Saved secret document");
        Ok(())
    }

    async fn modify<F>(&self, secret_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut SecretDocument) -> Result<()> + Send,
    {
        let _guard = self.write_guard.lock().await;
        let mut document = self.read(secret_id).await?;
        f(&mut document)?;
        self.write(secret_id, &document).await
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn load_state(&self, secret_id: &str) -> Result<Option<RotationState>> {
        Ok(self.read(secret_id).await?.state)
    }

    async fn save_state(&self, state: &RotationState) -> Result<()> {
        let secret_id = state.secret_id.clone();
        let state = state.clone();
        self.modify(&secret_id, move |d| {
            d.state = Some(state);
            Ok(())
        })
        .await
    }

    async fn get_version(
        &self,
        secret_id: &str,
        version_id: &str,
    ) -> Result<Option<SecretVersion>> {
        Ok(self.read(secret_id).await?.version(version_id).cloned())
    }

    async fn put_version(&self, secret_id: &str, version: SecretVersion) -> Result<()> {
        self.modify(secret_id, move |d| {
            d.put(version);
            Ok(())
        })
        .await
    }

    async fn delete_version(&self, secret_id: &str, version_id: &str) -> Result<()> {
        self.modify(secret_id, |d| {
            d.versions.retain(|v| v.version_id != version_id);
            Ok(())
        })
        .await
    }

    async fn promote(&self, secret_id: &str, version_id: &str) -> Result<()> {
        self.modify(secret_id, |d| d.promote(secret_id, version_id))
            .await
    }

    async fn list_secrets(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            let document: SecretDocument = serde_json::from_str(&content)?;
            if let Some(state) = document.state {
                ids.push(state.secret_id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
