use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, info, warn};

use super::snapshot::Snapshot;
use crate::batch::registry::BatchRegistry;
use crate::common::errors::{EngineError, Result};
use crate::config::types::AppConfig;

/// Where a loaded snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Primary,
    Backup,
}

/// JSON snapshot files with a one-deep backup
///
/// Every save copies the current primary file to the backup path first, then
/// replaces the primary through a temporary file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    primary: PathBuf,
    backup: PathBuf,
    account_id: String,
    strategy_tag: String,
}

impl SnapshotStore {
    pub fn new(
        primary: impl Into<PathBuf>,
        backup: impl Into<PathBuf>,
        account_id: impl Into<String>,
        strategy_tag: impl Into<String>,
    ) -> Self {
        Self {
            primary: primary.into(),
            backup: backup.into(),
            account_id: account_id.into(),
            strategy_tag: strategy_tag.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.persistence.state_file.clone(),
            config.persistence.backup_file(),
            config.account.account_id.clone(),
            config.account.strategy_tag.clone(),
        )
    }

    pub fn primary_path(&self) -> &Path {
        &self.primary
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn strategy_tag(&self) -> &str {
        &self.strategy_tag
    }

    /// Snapshot the registry and write it
    pub async fn save(&self, registry: &BatchRegistry) -> Result<Snapshot> {
        let snapshot = Snapshot::capture(registry, &self.account_id, &self.strategy_tag, Utc::now());
        self.write(&snapshot).await?;
        Ok(snapshot)
    }

    pub async fn write(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.primary.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        if fs::try_exists(&self.primary).await? {
            fs::copy(&self.primary, &self.backup).await?;
        }

        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = temp_path(&self.primary);
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.primary).await?;

        debug!(
            "Saved state: {} batches, {} layers to {}",
            snapshot.batches.len(),
            snapshot.layer_count(),
            self.primary.display()
        );
        Ok(())
    }

    /// Read one snapshot file without validation; a missing file is `None`
    pub async fn read_file(path: &Path) -> Result<Option<Snapshot>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| EngineError::CorruptSnapshot {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    /// Read and validate one file against this store's account and tag
    pub async fn load_from(&self, path: &Path) -> Result<Option<Snapshot>> {
        let Some(snapshot) = Self::read_file(path).await? else {
            return Ok(None);
        };
        snapshot.validate(&self.account_id, &self.strategy_tag)?;
        Ok(Some(snapshot))
    }

    /// Primary file, then backup, then nothing
    ///
    /// Never fails: a corrupt or foreign snapshot counts as no usable state.
    pub async fn load_with_fallback(&self) -> Option<(Snapshot, SnapshotSource)> {
        for (path, source) in [
            (&self.primary, SnapshotSource::Primary),
            (&self.backup, SnapshotSource::Backup),
        ] {
            match self.load_from(path).await {
                Ok(Some(snapshot)) => {
                    info!(
                        "Loaded state from {} ({} batches, saved {})",
                        path.display(),
                        snapshot.batches.len(),
                        snapshot.timestamp
                    );
                    return Some((snapshot, source));
                }
                Ok(None) => debug!("No state file at {}", path.display()),
                Err(e @ EngineError::ConfigMismatch { .. }) => {
                    warn!("Ignoring state file {}: {}", path.display(), e);
                }
                Err(e) => error!("Failed to load state file {}: {}", path.display(), e),
            }
        }

        info!("No usable saved state, starting fresh");
        None
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
