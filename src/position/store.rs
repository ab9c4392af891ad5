//! Position persistence

use super::ArbitragePosition;
use crate::{ArbitrageError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// System of record for positions across restarts
///
/// Reads and writes are atomic per position.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Insert or replace a position
    async fn save_position(&self, position: &ArbitragePosition) -> Result<()>;

    /// Load one position
    async fn load_position(&self, position_id: &str) -> Result<Option<ArbitragePosition>>;

    /// Every non-terminal position
    async fn load_active_positions(&self) -> Result<Vec<ArbitragePosition>> {
        Ok(self
            .load_all_positions()
            .await?
            .into_iter()
            .filter(|p| !p.is_terminal())
            .collect())
    }

    /// Every stored position
    async fn load_all_positions(&self) -> Result<Vec<ArbitragePosition>>;

    /// Delete a never-executed ERROR position
    async fn delete_position(&self, position_id: &str) -> Result<()>;
}

fn ensure_deletable(position: &ArbitragePosition) -> Result<()> {
    if position.is_deletable() {
        return Ok(());
    }
    Err(ArbitrageError::Persistence(format!(
        "position {} is {} with primary filled {} and hedge filled {}; only never-executed ERROR positions can be deleted",
        position.position_id, position.status, position.primary.filled_quantity, position.hedge.filled_quantity
    ))
    .into())
}

/// Process-local store
#[derive(Default)]
pub struct InMemoryPositionStore {
    positions: DashMap<String, ArbitragePosition>,
}

impl InMemoryPositionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn save_position(&self, position: &ArbitragePosition) -> Result<()> {
        self.positions.insert(position.position_id.clone(), position.clone());
        Ok(())
    }

    async fn load_position(&self, position_id: &str) -> Result<Option<ArbitragePosition>> {
        Ok(self.positions.get(position_id).map(|p| p.value().clone()))
    }

    async fn load_all_positions(&self) -> Result<Vec<ArbitragePosition>> {
        let mut positions: Vec<_> = self.positions.iter().map(|p| p.value().clone()).collect();
        positions.sort_by_key(|p| p.created_at);
        Ok(positions)
    }

    async fn delete_position(&self, position_id: &str) -> Result<()> {
        let position = self
            .load_position(position_id)
            .await?
            .ok_or_else(|| ArbitrageError::PositionNotFound(position_id.to_string()))?;
        ensure_deletable(&position)?;
        self.positions.remove(position_id);
        Ok(())
    }
}

/// One JSON document per position, replaced atomically through a temp file
pub struct JsonFilePositionStore {
    directory: PathBuf,
}

impl JsonFilePositionStore {
    /// Store rooted at `directory` (created on first write)
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, position_id: &str) -> Result<PathBuf> {
        if position_id.is_empty()
            || !position_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ArbitrageError::Persistence(format!("invalid position id '{}'", position_id)).into());
        }
        Ok(self.directory.join(format!("{}.json", position_id)))
    }

    async fn read(path: &Path) -> Result<ArbitragePosition> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ArbitrageError::Persistence(format!("Failed to read {}: {}", path.display(), e)))?;
        let position = serde_json::from_str(&contents)
            .map_err(|e| ArbitrageError::Persistence(format!("Failed to parse {}: {}", path.display(), e)))?;
        Ok(position)
    }
}

#[async_trait]
impl PositionStore for JsonFilePositionStore {
    async fn save_position(&self, position: &ArbitragePosition) -> Result<()> {
        let path = self.path_for(&position.position_id)?;
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| ArbitrageError::Persistence(format!("Failed to create store directory: {}", e)))?;

        let json = serde_json::to_string_pretty(position)
            .map_err(|e| ArbitrageError::Persistence(format!("Failed to serialize position: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| ArbitrageError::Persistence(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ArbitrageError::Persistence(format!("Failed to replace {}: {}", path.display(), e)))?;

        debug!(position_id = %position.position_id, status = %position.status, "Position saved");
        Ok(())
    }

    async fn load_position(&self, position_id: &str) -> Result<Option<ArbitragePosition>> {
        let path = self.path_for(position_id)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        Self::read(&path).await.map(Some)
    }

    async fn load_all_positions(&self) -> Result<Vec<ArbitragePosition>> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ArbitrageError::Persistence(format!("Failed to list store directory: {}", e)).into())
            }
        };

        let mut positions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ArbitrageError::Persistence(format!("Failed to list store directory: {}", e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(position) => positions.push(position),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable position file"),
            }
        }
        positions.sort_by_key(|p| p.created_at);
        Ok(positions)
    }

    async fn delete_position(&self, position_id: &str) -> Result<()> {
        let position = self
            .load_position(position_id)
            .await?
            .ok_or_else(|| ArbitrageError::PositionNotFound(position_id.to_string()))?;
        ensure_deletable(&position)?;
        let path = self.path_for(position_id)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| ArbitrageError::Persistence(format!("Failed to delete {}: {}", path.display(), e)))?;
        Ok(())
    }
}
