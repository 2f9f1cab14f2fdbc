//! Atomic JSON persistence for the trading engine's hot state document
//! (temp-file + fsync + rename, per §4.8). Reads tolerate absence and
//! corruption by falling back to defaults rather than crashing the process.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::application::state::StateDocument;
use crate::domain::errors::StateIoError;
use crate::domain::ports::{StateStore, StateStoreError};

pub struct JsonFileStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    async fn write_atomic(&self, path: &std::path::Path, bytes: &[u8]) -> Result<(), StateIoError> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_stem(path), Uuid::new_v4()));

        let mut file = fs::File::create(&tmp_path).await.map_err(|e| StateIoError::Write {
            path: tmp_path.display().to_string(),
            source: e,
        })?;
        use tokio::io::AsyncWriteExt;
        file.write_all(bytes).await.map_err(|e| StateIoError::Write {
            path: tmp_path.display().to_string(),
            source: e,
        })?;
        file.sync_all().await.map_err(|e| StateIoError::Write {
            path: tmp_path.display().to_string(),
            source: e,
        })?;

        fs::rename(&tmp_path, path).await.map_err(|e| StateIoError::Rename {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }

    /// `<state_path>.heartbeat`, a separate lightweight file so external
    /// monitors can check liveness without parsing the full state document.
    fn heartbeat_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.heartbeat", self.path.display()))
    }
}

fn file_stem(path: &std::path::Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("state")
        .to_string()
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn load(&self) -> StateDocument {
        match fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting from defaults");
                StateDocument::default()
            }),
            Err(_) => StateDocument::default(),
        }
    }

    async fn save(&self, doc: &StateDocument) -> Result<(), StateStoreError> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(StateIoError::Serialize)?;
        self.write_atomic(&self.path, &bytes).await?;
        if let Some(heartbeat) = doc.heartbeat {
            if let Err(e) = self.write_atomic(&self.heartbeat_path(), heartbeat.to_rfc3339().as_bytes()).await {
                warn!(error = %e, "failed to update heartbeat file");
            }
        }
        Ok(())
    }

    async fn touch_heartbeat(&self, now: DateTime<Utc>) -> Result<(), StateStoreError> {
        self.write_atomic(&self.heartbeat_path(), now.to_rfc3339().as_bytes())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let path = std::env::temp_dir().join(format!("xsmom_state_{}.json", Uuid::new_v4()));
        let store = JsonFileStateStore::new(path.clone());
        let mut doc = StateDocument::default();
        doc.heartbeat = Some(Utc::now());
        store.save(&doc).await.expect("save");
        let loaded = store.load().await;
        assert!(loaded.heartbeat.is_some());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join(format!("xsmom_missing_{}.json", Uuid::new_v4()));
        let store = JsonFileStateStore::new(path);
        let loaded = store.load().await;
        assert!(loaded.positions.is_empty());
    }

    #[tokio::test]
    async fn touch_heartbeat_writes_separate_file_without_touching_state() {
        let path = std::env::temp_dir().join(format!("xsmom_heartbeat_{}.json", Uuid::new_v4()));
        let store = JsonFileStateStore::new(path.clone());
        let doc = StateDocument::default();
        store.save(&doc).await.expect("save");

        let now = Utc::now();
        store.touch_heartbeat(now).await.expect("touch heartbeat");

        let heartbeat_path = format!("{}.heartbeat", path.display());
        let raw = fs::read_to_string(&heartbeat_path).await.expect("heartbeat file exists");
        assert_eq!(raw, now.to_rfc3339());

        let loaded = store.load().await;
        assert!(loaded.heartbeat.is_none());

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&heartbeat_path);
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("xsmom_corrupt_{}.json", Uuid::new_v4()));
        fs::write(&path, b"not json").await.unwrap();
        let store = JsonFileStateStore::new(path.clone());
        let loaded = store.load().await;
        assert!(loaded.positions.is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
