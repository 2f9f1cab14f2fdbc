//! Config version writing, atomic pointer swap, and rollback. Mirrors the
//! temp-file + rename discipline `infrastructure::state_store` uses for the
//! hot state document, applied instead to the versioned-config pointer file
//! so a crash mid-deploy can never leave the live pointer referencing a
//! half-written config.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::config::{Config, PathsSection};
use crate::domain::config_version::ConfigVersionMetadata;
use crate::domain::errors::OptimizerError;

fn config_path(dir: &Path, version_id: &str) -> PathBuf {
    dir.join(format!("config_{version_id}.yaml"))
}

fn metadata_path(dir: &Path, version_id: &str) -> PathBuf {
    dir.join(format!("metadata_{version_id}.json"))
}

fn pointer_path(dir: &Path) -> PathBuf {
    dir.join("LIVE_POINTER")
}

pub fn new_version_id() -> String {
    Utc::now().timestamp_millis().to_string()
}

/// Returns the version id the pointer currently references, if any.
pub async fn current_live_version(paths: &PathsSection) -> Option<String> {
    let raw = tokio::fs::read_to_string(pointer_path(&paths.config_versions_dir)).await.ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
}

async fn write_atomic(path: &Path, contents: &str) -> Result<(), OptimizerError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(OptimizerError::Versioning)?;
    }
    let tmp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
    tokio::fs::write(&tmp_path, contents).await.map_err(OptimizerError::Versioning)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(OptimizerError::Versioning)?;
    Ok(())
}

/// Writes a new config version and its metadata sidecar, then atomically
/// swaps the live pointer onto it. `metadata.backup_of` should already be
/// set to the version id being superseded (or `None` for the first deploy).
pub async fn deploy(
    paths: &PathsSection,
    candidate: &Config,
    metadata: &ConfigVersionMetadata,
) -> Result<(), OptimizerError> {
    let dir = &paths.config_versions_dir;
    let yaml = serde_yaml::to_string(candidate).map_err(|e| {
        OptimizerError::Versioning(std::io::Error::other(format!("failed to serialize candidate config: {e}")))
    })?;
    write_atomic(&config_path(dir, &metadata.version_id), &yaml).await?;

    let json = serde_json::to_string_pretty(metadata).map_err(|e| {
        OptimizerError::Versioning(std::io::Error::other(format!("failed to serialize version metadata: {e}")))
    })?;
    write_atomic(&metadata_path(dir, &metadata.version_id), &json).await?;

    write_atomic(&pointer_path(dir), &metadata.version_id).await?;
    info!(version_id = %metadata.version_id, deployed = metadata.deployed, "wrote optimizer config version");
    Ok(())
}

pub async fn load_metadata(paths: &PathsSection, version_id: &str) -> Result<ConfigVersionMetadata, OptimizerError> {
    let raw = tokio::fs::read_to_string(metadata_path(&paths.config_versions_dir, version_id))
        .await
        .map_err(OptimizerError::Versioning)?;
    serde_json::from_str(&raw)
        .map_err(|e| OptimizerError::Versioning(std::io::Error::other(format!("corrupt metadata for {version_id}: {e}"))))
}

/// Lists every recorded version, most recent first, by created_at.
pub async fn list_versions(paths: &PathsSection) -> Result<Vec<ConfigVersionMetadata>, OptimizerError> {
    let dir = &paths.config_versions_dir;
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = tokio::fs::read_dir(dir).await.map_err(OptimizerError::Versioning)?;
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(OptimizerError::Versioning)? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(id) = name.strip_prefix("metadata_").and_then(|s| s.strip_suffix(".json"))
            && let Ok(meta) = load_metadata(paths, id).await
        {
            out.push(meta);
        }
    }
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(out)
}

/// Restores the backup config identified by `version_id`, or (if `None`) the
/// version the currently-live config's metadata names as `backup_of`.
pub async fn rollback(paths: &PathsSection, version_id: Option<&str>) -> Result<String, OptimizerError> {
    let target = match version_id {
        Some(id) => id.to_string(),
        None => {
            let current = current_live_version(paths).await.ok_or(OptimizerError::NoViableCandidates)?;
            let meta = load_metadata(paths, &current).await?;
            meta.backup_of.ok_or(OptimizerError::NoViableCandidates)?
        }
    };
    let dir = &paths.config_versions_dir;
    if !config_path(dir, &target).exists() {
        return Err(OptimizerError::Versioning(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no config version {target} on disk"),
        )));
    }
    write_atomic(&pointer_path(dir), &target).await?;
    info!(version_id = %target, "rolled back live config pointer");
    Ok(target)
}

/// Loads the config a given version id points at, for the trading engine or
/// a future optimizer run to use as the baseline.
pub async fn load_config(paths: &PathsSection, version_id: &str) -> Result<Config, OptimizerError> {
    let raw = tokio::fs::read_to_string(config_path(&paths.config_versions_dir, version_id))
        .await
        .map_err(OptimizerError::Versioning)?;
    serde_yaml::from_str(&raw)
        .map_err(|e| OptimizerError::Versioning(std::io::Error::other(format!("corrupt config version {version_id}: {e}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config_version::ParameterSet;
    use std::collections::BTreeMap;

    fn temp_paths() -> PathsSection {
        PathsSection {
            state_path: PathBuf::from("/dev/null"),
            logs_dir: PathBuf::from("/dev/null"),
            config_versions_dir: std::env::temp_dir().join(format!("xsmom_versions_{}", Uuid::new_v4())),
            optimizer_db: PathBuf::from("/dev/null"),
        }
    }

    fn sample_metadata(version_id: &str, backup_of: Option<String>) -> ConfigVersionMetadata {
        ConfigVersionMetadata {
            version_id: version_id.to_string(),
            created_at: Utc::now(),
            parameters: ParameterSet { values: BTreeMap::new() },
            baseline_oos_sharpe: 1.0,
            candidate_oos_sharpe: 1.2,
            segment_metrics: Vec::new(),
            deployed: true,
            backup_of,
        }
    }

    #[tokio::test]
    async fn deploy_then_rollback_restores_prior_pointer() {
        let paths = temp_paths();
        let first = new_version_id();
        deploy(&paths, &Config::default(), &sample_metadata(&first, None)).await.expect("first deploy");
        assert_eq!(current_live_version(&paths).await.as_deref(), Some(first.as_str()));

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = new_version_id();
        let second = if second == first { format!("{first}1") } else { second };
        deploy(&paths, &Config::default(), &sample_metadata(&second, Some(first.clone())))
            .await
            .expect("second deploy");
        assert_eq!(current_live_version(&paths).await.as_deref(), Some(second.as_str()));

        let restored = rollback(&paths, None).await.expect("rollback");
        assert_eq!(restored, first);
        assert_eq!(current_live_version(&paths).await.as_deref(), Some(first.as_str()));
    }

    #[tokio::test]
    async fn list_versions_returns_all_metadata() {
        let paths = temp_paths();
        deploy(&paths, &Config::default(), &sample_metadata("1", None)).await.expect("deploy");
        let versions = list_versions(&paths).await.expect("list");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version_id, "1");
    }
}
