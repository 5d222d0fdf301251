//! Atomic JSON persistence shared by all learned models.
//!
//! Every persisted file carries a `version` integer. Loading a file with an
//! unknown version or corrupt content yields `None` and the caller starts
//! fresh; persistence must never crash the decision loop.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Serialize `model` and atomically replace `path` via temp-file + rename.
pub fn write_model<T: Serialize>(path: &Path, model: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(model).context("serialize model")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create data dir {}", parent.display()))?;
    }
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}

/// Load a persisted model, accepting only the expected schema version.
pub fn load_model<T: DeserializeOwned>(path: &Path, version: u32) -> Option<T> {
    let raw = fs::read(path).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    if value.get("version").and_then(serde_json::Value::as_u64) != Some(u64::from(version)) {
        debug!(path = %path.display(), "ignoring persisted model with unknown schema version");
        return None;
    }
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Model {
        version: u32,
        value: f64,
    }

    #[test]
    fn round_trip_preserves_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let model = Model { version: 1, value: 42.5 };
        write_model(&path, &model).unwrap();
        let loaded: Model = load_model(&path, 1).unwrap();
        assert_eq!(loaded, model);
    }

    #[test]
    fn unknown_version_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        write_model(&path, &Model { version: 2, value: 1.0 }).unwrap();
        assert!(load_model::<Model>(&path, 1).is_none());
    }

    #[test]
    fn corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(load_model::<Model>(&path, 1).is_none());
    }

    #[test]
    fn missing_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_model::<Model>(&dir.path().join("absent.json"), 1).is_none());
    }
}
