//! Per-asset render state and the snapshots handed to HTTP clients.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use parking_lot::RwLock;

use crate::foundation::core::BuildVersion;

/// Lifecycle of one render subprocess under one build version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Active { progress_text: String },
    Successful { asset_url: String },
    Failed { error_text: String },
}

impl ProcessState {
    pub fn active(progress_text: impl Into<String>) -> Self {
        Self::Active {
            progress_text: progress_text.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active { .. })
    }

    pub fn snapshot(&self) -> ProcessStateSnapshot {
        match self {
            Self::Active { progress_text } => ProcessStateSnapshot::Active {
                progress_text: progress_text.clone(),
            },
            Self::Successful { asset_url } => ProcessStateSnapshot::Successful {
                asset_url: asset_url.clone(),
            },
            Self::Failed { error_text } => ProcessStateSnapshot::Failed {
                error_text: error_text.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ProcessStateSnapshot {
    #[serde(rename_all = "camelCase")]
    Active { progress_text: String },
    #[serde(rename_all = "camelCase")]
    Successful { asset_url: String },
    #[serde(rename_all = "camelCase")]
    Failed { error_text: String },
}

/// What a polling client sees for one asset key.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "moduleStatus", rename_all = "camelCase")]
pub enum StateSnapshot {
    #[serde(rename_all = "camelCase")]
    Valid {
        build_version: BuildVersion,
        animation_name: String,
        frame_count: u64,
        process_state: ProcessStateSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    Invalid {
        build_version: BuildVersion,
        error_text: String,
    },
}

/// Reply to a client state read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// No build has completed yet.
    NoBuild,
    Snapshot(StateSnapshot),
    /// The key is well-formed but not valid for the current module.
    InvalidKey(String),
}

/// URL path under which a registered asset is served.
pub fn asset_url(file_name: &str) -> String {
    format!("/asset/{file_name}")
}

/// Completed render artifacts by file name.
///
/// Written only by the supervisor actor, read by HTTP handlers.
#[derive(Debug, Clone, Default)]
pub struct AssetTable {
    inner: Arc<RwLock<HashMap<String, PathBuf>>>,
}

impl AssetTable {
    pub fn register(&self, file_name: impl Into<String>, path: PathBuf) {
        self.inner.write().insert(file_name.into(), path);
    }

    pub fn resolve(&self, file_name: &str) -> Option<PathBuf> {
        self.inner.read().get(file_name).cloned()
    }

    /// Forget every asset and return the paths that were registered.
    pub fn clear(&self) -> Vec<PathBuf> {
        self.inner.write().drain().map(|(_, path)| path).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_snapshot_json_shape() {
        let snapshot = StateSnapshot::Valid {
            build_version: BuildVersion(2),
            animation_name: "orbit".into(),
            frame_count: 10,
            process_state: ProcessState::active("Rendered 3/10 frames").snapshot(),
        };
        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            json!({
                "moduleStatus": "valid",
                "buildVersion": 2,
                "animationName": "orbit",
                "frameCount": 10,
                "processState": {"status": "active", "progressText": "Rendered 3/10 frames"}
            })
        );
    }

    #[test]
    fn terminal_states_serialize_their_payload() {
        let ok = ProcessState::Successful {
            asset_url: asset_url("v1-animation.mp4"),
        };
        assert_eq!(
            serde_json::to_value(ok.snapshot()).unwrap(),
            json!({"status": "successful", "assetUrl": "/asset/v1-animation.mp4"})
        );
        let failed = ProcessState::Failed {
            error_text: "boom".into(),
        };
        assert!(failed.is_terminal());
        assert_eq!(
            serde_json::to_value(failed.snapshot()).unwrap(),
            json!({"status": "failed", "errorText": "boom"})
        );
    }

    #[test]
    fn invalid_snapshot_json_shape() {
        let snapshot = StateSnapshot::Invalid {
            build_version: BuildVersion(0),
            error_text: "build error: x".into(),
        };
        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            json!({"moduleStatus": "invalid", "buildVersion": 0, "errorText": "build error: x"})
        );
    }

    #[test]
    fn asset_table_is_shared_between_clones() {
        let table = AssetTable::default();
        let reader = table.clone();
        table.register("v0-frame-1.png", PathBuf::from("/tmp/v0-frame-1.png"));
        assert_eq!(
            reader.resolve("v0-frame-1.png"),
            Some(PathBuf::from("/tmp/v0-frame-1.png"))
        );
        assert!(reader.resolve("missing.png").is_none());
    }

    #[test]
    fn clearing_returns_the_registered_paths() {
        let table = AssetTable::default();
        table.register("v0-frame-1.png", PathBuf::from("/tmp/v0-frame-1.png"));
        table.register("v0-animation.mp4", PathBuf::from("/tmp/v0-animation.mp4"));
        let mut cleared = table.clear();
        cleared.sort();
        assert_eq!(
            cleared,
            vec![PathBuf::from("/tmp/v0-animation.mp4"), PathBuf::from("/tmp/v0-frame-1.png")]
        );
        assert!(table.is_empty());
        assert!(table.resolve("v0-frame-1.png").is_none());
    }
}
