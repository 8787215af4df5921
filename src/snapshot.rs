//! Debug snapshots of agent sessions, one JSON file per key.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

/// Writes `<dir>/<trace_id>/<key>.json`. Without a directory every save is
/// a no-op.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSaver {
    dir: Option<PathBuf>,
}

impl SnapshotSaver {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn path_for(&self, trace_id: &str, key: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(sanitize(trace_id)).join(format!("{key}.json")))
    }

    pub fn save<T: Serialize + ?Sized>(&self, trace_id: &str, key: &str, data: &T) -> Result<()> {
        let Some(path) = self.path_for(trace_id, key) else {
            return Ok(());
        };
        write_json(&path, data)
    }

    /// Save, logging instead of failing. Snapshots never abort a session.
    pub fn save_or_warn<T: Serialize + ?Sized>(&self, trace_id: &str, key: &str, data: &T) {
        if let Err(e) = self.save(trace_id, key, data) {
            tracing::warn!(trace_id, key, error = %e, "Failed to save snapshot");
        }
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create snapshot directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(data).context("Failed to serialize snapshot")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write snapshot {}", path.display()))
}

/// Trace ids come from clients; keep them to one path component.
fn sanitize(trace_id: &str) -> String {
    trace_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_saver_writes_nothing() {
        let saver = SnapshotSaver::disabled();
        assert!(!saver.is_enabled());
        saver.save("t", "fsm_enter", &serde_json::json!({"a": 1})).unwrap();
        assert!(saver.path_for("t", "k").is_none());
    }

    #[test]
    fn nested_keys_create_directories() {
        let dir = tempfile::tempdir().unwrap();
        let saver = SnapshotSaver::new(Some(dir.path().to_path_buf()));
        saver.save("trace-1", "sse_events/0", &serde_json::json!({"status": "idle"})).unwrap();

        let written = std::fs::read_to_string(dir.path().join("trace-1/sse_events/0.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value["status"], "idle");
    }

    #[test]
    fn trace_ids_cannot_escape_the_directory() {
        let saver = SnapshotSaver::new(Some(PathBuf::from("/snapshots")));
        let path = saver.path_for("../../etc", "fsm_exit").unwrap();
        assert_eq!(path, PathBuf::from("/snapshots/______etc/fsm_exit.json"));
    }
}
