//! Durable snapshot of the session list
//!
//! The pool is rewritten to a JSON file after every refresh cycle so that
//! refreshed tokens survive a restart. All writes use temp-file + rename so a
//! crash mid-write never leaves a truncated file behind.
//!
//! File format: `{"sessions":[{"session_key":"..."}]}`. The legacy
//! `SessionKey` field name is accepted on load.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::session::Session;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    sessions: Vec<SessionRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    #[serde(alias = "SessionKey")]
    session_key: String,
}

/// Reads and writes the persisted session list.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted sessions.
    ///
    /// Returns `Ok(None)` when no snapshot exists yet (it is created on the
    /// first refresh cycle).
    pub async fn load(&self) -> Result<Option<Vec<Session>>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no session snapshot found, will create on first refresh");
            return Ok(None);
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Snapshot(format!("reading snapshot: {e}")))?;
        let file: SnapshotFile = serde_json::from_str(&contents)
            .map_err(|e| Error::Snapshot(format!("parsing snapshot: {e}")))?;

        let sessions: Vec<Session> = file
            .sessions
            .into_iter()
            .filter(|r| !r.session_key.is_empty())
            .map(|r| Session::new(r.session_key))
            .collect();
        info!(path = %self.path.display(), sessions = sessions.len(), "loaded session snapshot");
        Ok(Some(sessions))
    }

    /// Persist the given sessions atomically.
    pub async fn save(&self, sessions: &[Session]) -> Result<()> {
        let file = SnapshotFile {
            sessions: sessions
                .iter()
                .map(|s| SessionRecord {
                    session_key: s.token().to_string(),
                })
                .collect(),
        };
        write_atomic(&self.path, &file).await?;
        info!(path = %self.path.display(), sessions = sessions.len(), "saved session snapshot");
        Ok(())
    }
}

/// Write the snapshot to a temp file in the same directory, then rename it
/// over the target. Permissions are 0600 since the file holds session tokens.
async fn write_atomic(path: &Path, data: &SnapshotFile) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Snapshot(format!("serializing snapshot: {e}")))?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let tmp_path = dir.join(format!(".sessions.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Snapshot(format!("writing temp snapshot: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Snapshot(format!("setting snapshot permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Snapshot(format!("renaming temp snapshot: {e}")))?;

    debug!(path = %path.display(), "persisted snapshot");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("sessions.json"));

        store
            .save(&[Session::new("tok_a"), Session::new("tok_b")])
            .await
            .unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        let tokens: Vec<&str> = loaded.iter().map(|s| s.token()).collect();
        assert_eq!(tokens, vec!["tok_a", "tok_b"]);
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("sessions.json"));
        assert!(store.load().await.unwrap().is_none());
        assert!(!store.path().exists(), "load must not create the file");
    }

    #[tokio::test]
    async fn accepts_legacy_field_name_and_drops_empty_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        tokio::fs::write(
            &path,
            r#"{"sessions":[{"SessionKey":"legacy"},{"SessionKey":""},{"session_key":"new"}]}"#,
        )
        .await
        .unwrap();

        let loaded = SnapshotStore::new(path).load().await.unwrap().unwrap();
        let tokens: Vec<&str> = loaded.iter().map(|s| s.token()).collect();
        assert_eq!(tokens, vec!["legacy", "new"]);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = SnapshotStore::new(path).load().await.unwrap_err();
        assert!(err.to_string().contains("parsing snapshot"), "got: {err}");
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("sessions.json"));
        store.save(&[Session::new("x")]).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["sessions.json"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        SnapshotStore::new(path.clone())
            .save(&[Session::new("x")])
            .await
            .unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "snapshot must be 0600, got {mode:o}");
    }
}
