use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// The runner's persisted identity: the machine id and auth token handed
/// back by the control plane on registration, plus the name it was
/// registered under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunnerIdentity {
    pub id: String,
    pub token: String,
    pub name: String,
}

/// Locates and persists `config.json` next to the running binary.
///
/// Unlike the XDG-homed config the desktop client uses, a runner is expected
/// to live in its own directory (one per machine, often one per container),
/// so co-locating the file with the executable keeps deployment to "copy the
/// binary and a token".
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    /// Resolves `config.json` relative to the current executable's directory.
    pub fn next_to_binary() -> Result<Self, ConfigError> {
        let exe = std::env::current_exe().map_err(|e| ConfigError::Io {
            message: "could not resolve current executable path".into(),
            source: e,
        })?;
        let dir = exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            path: dir.join("config.json"),
        })
    }

    #[cfg(test)]
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted identity, if any. A missing file is not an
    /// error — the runner bootstraps a fresh one. A present-but-unparseable
    /// file is treated as corrupt and discarded the same way: the caller
    /// re-registers and overwrites it.
    pub fn load(&self) -> Option<RunnerIdentity> {
        let raw = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(identity) => Some(identity),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "config.json is not valid, ignoring");
                None
            }
        }
    }

    /// Writes the identity via a tmp-file-then-rename so a crash mid-write
    /// never leaves `config.json` half-written.
    pub fn save(&self, identity: &RunnerIdentity) -> Result<(), ConfigError> {
        let body = serde_json::to_string_pretty(identity).map_err(|e| ConfigError::Serialize {
            source: e,
        })?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &body).map_err(|e| ConfigError::Io {
            message: format!("writing {}", tmp_path.display()),
            source: e,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|e| ConfigError::Io {
            message: format!("renaming {} to {}", tmp_path.display(), self.path.display()),
            source: e,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::at(dir.path().join("config.json"));
        assert!(store.load().is_none());
    }

    #[test]
    fn round_trips_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::at(dir.path().join("config.json"));
        let identity = RunnerIdentity {
            id: "machine-1".into(),
            token: "secret".into(),
            name: "box-a".into(),
        };
        store.save(&identity).unwrap();
        assert_eq!(store.load(), Some(identity));
    }

    #[test]
    fn corrupt_file_loads_as_none_rather_than_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        let store = IdentityStore::at(path);
        assert!(store.load().is_none());
    }

    #[test]
    fn save_overwrites_previous_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::at(dir.path().join("config.json"));
        store
            .save(&RunnerIdentity {
                id: "old".into(),
                token: "old-token".into(),
                name: "old-name".into(),
            })
            .unwrap();
        let fresh = RunnerIdentity {
            id: "new".into(),
            token: "new-token".into(),
            name: "new-name".into(),
        };
        store.save(&fresh).unwrap();
        assert_eq!(store.load(), Some(fresh));
    }
}
