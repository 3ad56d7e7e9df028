//! Session credential persistence.
//!
//! The credential blob is opaque to the bot: the transport hands it out via
//! `CredentialsUpdated` and takes it back on `connect`.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{errors::Error, settings::write_json_atomic, Result};

/// Opaque authenticated-identity material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub serde_json::Value);

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<Credentials>>;
    fn save(&self, credentials: &Credentials) -> Result<()>;
    /// Remove persisted credentials. Wiping an empty store is not an error.
    fn wipe(&self) -> Result<()>;
}

/// Single JSON file credential store.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credentials>> {
        let txt = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if txt.trim().is_empty() {
            return Ok(None);
        }
        // An unreadable blob cannot authenticate; the supervisor wipes it.
        serde_json::from_str(&txt).map(Some).map_err(|e| {
            Error::SessionCorrupt(format!(
                "malformed credentials at {}: {e}",
                self.path.display()
            ))
        })
    }

    fn save(&self, credentials: &Credentials) -> Result<()> {
        write_json_atomic(&self.path, credentials)
    }

    fn wipe(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tmp_store(name: &str) -> FileCredentialStore {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        FileCredentialStore::new(format!(
            "/tmp/wab-creds-{name}-{}-{ts}/creds.json",
            std::process::id()
        ))
    }

    fn cleanup(store: &FileCredentialStore) {
        if let Some(dir) = store.path().parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn save_load_wipe_cycle() {
        let store = tmp_store("cycle");
        assert_eq!(store.load().unwrap(), None);

        let creds = Credentials(json!({"me": {"id": "1555@s.whatsapp.net"}, "noiseKey": "abc"}));
        store.save(&creds).unwrap();
        assert_eq!(store.load().unwrap(), Some(creds));

        store.wipe().unwrap();
        assert_eq!(store.load().unwrap(), None);
        // Second wipe is a no-op.
        store.wipe().unwrap();

        cleanup(&store);
    }

    #[test]
    fn malformed_file_reports_session_corrupt() {
        let store = tmp_store("corrupt");
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{ not json").unwrap();

        let err = store.load().unwrap_err();
        assert!(err.is_session_corrupt());

        cleanup(&store);
    }
}
