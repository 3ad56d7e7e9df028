//! Process-wide, runtime-mutable bot settings.
//!
//! All mutation goes through [`SettingsStore::update`], which persists before it
//! publishes, so the file on disk and the in-memory copy never diverge.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::Result;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Public,
    Private,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "public" => Some(Mode::Public),
            "private" => Some(Mode::Private),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Public => "public",
            Mode::Private => "private",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub prefix: String,
    pub mode: Mode,
    pub anti_delete: bool,
    pub restrict_to_admins: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prefix: "!".to_string(),
            mode: Mode::Public,
            anti_delete: false,
            restrict_to_admins: false,
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
    // Serialises update-and-persist so concurrent writers cannot interleave.
    write: Mutex<()>,
}

impl SettingsStore {
    /// Load settings from `path`, falling back to (and persisting) `defaults`.
    pub fn load(path: impl Into<PathBuf>, defaults: Settings) -> Result<Self> {
        let path = path.into();
        let settings = match read_settings_file(&path)? {
            Some(s) => {
                debug!(path = %path.display(), "loaded settings");
                s
            }
            None => {
                info!(path = %path.display(), "no settings file, writing defaults");
                write_settings_file(&path, &defaults)?;
                defaults
            }
        };

        Ok(Self {
            path,
            current: RwLock::new(settings),
            write: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> Settings {
        self.current.read().await.clone()
    }

    /// Apply `f` to a copy, persist it, then publish it. Returns the new settings.
    ///
    /// If persisting fails the in-memory settings are left untouched.
    pub async fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<Settings> {
        let _guard = self.write.lock().await;

        let mut next = self.current.read().await.clone();
        f(&mut next);
        write_settings_file(&self.path, &next)?;

        *self.current.write().await = next.clone();
        debug!(path = %self.path.display(), "settings updated");
        Ok(next)
    }

    /// Re-write the current settings to disk.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.write.lock().await;
        let snapshot = self.current.read().await.clone();
        write_settings_file(&self.path, &snapshot)
    }
}

fn read_settings_file(path: &Path) -> Result<Option<Settings>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&txt)?))
}

/// Write via a sibling temp file + rename so a crash never leaves a torn file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let txt = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, txt)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_settings_file(path: &Path, settings: &Settings) -> Result<()> {
    write_json_atomic(path, settings)
}
