use std::{
    env, fs,
    path::PathBuf,
    time::Duration,
};

use crate::{domain::Jid, errors::Error, Result};

/// Typed process configuration, read from the environment (and `.env`).
///
/// Runtime-mutable bot behavior (prefix, mode, toggles) lives in
/// [`crate::settings::Settings`] instead; this struct is fixed for the process lifetime.
#[derive(Clone, Debug)]
pub struct Config {
    // Transport
    pub sidecar_url: String,
    pub request_timeout: Duration,

    // Identity
    pub owners: Vec<Jid>,

    // Storage
    pub auth_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub settings_file: PathBuf,

    // Behavior
    pub default_prefix: String,
    pub ignore_self_messages: bool,
    pub media_download_limit: u64,

    // Pacing / recovery
    pub send_interval: Duration,
    pub reconnect_delay: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Existing environment variables win over `.env`.
        dotenvy::dotenv().ok();
        let cfg = Self::from_lookup(|key| env::var(key).ok())?;

        fs::create_dir_all(&cfg.auth_dir)?;
        fs::create_dir_all(&cfg.storage_dir)?;
        if let Some(parent) = cfg.settings_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        Ok(cfg)
    }

    /// Build the config from an arbitrary key lookup. Does not touch the filesystem.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        let sidecar_url = get("WAB_SIDECAR_URL").unwrap_or("ws://127.0.0.1:8765".to_string());
        if !(sidecar_url.starts_with("ws://") || sidecar_url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "WAB_SIDECAR_URL must be a ws:// or wss:// url, got {sidecar_url}"
            )));
        }
        let request_timeout = Duration::from_millis(
            parse_u64(&get, "SIDECAR_REQUEST_TIMEOUT_MS")?.unwrap_or(30_000),
        );

        let owners = parse_owners(get("OWNER_NUMBER"));

        let auth_dir = PathBuf::from(get("AUTH_DIR").unwrap_or("./auth_info".to_string()));
        let storage_dir = PathBuf::from(get("STORAGE_DIR").unwrap_or("./storage".to_string()));
        let settings_file = get("SETTINGS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| storage_dir.join("settings.json"));

        let default_prefix = get("BOT_PREFIX")
            .map(|p| p.trim().to_string())
            .unwrap_or("!".to_string());
        if default_prefix.chars().any(char::is_whitespace) {
            return Err(Error::Config(
                "BOT_PREFIX must not contain whitespace".to_string(),
            ));
        }
        let ignore_self_messages = parse_bool(get("IGNORE_SELF_MESSAGES")).unwrap_or(false);
        let media_download_limit =
            parse_u64(&get, "MEDIA_DOWNLOAD_LIMIT")?.unwrap_or(64 * 1024 * 1024);

        let send_interval_ms = parse_u64(&get, "SEND_INTERVAL_MS")?.unwrap_or(1000);
        if send_interval_ms == 0 {
            return Err(Error::Config(
                "SEND_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }
        let send_interval = Duration::from_millis(send_interval_ms);
        let reconnect_delay =
            Duration::from_millis(parse_u64(&get, "RECONNECT_DELAY_MS")?.unwrap_or(5000));

        Ok(Self {
            sidecar_url,
            request_timeout,
            owners,
            auth_dir,
            storage_dir,
            settings_file,
            default_prefix,
            ignore_self_messages,
            media_download_limit,
            send_interval,
            reconnect_delay,
        })
    }

    /// Recipient of the one-time "connected" notification.
    pub fn primary_owner(&self) -> Option<&Jid> {
        self.owners.first()
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.auth_dir.join("creds.json")
    }
}

fn parse_bool(v: Option<String>) -> Option<bool> {
    v.map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn parse_u64(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    match get(key) {
        None => Ok(None),
        Some(s) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {s}"))),
    }
}

fn parse_owners(v: Option<String>) -> Vec<Jid> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(Jid::from_phone)
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
