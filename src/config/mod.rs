//! Settings surface consumed by the supervisor
//!
//! Settings are loaded from an optional JSON file named by
//! `WEBWARDEN_SETTINGS`, then individual `WEBWARDEN_*` environment
//! variables override scalar fields. The store keeps the live copy;
//! everything else takes cloned snapshots.

use crate::error::SettingsError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

/// Prefix for all environment overrides
pub const ENV_PREFIX: &str = "WEBWARDEN_";

/// Environment variable naming the JSON settings file
pub const SETTINGS_PATH_ENV: &str = "WEBWARDEN_SETTINGS";

/// Full settings surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the companion worker and the redirect responder bind to
    pub bind_addr: String,
    /// External port served by the companion worker
    pub server_port: u16,
    /// Loopback port of the primary (internal) listener
    pub server_internal_port: u16,
    /// Whether the external endpoint is served over TLS
    pub server_ssl: bool,
    /// PEM certificate
    pub server_cert: Option<String>,
    /// PEM private key
    pub server_key: Option<String>,
    /// PEM Diffie-Hellman parameters
    pub server_dh_params: Option<String>,
    /// Domain the certificate is issued for, if any
    pub acme_domain: Option<String>,
    /// Listen backlog of the internal listener
    pub request_queue_size: u32,
    /// Maximum concurrent requests on the internal listener
    pub request_thread_count: usize,
    /// Run the health watchdog
    pub server_watch: bool,
    /// Probe timeout in seconds
    pub server_watch_timeout: f64,
    /// Passed to the worker as `REDIRECT_SERVER`
    pub redirect_server: bool,
    /// Run the in-process redirect & challenge responder
    pub redirect_listener: bool,
    /// Plaintext port of the redirect responder
    pub redirect_port: u16,
    /// Demo deployments never run the watchdog
    pub demo_mode: bool,
    /// Bypass the supervisor and serve the app directly
    pub debug: bool,
    /// Companion worker executable
    pub web_executable: String,
    /// Extra arguments for the companion worker
    pub web_args: Vec<String>,
    /// Directory the certificate and key files are written to
    pub data_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            server_port: 443,
            server_internal_port: 9755,
            server_ssl: true,
            server_cert: None,
            server_key: None,
            server_dh_params: None,
            acme_domain: None,
            request_queue_size: 1024,
            request_thread_count: 128,
            server_watch: true,
            server_watch_timeout: 10.0,
            redirect_server: true,
            redirect_listener: false,
            redirect_port: 80,
            demo_mode: false,
            debug: false,
            web_executable: "webwarden-web".to_string(),
            web_args: Vec::new(),
            data_dir: PathBuf::from("/var/lib/webwarden"),
        }
    }
}

/// The part of the settings whose change requires a new generation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServingConfig {
    pub server_cert: Option<String>,
    pub server_key: Option<String>,
    pub server_port: u16,
}

impl Settings {
    /// Snapshot of the certificate/key/port triple
    pub fn serving(&self) -> ServingConfig {
        ServingConfig {
            server_cert: self.server_cert.clone(),
            server_key: self.server_key.clone(),
            server_port: self.server_port,
        }
    }

    /// Probe timeout as a `Duration`, clamped to at least 1ms
    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.server_watch_timeout.max(0.001))
    }

    /// Whether the watchdog should run at all
    pub fn watchdog_enabled(&self) -> bool {
        self.server_watch && !self.demo_mode
    }

    /// Loopback address of the internal listener as handed to the worker
    pub fn internal_address(&self) -> String {
        format!("localhost:{}", self.server_internal_port)
    }

    /// Apply `WEBWARDEN_*` overrides using `lookup` to read variables
    ///
    /// Takes a lookup function so callers (and tests) can supply something
    /// other than the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = get("SERVER_PORT") {
            self.server_port = parse_env("SERVER_PORT", &v)?;
        }
        if let Some(v) = get("SERVER_INTERNAL_PORT") {
            self.server_internal_port = parse_env("SERVER_INTERNAL_PORT", &v)?;
        }
        if let Some(v) = get("SERVER_SSL") {
            self.server_ssl = parse_bool("SERVER_SSL", &v)?;
        }
        if let Some(v) = get("ACME_DOMAIN") {
            self.acme_domain = Some(v).filter(|d| !d.is_empty());
        }
        if let Some(v) = get("REQUEST_QUEUE_SIZE") {
            self.request_queue_size = parse_env("REQUEST_QUEUE_SIZE", &v)?;
        }
        if let Some(v) = get("REQUEST_THREAD_COUNT") {
            self.request_thread_count = parse_env("REQUEST_THREAD_COUNT", &v)?;
        }
        if let Some(v) = get("SERVER_WATCH") {
            self.server_watch = parse_bool("SERVER_WATCH", &v)?;
        }
        if let Some(v) = get("SERVER_WATCH_TIMEOUT") {
            self.server_watch_timeout = parse_env("SERVER_WATCH_TIMEOUT", &v)?;
        }
        if let Some(v) = get("REDIRECT_SERVER") {
            self.redirect_server = parse_bool("REDIRECT_SERVER", &v)?;
        }
        if let Some(v) = get("REDIRECT_LISTENER") {
            self.redirect_listener = parse_bool("REDIRECT_LISTENER", &v)?;
        }
        if let Some(v) = get("REDIRECT_PORT") {
            self.redirect_port = parse_env("REDIRECT_PORT", &v)?;
        }
        if let Some(v) = get("DEMO_MODE") {
            self.demo_mode = parse_bool("DEMO_MODE", &v)?;
        }
        if let Some(v) = get("DEBUG") {
            self.debug = parse_bool("DEBUG", &v)?;
        }
        if let Some(v) = get("WEB_EXECUTABLE") {
            self.web_executable = v;
        }
        if let Some(v) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::InvalidEnv {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SettingsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidEnv {
            key: format!("{ENV_PREFIX}{key}"),
            value: value.to_string(),
        }),
    }
}

/// External settings store
///
/// `settings()` returns a consistent snapshot; `update` mutates the live
/// copy in memory and `commit` persists it.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Current settings snapshot
    fn settings(&self) -> Settings;

    /// Mutate the live settings in place
    fn update(&self, f: &mut dyn FnMut(&mut Settings));

    /// Persist the live settings
    async fn commit(&self) -> Result<(), SettingsError>;

    /// Re-read settings from their source, replacing the live copy
    async fn reload(&self) -> Result<(), SettingsError>;
}

/// Settings kept in memory, optionally backed by a JSON file
pub struct FileSettingsStore {
    path: Option<PathBuf>,
    live: RwLock<Settings>,
}

impl FileSettingsStore {
    /// In-memory store with the given settings and no backing file
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: None,
            live: RwLock::new(settings),
        }
    }

    /// Load from `path` (missing file means defaults) without env overrides
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let settings = read_file(&path).await?;
        Ok(Self {
            path: Some(path),
            live: RwLock::new(settings),
        })
    }

    /// Load from `WEBWARDEN_SETTINGS` (if set) and apply env overrides
    pub async fn from_env() -> Result<Self, SettingsError> {
        let path = std::env::var(SETTINGS_PATH_ENV).ok().map(PathBuf::from);
        let mut settings = match &path {
            Some(p) => read_file(p).await?,
            None => Settings::default(),
        };
        settings.apply_overrides(|k| std::env::var(k).ok())?;
        info!(
            path = ?path,
            server_port = settings.server_port,
            server_ssl = settings.server_ssl,
            "Settings loaded"
        );
        Ok(Self {
            path,
            live: RwLock::new(settings),
        })
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

async fn read_file(path: &Path) -> Result<Settings, SettingsError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Settings file missing, using defaults");
            Ok(Settings::default())
        }
        Err(source) => Err(SettingsError::Read {
            path: path.display().to_string(),
            source,
        }),
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    fn settings(&self) -> Settings {
        self.live
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update(&self, f: &mut dyn FnMut(&mut Settings)) {
        let mut live = self
            .live
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut live);
    }

    async fn commit(&self) -> Result<(), SettingsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&self.settings())?;
        tokio::fs::write(path, json)
            .await
            .map_err(|source| SettingsError::Write {
                path: path.display().to_string(),
                source,
            })?;
        debug!(path = %path.display(), "Settings committed");
        Ok(())
    }

    async fn reload(&self) -> Result<(), SettingsError> {
        let mut settings = match &self.path {
            Some(p) => read_file(p).await?,
            None => self.settings(),
        };
        settings.apply_overrides(|k| std::env::var(k).ok())?;
        *self
            .live
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
        Ok(())
    }
}

#[cfg(test)]
#[path = "settings_test.rs"]
mod tests;
