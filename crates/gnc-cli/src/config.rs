//! Config vault – reads/writes `~/.gnc-console/config.toml`.

use gnc_bridge::{DEFAULT_ENDPOINT, DEFAULT_HEALTH_INTERVAL};
use gnc_dashboard::ActiveView;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Shortest health-check period accepted from config or environment.
const MIN_HEALTH_INTERVAL_MS: u64 = 100;

/// Persisted console configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// rosbridge WebSocket URL.
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,

    /// Reconnect health-check period in milliseconds.
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    /// Scene shown on start-up: `earth` or `station`.
    #[serde(default = "default_view")]
    pub default_view: String,
}

fn default_bridge_url() -> String {
    DEFAULT_ENDPOINT.to_string()
}
fn default_health_interval_ms() -> u64 {
    DEFAULT_HEALTH_INTERVAL.as_millis() as u64
}
fn default_view() -> String {
    ActiveView::default().as_str().to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            health_interval_ms: default_health_interval_ms(),
            default_view: default_view(),
        }
    }
}

impl Config {
    /// The configured check period, clamped to a sane minimum.
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(MIN_HEALTH_INTERVAL_MS))
    }

    /// The configured start-up view; unknown names fall back to the default.
    pub fn view(&self) -> ActiveView {
        ActiveView::parse(&self.default_view).unwrap_or_default()
    }
}

/// Return the path to `~/.gnc-console/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".gnc-console").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `GNC_*` environment overrides.
///
/// | Variable | Config field |
/// |---|---|
/// | `GNC_BRIDGE_URL` | `bridge_url` |
/// | `GNC_HEALTH_INTERVAL_MS` | `health_interval_ms` |
/// | `GNC_DEFAULT_VIEW` | `default_view` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("GNC_BRIDGE_URL")
        && !v.trim().is_empty()
    {
        cfg.bridge_url = v.trim().to_string();
    }
    if let Ok(v) = std::env::var("GNC_HEALTH_INTERVAL_MS")
        && let Ok(ms) = v.trim().parse::<u64>()
    {
        cfg.health_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("GNC_DEFAULT_VIEW")
        && let Some(view) = ActiveView::parse(&v)
    {
        cfg.default_view = view.as_str().to_string();
    }
}

/// Save the config to disk, creating `~/.gnc-console/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
