//! Load config from file and environment.

use serde::Deserialize;
use slsk_core::{SearchOptions, MAX_FRAME_LEN};
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/slsk/config.toml or /etc/slsk/config.toml.
/// Env overrides: SLSK_LISTEN_PORT, SLSK_USERNAME, SLSK_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Peer listen port (default 2234).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Our username, sent in PeerInit (default "slsk-linux").
    #[serde(default = "default_username")]
    pub username: String,
    /// tracing filter used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Largest accepted peer frame.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default)]
    pub search: SearchOptions,
}

fn default_listen_port() -> u16 {
    2234
}
fn default_username() -> String {
    "slsk-linux".to_owned()
}
fn default_log_filter() -> String {
    "info".to_owned()
}
fn default_max_frame_len() -> usize {
    MAX_FRAME_LEN
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            username: default_username(),
            log_filter: default_log_filter(),
            max_frame_len: default_max_frame_len(),
            search: SearchOptions::default(),
        }
    }
}

/// Load config: defaults, then the first config file found, then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = load_file()?.unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("SLSK_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(u) = var("SLSK_USERNAME").filter(|u| !u.is_empty()) {
        c.username = u;
    }
    if let Some(f) = var("SLSK_LOG") {
        c.log_filter = f;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/slsk/config.toml"));
    }
    out.push(PathBuf::from("/etc/slsk/config.toml"));
    out
}

fn load_file() -> anyhow::Result<Option<Config>> {
    use anyhow::Context;

    let Some(path) = config_paths().into_iter().find(|p| p.exists()) else {
        return Ok(None);
    };
    let s = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let c = toml::from_str::<Config>(&s).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(c))
}
