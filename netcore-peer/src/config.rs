//! Load the link configuration from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use netcore_core::{Backoff, LinkSpec, NetCoreError, Role};
use serde::Deserialize;

/// Peer configuration. File: ~/.config/netcore/config.toml or /etc/netcore/config.toml.
/// Env overrides: NETCORE_ADDRESS, NETCORE_BASE_PORT, NETCORE_ROLE, NETCORE_LOOPBACK,
/// NETCORE_SYNCED_CALL_TIMEOUT_MS.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Peer host (default 127.0.0.1).
    #[serde(default = "default_address")]
    pub address: String,
    /// First of the three link ports (default 47800).
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_role")]
    pub role: Role,
    /// Both ends on one host (default true).
    #[serde(default = "default_loopback")]
    pub loopback: bool,
    #[serde(default = "default_synced_call_timeout_ms")]
    pub synced_call_timeout_ms: u64,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Give up reconnecting after this many failed attempts; unset retries forever.
    #[serde(default)]
    pub reconnect_max_attempts: Option<u32>,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}
fn default_base_port() -> u16 {
    47800
}
fn default_role() -> Role {
    Role::Server
}
fn default_loopback() -> bool {
    true
}
fn default_synced_call_timeout_ms() -> u64 {
    netcore_core::DEFAULT_SYNCED_CALL_TIMEOUT.as_millis() as u64
}
fn default_reconnect_initial_ms() -> u64 {
    100
}
fn default_reconnect_max_ms() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            base_port: default_base_port(),
            role: default_role(),
            loopback: default_loopback(),
            synced_call_timeout_ms: default_synced_call_timeout_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_max_attempts: None,
        }
    }
}

impl Config {
    pub fn to_link_spec(&self) -> Result<LinkSpec, NetCoreError> {
        let spec = LinkSpec {
            address: self.address.clone(),
            base_port: self.base_port,
            role: self.role,
            loopback: self.loopback,
            synced_call_timeout: Duration::from_millis(self.synced_call_timeout_ms),
            reconnect: Backoff {
                initial: Duration::from_millis(self.reconnect_initial_ms),
                max: Duration::from_millis(self.reconnect_max_ms),
                max_attempts: self.reconnect_max_attempts,
            },
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Apply env overrides from `lookup` (normally `std::env::var`). Unparseable values are
    /// logged and ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = lookup("NETCORE_ADDRESS") {
            self.address = s;
        }
        if let Some(p) = parse_env(&lookup, "NETCORE_BASE_PORT") {
            self.base_port = p;
        }
        if let Some(r) = parse_env(&lookup, "NETCORE_ROLE") {
            self.role = r;
        }
        if let Some(b) = parse_env(&lookup, "NETCORE_LOOPBACK") {
            self.loopback = b;
        }
        if let Some(ms) = parse_env(&lookup, "NETCORE_SYNCED_CALL_TIMEOUT_MS") {
            self.synced_call_timeout_ms = ms;
        }
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("ignoring {key}={raw:?}: {e}");
            None
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|key| std::env::var(key).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/netcore/config.toml"));
    }
    out.push(PathBuf::from("/etc/netcore/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    load_from(&path)
}

/// Parse one config file. The first existing file wins; a broken one is not skipped over.
pub fn load_from(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot read {}: {e}", path.display());
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("invalid config {}: {e}; using defaults", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn file_fields_default_individually() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "role = \"client\"\nbase_port = 50000").unwrap();
        let c = load_from(f.path()).unwrap();
        assert_eq!(c.role, Role::Client);
        assert_eq!(c.base_port, 50000);
        assert_eq!(c.address, "127.0.0.1");
        assert!(c.loopback);
        let spec = c.to_link_spec().unwrap();
        assert_eq!(spec.synced_call_timeout, netcore_core::DEFAULT_SYNCED_CALL_TIMEOUT);
        assert_eq!(spec.unreliable_listen_port(), 50000);
    }

    #[test]
    fn unknown_keys_and_bad_toml_fall_back() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "proxy_port = 3128").unwrap();
        assert!(load_from(f.path()).is_none());
        assert!(load_from(Path::new("/nonexistent/netcore.toml")).is_none());
    }

    #[test]
    fn env_overrides_win_and_garbage_is_ignored() {
        let env: HashMap<&str, &str> = [
            ("NETCORE_ADDRESS", "192.168.1.20"),
            ("NETCORE_BASE_PORT", "not-a-port"),
            ("NETCORE_ROLE", "client"),
            ("NETCORE_LOOPBACK", "false"),
            ("NETCORE_SYNCED_CALL_TIMEOUT_MS", "1000"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.address, "192.168.1.20");
        assert_eq!(c.base_port, default_base_port());
        assert_eq!(c.role, Role::Client);
        assert!(!c.loopback);
        let spec = c.to_link_spec().unwrap();
        assert_eq!(spec.synced_call_timeout, Duration::from_secs(1));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let c = Config {
            synced_call_timeout_ms: 0,
            ..Config::default()
        };
        assert!(c.to_link_spec().is_err());
    }
}
