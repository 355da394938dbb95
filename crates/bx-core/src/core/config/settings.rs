use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use dirs_next::home_dir;
use serde::Serialize;

use crate::core::net;

pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const ABSPATH_PLACEHOLDER: &str = "${abspath}";

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Unset and falsey values both read as `default`.
    pub(crate) fn flag(&self, key: &str, default: bool) -> bool {
        match self.var(key) {
            Some(value) => {
                let lowered = value.trim().to_ascii_lowercase();
                !matches!(lowered.as_str(), "0" | "false" | "no" | "off" | "")
            }
            None => default,
        }
    }

    pub(crate) fn non_empty(&self, key: &str) -> Option<&str> {
        self.var(key).filter(|value| !value.trim().is_empty())
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheLocation {
    pub path: PathBuf,
    pub source: &'static str,
}

/// Knobs shared by every archive, revision and content of one cache.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub buffer_size: usize,
    pub exec_permission: Option<String>,
    pub proxy_auth: Option<String>,
    pub keep_proxies: bool,
    /// Proxy that receives `proxy_auth`; taken from the standard variables.
    pub proxy_url: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            exec_permission: None,
            proxy_auth: None,
            keep_proxies: false,
            proxy_url: None,
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub(crate) cache: CacheLocation,
    pub(crate) locking: bool,
    pub(crate) settings: Arc<CacheSettings>,
    pub(crate) trusted_ca: Vec<PathBuf>,
}

impl Config {
    /// Builds a configuration snapshot from the current process environment.
    ///
    /// # Errors
    /// Returns an error if the cache root cannot be resolved.
    pub fn from_env() -> Result<Self> {
        let snapshot = EnvSnapshot::capture();
        Self::from_snapshot(&snapshot)
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let buffer_size = match snapshot.non_empty("BX_CACHE_BUFSIZE") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|size| *size > 0)
                .with_context(|| format!("BX_CACHE_BUFSIZE must be a positive integer, got {raw:?}"))?,
            None => DEFAULT_BUFFER_SIZE,
        };
        let trusted_ca = snapshot
            .non_empty("BX_TRUSTED_CA")
            .map(|raw| env::split_paths(raw).collect())
            .unwrap_or_default();
        Ok(Self {
            cache: resolve_cache_location(snapshot)?,
            locking: snapshot.flag("BX_CACHE_LOCKING", true),
            settings: Arc::new(CacheSettings {
                buffer_size,
                exec_permission: snapshot.non_empty("BX_EXEC_PERMISSION").map(ToOwned::to_owned),
                proxy_auth: snapshot.non_empty("BX_PROXY_AUTH").map(ToOwned::to_owned),
                keep_proxies: net::keep_proxies(snapshot),
                proxy_url: net::proxy_url(snapshot),
            }),
            trusted_ca,
        })
    }

    /// Replace the cache root, e.g. from a command-line flag.
    #[must_use]
    pub fn with_cache_root(mut self, path: PathBuf) -> Self {
        self.cache = CacheLocation {
            path,
            source: "--cache-root",
        };
        self
    }

    #[must_use]
    pub fn cache(&self) -> &CacheLocation {
        &self.cache
    }

    #[must_use]
    pub fn locking(&self) -> bool {
        self.locking
    }

    #[must_use]
    pub fn settings(&self) -> Arc<CacheSettings> {
        Arc::clone(&self.settings)
    }

    #[must_use]
    pub fn trusted_ca_paths(&self) -> &[PathBuf] {
        &self.trusted_ca
    }
}

fn resolve_cache_location(snapshot: &EnvSnapshot) -> Result<CacheLocation> {
    if let Some(override_path) = snapshot.non_empty("BX_CACHE_PATH") {
        return Ok(CacheLocation {
            path: absolutize(PathBuf::from(override_path))?,
            source: "BX_CACHE_PATH",
        });
    }

    #[cfg(target_os = "windows")]
    let (base, source) = windows_cache_base(snapshot);
    #[cfg(not(target_os = "windows"))]
    let (base, source) = unix_cache_base(snapshot);

    Ok(CacheLocation {
        path: base.join("bx").join("bundles"),
        source,
    })
}

#[cfg(not(target_os = "windows"))]
fn unix_cache_base(snapshot: &EnvSnapshot) -> (PathBuf, &'static str) {
    if let Some(xdg) = snapshot.non_empty("XDG_CACHE_HOME") {
        return (PathBuf::from(xdg), "XDG_CACHE_HOME");
    }
    if let Some(home) = home_dir() {
        return (home.join(".cache"), "HOME/.cache");
    }
    (PathBuf::from("/tmp"), "default (/tmp)")
}

#[cfg(target_os = "windows")]
fn windows_cache_base(snapshot: &EnvSnapshot) -> (PathBuf, &'static str) {
    if let Some(local_app_data) = snapshot.non_empty("LOCALAPPDATA") {
        return (PathBuf::from(local_app_data), "LOCALAPPDATA");
    }
    if let Some(home) = home_dir() {
        return (home.join("AppData").join("Local"), "HOME/AppData/Local");
    }
    (PathBuf::from("C:\\"), "default (C:\\)")
}

fn absolutize(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(env::current_dir()
            .context("failed to resolve BX_CACHE_PATH")?
            .join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_apply_without_overrides() {
        let snapshot = EnvSnapshot::testing(&[("XDG_CACHE_HOME", "/var/cache/test")]);
        let config = Config::from_snapshot(&snapshot).unwrap();
        assert!(config.locking());
        assert_eq!(config.settings().buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.settings().exec_permission.is_none());
        assert!(config.trusted_ca_paths().is_empty());
        #[cfg(not(target_os = "windows"))]
        assert_eq!(
            config.cache().path,
            PathBuf::from("/var/cache/test/bx/bundles")
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let snapshot = EnvSnapshot::testing(&[
            ("BX_CACHE_PATH", "/srv/bundles"),
            ("BX_CACHE_BUFSIZE", "8192"),
            ("BX_CACHE_LOCKING", "off"),
            ("BX_EXEC_PERMISSION", "chmod +x ${abspath}"),
            ("BX_PROXY_AUTH", "user:secret"),
        ]);
        let config = Config::from_snapshot(&snapshot).unwrap();
        assert!(!config.locking());
        assert_eq!(config.cache().source, "BX_CACHE_PATH");
        let settings = config.settings();
        assert_eq!(settings.buffer_size, 8192);
        assert_eq!(
            settings.exec_permission.as_deref(),
            Some("chmod +x ${abspath}")
        );
        assert_eq!(settings.proxy_auth.as_deref(), Some("user:secret"));
        assert!(settings.proxy_url.is_none());
    }

    #[test]
    fn proxy_url_prefers_https_variables() {
        let snapshot = EnvSnapshot::testing(&[
            ("HTTP_PROXY", "http://plain.example:3128"),
            ("https_proxy", "http://tls.example:3128"),
        ]);
        let config = Config::from_snapshot(&snapshot).unwrap();
        assert!(config.settings().keep_proxies);
        assert_eq!(
            config.settings().proxy_url.as_deref(),
            Some("http://tls.example:3128")
        );
    }

    #[test]
    fn invalid_buffer_size_is_rejected() {
        let snapshot = EnvSnapshot::testing(&[("BX_CACHE_BUFSIZE", "0")]);
        assert!(Config::from_snapshot(&snapshot).is_err());
    }

    #[test]
    fn trusted_ca_is_a_path_list() {
        let joined = env::join_paths(["/etc/ca/one.pem", "/etc/ca/dir"]).unwrap();
        let joined = joined.to_string_lossy().to_string();
        let snapshot = EnvSnapshot::testing(&[("BX_TRUSTED_CA", joined.as_str())]);
        let config = Config::from_snapshot(&snapshot).unwrap();
        assert_eq!(
            config.trusted_ca_paths(),
            [PathBuf::from("/etc/ca/one.pem"), PathBuf::from("/etc/ca/dir")]
        );
    }

    #[test]
    #[serial]
    #[cfg(not(target_os = "windows"))]
    fn from_env_reads_process_environment() {
        let previous = env::var("BX_CACHE_PATH").ok();
        env::set_var("BX_CACHE_PATH", "/opt/bx-cache");
        let config = Config::from_env();
        match previous {
            Some(value) => env::set_var("BX_CACHE_PATH", value),
            None => env::remove_var("BX_CACHE_PATH"),
        }
        let config = config.unwrap();
        assert_eq!(config.cache().path, PathBuf::from("/opt/bx-cache"));
    }
}
