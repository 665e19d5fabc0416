use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LauncherError, Result};

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_VERSION: u32 = 1;
const APP_DIR_NAME: &str = "firmata";

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub paths: Paths,
    pub release: ReleaseConfig,
    pub network: NetworkConfig,
    pub runtime: RuntimeConfig,
    pub prerequisite: PrerequisiteConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub install_root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ReleaseConfig {
    pub feed_url: String,
    pub download_base_url: String,
    pub notes_base_url: String,
    pub artifact_name: String,
    pub fetch_timeout_sec: u64,
    pub download_timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub probe_url: String,
    pub probe_timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub program: String,
    pub args: Vec<String>,
    pub port: u16,
    pub grace_period_sec: u64,
    pub settle_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct PrerequisiteConfig {
    pub name: String,
    pub managed_dir: String,
    pub provision_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            paths: Paths::default(),
            release: ReleaseConfig::default(),
            network: NetworkConfig::default(),
            runtime: RuntimeConfig::default(),
            prerequisite: PrerequisiteConfig::default(),
        }
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            feed_url: "https://api.github.com/repos/jflamy/owlcms-firmata/releases".to_string(),
            download_base_url: "https://github.com/jflamy/owlcms-firmata/releases/download"
                .to_string(),
            notes_base_url: "https://github.com/jflamy/owlcms-firmata/releases/tag".to_string(),
            artifact_name: "owlcms-firmata.jar".to_string(),
            fetch_timeout_sec: 10,
            download_timeout_sec: 600,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_url: "https://github.com".to_string(),
            probe_timeout_sec: 5,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: "java".to_string(),
            args: vec!["-jar".to_string(), "{artifact}".to_string()],
            port: 8090,
            grace_period_sec: 10,
            settle_ms: 500,
        }
    }
}

impl Default for PrerequisiteConfig {
    fn default() -> Self {
        Self {
            name: "java".to_string(),
            managed_dir: "java17".to_string(),
            provision_url: String::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_sec)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn port(&self) -> Option<u16> {
        if self.port == 0 {
            None
        } else {
            Some(self.port)
        }
    }
}

pub fn read_config_from_str(content: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(LauncherError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// Missing config files mean defaults; a present but invalid file is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        read_config(path)
    } else {
        Ok(Config::default())
    }
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    let artifact = cfg.release.artifact_name.trim();
    if artifact.is_empty() {
        return Err(LauncherError::Config(
            "release.artifact_name must be non-empty".to_string(),
        ));
    }
    if artifact.contains('/') || artifact.contains('\\') {
        return Err(LauncherError::Config(
            "release.artifact_name must be a plain file name".to_string(),
        ));
    }
    for (field, value) in [
        ("release.feed_url", &cfg.release.feed_url),
        ("release.download_base_url", &cfg.release.download_base_url),
        ("network.probe_url", &cfg.network.probe_url),
    ] {
        if !value.starts_with("http://") && !value.starts_with("https://") {
            return Err(LauncherError::Config(format!(
                "{field} must be an http(s) URL"
            )));
        }
    }
    for (field, value) in [
        ("release.fetch_timeout_sec", cfg.release.fetch_timeout_sec),
        ("release.download_timeout_sec", cfg.release.download_timeout_sec),
        ("network.probe_timeout_sec", cfg.network.probe_timeout_sec),
        ("runtime.grace_period_sec", cfg.runtime.grace_period_sec),
    ] {
        if value == 0 {
            return Err(LauncherError::Config(format!(
                "{field} must be greater than 0"
            )));
        }
    }
    if cfg.runtime.program.trim().is_empty() {
        return Err(LauncherError::Config(
            "runtime.program must be non-empty".to_string(),
        ));
    }
    if cfg.prerequisite.managed_dir.trim().is_empty() {
        return Err(LauncherError::Config(
            "prerequisite.managed_dir must be non-empty".to_string(),
        ));
    }
    Ok(())
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(dir) = env::var("FIRMATA_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    let mut base = dirs::config_dir()
        .or_else(home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    base.push("firmata-launcher");
    base
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("FIRMATA_CONFIG") {
        return PathBuf::from(path);
    }
    default_config_dir().join("config.yaml")
}

/// Per-user application data directory (APPDATA, Application Support, ~/.local/share).
pub fn default_install_root() -> PathBuf {
    match dirs::data_dir() {
        Some(dir) => dir.join(APP_DIR_NAME),
        None => PathBuf::from(".").join(APP_DIR_NAME),
    }
}

pub fn resolve_install_root(cfg: &Config) -> PathBuf {
    if let Ok(path) = env::var("FIRMATA_INSTALL_ROOT") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let configured = cfg.paths.install_root.trim();
    if configured.is_empty() {
        return default_install_root();
    }
    PathBuf::from(expand_path(configured))
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn offline_forced() -> bool {
    env::var("FIRMATA_OFFLINE")
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
