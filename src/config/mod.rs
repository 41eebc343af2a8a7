// ABOUTME: Configuration management for ptygate
// Aggregates every subsystem's settings, loads TOML files in precedence order
// and applies environment overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::admission::AdmissionConfig;
use crate::executor::ExecutorConfig;
use crate::invocation::ClaudeCliConfig;
use crate::pool::{Credentials, PoolConfig};
use crate::provisioning::ProvisionConfig;

/// Everything the binary needs to build a gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Remote connection pool
    pub pool: PoolConfig,

    /// Concurrency limits
    pub admission: AdmissionConfig,

    /// Streaming execution
    pub executor: ExecutorConfig,

    /// Claude CLI invocation
    pub claude: ClaudeCliConfig,

    /// Remote account management
    pub provisioning: ProvisionConfig,
}

impl AppConfig {
    /// Load configuration from default locations, then `explicit`, then the environment
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut paths = Self::get_config_paths();
        if let Some(path) = explicit {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            paths.push(path.to_path_buf());
        }

        let mut config = Self::load_files(&paths)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Merge the files that exist, later ones overriding earlier ones key by key
    pub fn load_files(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        for path in paths {
            if !path.exists() {
                continue;
            }
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            let layer: toml::Value = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?;
            merge_toml(&mut merged, layer);
        }

        merged
            .try_into::<Self>()
            .context("Failed to interpret merged configuration")
    }

    /// Get configuration file paths, lowest precedence first
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/ptygate/config.toml")];

        if let Ok(config_dir) = Self::get_user_config_dir() {
            paths.push(config_dir.join("config.toml"));
        }

        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd.join(".ptygate").join("config.toml"));
        }

        paths
    }

    /// Get user configuration directory
    pub fn get_user_config_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home_dir.join(".ptygate"))
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(host) = get("PTYGATE_SSH_HOST") {
            self.pool.endpoint.host = host;
        }
        if let Some(port) = get("PTYGATE_SSH_PORT") {
            self.pool.endpoint.port = port
                .trim()
                .parse()
                .with_context(|| format!("PTYGATE_SSH_PORT is not a valid port: {port}"))?;
        }
        if let Some(user) = get("PTYGATE_SSH_USER") {
            self.pool.endpoint.username = user;
        }
        if let Some(key) = get("PTYGATE_SSH_KEY") {
            self.pool.endpoint.credentials = Credentials::PrivateKey {
                path: expand_home(&key),
                passphrase: get("PTYGATE_SSH_KEY_PASSPHRASE"),
            };
        }
        if let Some(max) = get("MAX_CONCURRENT_USERS") {
            self.admission.max_global = max
                .trim()
                .parse()
                .with_context(|| format!("MAX_CONCURRENT_USERS is not a number: {max}"))?;
        }
        if let Some(max) = get("MAX_CONCURRENT_PER_USER") {
            self.admission.max_per_tenant = max
                .trim()
                .parse()
                .with_context(|| format!("MAX_CONCURRENT_PER_USER is not a number: {max}"))?;
        }
        if let Some(token) = get("VPS_ANTHROPIC_AUTH_TOKEN") {
            self.claude.auth_token = Some(token);
        }
        if let Some(url) = get("VPS_ANTHROPIC_BASE_URL") {
            self.claude.base_url = Some(url);
        }
        if let Some(model) = get("VPS_CLAUDE_MODEL").or_else(|| get("CLAUDE_MODEL")) {
            self.claude.model = model;
        }
        Ok(())
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        self.pool
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid pool configuration")?;
        self.admission
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid admission configuration")?;
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

/// Deep-merge `overlay` into `base`; tables merge, everything else is replaced
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
