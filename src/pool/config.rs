// ABOUTME: Configuration for the remote connection pool
//
// Defines PoolConfig with all tunable parameters for the pool:
// - Remote endpoint and credentials
// - Capacity and timeouts for connect, acquire, idle reaping
// - SSH keepalive settings

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How to authenticate against the remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Credentials {
    /// Private key file, optionally passphrase-protected
    PrivateKey {
        /// Path to the key file
        path: PathBuf,
        /// Passphrase for an encrypted key
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    /// Plain password authentication
    Password {
        /// The password
        password: String,
    },
}

impl Default for Credentials {
    fn default() -> Self {
        Self::PrivateKey {
            path: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ssh")
                .join("id_ed25519"),
            passphrase: None,
        }
    }
}

/// The single remote host the pool connects to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Host name or address
    pub host: String,

    /// SSH port
    pub port: u16,

    /// Login user
    pub username: String,

    /// Authentication method
    pub credentials: Credentials,

    /// Prefer IPv4 addresses when the host resolves to both families
    pub force_ipv4: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            username: "root".to_string(),
            credentials: Credentials::default(),
            force_ipv4: true,
        }
    }
}

/// SSH-level liveness probing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Interval between keepalive requests
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// Unanswered keepalives before the session is considered dead
    pub max_missed: usize,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_missed: 3,
        }
    }
}

/// Configuration for the connection pool
///
/// Immutable once the pool is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Where to connect
    pub endpoint: EndpointConfig,

    // === Capacity ===
    /// Upper bound on open connections (idle + in use + being established)
    pub max_connections: usize,

    // === Timeouts ===
    /// Maximum time to establish and authenticate one connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Idle connections unused for longer than this are closed by the reaper
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Maximum time `acquire()` waits for a connection to free up
    #[serde(with = "duration_secs")]
    pub acquire_timeout: Duration,

    /// Period of the idle reaper
    #[serde(with = "duration_secs")]
    pub reap_interval: Duration,

    /// Default timeout for non-streaming `exec`
    #[serde(with = "duration_secs")]
    pub exec_timeout: Duration,

    /// SSH keepalive
    pub keepalive: KeepaliveConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            max_connections: 5,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300), // 5 minutes
            acquire_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(300),
            exec_timeout: Duration::from_secs(30),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Check that the configuration can produce a working pool
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("pool.max_connections must be at least 1".to_string());
        }
        if self.reap_interval.is_zero() {
            return Err("pool.reap_interval must be non-zero".to_string());
        }
        if self.endpoint.host.trim().is_empty() {
            return Err("pool.endpoint.host must not be empty".to_string());
        }
        Ok(())
    }
}

/// Serde helper for Duration as seconds (u64)
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for Duration as milliseconds (u64)
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
