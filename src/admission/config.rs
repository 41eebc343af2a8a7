// ABOUTME: Limits for the admission controller

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::pool::config::duration_millis;

/// Concurrency limits enforced before any execution starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Executions in flight across all tenants
    pub max_global: usize,

    /// Executions in flight for any single tenant
    pub max_per_tenant: usize,

    /// Bounded wait used by interactive request paths before answering "busy"
    #[serde(with = "duration_millis")]
    pub probe_wait: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_global: 20,
            max_per_tenant: 1,
            probe_wait: Duration::from_millis(100),
        }
    }
}

impl AdmissionConfig {
    /// Check that the limits can ever admit anyone
    pub fn validate(&self) -> Result<(), String> {
        if self.max_global == 0 {
            return Err("admission.max_global must be at least 1".to_string());
        }
        if self.max_per_tenant == 0 {
            return Err("admission.max_per_tenant must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AdmissionConfig::default();
        assert_eq!(config.max_global, 20);
        assert_eq!(config.max_per_tenant, 1);
        assert_eq!(config.probe_wait, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_probe_wait_in_millis() {
        let config: AdmissionConfig = toml::from_str("probe_wait = 250\nmax_global = 4").unwrap();
        assert_eq!(config.probe_wait, Duration::from_millis(250));
        assert_eq!(config.max_global, 4);
        assert_eq!(config.max_per_tenant, 1);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = AdmissionConfig {
            max_per_tenant: 0,
            ..AdmissionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
