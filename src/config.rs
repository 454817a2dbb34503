//! Database configuration
//!
//! Every subsystem has its own config block with conservative defaults.
//! The whole tree deserializes from TOML; missing keys fall back to defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// Top-level configuration for a [`crate::core::Database`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub storage: StorageConfig,
    pub index: IndexConfig,
    pub rules: RulesConfig,
    pub maintenance: MaintenanceConfig,
}

impl DatabaseConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Reject values that would make a subsystem unusable.
    pub fn validate(&self) -> Result<()> {
        if self.storage.max_transaction_ops == 0 {
            return Err(Error::Config(
                "storage.max_transaction_ops must be positive".into(),
            ));
        }
        if self.storage.idempotency_capacity == 0 {
            return Err(Error::Config(
                "storage.idempotency_capacity must be positive".into(),
            ));
        }
        if self.index.tenant_field.trim().is_empty() {
            return Err(Error::Config("index.tenant_field must not be empty".into()));
        }
        if self.rules.cache_capacity == 0 {
            return Err(Error::Config("rules.cache_capacity must be positive".into()));
        }
        if self.maintenance.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "maintenance.sweep_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Storage engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Maximum operations buffered in one transaction.
    pub max_transaction_ops: usize,
    /// How long a completed idempotent write is remembered.
    pub idempotency_ttl_secs: u64,
    /// Upper bound on remembered idempotency keys. Once full, the least
    /// recently used key is forgotten before its TTL, so size this above the
    /// number of keyed writes expected within one `idempotency_ttl_secs`.
    pub idempotency_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_transaction_ops: 500,
            idempotency_ttl_secs: 600,
            idempotency_capacity: 100_000,
        }
    }
}

impl StorageConfig {
    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn with_max_transaction_ops(mut self, max: usize) -> Self {
        self.max_transaction_ops = max;
        self
    }

    pub fn with_idempotency_capacity(mut self, capacity: usize) -> Self {
        self.idempotency_capacity = capacity;
        self
    }
}

/// Index system settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Name of the implicit partition field placed first in every index.
    pub tenant_field: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            tenant_field: "tenantId".to_string(),
        }
    }
}

/// Rules evaluator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Whether decisions are cached at all.
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_secs: 60,
            cache_capacity: 10_000,
        }
    }
}

impl RulesConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Config with decision caching switched off.
    pub fn uncached() -> Self {
        Self {
            cache_enabled: false,
            ..Self::default()
        }
    }
}

/// Periodic cache sweeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub sweep_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
        }
    }
}

impl MaintenanceConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.storage.max_transaction_ops, 500);
        assert_eq!(config.storage.idempotency_ttl(), Duration::from_secs(600));
        assert_eq!(config.index.tenant_field, "tenantId");
        assert_eq!(config.rules.cache_ttl(), Duration::from_secs(60));
        assert!(config.rules.cache_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = DatabaseConfig::from_toml_str(
            r#"
            [storage]
            max_transaction_ops = 50

            [rules]
            cache_enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.max_transaction_ops, 50);
        assert_eq!(config.storage.idempotency_ttl_secs, 600);
        assert!(!config.rules.cache_enabled);
        assert_eq!(config.index.tenant_field, "tenantId");
    }

    #[test]
    fn test_zero_transaction_cap_rejected() {
        let result = DatabaseConfig::from_toml_str("[storage]\nmax_transaction_ops = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let result = DatabaseConfig::from_toml_str("[storage\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
