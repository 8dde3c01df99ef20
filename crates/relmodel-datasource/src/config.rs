//! Datasource configuration.

use relmodel_core::{ConfigError, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration for one named datasource.
///
/// `driver` is either a built-in driver name (`"sqlite"`) or a
/// plugin-qualified name (`"Plugin.Driver"`) registered through
/// [`DatasourceRegistry::register_driver`](crate::DatasourceRegistry::register_driver).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasourceConfig {
    /// Driver name used to look up a factory
    pub driver: String,
    /// Database location understood by the driver (file path, ":memory:")
    pub database: String,
    /// Table prefix applied to entities bound to this datasource
    pub prefix: String,
    /// Resolve through another named datasource instead of opening a connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_of: Option<String>,
    /// Driver-specific options
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl Default for DatasourceConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            database: ":memory:".to_string(),
            prefix: String::new(),
            alias_of: None,
            options: BTreeMap::new(),
        }
    }
}

impl DatasourceConfig {
    /// Create a config for the given driver.
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            ..Default::default()
        }
    }

    /// SQLite database at `path` (":memory:" for an in-memory database).
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self::new("sqlite").database(path)
    }

    /// A datasource that resolves to the connection of `target`.
    pub fn alias(target: impl Into<String>) -> Self {
        Self {
            alias_of: Some(target.into()),
            ..Default::default()
        }
    }

    /// Parse a config from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("Invalid datasource config: {}", e),
                source: Some(Box::new(e)),
            })
        })
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set a driver-specific option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Split a plugin-qualified driver name into `(plugin, driver)`.
    pub fn plugin_driver(&self) -> (Option<&str>, &str) {
        match self.driver.split_once('.') {
            Some((plugin, driver)) => (Some(plugin), driver),
            None => (None, self.driver.as_str()),
        }
    }

    pub(crate) fn option_u32(&self, key: &str) -> Option<u32> {
        self.options
            .get(key)
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    pub(crate) fn option_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(serde_json::Value::as_bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DatasourceConfig::default();
        assert_eq!(config.driver, "sqlite");
        assert_eq!(config.database, ":memory:");
        assert!(config.prefix.is_empty());
        assert!(config.alias_of.is_none());
    }

    #[test]
    fn test_builder() {
        let config = DatasourceConfig::sqlite("app.db")
            .prefix("app_")
            .option("busy_timeout", 250);
        assert_eq!(config.database, "app.db");
        assert_eq!(config.prefix, "app_");
        assert_eq!(config.option_u32("busy_timeout"), Some(250));
        assert_eq!(config.option_bool("foreign_keys"), None);
    }

    #[test]
    fn test_plugin_driver() {
        let config = DatasourceConfig::new("TestPlugin.TestSource");
        assert_eq!(config.plugin_driver(), (Some("TestPlugin"), "TestSource"));
        assert_eq!(
            DatasourceConfig::default().plugin_driver(),
            (None, "sqlite")
        );
    }

    #[test]
    fn test_from_json() {
        let config = DatasourceConfig::from_json(
            r#"{"driver":"sqlite","database":"test.db","options":{"foreign_keys":true}}"#,
        )
        .expect("parse config");
        assert_eq!(config.database, "test.db");
        assert_eq!(config.option_bool("foreign_keys"), Some(true));

        let err = DatasourceConfig::from_json("{not json").expect_err("invalid json");
        assert!(err.is_configuration_error());
    }
}
