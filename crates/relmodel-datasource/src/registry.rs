//! Process-wide directory of named datasources.

use crate::config::DatasourceConfig;
use relmodel_core::{ConnectionErrorKind, Connection, Error, Result};
use relmodel_sqlite::{SqliteConfig, SqliteConnection};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Creates a connection from a datasource config.
pub type DriverFactory = Arc<dyn Fn(&DatasourceConfig) -> Result<Arc<dyn Connection>> + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    configs: HashMap<String, DatasourceConfig>,
    drivers: HashMap<String, DriverFactory>,
    connections: HashMap<String, Arc<dyn Connection>>,
}

/// Named datasource registry.
///
/// Registration is idempotent: registering a name that already exists keeps
/// the stored config and returns it. Connections are opened lazily on the
/// first [`resolve`](Self::resolve) and shared afterwards.
pub struct DatasourceRegistry {
    inner: RwLock<RegistryInner>,
}

impl std::fmt::Debug for DatasourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("DatasourceRegistry")
            .field("configured", &inner.configs.keys().collect::<Vec<_>>())
            .field("drivers", &inner.drivers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for DatasourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: OnceLock<DatasourceRegistry> = OnceLock::new();

thread_local! {
    static RESOLVING: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Pops the resolution stack entry pushed by [`ResolveGuard::enter`].
struct ResolveGuard;

impl ResolveGuard {
    fn enter(name: &str) -> Result<Self> {
        RESOLVING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.iter().any(|n| n == name) {
                let chain = stack.join(" -> ");
                return Err(Error::missing_connection(
                    name,
                    ConnectionErrorKind::Recursive,
                    format!(
                        "Datasource '{}' resolves through itself ({} -> {})",
                        name, chain, name
                    ),
                ));
            }
            stack.push(name.to_string());
            Ok(ResolveGuard)
        })
    }
}

impl Drop for ResolveGuard {
    fn drop(&mut self) {
        RESOLVING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

impl DatasourceRegistry {
    /// Create an empty registry with the built-in `sqlite` driver.
    pub fn new() -> Self {
        let registry = Self {
            inner: RwLock::new(RegistryInner::default()),
        };
        registry.register_driver("sqlite", Arc::new(sqlite_factory));
        registry
    }

    /// The process-wide registry.
    pub fn global() -> &'static DatasourceRegistry {
        GLOBAL.get_or_init(DatasourceRegistry::new)
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a driver factory under `name` (e.g. `"sqlite"` or
    /// `"Plugin.Driver"`). Replaces any factory of the same name.
    pub fn register_driver(&self, name: impl Into<String>, factory: DriverFactory) {
        let name = name.into();
        tracing::debug!(driver = %name, "registered datasource driver");
        self.write().drivers.insert(name, factory);
    }

    /// Register a datasource config.
    ///
    /// Returns the stored config: the given one for a new name, the existing
    /// one when `name` is already registered.
    pub fn register(&self, name: impl Into<String>, config: DatasourceConfig) -> DatasourceConfig {
        let name = name.into();
        let mut inner = self.write();
        if let Some(existing) = inner.configs.get(&name) {
            tracing::debug!(datasource = %name, "datasource already registered");
            return existing.clone();
        }
        tracing::debug!(datasource = %name, driver = %config.driver, "registered datasource");
        inner.configs.insert(name, config.clone());
        config
    }

    /// Register an already open connection under `name`.
    pub fn register_connection(&self, name: impl Into<String>, connection: Arc<dyn Connection>) {
        let name = name.into();
        let mut inner = self.write();
        inner
            .configs
            .entry(name.clone())
            .or_insert_with(DatasourceConfig::default);
        inner.connections.insert(name, connection);
    }

    /// Resolve `name` to a connection, opening it on first use.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Connection>> {
        if let Some(conn) = self.read().connections.get(name) {
            return Ok(Arc::clone(conn));
        }

        let _guard = ResolveGuard::enter(name)?;
        let config = self.config(name).ok_or_else(|| {
            Error::missing_connection(
                name,
                ConnectionErrorKind::UnknownDatasource,
                format!("Datasource '{}' is not configured", name),
            )
        })?;

        let conn = if let Some(target) = &config.alias_of {
            self.resolve(target)?
        } else {
            let factory = self.read().drivers.get(&config.driver).cloned();
            let Some(factory) = factory else {
                let message = match config.plugin_driver() {
                    (Some(plugin), driver) => format!(
                        "Driver '{}' from plugin '{}' is not registered for datasource '{}'",
                        driver, plugin, name
                    ),
                    (None, driver) => format!(
                        "Driver '{}' is not registered for datasource '{}'",
                        driver, name
                    ),
                };
                return Err(Error::missing_connection(
                    name,
                    ConnectionErrorKind::UnknownDriver,
                    message,
                ));
            };
            // the factory may call back into the registry, so no lock is held here
            factory(&config)?
        };

        let mut inner = self.write();
        let stored = inner
            .connections
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&conn));
        tracing::debug!(datasource = %name, "resolved datasource");
        Ok(Arc::clone(stored))
    }

    /// The stored config for `name`.
    pub fn config(&self, name: &str) -> Option<DatasourceConfig> {
        self.read().configs.get(name).cloned()
    }

    /// Names of all configured datasources, sorted.
    pub fn configured(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a connection for `name` has been opened.
    pub fn is_connected(&self, name: &str) -> bool {
        self.read().connections.contains_key(name)
    }

    /// Remove a datasource and its connection. Returns whether it existed.
    pub fn drop(&self, name: &str) -> bool {
        let mut inner = self.write();
        inner.connections.remove(name);
        inner.configs.remove(name).is_some()
    }
}

fn sqlite_factory(config: &DatasourceConfig) -> Result<Arc<dyn Connection>> {
    let mut sqlite = SqliteConfig::file(config.database.clone());
    if let Some(ms) = config.option_u32("busy_timeout") {
        sqlite = sqlite.busy_timeout(ms);
    }
    if let Some(enabled) = config.option_bool("foreign_keys") {
        sqlite = sqlite.foreign_keys(enabled);
    }
    Ok(Arc::new(SqliteConnection::open(&sqlite)?))
}
