//! Named datasources for relmodel.
//!
//! A [`DatasourceRegistry`] maps logical names (`"default"`, `"test"`) to
//! driver connections. Entities name their datasource; the engine resolves
//! it here on first use.
//!
//! ```ignore
//! let registry = DatasourceRegistry::global();
//! registry.register("default", DatasourceConfig::sqlite("app.db"));
//! let conn = registry.resolve("default")?;
//! ```

pub mod config;
pub mod registry;

pub use config::DatasourceConfig;
pub use registry::{DatasourceRegistry, DriverFactory};
