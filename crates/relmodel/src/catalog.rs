//! The catalog: entity definitions, shared behaviors, schema and query
//! caches, and the datasource registry models resolve connections from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use relmodel_core::{
    ConfigError, Connection, EntitySchema, Error, Result, SchemaError, SchemaErrorKind,
};
use relmodel_datasource::DatasourceRegistry;
use relmodel_query::QueryCache;
use relmodel_schema::Introspector;

use crate::behavior::Behavior;
use crate::entity::EntityDef;
use crate::model::Model;

enum Datasources {
    Global,
    Owned(Arc<DatasourceRegistry>),
}

struct CatalogInner {
    entities: RwLock<HashMap<String, Arc<EntityDef>>>,
    behaviors: RwLock<HashMap<String, Arc<dyn Behavior>>>,
    schemas: RwLock<HashMap<(String, String), EntitySchema>>,
    cache: Mutex<QueryCache>,
    datasources: Datasources,
}

/// Registry of entity definitions and shared engine state.
///
/// Cloning is cheap; clones share everything.
#[derive(Clone)]
pub struct Catalog {
    inner: Arc<CatalogInner>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self
            .inner
            .entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        f.debug_struct("Catalog").field("entities", &names).finish_non_exhaustive()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    /// Catalog resolving datasources through the process-wide registry.
    pub fn new() -> Self {
        Self::build(Datasources::Global)
    }

    /// Catalog with its own datasource registry.
    pub fn with_datasources(registry: Arc<DatasourceRegistry>) -> Self {
        Self::build(Datasources::Owned(registry))
    }

    fn build(datasources: Datasources) -> Self {
        Self {
            inner: Arc::new(CatalogInner {
                entities: RwLock::new(HashMap::new()),
                behaviors: RwLock::new(HashMap::new()),
                schemas: RwLock::new(HashMap::new()),
                cache: Mutex::new(QueryCache::default()),
                datasources,
            }),
        }
    }

    pub fn datasources(&self) -> &DatasourceRegistry {
        match &self.inner.datasources {
            Datasources::Global => DatasourceRegistry::global(),
            Datasources::Owned(registry) => registry,
        }
    }

    // ==================== Entities ====================

    /// Register (or replace) an entity definition.
    pub fn define(&self, def: EntityDef) -> Arc<EntityDef> {
        let def = Arc::new(def);
        tracing::debug!(entity = %def.name, table = ?def.table, "defined entity");
        self.inner
            .entities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(def.name.clone(), Arc::clone(&def));
        def
    }

    /// The definition registered as `name`.
    pub fn entity(&self, name: &str) -> Result<Arc<EntityDef>> {
        self.inner
            .entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| {
                Error::Schema(SchemaError {
                    kind: SchemaErrorKind::EntityNotFound,
                    message: format!("Entity '{}' is not defined", name),
                    source: None,
                })
            })
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.inner
            .entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// A new model instance of `name`, aliased as its name.
    pub fn model(&self, name: &str) -> Result<Model> {
        self.model_as(name, name)
    }

    /// A new model instance of `name` under `alias`.
    pub fn model_as(&self, name: &str, alias: &str) -> Result<Model> {
        let def = self.entity(name)?;
        Model::new(self.clone(), def, alias)
    }

    // ==================== Behaviors ====================

    /// Make `behavior` attachable by name.
    pub fn register_behavior(&self, behavior: Arc<dyn Behavior>) {
        let name = behavior.name().to_string();
        tracing::debug!(behavior = %name, "registered behavior");
        self.inner
            .behaviors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, behavior);
    }

    pub fn behavior(&self, name: &str) -> Result<Arc<dyn Behavior>> {
        self.inner
            .behaviors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| {
                Error::Config(ConfigError {
                    message: format!("Behavior '{}' is not registered", name),
                    source: None,
                })
            })
    }

    // ==================== Storage ====================

    pub fn connection(&self, def: &EntityDef) -> Result<Arc<dyn Connection>> {
        self.datasources().resolve(&def.datasource)
    }

    /// Table prefix of `def`: its own, else its datasource's.
    pub fn prefix(&self, def: &EntityDef) -> String {
        match &def.table_prefix {
            Some(prefix) => prefix.clone(),
            None => self
                .datasources()
                .config(&def.datasource)
                .map(|c| c.prefix)
                .unwrap_or_default(),
        }
    }

    /// Full table name of `def`, prefix included.
    pub fn table_name(&self, def: &EntityDef) -> Option<String> {
        let table = def.table.as_ref()?;
        Some(format!("{}{table}", self.prefix(def)))
    }

    /// Columns of `def`: the declared schema, or the live table's.
    pub fn schema_of(&self, def: &EntityDef) -> Result<EntitySchema> {
        if !def.schema.is_empty() {
            return Ok(def.schema.clone());
        }
        match self.table_name(def) {
            Some(table) => self.table_schema(&def.datasource, &table),
            None => Ok(EntitySchema::default()),
        }
    }

    /// Columns of a live table, introspected once and cached.
    pub fn table_schema(&self, datasource: &str, table: &str) -> Result<EntitySchema> {
        let key = (datasource.to_string(), table.to_string());
        if let Some(schema) = self
            .inner
            .schemas
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(schema.clone());
        }

        let conn = self.datasources().resolve(datasource)?;
        let schema = Introspector::new().describe(conn.as_ref(), table)?;
        tracing::debug!(datasource, table, columns = schema.len(), "introspected table");
        self.inner
            .schemas
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, schema.clone());
        Ok(schema)
    }

    /// Forget introspected schemas, e.g. after a migration.
    pub fn clear_schema_cache(&self) {
        self.inner
            .schemas
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn query_cache(&self) -> MutexGuard<'_, QueryCache> {
        self.inner.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop cached reads of `table`.
    pub fn invalidate(&self, table: &str) {
        self.query_cache().invalidate(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmodel_datasource::DatasourceConfig;

    fn catalog() -> Catalog {
        let registry = Arc::new(DatasourceRegistry::new());
        registry.register("default", DatasourceConfig::sqlite(":memory:").prefix("app_"));
        Catalog::with_datasources(registry)
    }

    #[test]
    fn test_define_and_lookup() {
        let catalog = catalog();
        catalog.define(EntityDef::new("Post"));
        assert!(catalog.is_defined("Post"));
        assert!(catalog.entity("Post").is_ok());
        let err = catalog.entity("Nope").expect_err("unknown entity");
        assert!(matches!(
            err,
            Error::Schema(SchemaError { kind: SchemaErrorKind::EntityNotFound, .. })
        ));
    }

    #[test]
    fn test_table_prefix_resolution() {
        let catalog = catalog();
        let post = EntityDef::new("Post");
        assert_eq!(catalog.table_name(&post).as_deref(), Some("app_posts"));
        let own = EntityDef::new("Post").table_prefix("");
        assert_eq!(catalog.table_name(&own).as_deref(), Some("posts"));
        assert_eq!(catalog.table_name(&EntityDef::new("Form").without_table()), None);
    }

    #[test]
    fn test_unknown_behavior_is_config_error() {
        let catalog = catalog();
        let err = catalog.behavior("Nope").err().expect("unknown behavior");
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_introspects_undeclared_schema() {
        let catalog = catalog();
        let conn = catalog.datasources().resolve("default").expect("connect");
        conn.execute_raw("CREATE TABLE app_posts (id INTEGER PRIMARY KEY, title TEXT)")
            .expect("create");
        let def = catalog.define(EntityDef::new("Post"));
        let schema = catalog.schema_of(&def).expect("schema");
        assert_eq!(schema.names().collect::<Vec<_>>(), vec!["id", "title"]);
    }
}
