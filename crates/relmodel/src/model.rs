//! Model instances.
//!
//! A [`Model`] is one request-scoped handle on an entity: it owns its
//! association registry, its behavior collection (with per-instance
//! settings), the related models it instantiated, and the record it is
//! currently working on. Reads live in [`crate::find`], writes in
//! [`crate::save`] and [`crate::delete`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use relmodel_core::{Connection, EntitySchema, Error, Result, Value};
use relmodel_query::{Expr, SelectQuery};

use crate::association::{AssociationKind, AssociationRegistry, AssociationSpec};
use crate::behavior::{BehaviorCollection, Dispatch, TriggerOptions};
use crate::catalog::Catalog;
use crate::entity::EntityDef;
use crate::find::FindOptions;
use crate::save::{SaveOptions, ValidationErrors};
use crate::tree::{Record, Tree};

/// A handle on one entity, aliased for use in queries and result trees.
#[derive(Debug, Clone)]
pub struct Model {
    pub(crate) catalog: Catalog,
    pub(crate) def: Arc<EntityDef>,
    pub(crate) alias: String,
    pub(crate) associations: AssociationRegistry,
    pub(crate) behaviors: BehaviorCollection,
    pub(crate) related: HashMap<String, Model>,
    pub(crate) id: Option<Value>,
    pub(crate) data: Record,
    pub(crate) validation_errors: ValidationErrors,
    pub(crate) recursive: i32,
    pub(crate) cache_queries: bool,
}

impl Model {
    /// Instantiate `def` under `alias`, attaching its declared behaviors.
    pub fn new(catalog: Catalog, def: Arc<EntityDef>, alias: impl Into<String>) -> Result<Self> {
        let alias = alias.into();
        let mut behaviors = BehaviorCollection::new(alias.clone(), def.name.clone());
        for (name, settings) in &def.behaviors {
            behaviors.attach(catalog.behavior(name)?, settings.clone());
        }
        tracing::trace!(entity = %def.name, alias = %alias, "instantiated model");
        Ok(Self {
            associations: AssociationRegistry::new(def.associations.clone()),
            behaviors,
            related: HashMap::new(),
            id: None,
            data: Record::new(),
            validation_errors: ValidationErrors::default(),
            recursive: def.recursive,
            cache_queries: def.cache_queries,
            alias,
            def,
            catalog,
        })
    }

    // ==================== Identity ====================

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn def(&self) -> &EntityDef {
        &self.def
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn primary_key(&self) -> &str {
        &self.def.primary_key
    }

    /// Full table name, prefix included.
    pub fn table(&self) -> Option<String> {
        self.catalog.table_name(&self.def)
    }

    pub(crate) fn require_table(&self) -> Result<String> {
        self.table().ok_or_else(|| {
            Error::Custom(format!("Entity '{}' has no table", self.def.name))
        })
    }

    pub fn schema(&self) -> Result<EntitySchema> {
        self.catalog.schema_of(&self.def)
    }

    pub fn connection(&self) -> Result<Arc<dyn Connection>> {
        self.catalog.connection(&self.def)
    }

    /// Default association depth of finds on this instance.
    pub fn recursive(&self) -> i32 {
        self.recursive
    }

    pub fn set_recursive(&mut self, depth: i32) {
        self.recursive = depth;
    }

    pub fn set_cache_queries(&mut self, enabled: bool) {
        self.cache_queries = enabled;
    }

    // ==================== Current record ====================

    /// Id of the current record.
    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref().filter(|v| !v.is_empty())
    }

    pub fn set_id(&mut self, id: impl Into<Value>) {
        let id = id.into();
        self.id = if id.is_empty() { None } else { Some(id) };
    }

    pub fn data(&self) -> &Record {
        &self.data
    }

    pub fn set_data(&mut self, data: Record) {
        self.data = data;
    }

    /// Start a new record: forget the id, clear errors and load column
    /// defaults overlaid with `data`.
    pub fn create(&mut self, data: Option<Record>) -> Result<&Record> {
        self.id = None;
        self.validation_errors.clear();
        let mut record = Record::new();
        if self.def.table.is_some() {
            for column in self.schema()?.columns() {
                if column.is_primary() {
                    continue;
                }
                if let Some(default) = &column.default {
                    record.set(column.name.clone(), default.clone());
                }
            }
        }
        if let Some(data) = data {
            record.merge(data);
        }
        self.data = record;
        Ok(&self.data)
    }

    /// Whether a row with the current id is stored. Checked against the
    /// database on every call.
    pub fn exists(&self) -> Result<bool> {
        let Some(id) = self.id().cloned() else {
            return Ok(false);
        };
        let Some(table) = self.table() else {
            return Ok(false);
        };
        let conn = self.connection()?;
        let query = SelectQuery::new(table, self.alias.clone())
            .filter(Expr::qualified(self.alias.clone(), self.primary_key()).eq(id));
        let (sql, params) = query.build_count(conn.dialect());
        let count = match conn.query_one(&sql, &params)? {
            Some(row) => row.get_by_name("count").and_then(Value::as_i64).unwrap_or(0),
            None => 0,
        };
        Ok(count > 0)
    }

    /// Value of `name` on the first row matching `conditions`, or on the
    /// current record when no conditions are given.
    pub fn field(&mut self, name: &str, conditions: Option<Expr>) -> Result<Option<Value>> {
        let conditions = match conditions {
            Some(c) => c,
            None => match self.id().cloned() {
                Some(id) => Expr::qualified(self.alias.clone(), self.primary_key()).eq(id),
                None => return Ok(None),
            },
        };
        let field = if name.contains('.') || name.contains('(') {
            name.to_string()
        } else {
            format!("{}.{}", self.alias, name)
        };
        let options = FindOptions::new()
            .conditions(conditions)
            .fields([field])
            .recursive(-1);
        let found = self.find_first(options)?;
        let key = name.rsplit('.').next().unwrap_or(name);
        Ok(found.and_then(|tree| tree.record(&self.alias).and_then(|r| r.get(key)).cloned()))
    }

    /// Save one field of the current record.
    pub fn save_field(&mut self, name: &str, value: impl Into<Value>, validate: bool) -> Result<bool> {
        let record = Record::new().with(name, value);
        let options = SaveOptions::new()
            .validate(validate)
            .field_list([name]);
        self.save(Tree::single(self.alias.clone(), record), options)
    }

    // ==================== Validation ====================

    /// Validate the current record, replacing the stored errors.
    pub fn validates(&mut self) -> bool {
        let creating = self.id().is_none();
        self.validation_errors.clear();
        let errors = self.def.validate.validate(self.data.fields(), creating, &[]);
        self.validation_errors.absorb(errors);
        self.validation_errors.is_empty()
    }

    /// Record a validation failure by hand.
    pub fn invalidate(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.validation_errors.add(field, message);
    }

    pub fn validation_errors(&self) -> &ValidationErrors {
        &self.validation_errors
    }

    // ==================== Associations ====================

    /// Bind associations. Transient binds (`permanent == false`) are undone
    /// when the next find, save or delete completes.
    pub fn bind_model(&mut self, bindings: Vec<(String, AssociationSpec)>, permanent: bool) {
        for (alias, spec) in bindings {
            self.associations.bind(alias, spec, permanent);
        }
    }

    /// Unbind `(kind, alias)` pairs; returns how many were removed.
    pub fn unbind_model(&mut self, bindings: &[(AssociationKind, &str)], permanent: bool) -> usize {
        bindings
            .iter()
            .filter(|(kind, alias)| self.associations.unbind(*kind, alias, permanent))
            .count()
    }

    /// Restore the declared associations.
    pub fn reset_associations(&mut self) {
        self.associations.reset();
    }

    pub fn association(&self, alias: &str) -> Option<&AssociationSpec> {
        self.associations.get(alias)
    }

    pub fn associations(&self) -> &AssociationRegistry {
        &self.associations
    }

    /// Aliases currently bound with `kind`.
    pub fn get_associated(&self, kind: AssociationKind) -> Vec<String> {
        self.associations.get_associated(kind)
    }

    /// Every current association, alias to spec.
    pub fn get_associated_all(&self) -> BTreeMap<String, AssociationSpec> {
        self.associations
            .iter()
            .map(|(alias, spec)| (alias.to_string(), spec.clone()))
            .collect()
    }

    /// The model behind association `alias`, instantiated on first use and
    /// again whenever the association is rebound to another entity.
    pub fn related_mut(&mut self, alias: &str) -> Result<&mut Model> {
        let Some(spec) = self.associations.get(alias) else {
            return Err(self.missing_association(alias));
        };
        let target = spec.target_name(alias).to_string();

        let stale = self
            .related
            .get(alias)
            .is_some_and(|model| model.def.name != target);
        if stale {
            tracing::debug!(alias = %self.alias, association = alias, target = %target, "re-instantiating related model");
            self.related.remove(alias);
        }

        if !self.related.contains_key(alias) {
            let def = self.catalog.entity(&target).map_err(|_| Error::MissingAssociation {
                entity: self.alias.clone(),
                alias: target.clone(),
            })?;
            let model = Model::new(self.catalog.clone(), def, alias)?;
            self.related.insert(alias.to_string(), model);
        }
        self.related
            .get_mut(alias)
            .ok_or_else(|| Error::Custom(format!("related model '{alias}' vanished")))
    }

    pub(crate) fn missing_association(&self, alias: &str) -> Error {
        Error::MissingAssociation {
            entity: self.alias.clone(),
            alias: alias.to_string(),
        }
    }

    /// Undo transient binds here and on every instantiated related model.
    pub(crate) fn restore_transient(&mut self) {
        self.associations.restore_transient();
        for model in self.related.values_mut() {
            model.restore_transient();
        }
    }

    /// Restore transient state, then hand back `result`.
    pub(crate) fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        self.restore_transient();
        result
    }

    // ==================== Behaviors ====================

    /// Attach the catalog behavior `name` with `config`.
    pub fn attach(&mut self, name: &str, config: serde_json::Value) -> Result<()> {
        let behavior = self.catalog.behavior(name)?;
        self.behaviors.attach(behavior, config);
        Ok(())
    }

    pub fn detach(&mut self, name: &str) -> bool {
        self.behaviors.detach(name)
    }

    pub fn behaviors(&self) -> &BehaviorCollection {
        &self.behaviors
    }

    pub fn behaviors_mut(&mut self) -> &mut BehaviorCollection {
        &mut self.behaviors
    }

    /// Call a behavior-provided method.
    pub fn dispatch_method(&self, method: &str, args: &[Value]) -> Dispatch {
        self.behaviors.dispatch_method(method, args)
    }

    pub fn trigger(&self, event: &str, args: &[Value], options: &TriggerOptions) -> Vec<Value> {
        self.behaviors.trigger(event, args, options)
    }
}
