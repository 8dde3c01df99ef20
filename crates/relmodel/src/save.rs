//! Writes.
//!
//! [`Model::save`] writes one record (plus its hasAndBelongsToMany links);
//! [`Model::save_associated`] and [`Model::save_many`] compose it into
//! nested and batch saves. A single save runs, in order:
//!
//! 1. `before_validate`, then the entity's rules (skipped when
//!    `validate(false)`); a failure stops the save with `Ok(false)`
//! 2. `before_save`
//! 3. the create-or-update decision, checked against storage
//! 4. `created` / `modified` / `updated` stamps for columns the input omits
//! 5. INSERT or UPDATE of schema columns allowed by the field list
//! 6. join-table reconciliation for every HABTM entry in the input
//! 7. counter cache refreshes on old and new parents
//! 8. `after_save`, then query cache invalidation

use std::collections::{BTreeMap, HashSet};

use relmodel_core::{Error, Result, ValidationError, Value};
use relmodel_query::{DeleteQuery, Expr, InsertQuery, SelectQuery, UpdateQuery};
use serde::Serialize;

use crate::association::{AssociationKind, AssociationSpec};
use crate::model::Model;
use crate::timestamp;
use crate::tree::{Record, Related, Tree};

const STAMP_COLUMNS: [&str; 3] = ["created", "modified", "updated"];

// ==================== Validation errors ====================

/// Validation messages of the last save, keyed by field path.
///
/// Nested saves key errors by path: `"Author.name"` for a belongsTo,
/// `"Comment.0.comment"` for the first hasMany record, `"1.title"` for the
/// second record of a [`Model::save_many`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors {
    fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of fields with at least one message.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields.entry(field.into()).or_default().push(message.into());
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.fields.get(field).map(Vec::as_slice)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Take every message of a rule evaluation.
    pub fn absorb(&mut self, errors: ValidationError) {
        for error in errors.errors {
            self.add(error.field, error.message);
        }
    }

    /// Take every message of `other`, keyed under `prefix.`.
    pub fn merge_prefixed(&mut self, prefix: &str, other: ValidationErrors) {
        for (field, messages) in other.fields {
            self.fields
                .entry(format!("{prefix}.{field}"))
                .or_default()
                .extend(messages);
        }
    }
}

// ==================== Options ====================

/// Options of [`Model::save`].
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOptions {
    /// Run validation rules.
    pub validate: bool,
    /// Columns allowed to be written (and validated); empty allows all.
    pub field_list: Vec<String>,
    /// Run behavior hooks.
    pub callbacks: bool,
    /// Wrap the save in a transaction unless one is already open.
    pub atomic: bool,
    /// Refresh counter caches of belongsTo parents.
    pub counter_cache: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            validate: true,
            field_list: Vec::new(),
            callbacks: true,
            atomic: true,
            counter_cache: true,
        }
    }
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn field_list<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field_list = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn callbacks(mut self, callbacks: bool) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    pub fn counter_cache(mut self, counter_cache: bool) -> Self {
        self.counter_cache = counter_cache;
        self
    }

    fn allows(&self, column: &str) -> bool {
        self.field_list.is_empty() || self.field_list.iter().any(|f| f == column)
    }
}

/// When a batch or nested save validates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValidateMode {
    /// Validate each record as it is saved.
    #[default]
    Yes,
    /// Skip validation.
    No,
    /// Validate every record before writing any.
    First,
    /// Validate every record and write nothing.
    Only,
}

/// Options of [`Model::save_associated`], [`Model::save_many`] and
/// [`Model::save_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct SaveAllOptions {
    /// All records commit together or none do.
    pub atomic: bool,
    pub validate: ValidateMode,
    pub field_list: Vec<String>,
    pub callbacks: bool,
    /// Also save associations nested below the first level.
    pub deep: bool,
}

impl Default for SaveAllOptions {
    fn default() -> Self {
        Self {
            atomic: true,
            validate: ValidateMode::Yes,
            field_list: Vec::new(),
            callbacks: true,
            deep: false,
        }
    }
}

impl SaveAllOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    pub fn validate(mut self, validate: ValidateMode) -> Self {
        self.validate = validate;
        self
    }

    pub fn field_list<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field_list = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn callbacks(mut self, callbacks: bool) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn deep(mut self, deep: bool) -> Self {
        self.deep = deep;
        self
    }

    fn single(&self, validate: bool) -> SaveOptions {
        SaveOptions {
            validate,
            field_list: self.field_list.clone(),
            callbacks: self.callbacks,
            atomic: false,
            counter_cache: true,
        }
    }
}

/// Input of [`Model::save_all`].
#[derive(Debug, Clone, PartialEq)]
pub enum SaveAllInput {
    /// Several records of this model.
    Many(Vec<Tree>),
    /// One record with associated data.
    Associated(Tree),
}

/// Per-association result of a non-atomic nested save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SaveStatus {
    One(bool),
    Many(Vec<bool>),
}

impl SaveStatus {
    pub fn all(&self) -> bool {
        match self {
            SaveStatus::One(ok) => *ok,
            SaveStatus::Many(oks) => oks.iter().all(|ok| *ok),
        }
    }
}

/// Result of a batch or nested save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SaveOutcome {
    /// Atomic mode: whether everything was written.
    Atomic(bool),
    /// Non-atomic [`Model::save_many`]: one result per record.
    Records(Vec<bool>),
    /// Non-atomic [`Model::save_associated`]: one result per alias.
    Associated(BTreeMap<String, SaveStatus>),
}

impl SaveOutcome {
    /// Whether every record was written (or, with [`ValidateMode::Only`],
    /// validated).
    pub fn is_success(&self) -> bool {
        match self {
            SaveOutcome::Atomic(ok) => *ok,
            SaveOutcome::Records(oks) => oks.iter().all(|ok| *ok),
            SaveOutcome::Associated(statuses) => statuses.values().all(SaveStatus::all),
        }
    }
}

type Statuses = BTreeMap<String, SaveStatus>;

// ==================== Join rows ====================

/// Desired join-table rows of one HABTM entry. Each row holds the
/// association key and any extra join columns; the owner key is added on
/// insert.
fn join_rows(entry: Related, alias: &str, association_key: &str, target_pk: &str) -> Vec<BTreeMap<String, Value>> {
    match entry {
        Related::Keys(keys) => {
            let mut seen = HashSet::new();
            keys.into_iter()
                .filter(|k| !k.is_empty() && seen.insert(k.to_key_string()))
                .map(|k| BTreeMap::from([(association_key.to_string(), k)]))
                .collect()
        }
        Related::Many(records) => records
            .into_iter()
            .filter_map(|r| join_row(r, association_key, target_pk))
            .collect(),
        Related::One(mut record) => match record.take_related(alias) {
            Some(inner) => join_rows(inner, alias, association_key, target_pk),
            None => join_row(record, association_key, target_pk).into_iter().collect(),
        },
    }
}

fn join_row(record: Record, association_key: &str, target_pk: &str) -> Option<BTreeMap<String, Value>> {
    let (mut fields, _) = record.into_parts();
    if fields.get(association_key).is_some_and(|v| !v.is_empty()) {
        return Some(fields);
    }
    let key = fields.remove(target_pk).filter(|v| !v.is_empty())?;
    Some(BTreeMap::from([(association_key.to_string(), key)]))
}

fn row_matches(desired: &BTreeMap<String, Value>, current: &BTreeMap<String, Value>) -> bool {
    desired
        .iter()
        .all(|(column, value)| current.get(column).is_some_and(|v| v.loosely_eq(value)))
}

impl Model {
    // ==================== Single save ====================

    /// Save the record under this model's alias in `data`.
    ///
    /// Other entries of `data` naming hasAndBelongsToMany associations
    /// replace the record's links. Returns `Ok(false)` when validation or a
    /// behavior rejects the record, or when there is nothing to write;
    /// driver failures roll back and return `Err`.
    #[tracing::instrument(level = "debug", skip(self, data, options), fields(alias = %self.alias))]
    pub fn save(&mut self, data: Tree, options: SaveOptions) -> Result<bool> {
        self.validation_errors.clear();
        let result = self.root_record(data).and_then(|record| {
            if options.atomic {
                self.atomically(|m| m.save_record(record, &options), |ok| *ok)
            } else {
                self.save_record(record, &options)
            }
        });
        self.finish(result)
    }

    /// The record under this alias, with the other tree entries attached as
    /// its association data.
    fn root_record(&self, mut data: Tree) -> Result<Record> {
        let mut record = match data.remove(&self.alias) {
            Some(Related::One(record)) => record,
            Some(_) => {
                return Err(Error::Custom(format!(
                    "expected a single '{}' record to save",
                    self.alias
                )));
            }
            None => Record::new(),
        };
        for (alias, entry) in data.iter() {
            if record.related(alias).is_none() {
                record.set_related(alias, entry.clone());
            }
        }
        Ok(record)
    }

    /// Run `f` in a transaction, committing when `keep` accepts its result.
    /// Joins a transaction that is already open.
    pub(crate) fn atomically<T>(
        &mut self,
        f: impl FnOnce(&mut Model) -> Result<T>,
        keep: impl FnOnce(&T) -> bool,
    ) -> Result<T> {
        if self.def.table.is_none() {
            return f(self);
        }
        let conn = self.connection()?;
        if conn.in_transaction() {
            return f(self);
        }
        conn.begin()?;
        match f(self) {
            Ok(value) if keep(&value) => {
                conn.commit()?;
                Ok(value)
            }
            Ok(value) => {
                conn.rollback()?;
                self.catalog.query_cache().clear();
                tracing::debug!(alias = %self.alias, "rolled back");
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = conn.rollback() {
                    tracing::warn!(alias = %self.alias, error = %rollback, "rollback failed");
                }
                self.catalog.query_cache().clear();
                Err(e)
            }
        }
    }

    /// Forget the current record before saving another one.
    pub(crate) fn reset_record(&mut self) {
        self.id = None;
        self.data = Record::new();
        self.validation_errors.clear();
    }

    /// Run `before_validate` and the rules. `None` when the record was
    /// rejected; messages land in the validation errors.
    fn validated(&mut self, record: Record, validate: bool, options: &SaveOptions) -> Result<Option<Record>> {
        if let Some(id) = record.get(&self.def.primary_key).filter(|v| !v.is_empty()) {
            self.id = Some(id.clone());
        }
        let creating = !self.exists()?;
        let record = if options.callbacks {
            match self.behaviors.before_validate(record) {
                Ok(record) => record,
                Err(behavior) => {
                    tracing::debug!(alias = %self.alias, behavior = %behavior, "before_validate vetoed save");
                    return Ok(None);
                }
            }
        } else {
            record
        };
        if validate {
            let errors = self
                .def
                .validate
                .validate(record.fields(), creating, &options.field_list);
            if !errors.is_empty() {
                tracing::debug!(alias = %self.alias, failures = errors.errors.len(), "validation failed");
                self.validation_errors.absorb(errors);
                return Ok(None);
            }
        }
        Ok(Some(record))
    }

    /// The single-record pipeline, without transaction handling.
    fn save_record(&mut self, record: Record, options: &SaveOptions) -> Result<bool> {
        let Some(record) = self.validated(record, options.validate, options)? else {
            return Ok(false);
        };
        let mut record = if options.callbacks {
            match self.behaviors.before_save(record) {
                Ok(record) => record,
                Err(behavior) => {
                    tracing::debug!(alias = %self.alias, behavior = %behavior, "before_save vetoed save");
                    return Ok(false);
                }
            }
        } else {
            record
        };

        let Some(table) = self.table() else {
            self.data = record;
            return Ok(true);
        };
        let pk = self.def.primary_key.clone();
        if let Some(id) = record.get(&pk).filter(|v| !v.is_empty()) {
            self.id = Some(id.clone());
        }
        let creating = !self.exists()?;
        let schema = self.schema()?;

        let now = timestamp::now();
        let mut stamped = Vec::new();
        for column in STAMP_COLUMNS {
            if column == "created" && !creating {
                continue;
            }
            if schema.has(column) && !record.contains(column) {
                record.set(column, now.clone());
                stamped.push(column);
            }
        }

        let is_stamp = |column: &str| stamped.iter().any(|s| *s == column);
        let (fields, related) = record.into_parts();
        let mut payload: Vec<(String, Value)> = fields
            .iter()
            .filter(|(column, _)| {
                schema.has(column) && (options.allows(column) || is_stamp(column))
            })
            .map(|(column, value)| (column.clone(), schema.coerce_for_write(column, value.clone())))
            .collect();
        let habtm: Vec<(String, AssociationSpec, Related)> = related
            .into_iter()
            .filter_map(|(alias, entry)| match self.associations.get(&alias) {
                Some(spec) if spec.kind == AssociationKind::HasAndBelongsToMany => {
                    Some((alias, spec.clone(), entry))
                }
                _ => None,
            })
            .collect();

        let written = payload
            .iter()
            .filter(|(column, _)| *column != pk && !is_stamp(column))
            .count();
        if written == 0 && habtm.is_empty() && !(creating && !payload.is_empty()) {
            tracing::debug!(alias = %self.alias, "nothing to save");
            return Ok(false);
        }

        let conn = self.connection()?;
        let dialect = conn.dialect();
        let before = match self.id.clone() {
            Some(id) if !creating && options.counter_cache => self.counter_targets(&id)?,
            _ => Vec::new(),
        };

        let id = if creating {
            payload.retain(|(column, value)| !(*column == pk && value.is_empty()));
            let explicit = payload.iter().find(|(c, _)| *c == pk).map(|(_, v)| v.clone());
            let (sql, params) = InsertQuery::new(table.clone()).values(payload).build(dialect);
            let rowid = conn.insert(&sql, &params)?;
            tracing::debug!(alias = %self.alias, table = %table, rowid, "inserted");
            explicit.unwrap_or(Value::Int(rowid))
        } else {
            let id = self
                .id
                .clone()
                .ok_or_else(|| Error::Custom(format!("'{}' update without an id", self.alias)))?;
            let mut update = UpdateQuery::new(table.clone()).filter(Expr::col(pk.clone()).eq(id.clone()));
            for (column, value) in payload.into_iter().filter(|(c, _)| *c != pk) {
                update = update.set(column, value);
            }
            if !update.is_empty() {
                let (sql, params) = update.build(dialect);
                let affected = conn.execute(&sql, &params)?;
                tracing::debug!(alias = %self.alias, table = %table, id = %id, affected, "updated");
            }
            id
        };
        self.id = Some(id.clone());

        for (alias, spec, entry) in habtm {
            self.save_habtm(&alias, &spec, entry, &id)?;
        }

        if options.counter_cache {
            let mut targets = before;
            targets.extend(self.counter_targets(&id)?);
            self.refresh_counters(targets)?;
        }

        let mut saved = Record::new();
        *saved.fields_mut() = fields;
        saved.set(pk, id);
        self.catalog.invalidate(&table);
        if options.callbacks {
            for (behavior, ok) in self.behaviors.after_save(creating, &saved) {
                tracing::trace!(alias = %self.alias, behavior = %behavior, ok, "after_save");
            }
        }
        self.data = saved;
        Ok(true)
    }

    // ==================== HABTM ====================

    /// Make the join rows of `alias` for owner `id` match `entry`.
    ///
    /// Rows compare as multisets over the columns given in the input. When
    /// nothing differs no statement is issued. With a join-table key only
    /// stale rows are deleted; without one, every row of the owner is
    /// replaced. Non-unique associations only ever add rows.
    fn save_habtm(&mut self, alias: &str, spec: &AssociationSpec, entry: Related, id: &Value) -> Result<()> {
        let (join_table, with, foreign_key, association_key) = self.habtm_layout(alias, spec)?;
        let target_pk = self.related_mut(alias)?.def.primary_key.clone();
        let schema = self.catalog.table_schema(&self.def.datasource, &join_table)?;
        let join_pk = schema
            .columns()
            .iter()
            .find(|c| c.is_primary())
            .map(|c| c.name.clone());

        let desired: Vec<BTreeMap<String, Value>> = join_rows(entry, alias, &association_key, &target_pk)
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .filter(|(c, _)| {
                        *c != foreign_key && join_pk.as_ref() != Some(c) && schema.has(c)
                    })
                    .map(|(c, v)| {
                        let v = schema.coerce_for_write(&c, v);
                        (c, v)
                    })
                    .collect()
            })
            .collect();

        let conn = self.connection()?;
        let dialect = conn.dialect();
        let (sql, params) = SelectQuery::new(join_table.clone(), with.clone())
            .filter(Expr::qualified(with.clone(), foreign_key.clone()).eq(id.clone()))
            .build(dialect);
        let current: Vec<BTreeMap<String, Value>> = conn
            .query(&sql, &params)?
            .into_iter()
            .map(|row| row.into_pairs().collect())
            .collect();

        let mut matched = vec![false; current.len()];
        let mut missing = Vec::new();
        for row in desired.iter() {
            let hit = current
                .iter()
                .enumerate()
                .find(|(i, existing)| !matched[*i] && row_matches(row, existing));
            match hit {
                Some((i, _)) => matched[i] = true,
                None => missing.push(row.clone()),
            }
        }
        let stale: Vec<usize> = (0..current.len()).filter(|i| !matched[*i]).collect();

        if missing.is_empty() && (stale.is_empty() || !spec.unique) {
            tracing::trace!(alias = %self.alias, association = alias, "join rows unchanged");
            return Ok(());
        }

        let to_insert = if !spec.unique {
            missing
        } else if let Some(join_pk) = join_pk.as_ref().filter(|_| !stale.is_empty()) {
            let keys: Vec<Value> = stale
                .iter()
                .filter_map(|i| current[*i].get(join_pk).cloned())
                .collect();
            let (sql, params) = DeleteQuery::new(join_table.clone())
                .filter(Expr::col(join_pk.clone()).in_list(keys))
                .build(dialect);
            conn.execute(&sql, &params)?;
            missing
        } else if join_pk.is_some() {
            missing
        } else {
            let (sql, params) = DeleteQuery::new(join_table.clone())
                .filter(Expr::col(foreign_key.clone()).eq(id.clone()))
                .build(dialect);
            conn.execute(&sql, &params)?;
            desired
        };

        let inserted = to_insert.len();
        for row in to_insert {
            let (sql, params) = InsertQuery::new(join_table.clone())
                .value(foreign_key.clone(), id.clone())
                .values(row)
                .build(dialect);
            conn.insert(&sql, &params)?;
        }
        tracing::debug!(
            alias = %self.alias,
            association = alias,
            join_table = %join_table,
            removed = stale.len(),
            inserted,
            "synchronized join rows"
        );
        self.catalog.invalidate(&join_table);
        Ok(())
    }

    // ==================== Counter caches ====================

    /// `(parent alias, parent key)` of every counter-cached belongsTo of the
    /// stored row `id`.
    pub(crate) fn counter_targets(&mut self, id: &Value) -> Result<Vec<(String, Value)>> {
        let owner = self.def.convention_table();
        let caches: Vec<(String, String)> = self
            .associations
            .iter()
            .filter(|(_, spec)| spec.kind == AssociationKind::BelongsTo && spec.counter_cache.is_some())
            .filter_map(|(alias, spec)| {
                spec.foreign_key_column(alias, &owner)
                    .map(|fk| (alias.to_string(), fk))
            })
            .collect();
        if caches.is_empty() {
            return Ok(Vec::new());
        }

        let table = self.require_table()?;
        let conn = self.connection()?;
        let (sql, params) = SelectQuery::new(table, self.alias.clone())
            .filter(Expr::qualified(self.alias.clone(), self.def.primary_key.clone()).eq(id.clone()))
            .build(conn.dialect());
        let Some(row) = conn.query_one(&sql, &params)? else {
            return Ok(Vec::new());
        };
        Ok(caches
            .into_iter()
            .filter_map(|(alias, fk)| {
                row.get_by_name(&fk)
                    .filter(|v| !v.is_empty())
                    .map(|v| (alias, v.clone()))
            })
            .collect())
    }

    /// Recount children of each parent and store the count on the parent.
    pub(crate) fn refresh_counters(&mut self, targets: Vec<(String, Value)>) -> Result<()> {
        let owner = self.def.convention_table();
        let mut seen = HashSet::new();
        for (alias, parent_id) in targets {
            if !seen.insert((alias.clone(), parent_id.to_key_string())) {
                continue;
            }
            let Some(spec) = self.associations.get(&alias).cloned() else {
                continue;
            };
            let (Some(fk), Some(column)) = (
                spec.foreign_key_column(&alias, &owner),
                spec.counter_column(&self.alias),
            ) else {
                continue;
            };

            let table = self.require_table()?;
            let schema = self.schema()?;
            let conn = self.connection()?;
            let mut query = SelectQuery::new(table, self.alias.clone())
                .filter(Expr::qualified(self.alias.clone(), fk).eq(parent_id.clone()));
            if let Some(scope) = spec.counter_cache.as_ref().and_then(|c| c.scope.clone()) {
                query = query.filter(self.rewrite(scope, &schema));
            }
            let (sql, params) = query.build_count(conn.dialect());
            let count = conn
                .query_one(&sql, &params)?
                .and_then(|row| row.get_by_name("count").and_then(Value::as_i64))
                .unwrap_or(0);

            let parent = self.related_mut(&alias)?;
            let parent_table = parent.require_table()?;
            if !parent.schema()?.has(&column) {
                tracing::debug!(association = %alias, column = %column, "parent has no counter column");
                continue;
            }
            let parent_conn = parent.connection()?;
            let (sql, params) = UpdateQuery::new(parent_table.clone())
                .set(column.clone(), count)
                .filter(Expr::col(parent.def.primary_key.clone()).eq(parent_id.clone()))
                .build(parent_conn.dialect());
            parent_conn.execute(&sql, &params)?;
            self.catalog.invalidate(&parent_table);
            tracing::debug!(
                alias = %self.alias,
                association = %alias,
                parent = %parent_id,
                column = %column,
                count,
                "refreshed counter cache"
            );
        }
        Ok(())
    }

    // ==================== Nested saves ====================

    /// Save a record together with its associated data.
    ///
    /// belongsTo parents are saved first and their keys copied onto the
    /// record; hasOne and hasMany children follow with the new key set;
    /// hasAndBelongsToMany entries replace the record's links.
    #[tracing::instrument(level = "debug", skip(self, data, options), fields(alias = %self.alias))]
    pub fn save_associated(&mut self, data: Tree, options: SaveAllOptions) -> Result<SaveOutcome> {
        self.validation_errors.clear();
        let result = self
            .root_record(data)
            .and_then(|record| self.run_associated(record, &options));
        self.finish(result)
    }

    fn run_associated(&mut self, record: Record, options: &SaveAllOptions) -> Result<SaveOutcome> {
        let outcome = |ok: bool, statuses: Statuses| {
            if options.atomic {
                SaveOutcome::Atomic(ok)
            } else {
                SaveOutcome::Associated(statuses)
            }
        };

        let validate = match options.validate {
            ValidateMode::Only | ValidateMode::First => {
                let (ok, statuses) = self.validate_associated(record.clone(), options)?;
                if options.validate == ValidateMode::Only || !ok {
                    return Ok(outcome(ok, statuses));
                }
                false
            }
            ValidateMode::Yes => true,
            ValidateMode::No => false,
        };

        if options.atomic {
            let (ok, statuses) = self.atomically(
                |m| m.save_associated_record(record, options, validate),
                |(ok, _)| *ok,
            )?;
            Ok(outcome(ok, statuses))
        } else {
            let (ok, statuses) = self.save_associated_record(record, options, validate)?;
            Ok(outcome(ok, statuses))
        }
    }

    fn save_associated_record(
        &mut self,
        mut record: Record,
        options: &SaveAllOptions,
        validate: bool,
    ) -> Result<(bool, Statuses)> {
        let single = options.single(validate);
        let owner = self.def.convention_table();
        let mut statuses = Statuses::new();
        let mut ok = true;

        for alias in self.get_associated(AssociationKind::BelongsTo) {
            let Some(Related::One(parent)) = record.take_related(&alias) else {
                continue;
            };
            let fk = self
                .associations
                .get(&alias)
                .and_then(|spec| spec.foreign_key_column(&alias, &owner));
            let related = self.related_mut(&alias)?;
            related.reset_record();
            let saved = related.save_child(parent, options, &single)?;
            let parent_id = related.id.clone();
            let errors = std::mem::take(&mut related.validation_errors);
            if saved {
                if let (Some(fk), Some(parent_id)) = (fk, parent_id) {
                    record.set(fk, parent_id);
                }
            } else {
                self.validation_errors.merge_prefixed(&alias, errors);
                ok = false;
            }
            statuses.insert(alias, SaveStatus::One(saved));
        }

        let mut children: Vec<(String, AssociationKind, Related)> = Vec::new();
        for kind in [AssociationKind::HasOne, AssociationKind::HasMany] {
            for alias in self.get_associated(kind) {
                if let Some(entry) = record.take_related(&alias) {
                    children.push((alias, kind, entry));
                }
            }
        }

        if !ok && options.atomic {
            return Ok((false, statuses));
        }
        let saved = self.save_record(record, &single)?;
        statuses.insert(self.alias.clone(), SaveStatus::One(saved));
        if !saved {
            return Ok((false, statuses));
        }
        let Some(id) = self.id.clone() else {
            return Ok((ok, statuses));
        };

        for (alias, kind, entry) in children {
            let fk = self
                .associations
                .get(&alias)
                .and_then(|spec| spec.foreign_key_column(&alias, &owner));
            let records = match (kind, entry) {
                (AssociationKind::HasOne, Related::One(r)) => vec![r],
                (AssociationKind::HasMany, Related::Many(rs)) => rs,
                (AssociationKind::HasMany, Related::One(r)) => vec![r],
                _ => continue,
            };
            let mut results = Vec::with_capacity(records.len());
            for (index, mut child) in records.into_iter().enumerate() {
                if let Some(fk) = &fk {
                    child.set(fk.clone(), id.clone());
                }
                let related = self.related_mut(&alias)?;
                related.reset_record();
                let saved = related.save_child(child, options, &single)?;
                let errors = std::mem::take(&mut related.validation_errors);
                if !saved {
                    let prefix = match kind {
                        AssociationKind::HasMany => format!("{alias}.{index}"),
                        _ => alias.clone(),
                    };
                    self.validation_errors.merge_prefixed(&prefix, errors);
                    ok = false;
                }
                results.push(saved);
                if !saved && options.atomic {
                    break;
                }
            }
            let status = match kind {
                AssociationKind::HasMany => SaveStatus::Many(results),
                _ => SaveStatus::One(results.first().copied().unwrap_or(false)),
            };
            statuses.insert(alias, status);
            if !ok && options.atomic {
                break;
            }
        }
        Ok((ok, statuses))
    }

    /// Save one associated record, recursing into its own associations
    /// when `deep`.
    fn save_child(&mut self, record: Record, options: &SaveAllOptions, single: &SaveOptions) -> Result<bool> {
        if options.deep {
            self.save_associated_record(record, options, single.validate)
                .map(|(ok, _)| ok)
        } else {
            self.save_record(record, single)
        }
    }

    /// Validate a record and its associated data without writing.
    fn validate_associated(&mut self, mut record: Record, options: &SaveAllOptions) -> Result<(bool, Statuses)> {
        let single = options.single(true);
        let mut statuses = Statuses::new();
        let mut ok = true;

        let mut children: Vec<(String, AssociationKind, Vec<Record>)> = Vec::new();
        for kind in [
            AssociationKind::BelongsTo,
            AssociationKind::HasOne,
            AssociationKind::HasMany,
        ] {
            for alias in self.get_associated(kind) {
                let records = match record.take_related(&alias) {
                    Some(Related::One(r)) => vec![r],
                    Some(Related::Many(rs)) if kind == AssociationKind::HasMany => rs,
                    _ => continue,
                };
                children.push((alias, kind, records));
            }
        }

        let root_ok = self.validated(record, true, &single)?.is_some();
        statuses.insert(self.alias.clone(), SaveStatus::One(root_ok));
        ok &= root_ok;

        for (alias, kind, records) in children {
            let mut results = Vec::with_capacity(records.len());
            for (index, child) in records.into_iter().enumerate() {
                let related = self.related_mut(&alias)?;
                related.reset_record();
                let valid = if options.deep {
                    related.validate_associated(child, options)?.0
                } else {
                    related.validated(child, true, &single)?.is_some()
                };
                let errors = std::mem::take(&mut related.validation_errors);
                if !valid {
                    let prefix = match kind {
                        AssociationKind::HasMany => format!("{alias}.{index}"),
                        _ => alias.clone(),
                    };
                    self.validation_errors.merge_prefixed(&prefix, errors);
                }
                results.push(valid);
            }
            ok &= results.iter().all(|v| *v);
            let status = match kind {
                AssociationKind::HasMany => SaveStatus::Many(results),
                _ => SaveStatus::One(results.first().copied().unwrap_or(false)),
            };
            statuses.insert(alias, status);
        }
        Ok((ok, statuses))
    }

    // ==================== Batch saves ====================

    /// Save several records of this model.
    ///
    /// Validation errors are keyed by record index (`"1.title"`). In atomic
    /// mode the first failure stops the batch and rolls every write back.
    #[tracing::instrument(level = "debug", skip(self, records, options), fields(alias = %self.alias, count = records.len()))]
    pub fn save_many(&mut self, records: Vec<Tree>, options: SaveAllOptions) -> Result<SaveOutcome> {
        self.validation_errors.clear();
        let result = records
            .into_iter()
            .map(|tree| self.root_record(tree))
            .collect::<Result<Vec<_>>>()
            .and_then(|records| self.run_many(records, &options));
        self.finish(result)
    }

    fn run_many(&mut self, records: Vec<Record>, options: &SaveAllOptions) -> Result<SaveOutcome> {
        let outcome = |results: Vec<bool>| {
            if options.atomic {
                SaveOutcome::Atomic(results.iter().all(|ok| *ok))
            } else {
                SaveOutcome::Records(results)
            }
        };

        let validate = match options.validate {
            ValidateMode::Only | ValidateMode::First => {
                let mut errors = ValidationErrors::new();
                let mut results = Vec::with_capacity(records.len());
                for (index, record) in records.iter().enumerate() {
                    self.reset_record();
                    let valid = if options.deep {
                        self.validate_associated(record.clone(), options)?.0
                    } else {
                        self.validated(record.clone(), true, &options.single(true))?
                            .is_some()
                    };
                    errors.merge_prefixed(&index.to_string(), std::mem::take(&mut self.validation_errors));
                    results.push(valid);
                }
                self.reset_record();
                self.validation_errors = errors;
                let ok = results.iter().all(|v| *v);
                if options.validate == ValidateMode::Only || !ok {
                    return Ok(outcome(results));
                }
                false
            }
            ValidateMode::Yes => true,
            ValidateMode::No => false,
        };

        let results = if options.atomic {
            self.atomically(
                |m| m.save_each(records, options, validate),
                |results| results.iter().all(|ok| *ok),
            )?
        } else {
            self.save_each(records, options, validate)?
        };
        Ok(outcome(results))
    }

    fn save_each(&mut self, records: Vec<Record>, options: &SaveAllOptions, validate: bool) -> Result<Vec<bool>> {
        let single = options.single(validate);
        let mut errors = ValidationErrors::new();
        let mut results = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            self.reset_record();
            let saved = if options.deep {
                self.save_associated_record(record, options, validate)?.0
            } else {
                self.save_record(record, &single)?
            };
            errors.merge_prefixed(&index.to_string(), std::mem::take(&mut self.validation_errors));
            results.push(saved);
            if !saved && options.atomic {
                break;
            }
        }
        self.validation_errors = errors;
        Ok(results)
    }

    /// [`Model::save_many`] or [`Model::save_associated`], by input shape.
    pub fn save_all(&mut self, input: SaveAllInput, options: SaveAllOptions) -> Result<SaveOutcome> {
        match input {
            SaveAllInput::Many(records) => self.save_many(records, options),
            SaveAllInput::Associated(tree) => self.save_associated(tree, options),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmodel_core::ValidationErrorKind;

    #[test]
    fn test_validation_errors_prefixing() {
        let mut inner = ValidationErrors::new();
        inner.add("comment", "required");
        let mut outer = ValidationErrors::new();
        outer.add("title", "blank");
        outer.merge_prefixed("Comment.0", inner);
        assert_eq!(outer.len(), 2);
        assert_eq!(outer.get("Comment.0.comment"), Some(&["required".to_string()][..]));
        assert!(outer.contains("title"));
    }

    #[test]
    fn test_absorb_groups_by_field() {
        let mut rules = ValidationError::new();
        rules.add("title", ValidationErrorKind::Blank, "blank");
        rules.add("title", ValidationErrorKind::MinLength, "short");
        let mut errors = ValidationErrors::new();
        errors.absorb(rules);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.get("title").map(<[String]>::len), Some(2));
        assert_eq!(serde_json::to_value(&errors).expect("json")["title"][1], "short");
    }

    #[test]
    fn test_join_rows_dedupe_plain_keys() {
        let rows = join_rows(
            Related::Keys(vec![Value::from(1), Value::from("1"), Value::from(2), Value::from("")]),
            "Tag",
            "tag_id",
            "id",
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("tag_id"), Some(&Value::from(2)));
    }

    #[test]
    fn test_join_rows_from_records_and_nested_form() {
        let records = Related::Many(vec![
            Record::new().with("tag_id", 3).with("doomed", true),
            Record::new().with("id", 4),
            Record::new().with("name", "no key"),
        ]);
        let rows = join_rows(records, "Tag", "tag_id", "id");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("doomed"), Some(&Value::Bool(true)));
        assert_eq!(rows[1].get("tag_id"), Some(&Value::from(4)));

        let nested = Related::One(Record::new().with_related("Tag", Related::Keys(vec![Value::from(5)])));
        assert_eq!(join_rows(nested, "Tag", "tag_id", "id").len(), 1);
        assert!(join_rows(Related::Keys(vec![Value::from("")]), "Tag", "tag_id", "id").is_empty());
    }

    #[test]
    fn test_row_matching_is_loose() {
        let desired = BTreeMap::from([("tag_id".to_string(), Value::from("3"))]);
        let current = BTreeMap::from([
            ("tag_id".to_string(), Value::from(3)),
            ("post_id".to_string(), Value::from(1)),
        ]);
        assert!(row_matches(&desired, &current));
        let other = BTreeMap::from([("tag_id".to_string(), Value::from(4))]);
        assert!(!row_matches(&desired, &other));
    }

    #[test]
    fn test_outcome_success() {
        assert!(SaveOutcome::Records(vec![true, true]).is_success());
        assert!(!SaveOutcome::Records(vec![true, false]).is_success());
        let statuses = BTreeMap::from([
            ("Post".to_string(), SaveStatus::One(true)),
            ("Comment".to_string(), SaveStatus::Many(vec![true, false])),
        ]);
        assert!(!SaveOutcome::Associated(statuses).is_success());
        assert_eq!(
            serde_json::to_value(SaveOutcome::Records(vec![true, false])).expect("json"),
            serde_json::json!([true, false])
        );
    }

    #[test]
    fn test_field_list_allows() {
        let options = SaveOptions::new().field_list(["title"]);
        assert!(options.allows("title"));
        assert!(!options.allows("body"));
        assert!(SaveOptions::new().allows("body"));
    }
}
