//! Reads.
//!
//! A find runs `before_find` on the root model, compiles one SELECT (with
//! belongsTo/hasOne LEFT JOINed in when the depth budget allows), splits
//! each row into per-alias records, then merges the remaining associations
//! with batched follow-up queries:
//!
//! | kind      | fetched when | query                                      |
//! |-----------|--------------|--------------------------------------------|
//! | belongsTo | budget >= 0  | join at the root, else `pk IN (fks)`       |
//! | hasOne    | budget >= 0  | join at the root, else `fk IN (pks)`       |
//! | hasMany   | budget >= 1  | `fk IN (pks)`, per parent with limit/offset |
//! | HABTM     | budget >= 1  | target INNER JOIN join table, `fk IN (pks)` |
//!
//! Children are evaluated with `budget - 1`. A failed association fetch is
//! logged, reported through `on_error` and replaced by a placeholder.

use std::collections::{HashMap, HashSet};

use relmodel_core::{EntitySchema, Error, Result, Row, Value};
use relmodel_query::{Expr, Join, OrderBy, SelectQuery};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::association::{AssociationKind, AssociationSpec};
use crate::model::Model;
use crate::tree::{Record, Related, Tree};

/// Which lifecycle hooks a find runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Callbacks {
    #[default]
    All,
    None,
    Before,
    After,
}

impl Callbacks {
    fn before(self) -> bool {
        matches!(self, Callbacks::All | Callbacks::Before)
    }

    fn after(self) -> bool {
        matches!(self, Callbacks::All | Callbacks::After)
    }
}

/// Options of one find.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// WHERE condition.
    pub conditions: Option<Expr>,
    /// Fields as `"Alias.column"`, `"column"`, a virtual field name or an
    /// SQL expression with an optional `AS name`.
    pub fields: Vec<String>,
    /// Order terms such as `"Post.created DESC"`.
    pub order: Vec<String>,
    pub limit: Option<u64>,
    /// 1-based page; with `limit`, overrides `offset`.
    pub page: Option<u64>,
    pub offset: Option<u64>,
    pub group: Vec<String>,
    /// Extra joins, added as given.
    pub joins: Vec<Join>,
    /// Association depth; `None` uses the model's default, `-1` is root only.
    pub recursive: Option<i32>,
    pub callbacks: Callbacks,
    /// Associations bound for this find only.
    pub bind: Vec<(String, AssociationSpec)>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// AND `expr` into the conditions.
    pub fn conditions(mut self, expr: Expr) -> Self {
        self.conditions = Some(match self.conditions.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order.push(order.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn page(mut self, page: u64) -> Self {
        self.page = Some(page);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group.push(group.into());
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn recursive(mut self, depth: i32) -> Self {
        self.recursive = Some(depth);
        self
    }

    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Bind an association for this find only.
    pub fn bind(mut self, alias: impl Into<String>, spec: AssociationSpec) -> Self {
        self.bind.push((alias.into(), spec));
        self
    }

    fn effective_offset(&self) -> Option<u64> {
        match (self.page, self.limit) {
            (Some(page), Some(limit)) => Some(page.saturating_sub(1) * limit),
            _ => self.offset,
        }
    }
}

/// Kind of find.
#[derive(Debug, Clone, PartialEq)]
pub enum FindType {
    First,
    All,
    Count,
    /// Key/value pairs from up to three fields: key, value, group.
    List,
    /// Rows adjacent to `value` in the ordering of `field`.
    Neighbors { field: String, value: Value },
    /// Forest built from `parent_id`.
    Threaded,
}

/// Result of [`Model::find`], shaped by the find type.
#[derive(Debug, Clone, PartialEq)]
pub enum FindResult {
    First(Option<Tree>),
    All(Vec<Tree>),
    Count(i64),
    List(ListResult),
    Neighbors(Neighbors),
    Threaded(Vec<ThreadNode>),
}

impl FindResult {
    fn empty(find_type: &FindType) -> Self {
        match find_type {
            FindType::First => FindResult::First(None),
            FindType::All => FindResult::All(Vec::new()),
            FindType::Count => FindResult::Count(0),
            FindType::List => FindResult::List(ListResult::Flat(Vec::new())),
            FindType::Neighbors { .. } => FindResult::Neighbors(Neighbors::default()),
            FindType::Threaded => FindResult::Threaded(Vec::new()),
        }
    }

    pub fn into_first(self) -> Option<Tree> {
        match self {
            FindResult::First(tree) => tree,
            FindResult::All(trees) => trees.into_iter().next(),
            _ => None,
        }
    }

    pub fn into_all(self) -> Vec<Tree> {
        match self {
            FindResult::All(trees) => trees,
            FindResult::First(tree) => tree.into_iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn count(&self) -> Option<i64> {
        match self {
            FindResult::Count(n) => Some(*n),
            _ => None,
        }
    }

    pub fn into_list(self) -> ListResult {
        match self {
            FindResult::List(list) => list,
            _ => ListResult::Flat(Vec::new()),
        }
    }

    pub fn into_neighbors(self) -> Neighbors {
        match self {
            FindResult::Neighbors(n) => n,
            _ => Neighbors::default(),
        }
    }

    pub fn into_threaded(self) -> Vec<ThreadNode> {
        match self {
            FindResult::Threaded(nodes) => nodes,
            _ => Vec::new(),
        }
    }
}

/// Result of a list find, in row order.
#[derive(Debug, Clone, PartialEq)]
pub enum ListResult {
    Flat(Vec<(Value, Value)>),
    Grouped(Vec<(Value, Vec<(Value, Value)>)>),
}

impl ListResult {
    /// Value listed under `key` (flat lists only).
    pub fn get(&self, key: &Value) -> Option<&Value> {
        match self {
            ListResult::Flat(pairs) => pairs
                .iter()
                .find(|(k, _)| k.loosely_eq(key))
                .map(|(_, v)| v),
            ListResult::Grouped(_) => None,
        }
    }

    /// Pairs listed under `group` (grouped lists only).
    pub fn group(&self, group: &Value) -> Option<&[(Value, Value)]> {
        match self {
            ListResult::Grouped(groups) => groups
                .iter()
                .find(|(g, _)| g.loosely_eq(group))
                .map(|(_, pairs)| pairs.as_slice()),
            ListResult::Flat(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ListResult::Flat(pairs) => pairs.len(),
            ListResult::Grouped(groups) => groups.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn serialize_pairs<S: Serializer>(
    serializer: S,
    pairs: &[(Value, Value)],
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(pairs.len()))?;
    for (k, v) in pairs {
        map.serialize_entry(&k.to_key_string(), v)?;
    }
    map.end()
}

struct Pairs<'a>(&'a [(Value, Value)]);

impl Serialize for Pairs<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serialize_pairs(serializer, self.0)
    }
}

impl Serialize for ListResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ListResult::Flat(pairs) => serialize_pairs(serializer, pairs),
            ListResult::Grouped(groups) => {
                let mut map = serializer.serialize_map(Some(groups.len()))?;
                for (group, pairs) in groups {
                    map.serialize_entry(&group.to_key_string(), &Pairs(pairs))?;
                }
                map.end()
            }
        }
    }
}

/// Rows before and after a value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Neighbors {
    pub prev: Option<Tree>,
    pub next: Option<Tree>,
}

/// One node of a threaded find.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadNode {
    pub tree: Tree,
    pub children: Vec<ThreadNode>,
}

impl Serialize for ThreadNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.tree.len() + 1))?;
        for (alias, related) in self.tree.iter() {
            map.serialize_entry(alias, related)?;
        }
        map.serialize_entry("children", &self.children)?;
        map.end()
    }
}

// ==================== Query plans ====================

/// Join of a HABTM join table onto its target.
#[derive(Debug, Clone)]
struct JoinTable {
    alias: String,
    table: String,
    on: Expr,
    columns: Vec<String>,
}

/// One SELECT against a model, before compilation.
#[derive(Debug, Clone, Default)]
struct Select {
    conditions: Option<Expr>,
    fields: Vec<String>,
    order: Vec<String>,
    group: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    joins: Vec<Join>,
    join_table: Option<JoinTable>,
    /// LEFT JOIN belongsTo/hasOne associations.
    join_single: bool,
    /// Root columns always selected when `fields` is explicit.
    keys: Vec<String>,
    /// Depth budget of the rows, deciding which keys nested fetches need.
    budget: i32,
}

impl Select {
    fn from_options(options: &FindOptions, budget: i32) -> Self {
        Self {
            conditions: options.conditions.clone(),
            fields: options.fields.clone(),
            order: options.order.clone(),
            group: options.group.clone(),
            limit: options.limit,
            offset: options.effective_offset(),
            joins: options.joins.clone(),
            join_table: None,
            join_single: budget >= 0,
            keys: Vec::new(),
            budget,
        }
    }

    /// Fetch of an association's target rows.
    fn association(spec: &AssociationSpec, budget: i32) -> Self {
        Self {
            conditions: spec.conditions.clone(),
            fields: spec.fields.clone(),
            order: spec.order.clone(),
            budget,
            ..Self::default()
        }
    }

    fn filter(mut self, expr: Expr) -> Self {
        self.conditions = Some(match self.conditions.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    fn key(mut self, column: impl Into<String>) -> Self {
        self.keys.push(column.into());
        self
    }
}

/// A selected field, resolved against the model.
#[derive(Debug, Clone, PartialEq)]
enum Projection {
    Column { alias: String, name: String },
    Virtual(String),
    Computed { sql: String, name: String },
}

struct Compiled {
    query: SelectQuery,
    tables: Vec<String>,
    joined: Vec<String>,
    /// Aliases whose columns come back as `Alias__column`.
    prefixes: HashSet<String>,
    schemas: HashMap<String, EntitySchema>,
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

/// Split `"expr AS name"`.
fn split_as(field: &str) -> (&str, Option<&str>) {
    let lower = field.to_ascii_lowercase();
    match lower.rfind(" as ") {
        Some(pos) => (field[..pos].trim(), Some(field[pos + 4..].trim())),
        None => (field.trim(), None),
    }
}

fn key_of(value: Option<&Value>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(Value::to_key_string)
}

fn distinct_keys<'a>(values: impl Iterator<Item = Option<&'a Value>>) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for value in values.flatten() {
        if value.is_empty() {
            continue;
        }
        if seen.insert(value.to_key_string()) {
            keys.push(value.clone());
        }
    }
    keys
}

/// Root record plus its association entries as a result tree.
pub(crate) fn record_into_tree(alias: &str, record: Record) -> Tree {
    let (fields, related) = record.into_parts();
    let mut root = Record::new();
    *root.fields_mut() = fields;
    let mut tree = Tree::single(alias, root);
    for (name, entry) in related {
        tree.insert(name, entry);
    }
    tree
}

impl Model {
    // ==================== Public finds ====================

    /// Run a find of `find_type`.
    ///
    /// Transient association binds (from `options.bind` or an earlier
    /// `bind_model(.., false)`) are undone when it returns.
    #[tracing::instrument(level = "debug", skip(self, options), fields(alias = %self.alias))]
    pub fn find(&mut self, find_type: FindType, options: FindOptions) -> Result<FindResult> {
        let result = self.run_find(find_type, options);
        self.finish(result)
    }

    pub fn find_first(&mut self, options: FindOptions) -> Result<Option<Tree>> {
        Ok(self.find(FindType::First, options)?.into_first())
    }

    pub fn find_all(&mut self, options: FindOptions) -> Result<Vec<Tree>> {
        Ok(self.find(FindType::All, options)?.into_all())
    }

    /// Number of rows matching the options, from a dedicated COUNT query.
    pub fn find_count(&mut self, options: FindOptions) -> Result<i64> {
        Ok(self.find(FindType::Count, options)?.count().unwrap_or(0))
    }

    pub fn find_list(&mut self, options: FindOptions) -> Result<ListResult> {
        Ok(self.find(FindType::List, options)?.into_list())
    }

    pub fn find_neighbors(
        &mut self,
        field: &str,
        value: impl Into<Value>,
        options: FindOptions,
    ) -> Result<Neighbors> {
        let find_type = FindType::Neighbors {
            field: field.to_string(),
            value: value.into(),
        };
        Ok(self.find(find_type, options)?.into_neighbors())
    }

    pub fn find_threaded(&mut self, options: FindOptions) -> Result<Vec<ThreadNode>> {
        Ok(self.find(FindType::Threaded, options)?.into_threaded())
    }

    /// Read the row with `id` (or the current id) into the current record.
    pub fn read(&mut self, fields: &[&str], id: Option<Value>) -> Result<Option<Tree>> {
        if let Some(id) = id {
            self.set_id(id);
        }
        let Some(id) = self.id().cloned() else {
            return Ok(None);
        };
        let options = FindOptions::new()
            .conditions(Expr::qualified(self.alias.clone(), self.primary_key()).eq(id))
            .fields(fields.iter().copied());
        let found = self.find_first(options)?;
        self.data = found
            .as_ref()
            .and_then(|tree| tree.record(&self.alias))
            .cloned()
            .unwrap_or_default();
        Ok(found)
    }

    fn run_find(&mut self, find_type: FindType, mut options: FindOptions) -> Result<FindResult> {
        for (alias, spec) in std::mem::take(&mut options.bind) {
            self.associations.bind(alias, spec, false);
        }
        if options.callbacks.before() {
            match self.behaviors.before_find(options) {
                Some(replaced) => options = replaced,
                None => return Ok(FindResult::empty(&find_type)),
            }
        }
        if self.table().is_none() {
            tracing::debug!(alias = %self.alias, "tableless entity, nothing to find");
            return Ok(FindResult::empty(&find_type));
        }

        match find_type {
            FindType::First => {
                options.limit = Some(1);
                let trees = self.find_trees(&options)?;
                Ok(FindResult::First(trees.into_iter().next()))
            }
            FindType::All => Ok(FindResult::All(self.find_trees(&options)?)),
            FindType::Count => Ok(FindResult::Count(self.count_rows(&options)?)),
            FindType::List => Ok(FindResult::List(self.list_rows(&options)?)),
            FindType::Neighbors { field, value } => Ok(FindResult::Neighbors(
                self.neighbor_rows(&options, &field, value)?,
            )),
            FindType::Threaded => {
                let trees = self.find_trees(&options)?;
                Ok(FindResult::Threaded(thread(
                    &self.alias,
                    &self.def.primary_key,
                    trees,
                )))
            }
        }
    }

    fn budget(&self, options: &FindOptions) -> i32 {
        options.recursive.unwrap_or(self.recursive)
    }

    pub(crate) fn find_trees(&mut self, options: &FindOptions) -> Result<Vec<Tree>> {
        let budget = self.budget(options);
        let records = self.fetch_records(Select::from_options(options, budget))?;
        let trees: Vec<Tree> = records
            .into_iter()
            .map(|record| record_into_tree(&self.alias, record))
            .collect();
        if options.callbacks.after() {
            Ok(self.behaviors.after_find(trees))
        } else {
            Ok(trees)
        }
    }

    fn count_rows(&mut self, options: &FindOptions) -> Result<i64> {
        let mut select = Select::from_options(options, self.budget(options));
        select.fields.clear();
        let compiled = self.compile(&select)?;
        let conn = self.connection()?;
        let (sql, params) = compiled.query.build_count(conn.dialect());
        let rows = self.execute_read(conn.as_ref(), &sql, &params, &compiled.tables)?;
        Ok(rows
            .first()
            .and_then(|row| row.get_by_name("count"))
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    fn qualify(&self, field: &str) -> String {
        if field.contains('.') {
            field.to_string()
        } else {
            format!("{}.{}", self.alias, field)
        }
    }

    fn display_field(&self) -> Result<String> {
        if let Some(field) = &self.def.display_field {
            return Ok(field.clone());
        }
        let schema = self.schema()?;
        Ok(["title", "name"]
            .into_iter()
            .find(|c| schema.has(c))
            .unwrap_or(self.def.primary_key.as_str())
            .to_string())
    }

    fn list_rows(&mut self, options: &FindOptions) -> Result<ListResult> {
        let paths: Vec<String> = match options.fields.len() {
            0 => vec![self.def.primary_key.clone(), self.display_field()?],
            1 => vec![self.def.primary_key.clone(), options.fields[0].clone()],
            _ => options.fields.iter().take(3).cloned().collect(),
        };
        let paths: Vec<String> = paths.iter().map(|p| self.qualify(p)).collect();
        let crosses = paths
            .iter()
            .any(|p| p.split('.').next() != Some(self.alias.as_str()));

        let mut list_options = options.clone();
        list_options.fields = paths.clone();
        list_options.recursive = Some(if crosses { 0 } else { -1 });
        let trees = self.find_trees(&list_options)?;

        let value_at = |tree: &Tree, path: &str| tree.value(path).cloned().unwrap_or_default();
        if paths.len() < 3 {
            return Ok(ListResult::Flat(
                trees
                    .iter()
                    .map(|t| (value_at(t, &paths[0]), value_at(t, &paths[1])))
                    .collect(),
            ));
        }

        let mut groups: Vec<(Value, Vec<(Value, Value)>)> = Vec::new();
        for tree in &trees {
            let group = value_at(tree, &paths[2]);
            let pair = (value_at(tree, &paths[0]), value_at(tree, &paths[1]));
            match groups.iter_mut().find(|(g, _)| *g == group) {
                Some((_, pairs)) => pairs.push(pair),
                None => groups.push((group, vec![pair])),
            }
        }
        Ok(ListResult::Grouped(groups))
    }

    fn neighbor_rows(&mut self, options: &FindOptions, field: &str, value: Value) -> Result<Neighbors> {
        let field = self.qualify(field);

        let mut prev = options.clone().conditions(Expr::field(&field).lt(value.clone()));
        prev.order = vec![format!("{field} DESC")];
        prev.limit = Some(1);
        prev.page = None;
        prev.offset = None;

        let mut next = options.clone().conditions(Expr::field(&field).gt(value));
        next.order = vec![format!("{field} ASC")];
        next.limit = Some(1);
        next.page = None;
        next.offset = None;

        Ok(Neighbors {
            prev: self.find_trees(&prev)?.into_iter().next(),
            next: self.find_trees(&next)?.into_iter().next(),
        })
    }

    // ==================== Compilation ====================

    fn virtual_sql(&self, name: &str) -> Option<String> {
        self.def
            .virtual_fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, sql)| format!("({})", sql.replace("{alias}", &self.alias)))
    }

    /// Expand virtual fields and qualify bare root columns.
    pub(crate) fn rewrite(&self, expr: Expr, schema: &EntitySchema) -> Expr {
        let alias = self.alias.clone();
        expr.map_columns(&mut |table, name| {
            let on_root = table.as_deref().is_none_or(|t| t == alias);
            if on_root {
                if let Some(sql) = self.virtual_sql(&name) {
                    return Expr::raw(sql);
                }
            }
            match table {
                None if schema.has(&name) => Expr::qualified(alias.clone(), name),
                table => Expr::Column { table, name },
            }
        })
    }

    fn projection(&self, field: &str) -> Projection {
        let (expr, as_name) = split_as(field);
        if is_identifier(expr) {
            let (alias, name) = match expr.split_once('.') {
                Some((a, n)) => (a.to_string(), n.to_string()),
                None => (self.alias.clone(), expr.to_string()),
            };
            if alias == self.alias && self.virtual_sql(&name).is_some() {
                return Projection::Virtual(name);
            }
            return Projection::Column { alias, name };
        }
        Projection::Computed {
            sql: expr.to_string(),
            name: as_name.unwrap_or(expr).to_string(),
        }
    }

    /// Join for a root belongsTo/hasOne: `(join, table, columns, schema)`.
    ///
    /// `None` when the target lives on another datasource.
    fn single_join(
        &mut self,
        alias: &str,
        spec: &AssociationSpec,
    ) -> Result<Option<(Join, String, Vec<String>, EntitySchema)>> {
        let root = self.alias.clone();
        let root_pk = self.def.primary_key.clone();
        let datasource = self.def.datasource.clone();
        let foreign_key = spec.foreign_key_column(alias, &self.def.convention_table());

        let related = self.related_mut(alias)?;
        if related.def.datasource != datasource {
            return Ok(None);
        }
        let table = related.require_table()?;
        let schema = related.schema()?;
        let columns: Vec<String> = if spec.fields.is_empty() {
            schema.names().map(str::to_string).collect()
        } else {
            spec.fields.clone()
        };

        let key_match = foreign_key.map(|fk| match spec.kind {
            AssociationKind::BelongsTo => Expr::qualified(alias, related.primary_key())
                .eq(Expr::qualified(root.clone(), fk)),
            _ => Expr::qualified(alias, fk).eq(Expr::qualified(root.clone(), root_pk.clone())),
        });
        let on = Expr::all(key_match.into_iter().chain(spec.conditions.clone()));
        Ok(Some((Join::left(table.clone(), alias, on), table, columns, schema)))
    }

    fn compile(&mut self, select: &Select) -> Result<Compiled> {
        let table = self.require_table()?;
        let schema = self.schema()?;
        let mut query = SelectQuery::new(table.clone(), self.alias.clone());
        let mut tables = vec![table];
        let mut schemas = HashMap::new();
        let projections: Vec<Projection> = select.fields.iter().map(|f| self.projection(f)).collect();

        // Root columns.
        let root_projections: Vec<&Projection> = projections
            .iter()
            .filter(|p| match p {
                Projection::Column { alias, .. } => *alias == self.alias,
                _ => true,
            })
            .collect();
        if select.fields.is_empty() {
            for name in schema.names() {
                query = query.field(
                    Expr::qualified(self.alias.clone(), name),
                    Some(format!("{}__{}", self.alias, name)),
                );
            }
            for (name, _) in &self.def.virtual_fields {
                if let Some(sql) = self.virtual_sql(name) {
                    query = query.field(Expr::raw(sql), Some(format!("{}__{}", self.alias, name)));
                }
            }
        } else {
            let mut selected: Vec<String> = Vec::new();
            for projection in &root_projections {
                match projection {
                    Projection::Column { name, .. } => selected.push(name.clone()),
                    Projection::Virtual(name) => {
                        if let Some(sql) = self.virtual_sql(name) {
                            query = query
                                .field(Expr::raw(sql), Some(format!("{}__{}", self.alias, name)));
                        }
                    }
                    Projection::Computed { sql, name } => {
                        query = query.field(Expr::raw(sql.clone()), Some(name.clone()));
                    }
                }
            }
            if select.group.is_empty() {
                let mut keys = select.keys.clone();
                if select.budget >= 0 && !self.associations.is_empty() {
                    keys.push(self.def.primary_key.clone());
                    let owner = self.def.convention_table();
                    for (alias, spec) in self.associations.iter() {
                        if spec.kind == AssociationKind::BelongsTo {
                            keys.extend(spec.foreign_key_column(alias, &owner));
                        }
                    }
                }
                for key in keys {
                    if schema.has(&key) && !selected.contains(&key) {
                        selected.push(key);
                    }
                }
            }
            for name in &selected {
                query = query.field(
                    Expr::qualified(self.alias.clone(), name.clone()),
                    Some(format!("{}__{}", self.alias, name)),
                );
            }
        }
        schemas.insert(self.alias.clone(), schema.clone());

        // belongsTo / hasOne joins.
        let mut joined = Vec::new();
        if select.join_single {
            let singles: Vec<(String, AssociationSpec)> = self
                .associations
                .iter()
                .filter(|(_, spec)| spec.kind.is_single())
                .map(|(alias, spec)| (alias.to_string(), spec.clone()))
                .collect();
            for (alias, spec) in singles {
                let (join, table, columns, join_schema) = match self.single_join(&alias, &spec) {
                    Ok(Some(plan)) => plan,
                    Ok(None) => continue,
                    Err(error) => {
                        tracing::debug!(alias = %self.alias, association = %alias, error = %error, "not joining association");
                        continue;
                    }
                };
                let listed: Vec<String> = projections
                    .iter()
                    .filter_map(|p| match p {
                        Projection::Column { alias: a, name } if *a == alias => Some(name.clone()),
                        _ => None,
                    })
                    .collect();
                let columns = if listed.is_empty() { columns } else { listed };
                for column in &columns {
                    query = query.field(
                        Expr::qualified(alias.clone(), column.clone()),
                        Some(format!("{alias}__{column}")),
                    );
                }
                query = query.join(join);
                tables.push(table);
                schemas.insert(alias.clone(), join_schema);
                joined.push(alias);
            }
        }

        // HABTM join table.
        if let Some(jt) = &select.join_table {
            for column in &jt.columns {
                query = query.field(
                    Expr::qualified(jt.alias.clone(), column.clone()),
                    Some(format!("{}__{}", jt.alias, column)),
                );
            }
            query = query.join(Join::inner(jt.table.clone(), jt.alias.clone(), jt.on.clone()));
            tables.push(jt.table.clone());
        }

        for join in &select.joins {
            tables.push(join.table.clone());
            query = query.join(join.clone());
        }

        if let Some(conditions) = &select.conditions {
            query = query.filter(self.rewrite(conditions.clone(), &schema));
        }
        for group in &select.group {
            query = query.group_by(self.rewrite(Expr::field(group), &schema));
        }
        let order = if select.order.is_empty() {
            &self.def.order
        } else {
            &select.order
        };
        for spec in order {
            let mut term = OrderBy::parse(spec);
            term.expr = self.rewrite(term.expr, &schema);
            query = query.order_by(term);
        }
        if let Some(limit) = select.limit {
            query = query.limit(limit);
        }
        if let Some(offset) = select.offset {
            query = query.offset(offset);
        }

        let mut prefixes: HashSet<String> = joined.iter().cloned().collect();
        prefixes.insert(self.alias.clone());
        if let Some(jt) = &select.join_table {
            prefixes.insert(jt.alias.clone());
        }

        Ok(Compiled {
            query,
            tables,
            joined,
            prefixes,
            schemas,
        })
    }

    // ==================== Execution ====================

    pub(crate) fn execute_read(
        &self,
        conn: &dyn relmodel_core::Connection,
        sql: &str,
        params: &[Value],
        tables: &[String],
    ) -> Result<Vec<Row>> {
        if self.cache_queries {
            if let Some(rows) = self.catalog.query_cache().get(sql, params) {
                return Ok(rows);
            }
        }
        let rows = conn.query(sql, params)?;
        tracing::debug!(alias = %self.alias, sql = %sql, rows = rows.len(), "read");
        if self.cache_queries {
            self.catalog
                .query_cache()
                .insert(sql, params, tables.to_vec(), rows.clone());
        }
        Ok(rows)
    }

    fn split_row(&self, row: Row, compiled: &Compiled) -> Record {
        let mut root = Record::new();
        let mut others: Vec<(String, Record)> = Vec::new();
        for (column, value) in row.into_pairs() {
            let Some((alias, field)) = column
                .split_once("__")
                .filter(|(alias, _)| compiled.prefixes.contains(*alias))
            else {
                root.set(column, value);
                continue;
            };
            let value = match compiled.schemas.get(alias) {
                Some(schema) => schema.coerce_for_read(field, value),
                None => value,
            };
            if alias == self.alias {
                root.set(field, value);
                continue;
            }
            match others.iter_mut().find(|(a, _)| a == alias) {
                Some((_, record)) => record.set(field, value),
                None => others.push((alias.to_string(), Record::new().with(field, value))),
            }
        }
        for (alias, record) in others {
            root.set_related(alias, Related::One(record));
        }
        root
    }

    /// Compile, execute and merge associations within `select.budget`.
    fn fetch_records(&mut self, select: Select) -> Result<Vec<Record>> {
        let compiled = self.compile(&select)?;
        let conn = self.connection()?;
        let (sql, params) = compiled.query.build(conn.dialect());
        let rows = self.execute_read(conn.as_ref(), &sql, &params, &compiled.tables)?;
        let mut records: Vec<Record> = rows
            .into_iter()
            .map(|row| self.split_row(row, &compiled))
            .collect();
        self.attach_associations(&mut records, select.budget, &compiled.joined);
        Ok(records)
    }

    // ==================== Association merging ====================

    /// Record with every column of the association's target set to null.
    fn placeholder(&self, spec: &AssociationSpec) -> Record {
        if !spec.fields.is_empty() {
            return Record::placeholder(spec.fields.iter().map(String::as_str));
        }
        match self.schema() {
            Ok(schema) => Record::placeholder(schema.names()),
            Err(_) => Record::new(),
        }
    }

    fn empty_related(&mut self, alias: &str, spec: &AssociationSpec) -> Related {
        if !spec.kind.is_single() {
            return Related::Many(Vec::new());
        }
        match self.related_mut(alias) {
            Ok(related) => Related::One(related.placeholder(spec)),
            Err(_) => Related::One(Record::placeholder(spec.fields.iter().map(String::as_str))),
        }
    }

    fn attach_associations(&mut self, records: &mut [Record], budget: i32, joined: &[String]) {
        if records.is_empty() || budget < 0 {
            return;
        }
        let associations: Vec<(String, AssociationSpec)> = self
            .associations
            .iter()
            .map(|(alias, spec)| (alias.to_string(), spec.clone()))
            .collect();

        for (alias, spec) in associations {
            let wanted = if spec.kind.is_single() { budget >= 0 } else { budget >= 1 };
            if !wanted {
                continue;
            }
            let result = if joined.contains(&alias) {
                self.descend_joined(&alias, records, budget - 1)
            } else {
                self.fetch_association(&alias, &spec, records, budget - 1)
            };
            if let Err(error) = result {
                tracing::warn!(
                    alias = %self.alias,
                    association = %alias,
                    error = %error,
                    "association fetch failed"
                );
                self.behaviors.on_error(&error);
                let empty = self.empty_related(&alias, &spec);
                for record in records.iter_mut() {
                    record.set_related(alias.clone(), empty.clone());
                }
            }
        }
    }

    /// Merge the associations of records that arrived through a join.
    fn descend_joined(&mut self, alias: &str, records: &mut [Record], budget: i32) -> Result<()> {
        if budget < 0 {
            return Ok(());
        }
        let mut children: Vec<Record> = records
            .iter_mut()
            .map(|record| match record.take_related(alias) {
                Some(Related::One(child)) => child,
                _ => Record::new(),
            })
            .collect();
        let result = self
            .related_mut(alias)
            .map(|related| related.attach_associations(&mut children, budget, &[]));
        for (record, child) in records.iter_mut().zip(children) {
            record.set_related(alias, Related::One(child));
        }
        result
    }

    fn fetch_association(
        &mut self,
        alias: &str,
        spec: &AssociationSpec,
        records: &mut [Record],
        budget: i32,
    ) -> Result<()> {
        match spec.kind {
            AssociationKind::BelongsTo => self.fetch_belongs_to(alias, spec, records, budget),
            AssociationKind::HasOne | AssociationKind::HasMany => {
                self.fetch_has(alias, spec, records, budget)
            }
            AssociationKind::HasAndBelongsToMany => self.fetch_habtm(alias, spec, records, budget),
        }
    }

    fn fetch_belongs_to(
        &mut self,
        alias: &str,
        spec: &AssociationSpec,
        records: &mut [Record],
        budget: i32,
    ) -> Result<()> {
        let foreign_key = spec.foreign_key_column(alias, &self.def.convention_table());
        let related = self.related_mut(alias)?;
        let blank = related.placeholder(spec);
        let target_pk = related.def.primary_key.clone();

        let Some(foreign_key) = foreign_key else {
            let mut select = Select::association(spec, budget);
            select.limit = Some(1);
            let one = related.fetch_records(select)?.into_iter().next();
            for record in records.iter_mut() {
                record.set_related(alias, Related::One(one.clone().unwrap_or_else(|| blank.clone())));
            }
            return Ok(());
        };

        let keys = distinct_keys(records.iter().map(|r| r.get(&foreign_key)));
        let rows = if keys.is_empty() {
            Vec::new()
        } else {
            let select = Select::association(spec, budget)
                .filter(Expr::qualified(alias, target_pk.clone()).in_list(keys))
                .key(target_pk.clone());
            related.fetch_records(select)?
        };
        let by_key: HashMap<String, Record> = rows
            .into_iter()
            .filter_map(|row| key_of(row.get(&target_pk)).map(|k| (k, row)))
            .collect();
        for record in records.iter_mut() {
            let found = key_of(record.get(&foreign_key)).and_then(|k| by_key.get(&k).cloned());
            record.set_related(alias, Related::One(found.unwrap_or_else(|| blank.clone())));
        }
        Ok(())
    }

    fn fetch_has(
        &mut self,
        alias: &str,
        spec: &AssociationSpec,
        records: &mut [Record],
        budget: i32,
    ) -> Result<()> {
        let single = spec.kind == AssociationKind::HasOne;
        let per_parent = !single && (spec.limit.is_some() || spec.offset.is_some());
        let foreign_key = spec.foreign_key_column(alias, &self.def.convention_table());
        let root_pk = self.def.primary_key.clone();

        let related = self.related_mut(alias)?;
        let blank = related.placeholder(spec);
        let wrap = |rows: Vec<Record>| {
            if single {
                Related::One(rows.into_iter().next().unwrap_or_else(|| blank.clone()))
            } else {
                Related::Many(rows)
            }
        };
        let paged = |mut select: Select| {
            if !single {
                select.limit = spec.limit;
                select.offset = spec.offset;
            }
            select
        };

        let Some(foreign_key) = foreign_key else {
            let rows = related.fetch_records(paged(Select::association(spec, budget)))?;
            for record in records.iter_mut() {
                record.set_related(alias, wrap(rows.clone()));
            }
            return Ok(());
        };

        if per_parent {
            for record in records.iter_mut() {
                let rows = match record.get(&root_pk).filter(|v| !v.is_empty()).cloned() {
                    Some(id) => related.fetch_records(paged(
                        Select::association(spec, budget)
                            .filter(Expr::qualified(alias, foreign_key.clone()).eq(id)),
                    ))?,
                    None => Vec::new(),
                };
                record.set_related(alias, wrap(rows));
            }
            return Ok(());
        }

        let keys = distinct_keys(records.iter().map(|r| r.get(&root_pk)));
        let rows = if keys.is_empty() {
            Vec::new()
        } else {
            let select = Select::association(spec, budget)
                .filter(Expr::qualified(alias, foreign_key.clone()).in_list(keys))
                .key(foreign_key.clone());
            related.fetch_records(select)?
        };
        let mut by_parent: HashMap<String, Vec<Record>> = HashMap::new();
        for row in rows {
            if let Some(key) = key_of(row.get(&foreign_key)) {
                by_parent.entry(key).or_default().push(row);
            }
        }
        for record in records.iter_mut() {
            let rows = key_of(record.get(&root_pk))
                .and_then(|k| by_parent.get(&k).cloned())
                .unwrap_or_default();
            record.set_related(alias, wrap(rows));
        }
        Ok(())
    }

    /// Join-table details of a HABTM association:
    /// `(join table, with alias, foreign key, association foreign key)`.
    pub(crate) fn habtm_layout(
        &mut self,
        alias: &str,
        spec: &AssociationSpec,
    ) -> Result<(String, String, String, String)> {
        let owner = self.def.convention_table();
        let prefix = self.catalog.prefix(&self.def);
        let foreign_key = spec.foreign_key_column(alias, &owner).ok_or_else(|| {
            Error::Custom(format!(
                "HABTM association '{alias}' on '{}' needs a foreign key",
                self.alias
            ))
        })?;
        let target_table = self.related_mut(alias)?.def.convention_table();
        let join_table = spec.join_table_name(&owner, &target_table);
        Ok((
            format!("{prefix}{join_table}"),
            spec.with_alias(&join_table),
            foreign_key,
            spec.association_foreign_key_column(&target_table),
        ))
    }

    fn fetch_habtm(
        &mut self,
        alias: &str,
        spec: &AssociationSpec,
        records: &mut [Record],
        budget: i32,
    ) -> Result<()> {
        let (join_table, with, foreign_key, association_key) = self.habtm_layout(alias, spec)?;
        let root_pk = self.def.primary_key.clone();
        let catalog = self.catalog.clone();
        let datasource = self.def.datasource.clone();
        let join_schema = catalog.table_schema(&datasource, &join_table)?;

        let related = self.related_mut(alias)?;
        let target_pk = related.def.primary_key.clone();
        let base = |filter: Expr| {
            let mut select = Select::association(spec, budget)
                .filter(filter)
                .key(target_pk.clone());
            select.join_table = Some(JoinTable {
                alias: with.clone(),
                table: join_table.clone(),
                on: Expr::qualified(with.clone(), association_key.clone())
                    .eq(Expr::qualified(alias, target_pk.clone())),
                columns: join_schema.names().map(str::to_string).collect(),
            });
            select
        };
        let parent_of = |row: &Record| {
            row.related(&with)
                .and_then(Related::as_one)
                .and_then(|j| key_of(j.get(&foreign_key)))
        };

        if spec.limit.is_some() || spec.offset.is_some() {
            for record in records.iter_mut() {
                let rows = match record.get(&root_pk).filter(|v| !v.is_empty()).cloned() {
                    Some(id) => {
                        let mut select =
                            base(Expr::qualified(with.clone(), foreign_key.clone()).eq(id));
                        select.limit = spec.limit;
                        select.offset = spec.offset;
                        related.fetch_records(select)?
                    }
                    None => Vec::new(),
                };
                record.set_related(alias, Related::Many(rows));
            }
            return Ok(());
        }

        let keys = distinct_keys(records.iter().map(|r| r.get(&root_pk)));
        let rows = if keys.is_empty() {
            Vec::new()
        } else {
            related.fetch_records(base(
                Expr::qualified(with.clone(), foreign_key.clone()).in_list(keys),
            ))?
        };
        let mut by_parent: HashMap<String, Vec<Record>> = HashMap::new();
        for row in rows {
            if let Some(key) = parent_of(&row) {
                by_parent.entry(key).or_default().push(row);
            }
        }
        for record in records.iter_mut() {
            let rows = key_of(record.get(&root_pk))
                .and_then(|k| by_parent.get(&k).cloned())
                .unwrap_or_default();
            record.set_related(alias, Related::Many(rows));
        }
        Ok(())
    }
}

// ==================== Threading ====================

fn thread(alias: &str, primary_key: &str, trees: Vec<Tree>) -> Vec<ThreadNode> {
    let field = |tree: &Tree, name: &str| key_of(tree.record(alias).and_then(|r| r.get(name)));
    let keys: Vec<Option<String>> = trees.iter().map(|t| field(t, primary_key)).collect();
    let parents: Vec<Option<String>> = trees.iter().map(|t| field(t, "parent_id")).collect();
    let known: HashSet<&str> = keys.iter().flatten().map(String::as_str).collect();

    let mut roots = Vec::new();
    let mut children: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, parent) in parents.iter().enumerate() {
        match parent {
            Some(p) if known.contains(p.as_str()) && keys[i].as_ref() != Some(p) => {
                children.entry(p.as_str()).or_default().push(i);
            }
            _ => roots.push(i),
        }
    }

    // Explicit stack of (row, next child position, node) so deep chains
    // cannot exhaust the call stack.
    let mut slots: Vec<Option<Tree>> = trees.into_iter().map(Some).collect();
    let mut forest = Vec::new();
    for root in roots {
        let Some(tree) = slots[root].take() else {
            continue;
        };
        let mut stack = vec![(root, 0, ThreadNode { tree, children: Vec::new() })];
        while let Some((i, next, _)) = stack.last_mut() {
            let list = keys[*i]
                .as_deref()
                .and_then(|k| children.get(k))
                .map_or(&[][..], Vec::as_slice);
            if let Some(&child) = list.get(*next) {
                *next += 1;
                if let Some(tree) = slots[child].take() {
                    stack.push((child, 0, ThreadNode { tree, children: Vec::new() }));
                }
                continue;
            }
            let Some((_, _, done)) = stack.pop() else {
                break;
            };
            match stack.last_mut() {
                Some((_, _, parent)) => parent.children.push(done),
                None => forest.push(done),
            }
        }
    }
    forest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64, parent: Option<i64>) -> Tree {
        Tree::single(
            "Category",
            Record::new().with("id", id).with("parent_id", parent),
        )
    }

    #[test]
    fn test_split_as() {
        assert_eq!(split_as("COUNT(*) AS total"), ("COUNT(*)", Some("total")));
        assert_eq!(split_as("Post.title"), ("Post.title", None));
        assert_eq!(split_as("MAX(id) as top"), ("MAX(id)", Some("top")));
    }

    #[test]
    fn test_page_overrides_offset() {
        let options = FindOptions::new().limit(10).page(3).offset(1);
        assert_eq!(options.effective_offset(), Some(20));
        assert_eq!(FindOptions::new().offset(5).effective_offset(), Some(5));
    }

    #[test]
    fn test_conditions_accumulate() {
        let options = FindOptions::new()
            .conditions(Expr::field_is("Post.a", 1))
            .conditions(Expr::field_is("Post.b", 2));
        assert_eq!(
            options.conditions,
            Some(Expr::field_is("Post.a", 1).and(Expr::field_is("Post.b", 2)))
        );
    }

    #[test]
    fn test_thread_builds_forest_in_row_order() {
        let trees = vec![
            node(1, None),
            node(2, Some(1)),
            node(3, Some(1)),
            node(4, Some(2)),
            node(5, Some(99)),
        ];
        let forest = thread("Category", "id", trees);
        assert_eq!(forest.len(), 2);
        let first = &forest[0];
        assert_eq!(first.tree.value("Category.id"), Some(&Value::Int(1)));
        assert_eq!(first.children.len(), 2);
        assert_eq!(first.children[0].children.len(), 1);
        assert_eq!(forest[1].tree.value("Category.id"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_thread_ignores_unreachable_cycles() {
        let trees = vec![node(1, Some(2)), node(2, Some(1)), node(3, None)];
        let forest = thread("Category", "id", trees);
        assert_eq!(forest.len(), 1);
        assert!(forest[0].children.is_empty());
    }

    #[test]
    fn test_thread_handles_deep_chains() {
        let depth = 2_000;
        let trees = (1..=depth)
            .rev()
            .map(|id| node(id, (id > 1).then(|| id - 1)))
            .collect();
        let forest = thread("Category", "id", trees);
        assert_eq!(forest.len(), 1);

        let mut levels = 1;
        let mut cursor = &forest[0];
        while let Some(child) = cursor.children.first() {
            assert_eq!(cursor.children.len(), 1);
            cursor = child;
            levels += 1;
        }
        assert_eq!(levels, depth);
        assert_eq!(cursor.tree.value("Category.id"), Some(&Value::Int(depth)));
    }

    #[test]
    fn test_thread_node_serializes_children() {
        let forest = thread("Category", "id", vec![node(1, None), node(2, Some(1))]);
        let json = serde_json::to_value(&forest).expect("serialize");
        assert_eq!(json[0]["Category"]["id"], 1);
        assert_eq!(json[0]["children"][0]["Category"]["id"], 2);
    }

    #[test]
    fn test_list_lookup() {
        let list = ListResult::Flat(vec![(Value::Int(1), Value::from("a"))]);
        assert_eq!(list.get(&Value::from("1")), Some(&Value::from("a")));
        assert_eq!(list.len(), 1);
    }
}
