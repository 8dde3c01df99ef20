//! Association declarations and the per-model association registry.
//!
//! An [`AssociationSpec`] is plain data: it names the target entity by class
//! name and carries the per-association overrides. Targets are looked up in
//! the [`Catalog`](crate::Catalog) when a query or save needs them, so
//! rebinding an alias only swaps data.

use std::fmt;

use relmodel_query::Expr;

use crate::inflect;

/// The four association kinds, in the order they are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AssociationKind {
    /// This entity holds the foreign key to one target row.
    BelongsTo,
    /// One target row holds a foreign key back to this entity.
    HasOne,
    /// Many target rows hold a foreign key back to this entity.
    HasMany,
    /// Rows are linked through a join table.
    HasAndBelongsToMany,
}

impl AssociationKind {
    /// All kinds in processing order.
    pub const ALL: [AssociationKind; 4] = [
        AssociationKind::BelongsTo,
        AssociationKind::HasOne,
        AssociationKind::HasMany,
        AssociationKind::HasAndBelongsToMany,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            AssociationKind::BelongsTo => "belongsTo",
            AssociationKind::HasOne => "hasOne",
            AssociationKind::HasMany => "hasMany",
            AssociationKind::HasAndBelongsToMany => "hasAndBelongsToMany",
        }
    }

    /// belongsTo and hasOne yield one record per parent.
    pub const fn is_single(self) -> bool {
        matches!(self, AssociationKind::BelongsTo | AssociationKind::HasOne)
    }
}

impl fmt::Display for AssociationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Foreign key setting of an association.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ForeignKey {
    /// Derived from naming conventions.
    #[default]
    Conventional,
    /// An explicit column.
    Column(String),
    /// Key matching disabled: rows are related through `conditions` only.
    Disabled,
}

/// Counter column maintained on the parent of a belongsTo association.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterCache {
    /// Counter column on the parent; `None` means `<child alias>_count`.
    pub column: Option<String>,
    /// Extra condition a child row must satisfy to be counted.
    pub scope: Option<Expr>,
}

/// Declaration of one association.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationSpec {
    /// Association kind.
    pub kind: AssociationKind,

    /// Target entity name; `None` means the alias names the entity.
    pub class_name: Option<String>,

    /// Foreign key column (see [`ForeignKey`]).
    pub foreign_key: ForeignKey,

    /// HABTM join table; conventionally the sorted plural table names.
    pub join_table: Option<String>,

    /// HABTM alias under which join-table columns appear in results.
    pub with: Option<String>,

    /// HABTM join-table column pointing at the target.
    pub association_foreign_key: Option<String>,

    /// Extra condition applied when fetching the target.
    pub conditions: Option<Expr>,

    /// Target columns to fetch; empty means all.
    pub fields: Vec<String>,

    /// Order of fetched targets, e.g. `"Comment.created DESC"`.
    pub order: Vec<String>,

    /// Per-parent limit on hasMany / HABTM rows.
    pub limit: Option<u64>,

    /// Per-parent offset on hasMany / HABTM rows.
    pub offset: Option<u64>,

    /// Delete targets when the owner is deleted (hasOne / hasMany).
    pub dependent: bool,

    /// Cascade with one bulk delete by foreign key, skipping target callbacks.
    pub exclusive: bool,

    /// belongsTo counter cache on the parent.
    pub counter_cache: Option<CounterCache>,

    /// HABTM: replace the join rows on save (true) or only add missing rows.
    pub unique: bool,
}

impl AssociationSpec {
    pub fn new(kind: AssociationKind) -> Self {
        Self {
            kind,
            class_name: None,
            foreign_key: ForeignKey::Conventional,
            join_table: None,
            with: None,
            association_foreign_key: None,
            conditions: None,
            fields: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            dependent: false,
            exclusive: false,
            counter_cache: None,
            unique: true,
        }
    }

    pub fn belongs_to() -> Self {
        Self::new(AssociationKind::BelongsTo)
    }

    pub fn has_one() -> Self {
        Self::new(AssociationKind::HasOne)
    }

    pub fn has_many() -> Self {
        Self::new(AssociationKind::HasMany)
    }

    pub fn has_and_belongs_to_many() -> Self {
        Self::new(AssociationKind::HasAndBelongsToMany)
    }

    pub fn class_name(mut self, name: impl Into<String>) -> Self {
        self.class_name = Some(name.into());
        self
    }

    pub fn foreign_key(mut self, column: impl Into<String>) -> Self {
        self.foreign_key = ForeignKey::Column(column.into());
        self
    }

    /// Relate rows through `conditions` only.
    pub fn without_foreign_key(mut self) -> Self {
        self.foreign_key = ForeignKey::Disabled;
        self
    }

    pub fn join_table(mut self, table: impl Into<String>) -> Self {
        self.join_table = Some(table.into());
        self
    }

    pub fn with(mut self, alias: impl Into<String>) -> Self {
        self.with = Some(alias.into());
        self
    }

    pub fn association_foreign_key(mut self, column: impl Into<String>) -> Self {
        self.association_foreign_key = Some(column.into());
        self
    }

    pub fn conditions(mut self, conditions: Expr) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
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

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn dependent(mut self, dependent: bool) -> Self {
        self.dependent = dependent;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Maintain `<child alias>_count` on the parent.
    pub fn counter_cache(mut self) -> Self {
        self.counter_cache.get_or_insert_with(CounterCache::default);
        self
    }

    /// Maintain a named counter column on the parent.
    pub fn counter_cache_column(mut self, column: impl Into<String>) -> Self {
        self.counter_cache
            .get_or_insert_with(CounterCache::default)
            .column = Some(column.into());
        self
    }

    /// Count only children matching `scope`.
    pub fn counter_scope(mut self, scope: Expr) -> Self {
        self.counter_cache
            .get_or_insert_with(CounterCache::default)
            .scope = Some(scope);
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Target entity name for an association declared under `alias`.
    pub fn target_name<'a>(&'a self, alias: &'a str) -> &'a str {
        self.class_name.as_deref().unwrap_or(alias)
    }

    /// Resolved foreign key column.
    ///
    /// `owner_table` is the declaring entity's table; belongsTo keys derive
    /// from the alias instead.
    pub fn foreign_key_column(&self, alias: &str, owner_table: &str) -> Option<String> {
        match &self.foreign_key {
            ForeignKey::Column(c) => Some(c.clone()),
            ForeignKey::Disabled => None,
            ForeignKey::Conventional => Some(match self.kind {
                AssociationKind::BelongsTo => format!("{}_id", inflect::underscore(alias)),
                _ => format!("{}_id", inflect::singularize(owner_table)),
            }),
        }
    }

    /// Resolved HABTM join table.
    pub fn join_table_name(&self, owner_table: &str, target_table: &str) -> String {
        if let Some(table) = &self.join_table {
            return table.clone();
        }
        let mut tables = [owner_table, target_table];
        tables.sort_unstable();
        format!("{}_{}", tables[0], tables[1])
    }

    /// Resolved HABTM join-table column pointing at the target.
    pub fn association_foreign_key_column(&self, target_table: &str) -> String {
        self.association_foreign_key
            .clone()
            .unwrap_or_else(|| format!("{}_id", inflect::singularize(target_table)))
    }

    /// Alias of the join-table columns in HABTM results.
    pub fn with_alias(&self, join_table: &str) -> String {
        self.with
            .clone()
            .unwrap_or_else(|| inflect::classify(join_table))
    }

    /// Counter column for a belongsTo declared on the entity aliased
    /// `child_alias`.
    pub fn counter_column(&self, child_alias: &str) -> Option<String> {
        let cache = self.counter_cache.as_ref()?;
        Some(
            cache
                .column
                .clone()
                .unwrap_or_else(|| format!("{}_count", inflect::underscore(child_alias))),
        )
    }
}

type Bindings = Vec<(String, AssociationSpec)>;

/// Associations of one model instance.
///
/// Holds the declared set, the current (possibly rebound) set and, while a
/// transient change is pending, a snapshot to restore once the next
/// operation completes.
#[derive(Debug, Clone, Default)]
pub struct AssociationRegistry {
    declared: Bindings,
    current: Bindings,
    snapshot: Option<Bindings>,
}

impl AssociationRegistry {
    /// Registry over the declared associations.
    pub fn new(declared: Vec<(String, AssociationSpec)>) -> Self {
        Self {
            current: declared.clone(),
            declared,
            snapshot: None,
        }
    }

    fn snapshot_if(&mut self, permanent: bool) {
        if !permanent && self.snapshot.is_none() {
            self.snapshot = Some(self.current.clone());
        }
    }

    /// Bind `spec` under `alias`, replacing any association with that alias.
    ///
    /// Returns the replaced spec.
    pub fn bind(
        &mut self,
        alias: impl Into<String>,
        spec: AssociationSpec,
        permanent: bool,
    ) -> Option<AssociationSpec> {
        let alias = alias.into();
        self.snapshot_if(permanent);
        tracing::debug!(alias = %alias, kind = %spec.kind, permanent, "binding association");
        match self.current.iter_mut().find(|(a, _)| *a == alias) {
            Some((_, existing)) => Some(std::mem::replace(existing, spec)),
            None => {
                self.current.push((alias, spec));
                None
            }
        }
    }

    /// Remove the `kind` association bound under `alias`.
    pub fn unbind(&mut self, kind: AssociationKind, alias: &str, permanent: bool) -> bool {
        let Some(pos) = self
            .current
            .iter()
            .position(|(a, spec)| a == alias && spec.kind == kind)
        else {
            return false;
        };
        self.snapshot_if(permanent);
        tracing::debug!(alias = alias, kind = %kind, permanent, "unbinding association");
        self.current.remove(pos);
        true
    }

    /// Restore the declared associations, discarding every runtime change.
    pub fn reset(&mut self) {
        self.current = self.declared.clone();
        self.snapshot = None;
    }

    /// Undo transient changes; called after each find, save and delete.
    pub fn restore_transient(&mut self) -> bool {
        match self.snapshot.take() {
            Some(snapshot) => {
                tracing::trace!("restoring associations after transient change");
                self.current = snapshot;
                true
            }
            None => false,
        }
    }

    /// Whether a transient change is waiting to be undone.
    pub fn has_transient(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn get(&self, alias: &str) -> Option<&AssociationSpec> {
        self.current
            .iter()
            .find(|(a, _)| a == alias)
            .map(|(_, spec)| spec)
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.get(alias).is_some()
    }

    /// Aliases bound with `kind`, in binding order.
    pub fn get_associated(&self, kind: AssociationKind) -> Vec<String> {
        self.current
            .iter()
            .filter(|(_, spec)| spec.kind == kind)
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    /// Every current association in processing order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AssociationSpec)> {
        AssociationKind::ALL.into_iter().flat_map(move |kind| {
            self.current
                .iter()
                .filter(move |(_, spec)| spec.kind == kind)
                .map(|(alias, spec)| (alias.as_str(), spec))
        })
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AssociationRegistry {
        AssociationRegistry::new(vec![
            ("Comment".into(), AssociationSpec::has_many()),
            ("User".into(), AssociationSpec::belongs_to()),
            ("Tag".into(), AssociationSpec::has_and_belongs_to_many()),
        ])
    }

    #[test]
    fn test_conventional_keys() {
        let bt = AssociationSpec::belongs_to();
        assert_eq!(bt.foreign_key_column("Author", "posts").as_deref(), Some("author_id"));
        assert_eq!(
            bt.foreign_key_column("ParentCategory", "categories").as_deref(),
            Some("parent_category_id")
        );
        let hm = AssociationSpec::has_many();
        assert_eq!(hm.foreign_key_column("Comment", "articles").as_deref(), Some("article_id"));
        assert_eq!(
            AssociationSpec::has_many()
                .without_foreign_key()
                .foreign_key_column("Comment", "articles"),
            None
        );

        let habtm = AssociationSpec::has_and_belongs_to_many();
        assert_eq!(habtm.join_table_name("tags", "articles"), "articles_tags");
        assert_eq!(habtm.association_foreign_key_column("tags"), "tag_id");
        assert_eq!(habtm.with_alias("articles_tags"), "ArticlesTag");
    }

    #[test]
    fn test_counter_column_default() {
        let spec = AssociationSpec::belongs_to().counter_cache();
        assert_eq!(spec.counter_column("Comment").as_deref(), Some("comment_count"));
        let named = AssociationSpec::belongs_to().counter_cache_column("replies");
        assert_eq!(named.counter_column("Comment").as_deref(), Some("replies"));
        assert_eq!(AssociationSpec::belongs_to().counter_column("Comment"), None);
    }

    #[test]
    fn test_iteration_follows_kind_order() {
        let reg = registry();
        let aliases: Vec<&str> = reg.iter().map(|(a, _)| a).collect();
        assert_eq!(aliases, vec!["User", "Comment", "Tag"]);
    }

    #[test]
    fn test_transient_unbind_restores() {
        let mut reg = registry();
        assert!(reg.unbind(AssociationKind::HasMany, "Comment", false));
        assert!(!reg.contains("Comment"));
        assert!(reg.has_transient());
        assert!(reg.restore_transient());
        assert!(reg.contains("Comment"));
        assert!(!reg.restore_transient());
    }

    #[test]
    fn test_unbind_requires_matching_kind() {
        let mut reg = registry();
        assert!(!reg.unbind(AssociationKind::HasOne, "Comment", false));
        assert!(!reg.has_transient());
    }

    #[test]
    fn test_permanent_changes_survive_until_reset() {
        let mut reg = registry();
        reg.unbind(AssociationKind::BelongsTo, "User", true);
        reg.bind("Author", AssociationSpec::belongs_to().class_name("User"), true);
        assert!(!reg.restore_transient());
        assert_eq!(reg.get_associated(AssociationKind::BelongsTo), vec!["Author"]);
        reg.reset();
        assert_eq!(reg.get_associated(AssociationKind::BelongsTo), vec!["User"]);
    }

    #[test]
    fn test_rebind_replaces_spec() {
        let mut reg = registry();
        let old = reg.bind(
            "Comment",
            AssociationSpec::has_many().class_name("Reply").limit(2),
            false,
        );
        assert_eq!(old.map(|s| s.class_name), Some(None));
        assert_eq!(reg.get("Comment").map(|s| s.target_name("Comment")), Some("Reply"));
        reg.restore_transient();
        assert_eq!(reg.get("Comment").map(|s| s.target_name("Comment")), Some("Comment"));
    }
}
