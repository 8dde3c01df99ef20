//! Deletes and bulk updates.

use std::collections::HashSet;

use relmodel_core::{Result, Value};
use relmodel_query::{DeleteQuery, Expr, UpdateQuery};

use crate::association::AssociationKind;
use crate::find::{Callbacks, FindOptions};
use crate::model::Model;
use crate::tree::Record;

impl Model {
    /// Delete the record `id` (or the current record).
    ///
    /// With `cascade`, dependent hasOne/hasMany children go first: one bulk
    /// DELETE for `exclusive` associations, otherwise one delete per child
    /// so their own hooks and cascades run. Join rows of hasAndBelongsToMany
    /// associations are always removed. Returns `Ok(false)` when no such
    /// record exists or a behavior vetoes.
    #[tracing::instrument(level = "debug", skip(self), fields(alias = %self.alias))]
    pub fn delete(&mut self, id: Option<Value>, cascade: bool) -> Result<bool> {
        if let Some(id) = id.filter(|v| !v.is_empty()) {
            self.id = Some(id);
        }
        let result = self.atomically(|m| m.delete_record(cascade, true), |ok| *ok);
        self.finish(result)
    }

    fn delete_record(&mut self, cascade: bool, callbacks: bool) -> Result<bool> {
        let Some(id) = self.id().cloned() else {
            return Ok(false);
        };
        let table = self.require_table()?;
        if !self.exists()? {
            return Ok(false);
        }
        if callbacks {
            if let Err(behavior) = self.behaviors.before_delete(&id, cascade) {
                tracing::debug!(alias = %self.alias, behavior = %behavior, "before_delete vetoed delete");
                return Ok(false);
            }
        }

        let counters = self.counter_targets(&id)?;
        if cascade {
            self.delete_dependents(&id)?;
        }
        self.delete_links(&id)?;

        let conn = self.connection()?;
        let (sql, params) = DeleteQuery::new(table.clone())
            .filter(Expr::col(self.def.primary_key.clone()).eq(id.clone()))
            .build(conn.dialect());
        let affected = conn.execute(&sql, &params)?;
        tracing::debug!(alias = %self.alias, table = %table, id = %id, affected, "deleted");

        self.refresh_counters(counters)?;
        self.catalog.invalidate(&table);
        if callbacks {
            self.behaviors.after_delete(&id);
        }
        self.id = None;
        self.data = Record::new();
        Ok(true)
    }

    fn delete_dependents(&mut self, id: &Value) -> Result<()> {
        let owner = self.def.convention_table();
        for kind in [AssociationKind::HasOne, AssociationKind::HasMany] {
            for alias in self.get_associated(kind) {
                let Some(spec) = self.associations.get(&alias).cloned() else {
                    continue;
                };
                if !spec.dependent {
                    continue;
                }
                let Some(fk) = spec.foreign_key_column(&alias, &owner) else {
                    continue;
                };
                let related = self.related_mut(&alias)?;
                let mut conditions = Expr::qualified(alias.clone(), fk).eq(id.clone());
                if let Some(extra) = spec.conditions.clone() {
                    let schema = related.schema()?;
                    conditions = conditions.and(related.rewrite(extra, &schema));
                }
                if spec.exclusive {
                    related.delete_matching(conditions)?;
                } else {
                    for child in related.matching_ids(Some(conditions))? {
                        related.id = Some(child);
                        related.delete_record(true, true)?;
                    }
                }
                tracing::debug!(alias = %self.alias, association = %alias, exclusive = spec.exclusive, "deleted dependents");
            }
        }
        Ok(())
    }

    /// Remove join rows of every hasAndBelongsToMany association of `id`.
    fn delete_links(&mut self, id: &Value) -> Result<()> {
        for alias in self.get_associated(AssociationKind::HasAndBelongsToMany) {
            let Some(spec) = self.associations.get(&alias).cloned() else {
                continue;
            };
            let (join_table, _, foreign_key, _) = self.habtm_layout(&alias, &spec)?;
            let conn = self.connection()?;
            let (sql, params) = DeleteQuery::new(join_table.clone())
                .filter(Expr::col(foreign_key).eq(id.clone()))
                .build(conn.dialect());
            conn.execute(&sql, &params)?;
            self.catalog.invalidate(&join_table);
        }
        Ok(())
    }

    /// Primary keys of rows matching `conditions`, which may reference
    /// belongsTo and hasOne aliases.
    fn matching_ids(&mut self, conditions: Option<Expr>) -> Result<Vec<Value>> {
        let pk = self.def.primary_key.clone();
        let mut options = FindOptions::new()
            .field(format!("{}.{}", self.alias, pk))
            .recursive(0)
            .callbacks(Callbacks::None);
        if let Some(conditions) = conditions {
            options = options.conditions(conditions);
        }
        let mut seen = HashSet::new();
        Ok(self
            .find_trees(&options)?
            .iter()
            .filter_map(|tree| tree.record(&self.alias).and_then(|r| r.get(&pk)).cloned())
            .filter(|id| seen.insert(id.to_key_string()))
            .collect())
    }

    /// One DELETE for every row matching `conditions`; no hooks, no cascade.
    fn delete_matching(&mut self, conditions: Expr) -> Result<u64> {
        let ids = self.matching_ids(Some(conditions))?;
        if ids.is_empty() {
            return Ok(0);
        }
        let table = self.require_table()?;
        let conn = self.connection()?;
        let (sql, params) = DeleteQuery::new(table.clone())
            .filter(Expr::col(self.def.primary_key.clone()).in_list(ids))
            .build(conn.dialect());
        let affected = conn.execute(&sql, &params)?;
        self.catalog.invalidate(&table);
        tracing::debug!(alias = %self.alias, table = %table, affected, "bulk deleted");
        Ok(affected)
    }

    /// Delete every row matching `conditions`.
    ///
    /// Without `cascade` and `callbacks` this is one DELETE; otherwise each
    /// row goes through [`Model::delete`]'s pipeline and the result is
    /// `false` if any of them was not deleted. Rows that were deleted stay
    /// deleted in that case; a refused row does not roll the batch back.
    #[tracing::instrument(level = "debug", skip(self, conditions), fields(alias = %self.alias))]
    pub fn delete_all(&mut self, conditions: Option<Expr>, cascade: bool, callbacks: bool) -> Result<bool> {
        let result = self.atomically(
            |m| {
                if !cascade && !callbacks {
                    let conditions = conditions.unwrap_or_else(|| Expr::raw("1 = 1"));
                    return m.delete_matching(conditions).map(|_| true);
                }
                let mut all = true;
                for id in m.matching_ids(conditions)? {
                    m.id = Some(id);
                    all &= m.delete_record(cascade, callbacks)?;
                }
                Ok(all)
            },
            |_| true,
        );
        self.finish(result)
    }

    /// Set `fields` on every row matching `conditions` without hooks or
    /// validation. Values are expressions, so `views + 1` style updates
    /// work. Returns the number of rows changed.
    #[tracing::instrument(level = "debug", skip(self, fields, conditions), fields(alias = %self.alias))]
    pub fn update_all(&mut self, fields: Vec<(String, Expr)>, conditions: Option<Expr>) -> Result<u64> {
        let result = self.update_matching(fields, conditions);
        self.finish(result)
    }

    fn update_matching(&mut self, fields: Vec<(String, Expr)>, conditions: Option<Expr>) -> Result<u64> {
        let table = self.require_table()?;
        let schema = self.schema()?;
        let ids = self.matching_ids(conditions)?;
        if ids.is_empty() || fields.is_empty() {
            return Ok(0);
        }

        let alias = self.alias.clone();
        let mut unqualify = |table: Option<String>, name: String| match table {
            Some(t) if t != alias => Expr::Column { table: Some(t), name },
            _ => Expr::col(name),
        };
        let mut update = UpdateQuery::new(table.clone())
            .filter(Expr::col(self.def.primary_key.clone()).in_list(ids));
        for (column, value) in fields {
            let column = column.rsplit('.').next().unwrap_or(&column).to_string();
            let value = match value {
                Expr::Literal(v) => Expr::Literal(schema.coerce_for_write(&column, v)),
                other => self.rewrite(other, &schema).map_columns(&mut unqualify),
            };
            update = update.set_expr(column, value);
        }

        let conn = self.connection()?;
        let (sql, params) = update.build(conn.dialect());
        let affected = conn.execute(&sql, &params)?;
        self.catalog.invalidate(&table);
        tracing::debug!(alias = %self.alias, table = %table, affected, "bulk updated");
        Ok(affected)
    }
}
