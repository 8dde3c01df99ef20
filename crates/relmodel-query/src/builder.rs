//! Statement builders for SELECT, COUNT, INSERT, UPDATE and DELETE.
//!
//! Builders produce `(sql, params)` pairs for one dialect; they never touch
//! a connection.

use crate::clause::{Join, OrderBy};
use crate::expr::Expr;
use relmodel_core::{Dialect, Value};

/// One projected column: an expression with an optional result alias.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectField {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl SelectField {
    pub fn new(expr: Expr, alias: Option<String>) -> Self {
        Self { expr, alias }
    }
}

/// SELECT query against one aliased table.
#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    pub table: String,
    pub alias: String,
    pub fields: Vec<SelectField>,
    pub joins: Vec<Join>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectQuery {
    /// Select from `table AS alias`.
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
            ..Self::default()
        }
    }

    /// Add a projected field.
    pub fn field(mut self, expr: Expr, alias: Option<String>) -> Self {
        self.fields.push(SelectField::new(expr, alias));
        self
    }

    /// Add a join.
    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// AND a condition into the WHERE clause.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
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

    fn build_from(&self, dialect: Dialect, params: &mut Vec<Value>) -> String {
        let mut sql = format!(
            " FROM {} AS {}",
            dialect.quote_identifier(&self.table),
            dialect.quote_identifier(&self.alias)
        );
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(&join.build(dialect, params));
        }
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.build(dialect, params));
        }
        if !self.group_by.is_empty() {
            let groups: Vec<_> = self
                .group_by
                .iter()
                .map(|g| g.build(dialect, params))
                .collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&groups.join(", "));
        }
        sql
    }

    /// Build the SELECT statement.
    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let columns: Vec<_> = if self.fields.is_empty() {
            vec![format!("{}.*", dialect.quote_identifier(&self.alias))]
        } else {
            self.fields
                .iter()
                .map(|f| {
                    let expr_sql = f.expr.build(dialect, &mut params);
                    match &f.alias {
                        Some(alias) => format!("{} AS {}", expr_sql, dialect.quote_identifier(alias)),
                        None => expr_sql,
                    }
                })
                .collect()
        };

        let mut sql = format!("SELECT {}", columns.join(", "));
        sql.push_str(&self.build_from(dialect, &mut params));

        if !self.order_by.is_empty() {
            let orders: Vec<_> = self
                .order_by
                .iter()
                .map(|o| o.build(dialect, &mut params))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&orders.join(", "));
        }

        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }

        (sql, params)
    }

    /// Build a `COUNT(*)` statement over the same rows.
    ///
    /// ORDER BY, LIMIT and OFFSET are never compiled in. With GROUP BY the
    /// grouped query becomes a subquery and the groups are counted.
    pub fn build_count(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let count_alias = dialect.quote_identifier("count");
        if self.group_by.is_empty() {
            let from = self.build_from(dialect, &mut params);
            (format!("SELECT COUNT(*) AS {count_alias}{from}"), params)
        } else {
            let groups: Vec<_> = self
                .group_by
                .iter()
                .map(|g| g.build(dialect, &mut params))
                .collect();
            let from = self.build_from(dialect, &mut params);
            (
                format!(
                    "SELECT COUNT(*) AS {count_alias} FROM (SELECT {}{from}) AS {}",
                    groups.join(", "),
                    dialect.quote_identifier("grouped")
                ),
                params,
            )
        }
    }
}

/// INSERT of one row.
#[derive(Debug, Clone)]
pub struct InsertQuery {
    table: String,
    values: Vec<(String, Value)>,
}

impl InsertQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: Vec::new(),
        }
    }

    pub fn value(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.push((column.into(), value.into()));
        self
    }

    pub fn values(mut self, values: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.values.extend(values);
        self
    }

    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let table = dialect.quote_identifier(&self.table);
        if self.values.is_empty() {
            return (format!("INSERT INTO {table} DEFAULT VALUES"), Vec::new());
        }
        let columns: Vec<_> = self
            .values
            .iter()
            .map(|(c, _)| dialect.quote_identifier(c))
            .collect();
        let placeholders: Vec<_> = (1..=self.values.len())
            .map(|i| dialect.placeholder(i))
            .collect();
        let params = self.values.iter().map(|(_, v)| v.clone()).collect();
        (
            format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            ),
            params,
        )
    }
}

/// UPDATE of a single table.
#[derive(Debug, Clone)]
pub struct UpdateQuery {
    table: String,
    sets: Vec<(String, Expr)>,
    filter: Option<Expr>,
}

impl UpdateQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            sets: Vec::new(),
            filter: None,
        }
    }

    /// `SET column = <literal>`
    pub fn set(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_expr(column, Expr::Literal(value.into()))
    }

    /// `SET column = <expression>`
    pub fn set_expr(mut self, column: impl Into<String>, expr: Expr) -> Self {
        self.sets.push((column.into(), expr));
        self
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sets: Vec<_> = self
            .sets
            .iter()
            .map(|(c, e)| {
                format!(
                    "{} = {}",
                    dialect.quote_identifier(c),
                    e.build(dialect, &mut params)
                )
            })
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            dialect.quote_identifier(&self.table),
            sets.join(", ")
        );
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.build(dialect, &mut params));
        }
        (sql, params)
    }
}

/// DELETE from a single table.
#[derive(Debug, Clone)]
pub struct DeleteQuery {
    table: String,
    filter: Option<Expr>,
}

impl DeleteQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
        }
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", dialect.quote_identifier(&self.table));
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.build(dialect, &mut params));
        }
        (sql, params)
    }
}
