//! SQL clause types (ORDER BY, JOIN).

use crate::expr::Expr;
use relmodel_core::{Dialect, Value};

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }

    /// The opposite direction.
    pub const fn reverse(self) -> Self {
        match self {
            OrderDirection::Asc => OrderDirection::Desc,
            OrderDirection::Desc => OrderDirection::Asc,
        }
    }
}

/// One ORDER BY term.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: OrderDirection,
}

impl OrderBy {
    /// Create an ascending order by clause.
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            direction: OrderDirection::Asc,
        }
    }

    /// Create a descending order by clause.
    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            direction: OrderDirection::Desc,
        }
    }

    /// Parse `"Post.title DESC"`, `"id"` or `"LENGTH(title) ASC"`.
    ///
    /// Anything that is not a plain (optionally qualified) identifier is kept
    /// as raw SQL.
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        let (body, direction) = match spec.rsplit_once(char::is_whitespace) {
            Some((body, dir)) if dir.eq_ignore_ascii_case("desc") => {
                (body.trim(), OrderDirection::Desc)
            }
            Some((body, dir)) if dir.eq_ignore_ascii_case("asc") => {
                (body.trim(), OrderDirection::Asc)
            }
            _ => (spec, OrderDirection::Asc),
        };

        let is_identifier = !body.is_empty()
            && body
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '.');
        let expr = if is_identifier {
            Expr::field(body)
        } else {
            Expr::raw(body)
        };
        Self { expr, direction }
    }

    /// Generate SQL for this ORDER BY term.
    pub fn build(&self, dialect: Dialect, params: &mut Vec<Value>) -> String {
        format!(
            "{} {}",
            self.expr.build(dialect, params),
            self.direction.as_str()
        )
    }
}

/// Types of SQL joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

impl JoinType {
    /// Get the SQL keyword for this join type.
    pub const fn as_str(self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
        }
    }
}

/// A JOIN clause against a table under an alias.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: String,
    pub alias: String,
    pub on: Expr,
}

impl Join {
    /// Create a LEFT JOIN.
    pub fn left(table: impl Into<String>, alias: impl Into<String>, on: Expr) -> Self {
        Self {
            join_type: JoinType::Left,
            table: table.into(),
            alias: alias.into(),
            on,
        }
    }

    /// Create an INNER JOIN.
    pub fn inner(table: impl Into<String>, alias: impl Into<String>, on: Expr) -> Self {
        Self {
            join_type: JoinType::Inner,
            table: table.into(),
            alias: alias.into(),
            on,
        }
    }

    /// Generate SQL for this join.
    pub fn build(&self, dialect: Dialect, params: &mut Vec<Value>) -> String {
        format!(
            "{} {} AS {} ON {}",
            self.join_type.as_str(),
            dialect.quote_identifier(&self.table),
            dialect.quote_identifier(&self.alias),
            self.on.build(dialect, params)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_order_specs() {
        let o = OrderBy::parse("Post.title DESC");
        assert_eq!(o.expr, Expr::qualified("Post", "title"));
        assert_eq!(o.direction, OrderDirection::Desc);

        let o = OrderBy::parse("id");
        assert_eq!(o.expr, Expr::col("id"));
        assert_eq!(o.direction, OrderDirection::Asc);

        let o = OrderBy::parse("LENGTH(title) asc");
        assert_eq!(o.expr, Expr::raw("LENGTH(title)"));
    }

    #[test]
    fn join_sql() {
        let join = Join::left(
            "users",
            "Author",
            Expr::qualified("Author", "id").eq(Expr::qualified("Post", "author_id")),
        );
        let mut params = Vec::new();
        assert_eq!(
            join.build(Dialect::Sqlite, &mut params),
            "LEFT JOIN \"users\" AS \"Author\" ON \"Author\".\"id\" = \"Post\".\"author_id\""
        );
        assert!(params.is_empty());
    }
}
