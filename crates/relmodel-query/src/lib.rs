//! SQL construction layer for relmodel.
//!
//! `relmodel-query` turns the engine's query plans into SQL plus bound
//! parameters:
//!
//! - **Expression DSL**: [`Expr`] for conditions, join predicates and ordering.
//! - **Builders**: [`SelectQuery`] (including the dedicated COUNT form),
//!   [`InsertQuery`], [`UpdateQuery`], [`DeleteQuery`].
//! - **Query cache**: [`QueryCache`], keyed by SQL text and parameters with
//!   per-table invalidation.

pub mod builder;
pub mod cache;
pub mod clause;
pub mod expr;

pub use builder::{DeleteQuery, InsertQuery, SelectField, SelectQuery, UpdateQuery};
pub use cache::{CachedResult, QueryCache, cache_key};
pub use clause::{Join, JoinType, OrderBy, OrderDirection};
pub use expr::{BinaryOp, Expr, UnaryOp};
pub use relmodel_core::Dialect;
