//! Core types and traits for relmodel.
//!
//! This crate provides the foundations shared by every other relmodel crate:
//!
//! - `Value` and `Row` for dynamically typed SQL data
//! - `Connection` trait implemented by drivers
//! - `EntitySchema` column metadata with type coercion
//! - `Validator` field rules
//! - `Error` taxonomy and `Result` alias

pub mod connection;
pub mod error;
pub mod row;
pub mod schema;
pub mod validate;
pub mod value;

pub use connection::{Connection, Dialect};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, FieldValidationError, QueryError,
    QueryErrorKind, Result, SchemaError, SchemaErrorKind, TransactionError, TransactionErrorKind,
    TypeError, ValidationError, ValidationErrorKind,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use schema::{ColumnDef, EntitySchema, FieldType, KeyKind};
pub use validate::{On, Rule, ValidationRule, Validator, matches_pattern};
pub use value::Value;
