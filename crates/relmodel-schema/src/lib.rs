//! Schema introspection and diffing for relmodel.
//!
//! - [`Introspector`] reads a live SQLite database into a [`DatabaseSchema`]
//!   and describes single tables as entity schemas.
//! - [`schema_diff`] compares two schemas and returns ordered
//!   [`SchemaOperation`]s with warnings for destructive changes.
//! - [`SqliteDdl`] renders operations as DDL; [`apply_diff`] runs them.
//!
//! Schemas serialize to JSON so a known-good snapshot can be stored and
//! diffed later.

pub mod ddl;
pub mod diff;
pub mod introspect;

pub use ddl::{DdlGenerator, SqliteDdl, apply_diff};
pub use diff::{
    DestructivePolicy, DiffWarning, SchemaDiff, SchemaDiffer, SchemaOperation, WarningSeverity,
    schema_diff, schema_diff_with_policy,
};
pub use introspect::{ColumnInfo, DatabaseSchema, IndexInfo, Introspector, TableInfo};

use relmodel_core::EntitySchema;

/// Build an expected database schema from `(table, entity schema)` pairs.
pub fn expected_schema<'a, I>(entities: I) -> DatabaseSchema
where
    I: IntoIterator<Item = (&'a str, &'a EntitySchema)>,
{
    let mut schema = DatabaseSchema::new();
    for (table, entity) in entities {
        schema.add_table(TableInfo::from_entity_schema(table, entity));
    }
    schema
}
