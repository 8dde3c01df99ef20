//! DDL generation from schema operations.
//!
//! SQLite has limited ALTER TABLE support: column type, nullability and
//! default changes rebuild the table (create, copy, drop, rename).

use crate::diff::{SchemaDiff, SchemaOperation};
use crate::introspect::{ColumnInfo, IndexInfo, TableInfo};
use relmodel_core::{Connection, Error, Result, SchemaError, SchemaErrorKind};

/// Turns schema operations into DDL statements.
pub trait DdlGenerator {
    /// Dialect name for logging.
    fn dialect(&self) -> &'static str;

    /// DDL statements for one operation.
    fn generate(&self, op: &SchemaOperation) -> Result<Vec<String>>;

    /// DDL statements for a whole diff, in operation order.
    fn generate_all(&self, diff: &SchemaDiff) -> Result<Vec<String>> {
        let mut statements = Vec::new();
        for op in &diff.operations {
            statements.extend(self.generate(op)?);
        }
        Ok(statements)
    }
}

/// DDL generator for SQLite.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDdl;

impl DdlGenerator for SqliteDdl {
    fn dialect(&self) -> &'static str {
        "sqlite"
    }

    fn generate(&self, op: &SchemaOperation) -> Result<Vec<String>> {
        tracing::debug!(dialect = self.dialect(), op = ?op, "generating DDL");

        let statements = match op {
            SchemaOperation::CreateTable(table) => {
                let mut stmts = vec![create_table(table)];
                stmts.extend(table.indexes.iter().map(|idx| create_index(&table.name, idx)));
                stmts
            }
            SchemaOperation::DropTable(name) => {
                vec![format!("DROP TABLE IF EXISTS {}", quote(name))]
            }
            SchemaOperation::AddColumn { table, column } => vec![format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote(table),
                column_def(column, false)
            )],
            SchemaOperation::DropColumn {
                table,
                column,
                table_info,
            } => match table_info {
                Some(info) => {
                    let mut new_table = info.clone();
                    new_table.columns.retain(|c| c.name != *column);
                    new_table.primary_key.retain(|c| c != column);
                    new_table
                        .indexes
                        .retain(|idx| !idx.columns.iter().any(|c| c == column));
                    if new_table.columns.is_empty() {
                        return Err(invalid(format!(
                            "cannot drop the last column {}.{}",
                            table, column
                        )));
                    }
                    recreate_table(&new_table)
                }
                None => vec![format!(
                    "ALTER TABLE {} DROP COLUMN {}",
                    quote(table),
                    quote(column)
                )],
            },
            SchemaOperation::AlterColumnType {
                table,
                column,
                to_type,
                table_info,
                ..
            } => {
                let info = require_table_info(table, table_info.as_ref())?;
                recreate_with(info, column, |col| col.sql_type.clone_from(to_type))?
            }
            SchemaOperation::AlterColumnNullable {
                table,
                column,
                to_nullable,
                table_info,
                ..
            } => {
                let info = require_table_info(table, table_info.as_ref())?;
                recreate_with(info, column, |col| col.nullable = *to_nullable)?
            }
            SchemaOperation::AlterColumnDefault {
                table,
                column,
                to_default,
                table_info,
                ..
            } => {
                let info = require_table_info(table, table_info.as_ref())?;
                recreate_with(info, column, |col| col.default.clone_from(to_default))?
            }
            SchemaOperation::CreateIndex { table, index } => vec![create_index(table, index)],
            SchemaOperation::DropIndex { name, .. } => {
                vec![format!("DROP INDEX IF EXISTS {}", quote(name))]
            }
        };

        for stmt in &statements {
            tracing::trace!(sql = %stmt, "generated DDL statement");
        }
        Ok(statements)
    }
}

/// Generate and execute the DDL for `diff` inside one transaction.
///
/// Returns the number of statements executed.
pub fn apply_diff(conn: &dyn Connection, diff: &SchemaDiff) -> Result<usize> {
    let statements = SqliteDdl.generate_all(diff)?;
    if statements.is_empty() {
        return Ok(0);
    }

    conn.begin()?;
    for stmt in &statements {
        if let Err(e) = conn.execute_raw(stmt) {
            tracing::warn!(sql = %stmt, error = %e, "DDL failed, rolling back");
            if let Err(rollback) = conn.rollback() {
                tracing::warn!(error = %rollback, "rollback after failed DDL also failed");
            }
            return Err(e);
        }
    }
    conn.commit()?;
    tracing::info!(statements = statements.len(), "applied schema diff");
    Ok(statements.len())
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn invalid(message: String) -> Error {
    Error::Schema(SchemaError {
        kind: SchemaErrorKind::Invalid,
        message,
        source: None,
    })
}

fn require_table_info<'a>(table: &str, info: Option<&'a TableInfo>) -> Result<&'a TableInfo> {
    info.ok_or_else(|| {
        invalid(format!(
            "altering a column of '{}' needs the table definition to rebuild it",
            table
        ))
    })
}

fn column_def(col: &ColumnInfo, inline_pk: bool) -> String {
    let mut parts = vec![quote(&col.name), col.sql_type.clone()];
    if inline_pk {
        parts.push("PRIMARY KEY".to_string());
    } else if !col.nullable {
        parts.push("NOT NULL".to_string());
    }
    if let Some(default) = &col.default {
        parts.push(format!("DEFAULT {}", default));
    }
    parts.join(" ")
}

fn create_table(table: &TableInfo) -> String {
    // a single INTEGER key is declared inline so it aliases the rowid
    let inline_pk = match table.primary_key.as_slice() {
        [only] => Some(only.as_str()),
        _ => None,
    };

    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|col| format!("  {}", column_def(col, inline_pk == Some(col.name.as_str()))))
        .collect();
    if table.primary_key.len() > 1 {
        let cols: Vec<String> = table.primary_key.iter().map(|c| quote(c)).collect();
        parts.push(format!("  PRIMARY KEY ({})", cols.join(", ")));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        quote(&table.name),
        parts.join(",\n")
    )
}

fn create_index(table: &str, index: &IndexInfo) -> String {
    let cols: Vec<String> = index.columns.iter().map(|c| quote(c)).collect();
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote(&index.name),
        quote(table),
        cols.join(", ")
    )
}

fn recreate_with(
    table: &TableInfo,
    column: &str,
    change: impl FnOnce(&mut ColumnInfo),
) -> Result<Vec<String>> {
    let mut new_table = table.clone();
    let col = new_table
        .columns
        .iter_mut()
        .find(|c| c.name == column)
        .ok_or_else(|| {
            Error::Schema(SchemaError {
                kind: SchemaErrorKind::ColumnNotFound,
                message: format!("column '{}.{}' not found", table.name, column),
                source: None,
            })
        })?;
    change(col);
    Ok(recreate_table(&new_table))
}

fn recreate_table(new_table: &TableInfo) -> Vec<String> {
    let tmp = format!("__relmodel_new_{}", sanitize_ident(&new_table.name));
    let mut tmp_table = new_table.clone();
    tmp_table.name.clone_from(&tmp);

    let cols: Vec<String> = new_table.columns.iter().map(|c| quote(&c.name)).collect();
    let cols = cols.join(", ");

    let mut stmts = vec![
        create_table(&tmp_table),
        format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote(&tmp),
            cols,
            cols,
            quote(&new_table.name)
        ),
        format!("DROP TABLE {}", quote(&new_table.name)),
        format!(
            "ALTER TABLE {} RENAME TO {}",
            quote(&tmp),
            quote(&new_table.name)
        ),
    ];
    stmts.extend(
        new_table
            .indexes
            .iter()
            .map(|idx| create_index(&new_table.name, idx)),
    );
    stmts
}

fn sanitize_ident(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
