//! Schema diff engine for comparing database schemas.
//!
//! Compares a current schema (usually introspected) against an expected
//! one (usually built from entity declarations) and produces the ordered
//! operations that bring the database into line.

use crate::introspect::{ColumnInfo, DatabaseSchema, IndexInfo, TableInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Schema Operations
// ============================================================================

/// A single schema modification operation.
///
/// Operations that SQLite can only perform by rebuilding the table carry a
/// `table_info` snapshot of the table as it stands right before the
/// operation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaOperation {
    /// Create a new table.
    CreateTable(TableInfo),
    /// Drop an existing table.
    DropTable(String),
    /// Add a column to a table.
    AddColumn { table: String, column: ColumnInfo },
    /// Drop a column from a table.
    DropColumn {
        table: String,
        column: String,
        table_info: Option<TableInfo>,
    },
    /// Change a column's type.
    AlterColumnType {
        table: String,
        column: String,
        from_type: String,
        to_type: String,
        table_info: Option<TableInfo>,
    },
    /// Change a column's nullability.
    AlterColumnNullable {
        table: String,
        column: String,
        from_nullable: bool,
        to_nullable: bool,
        table_info: Option<TableInfo>,
    },
    /// Change a column's default value.
    AlterColumnDefault {
        table: String,
        column: String,
        from_default: Option<String>,
        to_default: Option<String>,
        table_info: Option<TableInfo>,
    },
    /// Create an index.
    CreateIndex { table: String, index: IndexInfo },
    /// Drop an index.
    DropIndex { table: String, name: String },
}

impl SchemaOperation {
    /// Check if this operation potentially loses data.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            SchemaOperation::DropTable(_)
                | SchemaOperation::DropColumn { .. }
                | SchemaOperation::AlterColumnType { .. }
        )
    }

    /// Get the inverse operation for rollback, if possible.
    ///
    /// Drops are not reversible: the dropped definition and data cannot be
    /// reconstructed from the operation alone.
    pub fn inverse(&self) -> Option<Self> {
        match self {
            SchemaOperation::CreateTable(table) => {
                Some(SchemaOperation::DropTable(table.name.clone()))
            }
            SchemaOperation::DropTable(_) | SchemaOperation::DropColumn { .. } => None,
            SchemaOperation::AddColumn { table, column } => Some(SchemaOperation::DropColumn {
                table: table.clone(),
                column: column.name.clone(),
                table_info: None,
            }),
            SchemaOperation::AlterColumnType {
                table,
                column,
                from_type,
                to_type,
                ..
            } => Some(SchemaOperation::AlterColumnType {
                table: table.clone(),
                column: column.clone(),
                from_type: to_type.clone(),
                to_type: from_type.clone(),
                table_info: None,
            }),
            SchemaOperation::AlterColumnNullable {
                table,
                column,
                from_nullable,
                to_nullable,
                ..
            } => Some(SchemaOperation::AlterColumnNullable {
                table: table.clone(),
                column: column.clone(),
                from_nullable: *to_nullable,
                to_nullable: *from_nullable,
                table_info: None,
            }),
            SchemaOperation::AlterColumnDefault {
                table,
                column,
                from_default,
                to_default,
                ..
            } => Some(SchemaOperation::AlterColumnDefault {
                table: table.clone(),
                column: column.clone(),
                from_default: to_default.clone(),
                to_default: from_default.clone(),
                table_info: None,
            }),
            SchemaOperation::CreateIndex { table, index } => Some(SchemaOperation::DropIndex {
                table: table.clone(),
                name: index.name.clone(),
            }),
            SchemaOperation::DropIndex { .. } => None,
        }
    }

    /// Get the table this operation affects.
    pub fn table(&self) -> &str {
        match self {
            SchemaOperation::CreateTable(t) => &t.name,
            SchemaOperation::DropTable(name) => name,
            SchemaOperation::AddColumn { table, .. }
            | SchemaOperation::DropColumn { table, .. }
            | SchemaOperation::AlterColumnType { table, .. }
            | SchemaOperation::AlterColumnNullable { table, .. }
            | SchemaOperation::AlterColumnDefault { table, .. }
            | SchemaOperation::CreateIndex { table, .. }
            | SchemaOperation::DropIndex { table, .. } => table,
        }
    }

    /// Get a priority value for ordering operations.
    fn priority(&self) -> u8 {
        // Drops of dependent objects first, then alterations, then
        // additions; whole-table drops go last.
        match self {
            SchemaOperation::DropIndex { .. } => 1,
            SchemaOperation::DropColumn { .. } => 2,
            SchemaOperation::AlterColumnType { .. } => 3,
            SchemaOperation::AlterColumnNullable { .. } => 4,
            SchemaOperation::AlterColumnDefault { .. } => 5,
            SchemaOperation::AddColumn { .. } => 6,
            SchemaOperation::CreateTable(_) => 7,
            SchemaOperation::CreateIndex { .. } => 8,
            SchemaOperation::DropTable(_) => 9,
        }
    }

    fn table_info_mut(&mut self) -> Option<&mut Option<TableInfo>> {
        match self {
            SchemaOperation::DropColumn { table_info, .. }
            | SchemaOperation::AlterColumnType { table_info, .. }
            | SchemaOperation::AlterColumnNullable { table_info, .. }
            | SchemaOperation::AlterColumnDefault { table_info, .. } => Some(table_info),
            _ => None,
        }
    }
}

// ============================================================================
// Diff Result
// ============================================================================

/// Warning severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    /// Informational message.
    Info,
    /// Warning that should be reviewed.
    Warning,
    /// Potential data loss.
    DataLoss,
}

/// A warning about a schema operation.
#[derive(Debug, Clone)]
pub struct DiffWarning {
    /// Severity of the warning.
    pub severity: WarningSeverity,
    /// Warning message.
    pub message: String,
    /// Index into operations that caused this warning.
    pub operation_index: Option<usize>,
}

/// How to handle destructive schema operations (drops, type changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestructivePolicy {
    /// Skip destructive operations entirely.
    Skip,
    /// Include destructive operations, but require explicit confirmation.
    #[default]
    Warn,
    /// Include destructive operations without additional confirmation gating.
    Allow,
}

/// The result of comparing two schemas.
#[derive(Debug)]
pub struct SchemaDiff {
    /// Policy used when generating this diff.
    pub destructive_policy: DestructivePolicy,
    /// Operations to transform current schema to expected schema.
    pub operations: Vec<SchemaOperation>,
    /// Warnings about potential issues.
    pub warnings: Vec<DiffWarning>,
}

impl SchemaDiff {
    /// Create an empty diff with the provided destructive policy.
    pub fn new(destructive_policy: DestructivePolicy) -> Self {
        Self {
            destructive_policy,
            operations: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Check if there are any changes.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Count of all operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if there are any destructive operations.
    pub fn has_destructive(&self) -> bool {
        self.operations.iter().any(SchemaOperation::is_destructive)
    }

    /// Get only destructive operations.
    pub fn destructive_operations(&self) -> Vec<&SchemaOperation> {
        self.operations
            .iter()
            .filter(|op| op.is_destructive())
            .collect()
    }

    /// Whether this diff requires explicit confirmation before applying.
    pub fn requires_confirmation(&self) -> bool {
        self.destructive_policy == DestructivePolicy::Warn && self.has_destructive()
    }

    /// Operations that undo this diff, in reverse order.
    ///
    /// Returns `None` when any operation is irreversible.
    pub fn inverse(&self) -> Option<Vec<SchemaOperation>> {
        self.operations
            .iter()
            .rev()
            .map(SchemaOperation::inverse)
            .collect()
    }

    /// Reorder operations for safe execution. The sort is stable, so
    /// operations of equal priority keep their discovery order.
    pub fn order_operations(&mut self) {
        let mut order: Vec<usize> = (0..self.operations.len()).collect();
        order.sort_by_key(|&i| self.operations[i].priority());

        let mut new_index = vec![0; order.len()];
        for (new, &old) in order.iter().enumerate() {
            new_index[old] = new;
        }
        let mut ops: Vec<Option<SchemaOperation>> =
            std::mem::take(&mut self.operations).into_iter().map(Some).collect();
        self.operations = order.iter().filter_map(|&i| ops[i].take()).collect();

        // warnings keep pointing at the operation that raised them
        for warning in &mut self.warnings {
            if let Some(i) = warning.operation_index {
                warning.operation_index = Some(new_index[i]);
            }
        }
    }

    /// Refresh the `table_info` snapshot of every rebuild operation.
    ///
    /// Several rebuilds of one table each need the table as left by the
    /// previous operation, so the operations are replayed against an
    /// in-memory copy of the current schema.
    fn refresh_table_infos(&mut self, current: &DatabaseSchema) {
        let mut state: HashMap<String, TableInfo> = current
            .tables
            .iter()
            .map(|(name, t)| (name.clone(), t.clone()))
            .collect();

        for op in &mut self.operations {
            match op {
                SchemaOperation::CreateTable(t) => {
                    state.insert(t.name.clone(), t.clone());
                    continue;
                }
                SchemaOperation::DropTable(name) => {
                    state.remove(name);
                    continue;
                }
                _ => {}
            }

            let table = op.table().to_string();
            let before = state.get(&table).cloned();
            if let Some(table_info) = op.table_info_mut() {
                table_info.clone_from(&before);
            }
            if let Some(table_state) = state.get_mut(&table) {
                apply_op_to_table_info(table_state, op);
            }
        }
    }

    /// Add an operation.
    fn add_op(&mut self, op: SchemaOperation) -> usize {
        let index = self.operations.len();
        self.operations.push(op);
        index
    }

    /// Add a warning.
    fn warn(
        &mut self,
        severity: WarningSeverity,
        message: impl Into<String>,
        operation_index: Option<usize>,
    ) {
        self.warnings.push(DiffWarning {
            severity,
            message: message.into(),
            operation_index,
        });
    }

    fn add_destructive_op(
        &mut self,
        op: SchemaOperation,
        warn_severity: WarningSeverity,
        warn_message: impl Into<String>,
    ) {
        let warn_message = warn_message.into();
        match self.destructive_policy {
            DestructivePolicy::Skip => {
                self.warn(
                    WarningSeverity::Warning,
                    format!("Skipped destructive operation: {}", warn_message),
                    None,
                );
            }
            DestructivePolicy::Warn => {
                let op_index = self.add_op(op);
                self.warn(warn_severity, warn_message, Some(op_index));
            }
            DestructivePolicy::Allow => {
                self.add_op(op);
            }
        }
    }
}

impl Default for SchemaDiff {
    fn default() -> Self {
        Self::new(DestructivePolicy::Warn)
    }
}

// ============================================================================
// Diff Algorithm
// ============================================================================

/// Compare two schemas and generate operations to transform current to expected.
///
/// ```ignore
/// let current = Introspector::new().introspect_all(conn.as_ref())?;
/// let diff = schema_diff(&current, &expected);
/// for stmt in SqliteDdl.generate_all(&diff) {
///     println!("{stmt}");
/// }
/// ```
pub fn schema_diff(current: &DatabaseSchema, expected: &DatabaseSchema) -> SchemaDiff {
    schema_diff_with_policy(current, expected, DestructivePolicy::Warn)
}

/// Compare two schemas and generate operations to transform current to expected.
pub fn schema_diff_with_policy(
    current: &DatabaseSchema,
    expected: &DatabaseSchema,
    destructive_policy: DestructivePolicy,
) -> SchemaDiff {
    SchemaDiffer::new(destructive_policy).diff(current, expected)
}

/// Schema diff engine.
#[derive(Debug, Clone, Copy)]
pub struct SchemaDiffer {
    destructive_policy: DestructivePolicy,
}

impl SchemaDiffer {
    pub const fn new(destructive_policy: DestructivePolicy) -> Self {
        Self { destructive_policy }
    }

    pub fn diff(&self, current: &DatabaseSchema, expected: &DatabaseSchema) -> SchemaDiff {
        let mut diff = SchemaDiff::new(self.destructive_policy);

        // New tables (in expected but not current)
        for (name, table) in &expected.tables {
            if !current.tables.contains_key(name) {
                diff.add_op(SchemaOperation::CreateTable(table.clone()));
            }
        }

        // Dropped tables (in current but not expected)
        for name in current.tables.keys() {
            if !expected.tables.contains_key(name) {
                diff.add_destructive_op(
                    SchemaOperation::DropTable(name.clone()),
                    WarningSeverity::DataLoss,
                    format!("Dropping table '{}' will delete all data", name),
                );
            }
        }

        for (name, expected_table) in &expected.tables {
            if let Some(current_table) = current.tables.get(name) {
                diff_table(current_table, expected_table, &mut diff);
            }
        }

        diff.order_operations();
        diff.refresh_table_infos(current);

        tracing::debug!(
            operations = diff.len(),
            warnings = diff.warnings.len(),
            destructive = diff.has_destructive(),
            "computed schema diff"
        );
        diff
    }
}

fn apply_op_to_table_info(table: &mut TableInfo, op: &SchemaOperation) {
    match op {
        SchemaOperation::AddColumn { column, .. } => {
            table.columns.push(column.clone());
        }
        SchemaOperation::DropColumn { column, .. } => {
            table.columns.retain(|c| c.name != *column);
            table.primary_key.retain(|c| c != column);
            table
                .indexes
                .retain(|idx| !idx.columns.iter().any(|c| c == column));
        }
        SchemaOperation::AlterColumnType {
            column, to_type, ..
        } => {
            if let Some(col) = table.columns.iter_mut().find(|c| c.name == *column) {
                col.sql_type.clone_from(to_type);
            }
        }
        SchemaOperation::AlterColumnNullable {
            column,
            to_nullable,
            ..
        } => {
            if let Some(col) = table.columns.iter_mut().find(|c| c.name == *column) {
                col.nullable = *to_nullable;
            }
        }
        SchemaOperation::AlterColumnDefault {
            column, to_default, ..
        } => {
            if let Some(col) = table.columns.iter_mut().find(|c| c.name == *column) {
                col.default.clone_from(to_default);
            }
        }
        SchemaOperation::CreateIndex { index, .. } => {
            table.indexes.push(index.clone());
        }
        SchemaOperation::DropIndex { name, .. } => {
            table.indexes.retain(|idx| idx.name != *name);
        }
        SchemaOperation::CreateTable(_) | SchemaOperation::DropTable(_) => {}
    }
}

fn diff_table(current: &TableInfo, expected: &TableInfo, diff: &mut SchemaDiff) {
    let table = expected.name.as_str();

    for col in &expected.columns {
        match current.column(&col.name) {
            None => {
                diff.add_op(SchemaOperation::AddColumn {
                    table: table.to_string(),
                    column: col.clone(),
                });
            }
            Some(cur) => diff_column_details(table, cur, col, diff),
        }
    }

    for cur in &current.columns {
        if expected.column(&cur.name).is_none() {
            diff.add_destructive_op(
                SchemaOperation::DropColumn {
                    table: table.to_string(),
                    column: cur.name.clone(),
                    table_info: None,
                },
                WarningSeverity::DataLoss,
                format!("Dropping column '{}.{}' will delete its data", table, cur.name),
            );
        }
    }

    if current.primary_key != expected.primary_key && !expected.primary_key.is_empty() {
        diff.warn(
            WarningSeverity::Warning,
            format!(
                "Primary key of '{}' differs ({:?} -> {:?}); rebuild the table manually",
                table, current.primary_key, expected.primary_key
            ),
            None,
        );
    }

    diff_indexes(table, &current.indexes, &expected.indexes, diff);
}

fn diff_column_details(table: &str, current: &ColumnInfo, expected: &ColumnInfo, diff: &mut SchemaDiff) {
    let from_type = normalize_type(&current.sql_type);
    let to_type = normalize_type(&expected.sql_type);
    if from_type != to_type {
        diff.add_destructive_op(
            SchemaOperation::AlterColumnType {
                table: table.to_string(),
                column: expected.name.clone(),
                from_type: current.sql_type.clone(),
                to_type: expected.sql_type.clone(),
                table_info: None,
            },
            WarningSeverity::Warning,
            format!(
                "Changing type of '{}.{}' from {} to {} may lose data",
                table, expected.name, current.sql_type, expected.sql_type
            ),
        );
    }

    // primary key columns are implicitly NOT NULL
    if current.nullable != expected.nullable && !expected.primary_key {
        let op_index = diff.add_op(SchemaOperation::AlterColumnNullable {
            table: table.to_string(),
            column: expected.name.clone(),
            from_nullable: current.nullable,
            to_nullable: expected.nullable,
            table_info: None,
        });
        if !expected.nullable {
            diff.warn(
                WarningSeverity::Warning,
                format!(
                    "Making '{}.{}' NOT NULL fails if existing rows hold NULL",
                    table, expected.name
                ),
                Some(op_index),
            );
        }
    }

    if normalize_default(current.default.as_deref()) != normalize_default(expected.default.as_deref()) {
        diff.add_op(SchemaOperation::AlterColumnDefault {
            table: table.to_string(),
            column: expected.name.clone(),
            from_default: current.default.clone(),
            to_default: expected.default.clone(),
            table_info: None,
        });
    }
}

fn diff_indexes(table: &str, current: &[IndexInfo], expected: &[IndexInfo], diff: &mut SchemaDiff) {
    for idx in expected {
        match current.iter().find(|c| c.name == idx.name) {
            Some(cur) if cur.columns == idx.columns && cur.unique == idx.unique => {}
            Some(cur) => {
                diff.add_op(SchemaOperation::DropIndex {
                    table: table.to_string(),
                    name: cur.name.clone(),
                });
                diff.add_op(SchemaOperation::CreateIndex {
                    table: table.to_string(),
                    index: idx.clone(),
                });
            }
            None => {
                diff.add_op(SchemaOperation::CreateIndex {
                    table: table.to_string(),
                    index: idx.clone(),
                });
            }
        }
    }

    for cur in current {
        if !expected.iter().any(|e| e.name == cur.name) {
            diff.add_op(SchemaOperation::DropIndex {
                table: table.to_string(),
                name: cur.name.clone(),
            });
        }
    }
}

/// Normalize a SQL type for comparison under SQLite's type affinity rules.
fn normalize_type(sql_type: &str) -> String {
    let upper = sql_type.trim().to_uppercase();
    match upper.as_str() {
        "INT" | "INTEGER" | "TINYINT" | "SMALLINT" | "MEDIUMINT" => "INTEGER".to_string(),
        "BOOL" => "BOOLEAN".to_string(),
        "DOUBLE" | "DOUBLE PRECISION" | "REAL" => "FLOAT".to_string(),
        "CHARACTER VARYING" => "VARCHAR".to_string(),
        _ => upper.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

fn normalize_default(default: Option<&str>) -> Option<String> {
    let default = default?.trim();
    if default.eq_ignore_ascii_case("NULL") {
        return None;
    }
    // PRAGMA reports parenthesized expressions verbatim
    let unwrapped = default
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(default);
    Some(unwrapped.to_string())
}
