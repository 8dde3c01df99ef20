//! Database introspection.
//!
//! Reads the live SQLite catalog (`sqlite_master` and the `PRAGMA`
//! table functions) into [`DatabaseSchema`], the same shape used for
//! declared schemas, so the two can be diffed.

use relmodel_core::{
    ColumnDef, Connection, EntitySchema, Error, FieldType, KeyKind, Result, SchemaError,
    SchemaErrorKind, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Schema Types
// ============================================================================

/// Complete representation of a database schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    /// All tables in the schema, keyed by table name
    pub tables: BTreeMap<String, TableInfo>,
}

impl DatabaseSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a table by name.
    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    /// Get all table names, sorted.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    /// Add or replace a table.
    pub fn add_table(&mut self, table: TableInfo) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Serialize to a JSON snapshot.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a JSON snapshot produced by [`to_json`](Self::to_json).
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Information about a database table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table name
    pub name: String,
    /// Columns in declaration order
    pub columns: Vec<ColumnInfo>,
    /// Primary key column names
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Secondary indexes
    #[serde(default)]
    pub indexes: Vec<IndexInfo>,
}

impl TableInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Build the table for a declared entity schema.
    ///
    /// Columns keyed `Unique` or `Index` get a single-column index named
    /// `<table>_<column>`.
    pub fn from_entity_schema(name: impl Into<String>, schema: &EntitySchema) -> Self {
        let mut table = Self::new(name);
        for def in schema.columns() {
            let primary = def.is_primary();
            if primary {
                table.primary_key.push(def.name.clone());
            }
            match def.key {
                Some(KeyKind::Unique) | Some(KeyKind::Index) => table.indexes.push(IndexInfo {
                    name: format!("{}_{}", table.name, def.name),
                    columns: vec![def.name.clone()],
                    unique: def.key == Some(KeyKind::Unique),
                }),
                _ => {}
            }
            table.columns.push(ColumnInfo {
                name: def.name.clone(),
                sql_type: def.ty.sql_name(def.length),
                nullable: def.nullable && !primary,
                default: def.default.as_ref().map(default_literal),
                primary_key: primary,
            });
        }
        table
    }

    /// Convert to the per-entity schema used by the engine.
    pub fn to_entity_schema(&self) -> EntitySchema {
        self.columns
            .iter()
            .map(|col| {
                let (ty, length) = FieldType::from_sql(&col.sql_type);
                let mut def = ColumnDef::new(col.name.clone(), ty);
                def.nullable = col.nullable && !col.primary_key;
                def.length = length;
                def.default = col.default.as_deref().and_then(parse_default);
                def.key = if col.primary_key {
                    Some(KeyKind::Primary)
                } else {
                    self.indexes
                        .iter()
                        .find(|idx| idx.columns.len() == 1 && idx.columns[0] == col.name)
                        .map(|idx| if idx.unique { KeyKind::Unique } else { KeyKind::Index })
                };
                def
            })
            .collect()
    }
}

/// Information about a table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// SQL type as declared
    pub sql_type: String,
    /// Whether the column is nullable
    pub nullable: bool,
    /// Default value expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Whether this is part of the primary key
    #[serde(default)]
    pub primary_key: bool,
}

/// Information about an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Index name
    pub name: String,
    /// Columns in the index
    pub columns: Vec<String>,
    /// Whether this is a unique index
    pub unique: bool,
}

/// Render a default value as an SQL literal.
pub fn default_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Double(f) => f.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Json(j) => format!("'{}'", j.to_string().replace('\'', "''")),
        Value::Bytes(b) => {
            let hex: String = b.iter().map(|byte| format!("{byte:02X}")).collect();
            format!("X'{}'", hex)
        }
    }
}

fn parse_default(literal: &str) -> Option<Value> {
    let trimmed = literal.trim();
    if trimmed.eq_ignore_ascii_case("NULL") {
        return None;
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
    {
        return Some(Value::Text(inner.replace("''", "'")));
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Value::Int(i));
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Some(Value::Double(f));
    }
    // expressions like CURRENT_TIMESTAMP are kept verbatim
    Some(Value::Text(trimmed.to_string()))
}

// ============================================================================
// Introspector
// ============================================================================

/// Reads table metadata from a live SQLite connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct Introspector;

impl Introspector {
    pub fn new() -> Self {
        Self
    }

    /// List all user table names in the database, sorted.
    pub fn table_names(&self, conn: &dyn Connection) -> Result<Vec<String>> {
        let rows = conn.query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            &[],
        )?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get(0).and_then(|v| v.as_str().map(String::from)))
            .collect())
    }

    /// Get detailed information about a table.
    ///
    /// Fails with `SchemaErrorKind::TableNotFound` when the table does not exist.
    pub fn table_info(&self, conn: &dyn Connection, table_name: &str) -> Result<TableInfo> {
        let quoted = conn.quote_identifier(table_name);
        let rows = conn.query(&format!("PRAGMA table_info({})", quoted), &[])?;
        if rows.is_empty() {
            return Err(Error::Schema(SchemaError {
                kind: SchemaErrorKind::TableNotFound,
                message: format!("Table '{}' does not exist", table_name),
                source: None,
            }));
        }

        let mut pk: Vec<(i64, String)> = Vec::new();
        let columns: Vec<ColumnInfo> = rows
            .iter()
            .filter_map(|row| {
                let name = row.get_named::<String>("name").ok()?;
                let sql_type = row.get_named::<String>("type").ok().unwrap_or_default();
                let notnull = row.get_named::<i64>("notnull").ok().unwrap_or(0);
                let default = row.get_named::<Option<String>>("dflt_value").ok().flatten();
                let pk_pos = row.get_named::<i64>("pk").ok().unwrap_or(0);
                if pk_pos > 0 {
                    pk.push((pk_pos, name.clone()));
                }
                Some(ColumnInfo {
                    name,
                    sql_type,
                    nullable: notnull == 0 && pk_pos == 0,
                    default,
                    primary_key: pk_pos > 0,
                })
            })
            .collect();
        pk.sort();

        let indexes = self.indexes(conn, table_name)?;
        tracing::debug!(
            table = %table_name,
            columns = columns.len(),
            indexes = indexes.len(),
            "introspected table"
        );

        Ok(TableInfo {
            name: table_name.to_string(),
            columns,
            primary_key: pk.into_iter().map(|(_, name)| name).collect(),
            indexes,
        })
    }

    fn indexes(&self, conn: &dyn Connection, table_name: &str) -> Result<Vec<IndexInfo>> {
        let quoted = conn.quote_identifier(table_name);
        let rows = conn.query(&format!("PRAGMA index_list({})", quoted), &[])?;

        let mut indexes = Vec::new();
        for row in &rows {
            let Ok(name) = row.get_named::<String>("name") else {
                continue;
            };
            let origin = row.get_named::<String>("origin").ok().unwrap_or_default();
            // implicit indexes (primary key, inline UNIQUE) are part of the table definition
            if origin != "c" {
                continue;
            }
            let unique = row.get_named::<i64>("unique").ok().unwrap_or(0) == 1;

            let info_sql = format!("PRAGMA index_info({})", conn.quote_identifier(&name));
            let info_rows = match conn.query(&info_sql, &[]) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(index = %name, error = %e, "skipping unreadable index");
                    continue;
                }
            };
            let columns: Vec<String> = info_rows
                .iter()
                .filter_map(|r| r.get_named::<String>("name").ok())
                .collect();

            indexes.push(IndexInfo {
                name,
                columns,
                unique,
            });
        }
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(indexes)
    }

    /// Introspect every user table.
    pub fn introspect_all(&self, conn: &dyn Connection) -> Result<DatabaseSchema> {
        let mut schema = DatabaseSchema::new();
        for name in self.table_names(conn)? {
            let table = self.table_info(conn, &name)?;
            schema.add_table(table);
        }
        Ok(schema)
    }

    /// Describe a live table as an entity schema.
    pub fn describe(&self, conn: &dyn Connection, table_name: &str) -> Result<EntitySchema> {
        Ok(self.table_info(conn, table_name)?.to_entity_schema())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_schema() -> EntitySchema {
        EntitySchema::new(vec![
            ColumnDef::primary("id"),
            ColumnDef::new("email", FieldType::String)
                .length(120)
                .not_null()
                .key(KeyKind::Unique),
            ColumnDef::new("active", FieldType::Boolean).default_value(true),
            ColumnDef::new("nickname", FieldType::String).default_value("n/a"),
        ])
    }

    #[test]
    fn test_from_entity_schema() {
        let table = TableInfo::from_entity_schema("users", &users_schema());
        assert_eq!(table.primary_key, vec!["id".to_string()]);
        assert_eq!(
            table.column("email").map(|c| c.sql_type.as_str()),
            Some("VARCHAR(120)")
        );
        assert!(!table.column("id").expect("id").nullable);
        assert_eq!(
            table.column("active").and_then(|c| c.default.as_deref()),
            Some("1")
        );
        assert_eq!(
            table.column("nickname").and_then(|c| c.default.as_deref()),
            Some("'n/a'")
        );
        assert_eq!(table.indexes.len(), 1);
        assert!(table.indexes[0].unique);
    }

    #[test]
    fn test_entity_schema_conversion() {
        let table = TableInfo::from_entity_schema("users", &users_schema());
        let schema = table.to_entity_schema();
        let email = schema.get("email").expect("email column");
        assert_eq!(email.ty, FieldType::String);
        assert_eq!(email.length, Some(120));
        assert_eq!(email.key, Some(KeyKind::Unique));
        assert!(schema.get("id").expect("id").is_primary());
        assert_eq!(
            schema.get("nickname").and_then(|c| c.default.clone()),
            Some(Value::from("n/a"))
        );
    }

    #[test]
    fn test_default_literal() {
        assert_eq!(default_literal(&Value::from("it's")), "'it''s'");
        assert_eq!(default_literal(&Value::Int(3)), "3");
        assert_eq!(default_literal(&Value::Bytes(vec![0xAB, 0x01])), "X'AB01'");
        assert_eq!(parse_default("'it''s'"), Some(Value::from("it's")));
        assert_eq!(parse_default("NULL"), None);
        assert_eq!(
            parse_default("CURRENT_TIMESTAMP"),
            Some(Value::from("CURRENT_TIMESTAMP"))
        );
    }

    #[test]
    fn test_json_snapshot() {
        let mut schema = DatabaseSchema::new();
        schema.add_table(TableInfo::from_entity_schema("users", &users_schema()));
        let json = schema.to_json().expect("serialize");
        let restored = DatabaseSchema::from_json(&json).expect("deserialize");
        assert_eq!(restored, schema);
        assert_eq!(restored.table_names(), vec!["users"]);
    }
}
