//! Column definitions and per-entity schemas.
//!
//! An [`EntitySchema`] is the ordered column list of one mapped table. It is
//! either declared on the entity or read from the live table, and supplies
//! type coercion for values written through the engine.

use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Abstract column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    BigInteger,
    Float,
    Decimal,
    String,
    Text,
    Boolean,
    Date,
    Datetime,
    Timestamp,
    Time,
    Binary,
    Json,
}

impl FieldType {
    /// Map a declared SQL type (`VARCHAR(255)`, `int(11)`, `DATETIME`) to a
    /// field type and optional length.
    pub fn from_sql(sql_type: &str) -> (Self, Option<u32>) {
        let upper = sql_type.trim().to_uppercase();
        let (base, length) = match upper.find('(') {
            Some(open) => {
                let inner = upper[open + 1..].trim_end_matches(')');
                let first = inner.split(',').next().unwrap_or_default().trim();
                (upper[..open].trim().to_string(), first.parse::<u32>().ok())
            }
            None => (upper.clone(), None),
        };

        let ty = match base.as_str() {
            "BIGINT" => FieldType::BigInteger,
            b if b.contains("INT") => FieldType::Integer,
            "BOOLEAN" | "BOOL" => FieldType::Boolean,
            "FLOAT" | "REAL" | "DOUBLE" | "DOUBLE PRECISION" => FieldType::Float,
            "DECIMAL" | "NUMERIC" => FieldType::Decimal,
            "DATETIME" => FieldType::Datetime,
            "TIMESTAMP" => FieldType::Timestamp,
            "DATE" => FieldType::Date,
            "TIME" => FieldType::Time,
            "BLOB" | "BINARY" | "VARBINARY" => FieldType::Binary,
            "JSON" | "JSONB" => FieldType::Json,
            b if b.contains("CHAR") => FieldType::String,
            b if b.contains("CLOB") || b.contains("TEXT") => FieldType::Text,
            "" => FieldType::Text,
            _ => FieldType::String,
        };

        // TINYINT(1) is the conventional boolean column
        if ty == FieldType::Integer && base == "TINYINT" && length == Some(1) {
            return (FieldType::Boolean, None);
        }
        (ty, length)
    }

    /// SQL type name used when rendering DDL.
    pub fn sql_name(self, length: Option<u32>) -> String {
        match (self, length) {
            (FieldType::String, Some(len)) => format!("VARCHAR({len})"),
            (FieldType::String, None) => "VARCHAR(255)".to_string(),
            (FieldType::Integer, _) => "INTEGER".to_string(),
            (FieldType::BigInteger, _) => "BIGINT".to_string(),
            (FieldType::Float, _) => "FLOAT".to_string(),
            (FieldType::Decimal, _) => "DECIMAL".to_string(),
            (FieldType::Text, _) => "TEXT".to_string(),
            (FieldType::Boolean, _) => "BOOLEAN".to_string(),
            (FieldType::Date, _) => "DATE".to_string(),
            (FieldType::Datetime, _) => "DATETIME".to_string(),
            (FieldType::Timestamp, _) => "TIMESTAMP".to_string(),
            (FieldType::Time, _) => "TIME".to_string(),
            (FieldType::Binary, _) => "BLOB".to_string(),
            (FieldType::Json, _) => "JSON".to_string(),
        }
    }

    pub const fn is_numeric(self) -> bool {
        matches!(
            self,
            FieldType::Integer | FieldType::BigInteger | FieldType::Float | FieldType::Decimal
        )
    }

    pub const fn is_text(self) -> bool {
        matches!(self, FieldType::String | FieldType::Text)
    }

    /// Coerce a value about to be written into this column.
    ///
    /// Empty strings become NULL for non-text columns; numeric text becomes a
    /// number; booleans are stored as 0/1.
    pub fn coerce_for_write(self, value: Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (ty, Value::Text(s)) if s.is_empty() && !ty.is_text() => Value::Null,
            (FieldType::Integer | FieldType::BigInteger, Value::Text(s)) => match s.trim().parse() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::Text(s),
            },
            (FieldType::Float, Value::Text(s)) => match s.trim().parse() {
                Ok(f) => Value::Double(f),
                Err(_) => Value::Text(s),
            },
            (FieldType::Boolean, v) => match v.as_bool() {
                Some(b) => Value::Int(i64::from(b)),
                None => v,
            },
            (FieldType::Json, Value::Json(j)) => Value::Text(j.to_string()),
            (_, v) => v,
        }
    }

    /// Coerce a value read from storage.
    pub fn coerce_for_read(self, value: Value) -> Value {
        match (self, value) {
            (FieldType::Boolean, Value::Int(i)) => Value::Bool(i != 0),
            (FieldType::Json, Value::Text(s)) => match serde_json::from_str(&s) {
                Ok(j) => Value::Json(j),
                Err(_) => Value::Text(s),
            },
            (_, v) => v,
        }
    }
}

/// Index role of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Primary,
    Unique,
    Index,
}

/// One column of an entity schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub length: Option<u32>,
    #[serde(default)]
    pub key: Option<KeyKind>,
}

impl ColumnDef {
    /// Create a nullable column with no default.
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
            default: None,
            length: None,
            key: None,
        }
    }

    /// Integer primary key column.
    pub fn primary(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer).not_null().key(KeyKind::Primary)
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn key(mut self, key: KeyKind) -> Self {
        self.key = Some(key);
        self
    }

    pub fn is_primary(&self) -> bool {
        self.key == Some(KeyKind::Primary)
    }
}

/// Ordered column list of one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntitySchema {
    columns: Vec<ColumnDef>,
}

impl EntitySchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Look up a column by name.
    pub fn get(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Column names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Append a column, replacing any existing column with the same name.
    pub fn push(&mut self, column: ColumnDef) {
        if let Some(existing) = self.columns.iter_mut().find(|c| c.name == column.name) {
            *existing = column;
        } else {
            self.columns.push(column);
        }
    }

    /// Coerce a value bound for `column`; unknown columns pass through.
    pub fn coerce_for_write(&self, column: &str, value: Value) -> Value {
        match self.get(column) {
            Some(def) => def.ty.coerce_for_write(value),
            None => value,
        }
    }

    /// Coerce a value read from `column`; unknown columns pass through.
    pub fn coerce_for_read(&self, column: &str, value: Value) -> Value {
        match self.get(column) {
            Some(def) => def.ty.coerce_for_read(value),
            None => value,
        }
    }
}

impl FromIterator<ColumnDef> for EntitySchema {
    fn from_iter<I: IntoIterator<Item = ColumnDef>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_declared_sql_types() {
        assert_eq!(
            FieldType::from_sql("VARCHAR(255)"),
            (FieldType::String, Some(255))
        );
        assert_eq!(FieldType::from_sql("int(11)"), (FieldType::Integer, Some(11)));
        assert_eq!(FieldType::from_sql("tinyint(1)"), (FieldType::Boolean, None));
        assert_eq!(FieldType::from_sql("DATETIME"), (FieldType::Datetime, None));
        assert_eq!(FieldType::from_sql("decimal(10,2)"), (FieldType::Decimal, Some(10)));
        assert_eq!(FieldType::from_sql("text"), (FieldType::Text, None));
        assert_eq!(FieldType::from_sql(""), (FieldType::Text, None));
    }

    #[test]
    fn coerces_writes_and_reads() {
        assert_eq!(
            FieldType::Integer.coerce_for_write(Value::from("42")),
            Value::Int(42)
        );
        assert_eq!(FieldType::Integer.coerce_for_write(Value::from("")), Value::Null);
        assert_eq!(FieldType::String.coerce_for_write(Value::from("")), Value::from(""));
        assert_eq!(
            FieldType::Boolean.coerce_for_write(Value::Bool(true)),
            Value::Int(1)
        );
        assert_eq!(
            FieldType::Boolean.coerce_for_read(Value::Int(0)),
            Value::Bool(false)
        );
    }

    #[test]
    fn schema_lookup_and_replace() {
        let mut schema: EntitySchema = vec![
            ColumnDef::primary("id"),
            ColumnDef::new("title", FieldType::String).length(50),
        ]
        .into_iter()
        .collect();
        assert!(schema.has("title"));
        assert_eq!(schema.names().collect::<Vec<_>>(), vec!["id", "title"]);

        schema.push(ColumnDef::new("title", FieldType::Text));
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.get("title").map(|c| c.ty), Some(FieldType::Text));
        assert!(schema.get("id").is_some_and(ColumnDef::is_primary));
    }

    #[test]
    fn schema_serializes_as_column_list() {
        let schema = EntitySchema::new(vec![ColumnDef::primary("id")]);
        let json = serde_json::to_value(&schema).expect("serialize schema");
        assert_eq!(json[0]["name"], "id");
        assert_eq!(json[0]["type"], "integer");
        assert_eq!(json[0]["key"], "primary");
    }
}
