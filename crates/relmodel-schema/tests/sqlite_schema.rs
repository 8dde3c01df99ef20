//! Introspect, diff and migrate against a live SQLite database.

use relmodel_core::{ColumnDef, Connection, EntitySchema, FieldType, KeyKind, Value};
use relmodel_schema::{
    DestructivePolicy, Introspector, SchemaOperation, apply_diff, expected_schema, schema_diff,
    schema_diff_with_policy,
};
use relmodel_sqlite::SqliteConnection;

fn users() -> EntitySchema {
    EntitySchema::new(vec![
        ColumnDef::primary("id"),
        ColumnDef::new("email", FieldType::String)
            .length(120)
            .not_null()
            .key(KeyKind::Unique),
        ColumnDef::new("active", FieldType::Boolean).default_value(true),
        ColumnDef::new("created", FieldType::Datetime),
    ])
}

#[test]
fn create_then_introspect_is_stable() {
    let conn = SqliteConnection::open_memory().expect("open");
    let users = users();
    let expected = expected_schema([("users", &users)]);

    let current = Introspector::new().introspect_all(&conn).expect("introspect");
    assert!(current.tables.is_empty());

    let diff = schema_diff(&current, &expected);
    assert_eq!(diff.len(), 1);
    let applied = apply_diff(&conn, &diff).expect("apply");
    assert_eq!(applied, 2, "create table plus unique index");

    let after = Introspector::new().introspect_all(&conn).expect("introspect again");
    let again = schema_diff(&after, &expected);
    assert!(again.is_empty(), "unexpected operations: {:?}", again.operations);
}

#[test]
fn describe_returns_entity_schema() {
    let conn = SqliteConnection::open_memory().expect("open");
    conn.execute_raw(
        "CREATE TABLE posts (
            id INTEGER PRIMARY KEY,
            author_id INT(11) NOT NULL,
            title VARCHAR(50),
            published TINYINT(1) DEFAULT 0,
            comments_count INTEGER DEFAULT 0
        )",
    )
    .expect("create");

    let schema = Introspector::new().describe(&conn, "posts").expect("describe");
    let names: Vec<&str> = schema.names().collect();
    assert_eq!(
        names,
        vec!["id", "author_id", "title", "published", "comments_count"]
    );
    assert!(schema.get("id").expect("id").is_primary());
    assert!(!schema.get("author_id").expect("author_id").nullable);
    assert_eq!(schema.get("title").and_then(|c| c.length), Some(50));
    assert_eq!(
        schema.get("published").map(|c| c.ty),
        Some(FieldType::Boolean)
    );
    assert_eq!(
        schema.get("comments_count").and_then(|c| c.default.clone()),
        Some(Value::Int(0))
    );

    let missing = Introspector::new().describe(&conn, "nope");
    assert!(missing.is_err());
}

#[test]
fn drop_and_add_column_preserves_rows() {
    let conn = SqliteConnection::open_memory().expect("open");
    conn.execute_raw(
        "CREATE TABLE posts (id INTEGER PRIMARY KEY, title VARCHAR(255), legacy TEXT);
         CREATE INDEX posts_legacy ON posts (legacy);
         INSERT INTO posts (title, legacy) VALUES ('First', 'x'), ('Second', 'y');",
    )
    .expect("seed");

    let posts = EntitySchema::new(vec![
        ColumnDef::primary("id"),
        ColumnDef::new("title", FieldType::String),
        ColumnDef::new("body", FieldType::Text),
    ]);
    let expected = expected_schema([("posts", &posts)]);
    let current = Introspector::new().introspect_all(&conn).expect("introspect");

    let skipped = schema_diff_with_policy(&current, &expected, DestructivePolicy::Skip);
    assert!(!skipped.has_destructive());

    let diff = schema_diff(&current, &expected);
    assert!(diff.requires_confirmation());
    assert!(diff
        .operations
        .iter()
        .any(|op| matches!(op, SchemaOperation::DropColumn { column, .. } if column == "legacy")));
    apply_diff(&conn, &diff).expect("apply");

    let after = Introspector::new().table_info(&conn, "posts").expect("posts");
    let columns: Vec<&str> = after.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(columns, vec!["id", "title", "body"]);
    assert!(after.indexes.is_empty());

    let rows = conn
        .query("SELECT title FROM posts ORDER BY id", &[])
        .expect("query");
    let titles: Vec<String> = rows
        .iter()
        .map(|r| r.get_named::<String>("title").expect("title"))
        .collect();
    assert_eq!(titles, vec!["First", "Second"]);
}

#[test]
fn snapshot_round_trip_matches_live_schema() {
    let conn = SqliteConnection::open_memory().expect("open");
    let users = users();
    apply_diff(
        &conn,
        &schema_diff(&Default::default(), &expected_schema([("users", &users)])),
    )
    .expect("apply");

    let live = Introspector::new().introspect_all(&conn).expect("introspect");
    let json = live.to_json().expect("snapshot");
    let restored = relmodel_schema::DatabaseSchema::from_json(&json).expect("restore");
    assert!(schema_diff(&restored, &live).is_empty());
}
