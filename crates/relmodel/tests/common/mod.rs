//! Blog fixture shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use relmodel::prelude::*;

const SCHEMA: &str = "
    CREATE TABLE users (id INTEGER PRIMARY KEY, user TEXT NOT NULL, post_count INTEGER DEFAULT 0, created TEXT, updated TEXT);
    CREATE TABLE posts (id INTEGER PRIMARY KEY, author_id INTEGER, title TEXT, body TEXT, published TEXT, comment_count INTEGER DEFAULT 0, created TEXT, updated TEXT);
    CREATE TABLE comments (id INTEGER PRIMARY KEY, post_id INTEGER, user_id INTEGER, comment TEXT, published TEXT, created TEXT, updated TEXT);
    CREATE TABLE attachments (id INTEGER PRIMARY KEY, comment_id INTEGER, attachment TEXT);
    CREATE TABLE tags (id INTEGER PRIMARY KEY, tag TEXT);
    CREATE TABLE posts_tags (post_id INTEGER NOT NULL, tag_id INTEGER NOT NULL);
    CREATE TABLE categories (id INTEGER PRIMARY KEY, parent_id INTEGER, name TEXT);
    CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
    CREATE TABLE portfolios (id INTEGER PRIMARY KEY, seller TEXT);
    CREATE TABLE items_portfolios (id INTEGER PRIMARY KEY, item_id INTEGER, portfolio_id INTEGER, doomed INTEGER DEFAULT 0);
";

const ROWS: &str = "
    INSERT INTO users (id, user) VALUES (1, 'mariano'), (2, 'nate'), (3, 'larry');
    INSERT INTO posts (id, author_id, title, body, published) VALUES
        (1, 1, 'First Post', 'First Post Body', 'Y'),
        (2, 3, 'Second Post', 'Second Post Body', 'Y'),
        (3, 1, 'Third Post', 'Third Post Body', 'N'),
        (4, 9, 'Orphan Post', 'Nobody wrote this', 'N');
    INSERT INTO comments (id, post_id, user_id, comment, published) VALUES
        (1, 1, 2, 'First Comment for First Post', 'Y'),
        (2, 1, 3, 'Second Comment for First Post', 'Y'),
        (3, 1, 1, 'Third Comment for First Post', 'Y'),
        (4, 1, 1, 'Fourth Comment for First Post', 'N'),
        (5, 2, 1, 'First Comment for Second Post', 'Y');
    INSERT INTO attachments (id, comment_id, attachment) VALUES (1, 5, 'attachment.zip');
    INSERT INTO tags (id, tag) VALUES (1, 'tag1'), (2, 'tag2'), (3, 'tag3');
    INSERT INTO posts_tags (post_id, tag_id) VALUES (1, 1), (1, 2), (2, 1), (2, 3);
    INSERT INTO categories (id, parent_id, name) VALUES
        (1, 0, 'Category 1'),
        (2, 1, 'Category 1.1'),
        (3, 2, 'Category 1.1.1'),
        (4, 0, 'Category 2');
";

/// In-memory catalog with the blog entities defined and seeded.
pub fn blog() -> Catalog {
    let registry = Arc::new(DatasourceRegistry::new());
    registry.register("default", DatasourceConfig::sqlite(":memory:"));
    let catalog = Catalog::with_datasources(registry);
    let conn = catalog.datasources().resolve("default").expect("connect");
    conn.execute_raw(SCHEMA).expect("create schema");
    conn.execute_raw(ROWS).expect("seed rows");

    catalog.define(
        EntityDef::new("Post")
            .associate(
                "Author",
                AssociationSpec::belongs_to()
                    .class_name("User")
                    .foreign_key("author_id")
                    .counter_cache_column("post_count"),
            )
            .associate("Comment", AssociationSpec::has_many().dependent(true))
            .has_and_belongs_to_many("Tag")
            .validate("title", Rule::NotBlank)
            .display_field("title"),
    );
    catalog.define(
        EntityDef::new("Comment")
            .associate("Post", AssociationSpec::belongs_to().counter_cache())
            .belongs_to("User")
            .associate("Attachment", AssociationSpec::has_one().dependent(true))
            .validate("comment", Rule::NotBlank),
    );
    catalog.define(EntityDef::new("User").validate("user", Rule::NotBlank));
    catalog.define(EntityDef::new("Attachment").belongs_to("Comment"));
    catalog.define(EntityDef::new("Tag"));
    catalog.define(
        EntityDef::new("Category")
            .table("categories")
            .associate(
                "Parent",
                AssociationSpec::belongs_to()
                    .class_name("Category")
                    .foreign_key("parent_id"),
            )
            .associate(
                "Child",
                AssociationSpec::has_many()
                    .class_name("Category")
                    .foreign_key("parent_id"),
            ),
    );
    catalog.define(EntityDef::new("Item"));
    catalog.define(EntityDef::new("Portfolio").has_and_belongs_to_many("Item"));
    catalog
}

/// Run a scalar query against the default datasource.
pub fn scalar(catalog: &Catalog, sql: &str) -> i64 {
    let conn = catalog.datasources().resolve("default").expect("connect");
    conn.query_one(sql, &[])
        .expect("query")
        .and_then(|row| row.get(0).and_then(Value::as_i64))
        .expect("one integer")
}

/// Sorted `(post_id, tag_id)` join rows.
pub fn post_tags(catalog: &Catalog, post_id: i64) -> Vec<i64> {
    let conn = catalog.datasources().resolve("default").expect("connect");
    let rows = conn
        .query(
            "SELECT tag_id FROM posts_tags WHERE post_id = ? ORDER BY tag_id",
            &[Value::Int(post_id)],
        )
        .expect("query");
    rows.iter()
        .filter_map(|row| row.get(0).and_then(Value::as_i64))
        .collect()
}
