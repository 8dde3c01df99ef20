//! Reads against the seeded blog schema.

mod common;

use relmodel::prelude::*;
use relmodel::ListResult;

fn by_id(alias: &str, id: i64) -> FindOptions {
    FindOptions::new().conditions(Expr::field_is(&format!("{alias}.id"), id))
}

// ==================== Placeholders ====================

#[test]
fn missing_parent_yields_null_placeholder() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let tree = post
        .find_first(by_id("Post", 4).recursive(0))
        .expect("find")
        .expect("orphan post");

    let author = tree.record("Author").expect("Author entry is always present");
    for column in ["id", "user", "post_count", "created", "updated"] {
        assert_eq!(author.get(column), Some(&Value::Null), "Author.{column}");
    }
}

#[test]
fn missing_has_one_child_yields_placeholder_in_nested_fetch() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let tree = post
        .find_first(by_id("Post", 1).recursive(1))
        .expect("find")
        .expect("post");
    let comments = tree.records("Comment").expect("comments");
    assert_eq!(comments.len(), 4);
    for comment in comments {
        let attachment = comment
            .related("Attachment")
            .and_then(Related::as_one)
            .expect("placeholder attachment");
        assert_eq!(attachment.get("id"), Some(&Value::Null));
        assert_eq!(attachment.get("attachment"), Some(&Value::Null));
    }
}

// ==================== Recursion ====================

#[test]
fn recursion_depth_bounds_nesting() {
    let catalog = common::blog();
    let mut category = catalog.model("Category").expect("model");

    let tree = category
        .find_first(by_id("Category", 3).recursive(1))
        .expect("find")
        .expect("category");
    let parent = tree.record("Parent").expect("parent");
    assert_eq!(parent.get("id"), Some(&Value::Int(2)));
    let grandparent = parent
        .related("Parent")
        .and_then(Related::as_one)
        .expect("grandparent at depth 1");
    assert_eq!(grandparent.get("id"), Some(&Value::Int(1)));
    assert!(grandparent.related("Parent").is_none());
    assert_eq!(tree.records("Child").map(<[Record]>::len), Some(0));

    let shallow = category
        .find_first(by_id("Category", 3).recursive(0))
        .expect("find")
        .expect("category");
    let parent = shallow.record("Parent").expect("parent");
    assert!(parent.related("Parent").is_none());
    assert!(!shallow.contains("Child"));

    let bare = category
        .find_first(by_id("Category", 3).recursive(-1))
        .expect("find")
        .expect("category");
    assert_eq!(bare.len(), 1);
}

#[test]
fn habtm_targets_carry_join_row() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let tree = post
        .find_first(by_id("Post", 1))
        .expect("find")
        .expect("post");
    let tags = tree.records("Tag").expect("tags");
    let mut names: Vec<&Value> = tags.iter().filter_map(|t| t.get("tag")).collect();
    names.sort_by_key(|v| v.to_key_string());
    assert_eq!(names, vec![&Value::from("tag1"), &Value::from("tag2")]);

    let link = tags[0]
        .related("PostsTag")
        .and_then(Related::as_one)
        .expect("join row");
    assert_eq!(link.get("post_id"), Some(&Value::Int(1)));
}

// ==================== Association binding ====================

#[test]
fn transient_unbind_lasts_one_find() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    assert_eq!(post.unbind_model(&[(AssociationKind::HasMany, "Comment")], false), 1);
    let tree = post.find_first(by_id("Post", 1)).expect("find").expect("post");
    assert!(!tree.contains("Comment"));

    let tree = post.find_first(by_id("Post", 1)).expect("find").expect("post");
    assert_eq!(tree.records("Comment").map(<[Record]>::len), Some(4));
}

#[test]
fn permanent_unbind_lasts_until_reset() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    post.unbind_model(&[(AssociationKind::HasMany, "Comment")], true);
    for _ in 0..2 {
        let tree = post.find_first(by_id("Post", 1)).expect("find").expect("post");
        assert!(!tree.contains("Comment"));
    }

    post.reset_associations();
    let tree = post.find_first(by_id("Post", 1)).expect("find").expect("post");
    assert_eq!(tree.records("Comment").map(<[Record]>::len), Some(4));
}

#[test]
fn find_option_bind_is_transient() {
    let catalog = common::blog();
    let mut user = catalog.model("User").expect("model");

    let options = by_id("User", 1).bind(
        "Post",
        AssociationSpec::has_many().foreign_key("author_id").order("Post.id"),
    );
    let tree = user.find_first(options).expect("find").expect("user");
    let titles: Vec<&Value> = tree
        .records("Post")
        .expect("bound posts")
        .iter()
        .filter_map(|p| p.get("title"))
        .collect();
    assert_eq!(titles, vec![&Value::from("First Post"), &Value::from("Third Post")]);
    assert!(user.association("Post").is_none());
}

#[test]
fn failing_association_fetch_is_isolated() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let options = by_id("Post", 1).bind("Ghost", AssociationSpec::has_many());
    let tree = post.find_first(options).expect("root find survives").expect("post");
    assert_eq!(tree.records("Ghost").map(<[Record]>::len), Some(0));
    assert_eq!(tree.value("Post.title"), Some(&Value::from("First Post")));
}

// ==================== Counting and listing ====================

#[test]
fn count_ignores_order() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");
    let published = || FindOptions::new().conditions(Expr::field_is("Post.published", "Y"));

    let plain = post.find_count(published()).expect("count");
    let ordered = post
        .find_count(published().order("Post.title DESC").order("Author.user ASC"))
        .expect("count");
    assert_eq!(plain, 2);
    assert_eq!(plain, ordered);
    assert_eq!(post.find_count(FindOptions::new()).expect("count"), 4);
}

#[test]
fn count_filters_on_joined_parent() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let count = post
        .find_count(FindOptions::new().conditions(Expr::field_is("Author.user", "mariano")))
        .expect("count");
    assert_eq!(count, 2);
}

#[test]
fn list_maps_key_to_display_field() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let list = post.find_list(FindOptions::new().order("Post.id")).expect("list");
    assert_eq!(list.len(), 4);
    assert_eq!(list.get(&Value::Int(2)), Some(&Value::from("Second Post")));
    match list {
        ListResult::Flat(pairs) => assert_eq!(pairs[0].0, Value::Int(1)),
        other => panic!("expected a flat list, got {other:?}"),
    }
}

#[test]
fn list_groups_by_third_field() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let list = post
        .find_list(
            FindOptions::new()
                .fields(["Post.id", "Post.title", "Post.author_id"])
                .order("Post.id"),
        )
        .expect("list");
    let mariano = list.group(&Value::Int(1)).expect("group for author 1");
    assert_eq!(mariano.len(), 2);
    assert_eq!(mariano[1].1, Value::from("Third Post"));
    assert_eq!(list.group(&Value::Int(3)).map(<[(Value, Value)]>::len), Some(1));
}

#[test]
fn neighbors_around_value() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let neighbors = post
        .find_neighbors("id", 2, FindOptions::new().recursive(-1))
        .expect("neighbors");
    let prev = neighbors.prev.expect("prev");
    let next = neighbors.next.expect("next");
    assert_eq!(prev.value("Post.id"), Some(&Value::Int(1)));
    assert_eq!(next.value("Post.id"), Some(&Value::Int(3)));

    let edge = post
        .find_neighbors("id", 1, FindOptions::new().recursive(-1))
        .expect("neighbors");
    assert!(edge.prev.is_none());
}

#[test]
fn threaded_nests_by_parent_id() {
    let catalog = common::blog();
    let mut category = catalog.model("Category").expect("model");

    let roots = category
        .find_threaded(FindOptions::new().order("Category.id").recursive(-1))
        .expect("threaded");
    assert_eq!(roots.len(), 2);
    assert_eq!(roots[0].tree.value("Category.name"), Some(&Value::from("Category 1")));
    let leaf = &roots[0].children[0].children[0];
    assert_eq!(leaf.tree.value("Category.name"), Some(&Value::from("Category 1.1.1")));
    assert!(leaf.children.is_empty());
    assert!(roots[1].children.is_empty());
}

// ==================== Fields ====================

#[test]
fn virtual_fields_select_and_filter() {
    let catalog = common::blog();
    catalog.define(
        EntityDef::new("Headline")
            .table("posts")
            .virtual_field("shout", "UPPER({alias}.title)"),
    );
    let mut headline = catalog.model("Headline").expect("model");

    let tree = headline
        .find_first(
            FindOptions::new()
                .fields(["Headline.id", "shout"])
                .conditions(Expr::field_is("shout", "SECOND POST")),
        )
        .expect("find")
        .expect("row");
    assert_eq!(tree.value("Headline.id"), Some(&Value::Int(2)));
    assert_eq!(tree.value("Headline.shout"), Some(&Value::from("SECOND POST")));
}

#[test]
fn computed_fields_land_in_root_record() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let rows = post
        .find_all(
            FindOptions::new()
                .fields(["Post.author_id", "COUNT(*) AS total"])
                .group("Post.author_id")
                .order("Post.author_id")
                .recursive(-1),
        )
        .expect("find");
    let totals: Vec<(Option<&Value>, Option<&Value>)> = rows
        .iter()
        .map(|t| (t.value("Post.author_id"), t.value("Post.total")))
        .collect();
    assert_eq!(
        totals,
        vec![
            (Some(&Value::Int(1)), Some(&Value::Int(2))),
            (Some(&Value::Int(3)), Some(&Value::Int(1))),
            (Some(&Value::Int(9)), Some(&Value::Int(1))),
        ]
    );
}

#[test]
fn computed_alias_with_separator_stays_on_root() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let tree = post
        .find_first(
            FindOptions::new()
                .fields(["Post.id", "COUNT(*) AS per__author"])
                .group("Post.author_id")
                .conditions(Expr::field_is("Post.author_id", 1))
                .recursive(-1),
        )
        .expect("find")
        .expect("row");
    assert_eq!(tree.value("Post.per__author"), Some(&Value::Int(2)));
    assert!(!tree.contains("per"));
}

#[test]
fn tableless_entity_finds_nothing() {
    let catalog = common::blog();
    catalog.define(EntityDef::new("Scratch").without_table());
    let mut scratch = catalog.model("Scratch").expect("model");

    assert!(scratch.find_all(FindOptions::new()).expect("find").is_empty());
    assert!(scratch.find_first(FindOptions::new()).expect("find").is_none());
    assert_eq!(scratch.find_count(FindOptions::new()).expect("count"), 0);
}

#[test]
fn read_loads_current_record() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let tree = post
        .read(&["title"], Some(Value::Int(3)))
        .expect("read")
        .expect("row");
    assert_eq!(tree.value("Post.title"), Some(&Value::from("Third Post")));
    assert_eq!(post.data().get("title"), Some(&Value::from("Third Post")));
    assert_eq!(
        post.field("title", Some(Expr::field_is("Post.id", 1))).expect("field"),
        Some(Value::from("First Post"))
    );
}

// ==================== Cache and errors ====================

#[test]
fn cached_reads_are_invalidated_by_writes() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");
    post.set_cache_queries(true);

    assert_eq!(post.find_count(FindOptions::new()).expect("count"), 4);
    let conn = catalog.datasources().resolve("default").expect("connect");
    conn.execute_raw("INSERT INTO posts (title) VALUES ('Sneaky')").expect("insert");
    assert_eq!(post.find_count(FindOptions::new()).expect("count"), 4);

    let saved = post
        .save(Tree::single("Post", record! { "title" => "Proper" }), SaveOptions::new())
        .expect("save");
    assert!(saved);
    assert_eq!(post.find_count(FindOptions::new()).expect("count"), 6);
}

#[test]
fn unknown_datasource_is_configuration_error() {
    let catalog = common::blog();
    catalog.define(EntityDef::new("Ghost").datasource("nowhere"));
    let mut ghost = catalog.model("Ghost").expect("model");

    let err = ghost.find_all(FindOptions::new()).expect_err("no datasource");
    assert!(err.is_configuration_error(), "{err}");
}
