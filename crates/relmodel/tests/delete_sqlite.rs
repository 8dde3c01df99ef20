//! Deletes and bulk updates against the seeded blog schema.

mod common;

use relmodel::prelude::*;

fn count(catalog: &Catalog, table: &str) -> i64 {
    common::scalar(catalog, &format!("SELECT COUNT(*) FROM {table}"))
}

#[test]
fn cascade_removes_dependents_and_links() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    assert!(post.delete(Some(Value::Int(2)), true).expect("delete"));
    assert!(post.id().is_none());
    assert_eq!(count(&catalog, "posts"), 3);
    assert_eq!(
        common::scalar(&catalog, "SELECT COUNT(*) FROM comments WHERE post_id = 2"),
        0
    );
    assert_eq!(count(&catalog, "attachments"), 0, "grandchild cascade");
    assert!(common::post_tags(&catalog, 2).is_empty());
    assert_eq!(common::post_tags(&catalog, 1), vec![1, 2]);
}

#[test]
fn delete_without_cascade_keeps_children() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    assert!(post.delete(Some(Value::Int(1)), false).expect("delete"));
    assert_eq!(count(&catalog, "comments"), 5);
    assert!(common::post_tags(&catalog, 1).is_empty());
}

#[test]
fn deleting_missing_record_returns_false() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    assert!(!post.delete(Some(Value::Int(99)), true).expect("delete"));
    assert!(!post.delete(None, true).expect("delete"));
    assert_eq!(count(&catalog, "posts"), 4);
}

#[test]
fn exclusive_dependents_skip_their_own_cascade() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");
    post.bind_model(
        vec![(
            "Comment".to_string(),
            AssociationSpec::has_many().dependent(true).exclusive(true),
        )],
        true,
    );

    assert!(post.delete(Some(Value::Int(2)), true).expect("delete"));
    assert_eq!(
        common::scalar(&catalog, "SELECT COUNT(*) FROM comments WHERE post_id = 2"),
        0
    );
    assert_eq!(count(&catalog, "attachments"), 1, "bulk delete runs no cascade");
}

#[test]
fn dependent_conditions_limit_cascade() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");
    post.bind_model(
        vec![(
            "Comment".to_string(),
            AssociationSpec::has_many()
                .dependent(true)
                .conditions(Expr::field_is("Comment.published", "N")),
        )],
        true,
    );

    assert!(post.delete(Some(Value::Int(1)), true).expect("delete"));
    assert_eq!(
        common::scalar(&catalog, "SELECT COUNT(*) FROM comments WHERE post_id = 1"),
        3
    );
}

#[test]
fn transient_unbind_skips_cascade_for_one_delete() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    assert_eq!(post.unbind_model(&[(AssociationKind::HasMany, "Comment")], false), 1);
    assert!(post.delete(Some(Value::Int(1)), true).expect("delete"));
    assert_eq!(
        common::scalar(&catalog, "SELECT COUNT(*) FROM comments WHERE post_id = 1"),
        4
    );
    assert!(post.association("Comment").is_some());

    assert!(post.delete(Some(Value::Int(2)), true).expect("delete"));
    assert_eq!(
        common::scalar(&catalog, "SELECT COUNT(*) FROM comments WHERE post_id = 2"),
        0
    );
}

#[test]
fn delete_all_bulk_and_cascading() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let bulk = post
        .delete_all(Some(Expr::field_is("Post.published", "N")), false, false)
        .expect("delete");
    assert!(bulk);
    assert_eq!(count(&catalog, "posts"), 2);

    let cascading = post
        .delete_all(Some(Expr::field_is("Author.user", "mariano")), true, true)
        .expect("delete");
    assert!(cascading);
    assert_eq!(count(&catalog, "posts"), 1);
    assert_eq!(
        common::scalar(&catalog, "SELECT COUNT(*) FROM comments WHERE post_id = 1"),
        0
    );
    assert_eq!(count(&catalog, "comments"), 1);
}

#[test]
fn update_all_sets_literals_and_expressions() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let changed = post
        .update_all(
            vec![("Post.published".to_string(), Expr::lit("Y"))],
            Some(Expr::field_is("Post.author_id", 1)),
        )
        .expect("update");
    assert_eq!(changed, 2);
    assert_eq!(
        common::scalar(&catalog, "SELECT COUNT(*) FROM posts WHERE published = 'Y'"),
        3
    );

    let bumped = post
        .update_all(
            vec![("comment_count".to_string(), Expr::col("comment_count").add(10))],
            None,
        )
        .expect("update");
    assert_eq!(bumped, 4);
    assert_eq!(
        common::scalar(&catalog, "SELECT comment_count FROM posts WHERE id = 4"),
        10
    );
}

#[test]
fn update_all_filters_through_joined_parent() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let changed = post
        .update_all(
            vec![("title".to_string(), Expr::lit("By Larry"))],
            Some(Expr::field_is("Author.user", "larry")),
        )
        .expect("update");
    assert_eq!(changed, 1);
    assert_eq!(
        common::scalar(&catalog, "SELECT COUNT(*) FROM posts WHERE title = 'By Larry' AND id = 2"),
        1
    );
}

#[test]
fn update_all_without_matches_changes_nothing() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");

    let changed = post
        .update_all(
            vec![("title".to_string(), Expr::lit("Nope"))],
            Some(Expr::field_is("Post.id", 42)),
        )
        .expect("update");
    assert_eq!(changed, 0);
}
