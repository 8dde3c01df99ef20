//! Behaviors attached to models of the blog schema.

mod common;

use std::sync::{Arc, Mutex};

use relmodel::prelude::*;
use relmodel::{Dispatch, TriggerOptions};
use serde_json::json;

/// Answers `beforeTest` with a fixed marker.
struct Marker {
    name: &'static str,
    marker: &'static str,
}

impl Behavior for Marker {
    fn name(&self) -> &str {
        self.name
    }

    fn default_settings(&self) -> serde_json::Value {
        json!({ "beforeFind": "on" })
    }

    fn handle(&self, _ctx: &BehaviorContext<'_>, event: &str, args: &[Value]) -> Option<Value> {
        match event {
            "beforeTest" => Some(Value::from(self.marker)),
            "chain" => {
                let seed = args.first().and_then(Value::as_str).unwrap_or_default();
                Some(Value::from(format!("{seed}+{}", self.name)))
            }
            _ => None,
        }
    }
}

fn markers(catalog: &Catalog) {
    for (name, marker) in [
        ("Test", "testbehavior"),
        ("Test2", "test2behavior"),
        ("Test3", "test3behavior"),
    ] {
        catalog.register_behavior(Arc::new(Marker { name, marker }));
    }
}

/// Scopes finds to `settings.published` and fills `body` from `title`.
struct Publishing {
    saves: Mutex<Vec<bool>>,
}

impl Behavior for Publishing {
    fn name(&self) -> &str {
        "Publishing"
    }

    fn before_find(&self, ctx: &BehaviorContext<'_>, query: &FindOptions) -> HookOutcome<FindOptions> {
        match ctx.settings.get("published").and_then(serde_json::Value::as_str) {
            Some("never") => HookOutcome::Abort,
            Some(flag) => HookOutcome::Replace(
                query
                    .clone()
                    .conditions(Expr::field_is(&format!("{}.published", ctx.alias), flag)),
            ),
            None => HookOutcome::NoOp,
        }
    }

    fn after_find(&self, ctx: &BehaviorContext<'_>, results: &[Tree]) -> HookOutcome<Vec<Tree>> {
        let mut results = results.to_vec();
        for tree in &mut results {
            if let Some(record) = tree.record_mut(ctx.alias) {
                record.set("seen", true);
            }
        }
        HookOutcome::Replace(results)
    }

    fn before_validate(&self, _ctx: &BehaviorContext<'_>, data: &Record) -> HookOutcome<Record> {
        if data.get("title") == Some(&Value::from("spam")) {
            HookOutcome::Abort
        } else {
            HookOutcome::NoOp
        }
    }

    fn before_save(&self, _ctx: &BehaviorContext<'_>, data: &Record) -> HookOutcome<Record> {
        match (data.get("title").and_then(Value::as_str), data.contains("body")) {
            (Some(title), false) => {
                let body = title.to_lowercase().replace(' ', "-");
                HookOutcome::Replace(data.clone().with("body", body))
            }
            _ => HookOutcome::NoOp,
        }
    }

    fn after_save(&self, _ctx: &BehaviorContext<'_>, created: bool, _data: &Record) -> bool {
        self.saves.lock().unwrap_or_else(|e| e.into_inner()).push(created);
        true
    }

    fn before_delete(&self, ctx: &BehaviorContext<'_>, id: &Value, _cascade: bool) -> bool {
        let protected = ctx.settings.get("protect").and_then(serde_json::Value::as_i64);
        ctx.settings.get("locked") != Some(&json!(true))
            && (protected.is_none() || protected != id.as_i64())
    }

    fn methods(&self) -> &[&'static str] {
        &["slug"]
    }

    fn map_methods(&self) -> &[(&'static str, &'static str)] {
        &[(r"^findBy\w+$", "find_by")]
    }

    fn call(&self, _ctx: &BehaviorContext<'_>, method: &str, args: &[Value]) -> Value {
        match method {
            "slug" => {
                let text = args.first().and_then(Value::as_str).unwrap_or_default();
                Value::from(text.to_lowercase().replace(' ', "-"))
            }
            "find_by" => args.first().cloned().unwrap_or_default(),
            _ => Value::Null,
        }
    }
}

fn publishing(catalog: &Catalog) -> Arc<Publishing> {
    let behavior = Arc::new(Publishing {
        saves: Mutex::new(Vec::new()),
    });
    catalog.register_behavior(behavior.clone());
    behavior
}

// ==================== Settings ====================

#[test]
fn settings_are_isolated_per_instance() {
    let catalog = common::blog();
    markers(&catalog);
    let mut first = catalog.model("Post").expect("model");
    let mut second = catalog.model("Post").expect("model");

    first.attach("Test", json!({ "key": "value" })).expect("attach");
    second.attach("Test", json!({ "key2": "value2" })).expect("attach");
    assert_eq!(
        first.behaviors().settings("Test"),
        Some(&json!({ "beforeFind": "on", "key": "value" }))
    );
    assert_eq!(
        second.behaviors().settings("Test"),
        Some(&json!({ "beforeFind": "on", "key2": "value2" }))
    );

    first.attach("Test", json!({ "key": "changed" })).expect("attach");
    assert_eq!(
        first.behaviors().settings("Test"),
        Some(&json!({ "beforeFind": "on", "key": "changed" }))
    );
    assert_eq!(
        second.behaviors().settings("Test"),
        Some(&json!({ "beforeFind": "on", "key2": "value2" }))
    );
}

#[test]
fn detach_keeps_settings_for_reattach() {
    let catalog = common::blog();
    markers(&catalog);
    let mut post = catalog.model("Post").expect("model");

    post.attach("Test", json!({ "key": "value" })).expect("attach");
    assert!(post.detach("Test"));
    assert!(!post.behaviors().is_attached("Test"));
    post.attach("Test", serde_json::Value::Null).expect("attach");
    assert_eq!(
        post.behaviors().settings("Test"),
        Some(&json!({ "beforeFind": "on", "key": "value" }))
    );
}

#[test]
fn enabled_flag_in_config_toggles_behavior() {
    let catalog = common::blog();
    markers(&catalog);
    let mut post = catalog.model("Post").expect("model");

    post.attach("Test", json!({ "enabled": false })).expect("attach");
    assert!(post.behaviors().is_attached("Test"));
    assert!(!post.behaviors().is_enabled("Test"));
    assert_eq!(post.behaviors().settings("Test"), Some(&json!({ "beforeFind": "on" })));

    post.attach("Test", json!({ "enabled": true })).expect("attach");
    assert_eq!(post.behaviors().enabled(), vec!["Test".to_string()]);
}

#[test]
fn unregistered_behavior_is_an_error() {
    let catalog = common::blog();
    let mut post = catalog.model("Post").expect("model");
    assert!(post.attach("Nope", json!({})).is_err());

    catalog.define(EntityDef::new("Draft").table("posts").behavior("Nope", json!({})));
    assert!(catalog.model("Draft").is_err());
}

// ==================== Trigger ====================

#[test]
fn trigger_stops_at_break_value() {
    let catalog = common::blog();
    markers(&catalog);
    let mut post = catalog.model("Post").expect("model");
    for name in ["Test", "Test2", "Test3"] {
        post.attach(name, json!({})).expect("attach");
    }

    let all = post.trigger("beforeTest", &[], &TriggerOptions::new());
    assert_eq!(
        all,
        vec![
            Value::from("testbehavior"),
            Value::from("test2behavior"),
            Value::from("test3behavior"),
        ]
    );

    let stopped = post.trigger(
        "beforeTest",
        &[],
        &TriggerOptions::new().break_on("test2behavior"),
    );
    assert_eq!(
        stopped,
        vec![Value::from("testbehavior"), Value::from("test2behavior")]
    );

    post.behaviors_mut().disable("Test2");
    let skipped = post.trigger(
        "beforeTest",
        &[],
        &TriggerOptions::new().break_on("test2behavior"),
    );
    assert_eq!(
        skipped,
        vec![Value::from("testbehavior"), Value::from("test3behavior")]
    );
}

#[test]
fn trigger_mod_params_chains_results() {
    let catalog = common::blog();
    markers(&catalog);
    let mut post = catalog.model("Post").expect("model");
    for name in ["Test", "Test2", "Test3"] {
        post.attach(name, json!({})).expect("attach");
    }

    let results = post.trigger(
        "chain",
        &[Value::from("seed")],
        &TriggerOptions::new().mod_params(true),
    );
    assert_eq!(
        results.last(),
        Some(&Value::from("seed+Test+Test2+Test3"))
    );
    assert!(post.trigger("unknown", &[], &TriggerOptions::new()).is_empty());
}

// ==================== Lifecycle hooks ====================

#[test]
fn before_find_scopes_and_aborts() {
    let catalog = common::blog();
    publishing(&catalog);
    let mut post = catalog.model("Post").expect("model");

    post.attach("Publishing", json!({ "published": "Y" })).expect("attach");
    assert_eq!(post.find_count(FindOptions::new()).expect("count"), 2);

    post.attach("Publishing", json!({ "published": "never" })).expect("attach");
    assert!(post.find_all(FindOptions::new()).expect("find").is_empty());
    assert_eq!(post.find_count(FindOptions::new()).expect("count"), 0);

    let unfiltered = post
        .find_all(FindOptions::new().callbacks(Callbacks::None))
        .expect("find");
    assert_eq!(unfiltered.len(), 4);
}

#[test]
fn after_find_replaces_results() {
    let catalog = common::blog();
    publishing(&catalog);
    let mut post = catalog.model("Post").expect("model");
    post.attach("Publishing", json!({})).expect("attach");

    let tree = post
        .find_first(FindOptions::new().conditions(Expr::field_is("Post.id", 1)))
        .expect("find")
        .expect("post");
    assert_eq!(tree.value("Post.seen"), Some(&Value::Bool(true)));

    let raw = post
        .find_first(
            FindOptions::new()
                .conditions(Expr::field_is("Post.id", 1))
                .callbacks(Callbacks::Before),
        )
        .expect("find")
        .expect("post");
    assert!(raw.value("Post.seen").is_none());
}

#[test]
fn save_hooks_rewrite_veto_and_observe() {
    let catalog = common::blog();
    let behavior = publishing(&catalog);
    let mut post = catalog.model("Post").expect("model");
    post.attach("Publishing", json!({})).expect("attach");

    assert!(post
        .save(Tree::single("Post", record! { "title" => "Hello World" }), SaveOptions::new())
        .expect("save"));
    assert_eq!(
        post.field("body", None).expect("field"),
        Some(Value::from("hello-world"))
    );
    // Still bound to the row created above, so this is an update.
    assert!(post
        .save(Tree::single("Post", record! { "title" => "Again" }), SaveOptions::new())
        .expect("save"));

    let vetoed = post
        .save(Tree::single("Post", record! { "title" => "spam" }), SaveOptions::new())
        .expect("save");
    assert!(!vetoed);
    assert_eq!(
        common::scalar(&catalog, "SELECT COUNT(*) FROM posts WHERE title = 'spam'"),
        0
    );

    let quiet = post
        .save(
            Tree::single("Post", record! { "title" => "No hooks" }),
            SaveOptions::new().callbacks(false),
        )
        .expect("save");
    assert!(quiet);

    let saves = behavior.saves.lock().expect("lock").clone();
    assert_eq!(saves, vec![true, false]);
}

#[test]
fn before_delete_can_veto() {
    let catalog = common::blog();
    publishing(&catalog);
    let mut post = catalog.model("Post").expect("model");
    post.attach("Publishing", json!({ "locked": true })).expect("attach");

    assert!(!post.delete(Some(Value::Int(3)), true).expect("delete"));
    assert_eq!(common::scalar(&catalog, "SELECT COUNT(*) FROM posts"), 4);

    assert!(post.delete_all(Some(Expr::field_is("Post.id", 3)), false, false).expect("delete"));
    assert_eq!(common::scalar(&catalog, "SELECT COUNT(*) FROM posts"), 3);
}

#[test]
fn vetoed_row_does_not_undo_delete_all() {
    let catalog = common::blog();
    publishing(&catalog);
    let mut post = catalog.model("Post").expect("model");
    post.attach("Publishing", json!({ "protect": 2 })).expect("attach");

    assert!(!post.delete_all(None, false, true).expect("delete"));
    assert_eq!(common::scalar(&catalog, "SELECT COUNT(*) FROM posts"), 1);
    assert_eq!(common::scalar(&catalog, "SELECT id FROM posts"), 2);
}

// ==================== Methods ====================

#[test]
fn methods_dispatch_by_name_and_pattern() {
    let catalog = common::blog();
    publishing(&catalog);
    let mut post = catalog.model("Post").expect("model");
    post.attach("Publishing", json!({})).expect("attach");

    assert_eq!(
        post.dispatch_method("slug", &[Value::from("Hello World")]),
        Dispatch::Handled {
            behavior: "Publishing".to_string(),
            value: Value::from("hello-world"),
        }
    );
    assert_eq!(
        post.dispatch_method("findByTitle", &[Value::from("x")]),
        Dispatch::Handled {
            behavior: "Publishing".to_string(),
            value: Value::from("findByTitle"),
        }
    );
    assert_eq!(post.dispatch_method("publish", &[]), Dispatch::Unhandled);

    post.behaviors_mut().disable("Publishing");
    assert!(matches!(
        post.dispatch_method("slug", &[Value::from("a b")]),
        Dispatch::Handled { .. }
    ));

    post.detach("Publishing");
    assert_eq!(post.dispatch_method("slug", &[]), Dispatch::Unhandled);
}
