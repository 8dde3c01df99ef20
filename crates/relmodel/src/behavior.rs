//! Behaviors: reusable hooks attached to model instances.
//!
//! Behavior code is shared (`Arc<dyn Behavior>`), but every
//! [`BehaviorCollection`] keeps its own settings bucket per behavior, so two
//! models of the same entity never see each other's configuration.
//!
//! Lifecycle hooks answer with a [`HookOutcome`]:
//!
//! | Outcome      | Effect                                             |
//! |--------------|----------------------------------------------------|
//! | `NoOp`       | continue with the current value                    |
//! | `Replace(v)` | continue with `v` (later behaviors see `v`)        |
//! | `Abort`      | stop: empty find result, or a save returning false |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use relmodel_core::{Error, Value};

use crate::find::FindOptions;
use crate::tree::{Record, Tree};

/// Result of a lifecycle hook.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HookOutcome<T> {
    /// Proceed unchanged.
    #[default]
    NoOp,
    /// Proceed with this value instead.
    Replace(T),
    /// Stop the operation.
    Abort,
}

/// What a behavior sees of the model it runs for.
#[derive(Debug, Clone, Copy)]
pub struct BehaviorContext<'a> {
    /// Alias of the model instance.
    pub alias: &'a str,
    /// Entity name of the model instance.
    pub entity: &'a str,
    /// This instance's settings for the behavior.
    pub settings: &'a serde_json::Value,
}

/// A reusable set of hooks and methods.
///
/// Every method has a no-op default; implement only what you need.
pub trait Behavior: Send + Sync {
    /// Name used to attach, detach and report the behavior.
    fn name(&self) -> &str;

    /// Settings a fresh bucket starts from before the attach config merges in.
    fn default_settings(&self) -> serde_json::Value {
        serde_json::Value::Object(serde_json::Map::new())
    }

    fn before_find(&self, _ctx: &BehaviorContext<'_>, _query: &FindOptions) -> HookOutcome<FindOptions> {
        HookOutcome::NoOp
    }

    fn after_find(&self, _ctx: &BehaviorContext<'_>, _results: &[Tree]) -> HookOutcome<Vec<Tree>> {
        HookOutcome::NoOp
    }

    fn before_validate(&self, _ctx: &BehaviorContext<'_>, _data: &Record) -> HookOutcome<Record> {
        HookOutcome::NoOp
    }

    fn before_save(&self, _ctx: &BehaviorContext<'_>, _data: &Record) -> HookOutcome<Record> {
        HookOutcome::NoOp
    }

    /// Runs after a committed save. The return value is recorded, never
    /// acted on.
    fn after_save(&self, _ctx: &BehaviorContext<'_>, _created: bool, _data: &Record) -> bool {
        true
    }

    /// Return false to veto the delete.
    fn before_delete(&self, _ctx: &BehaviorContext<'_>, _id: &Value, _cascade: bool) -> bool {
        true
    }

    fn after_delete(&self, _ctx: &BehaviorContext<'_>, _id: &Value) {}

    /// Called when an isolated step (an association fetch) failed.
    fn on_error(&self, _ctx: &BehaviorContext<'_>, _error: &Error) {}

    /// Method names this behavior answers through [`Behavior::call`].
    fn methods(&self) -> &[&'static str] {
        &[]
    }

    /// `(regex, method)` pairs: calls whose name matches the regex are routed
    /// to `method` with the called name prepended to the arguments.
    fn map_methods(&self) -> &[(&'static str, &'static str)] {
        &[]
    }

    /// Run a method listed in [`Behavior::methods`] or [`Behavior::map_methods`].
    fn call(&self, _ctx: &BehaviorContext<'_>, _method: &str, _args: &[Value]) -> Value {
        Value::Null
    }

    /// Handle a custom event fired through [`BehaviorCollection::trigger`].
    ///
    /// `None` means the behavior does not listen for `event`.
    fn handle(&self, _ctx: &BehaviorContext<'_>, _event: &str, _args: &[Value]) -> Option<Value> {
        None
    }
}

/// Options for [`BehaviorCollection::trigger`].
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerOptions {
    /// Stop once a result equals one of `break_on`.
    pub break_: bool,
    /// Results that stop iteration when `break_` is set.
    pub break_on: Vec<Value>,
    /// Feed each non-boolean, non-null result into the next call as the
    /// first argument.
    pub mod_params: bool,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self {
            break_: false,
            break_on: vec![Value::Bool(false)],
            mod_params: false,
        }
    }
}

impl TriggerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop after the first result equal to `value`.
    pub fn break_on(mut self, value: impl Into<Value>) -> Self {
        self.break_ = true;
        self.break_on = vec![value.into()];
        self
    }

    /// Stop after the first result equal to any of `values`.
    pub fn break_on_any<V: Into<Value>>(mut self, values: Vec<V>) -> Self {
        self.break_ = true;
        self.break_on = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn mod_params(mut self, mod_params: bool) -> Self {
        self.mod_params = mod_params;
        self
    }
}

/// Result of [`BehaviorCollection::dispatch_method`].
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// A behavior answered.
    Handled {
        /// Name of the behavior that ran.
        behavior: String,
        /// Its return value.
        value: Value,
    },
    /// No attached behavior declares the method.
    Unhandled,
}

#[derive(Clone)]
struct Attached {
    name: String,
    behavior: Arc<dyn Behavior>,
    enabled: bool,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Pattern(Regex),
}

#[derive(Debug, Clone)]
struct MethodEntry {
    matcher: Matcher,
    behavior: String,
    method: String,
}

/// Behaviors attached to one model instance.
#[derive(Clone, Default)]
pub struct BehaviorCollection {
    alias: String,
    entity: String,
    attached: Vec<Attached>,
    settings: BTreeMap<String, serde_json::Value>,
    methods: Vec<MethodEntry>,
}

impl fmt::Debug for BehaviorCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorCollection")
            .field("alias", &self.alias)
            .field("attached", &self.attached())
            .field("enabled", &self.enabled())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl BehaviorCollection {
    /// Empty collection for the model `alias` of entity `entity`.
    pub fn new(alias: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            entity: entity.into(),
            ..Self::default()
        }
    }

    // ==================== Attachment ====================

    /// Attach `behavior`, deep-merging `config` into this instance's
    /// settings for it.
    ///
    /// Attaching again only merges settings. An `"enabled"` key in `config`
    /// is not stored; it enables or disables the behavior.
    pub fn attach(&mut self, behavior: Arc<dyn Behavior>, config: serde_json::Value) {
        let name = behavior.name().to_string();
        let mut config = config;
        let enabled_flag = match &mut config {
            serde_json::Value::Object(map) => map.remove("enabled").and_then(|v| v.as_bool()),
            _ => None,
        };

        let bucket = self
            .settings
            .entry(name.clone())
            .or_insert_with(|| behavior.default_settings());
        if !config.is_null() {
            deep_merge(bucket, config);
        }

        match self.attached.iter_mut().find(|a| a.name == name) {
            Some(existing) => {
                if let Some(enabled) = enabled_flag {
                    existing.enabled = enabled;
                }
            }
            None => {
                tracing::debug!(alias = %self.alias, behavior = %name, "attaching behavior");
                self.attached.push(Attached {
                    name,
                    behavior,
                    enabled: enabled_flag.unwrap_or(true),
                });
                self.rebuild_methods();
            }
        }
    }

    /// Detach `name`. Its settings stay stored for a later attach.
    pub fn detach(&mut self, name: &str) -> bool {
        let before = self.attached.len();
        self.attached.retain(|a| a.name != name);
        let removed = self.attached.len() != before;
        if removed {
            tracing::debug!(alias = %self.alias, behavior = name, "detached behavior");
            self.rebuild_methods();
        }
        removed
    }

    pub fn enable(&mut self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable(&mut self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.attached.iter_mut().find(|a| a.name == name) {
            Some(a) => {
                a.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.attached.iter().any(|a| a.name == name && a.enabled)
    }

    /// Names of enabled behaviors, in attachment order.
    pub fn enabled(&self) -> Vec<String> {
        self.attached
            .iter()
            .filter(|a| a.enabled)
            .map(|a| a.name.clone())
            .collect()
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.attached.iter().any(|a| a.name == name)
    }

    /// Names of attached behaviors (enabled or not), in attachment order.
    pub fn attached(&self) -> Vec<String> {
        self.attached.iter().map(|a| a.name.clone()).collect()
    }

    /// This instance's settings for `name`.
    pub fn settings(&self, name: &str) -> Option<&serde_json::Value> {
        self.settings.get(name)
    }

    fn rebuild_methods(&mut self) {
        let mut methods = Vec::new();
        for a in &self.attached {
            for method in a.behavior.methods() {
                methods.push(MethodEntry {
                    matcher: Matcher::Exact((*method).to_string()),
                    behavior: a.name.clone(),
                    method: (*method).to_string(),
                });
            }
            for (pattern, method) in a.behavior.map_methods() {
                match Regex::new(pattern) {
                    Ok(re) => methods.push(MethodEntry {
                        matcher: Matcher::Pattern(re),
                        behavior: a.name.clone(),
                        method: (*method).to_string(),
                    }),
                    Err(e) => tracing::warn!(
                        behavior = %a.name,
                        pattern = pattern,
                        error = %e,
                        "ignoring invalid method map pattern"
                    ),
                }
            }
        }
        self.methods = methods;
    }

    // ==================== Dispatch ====================

    /// Whether some attached behavior answers `method`.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|entry| match &entry.matcher {
            Matcher::Exact(name) => name.eq_ignore_ascii_case(method),
            Matcher::Pattern(re) => re.is_match(method),
        })
    }

    /// Route `method` to the behavior that declares it.
    ///
    /// Exact names win over `map_methods` patterns; within each pass the
    /// first behavior in attachment order answers.
    pub fn dispatch_method(&self, method: &str, args: &[Value]) -> Dispatch {
        let exact = self.methods.iter().find(
            |entry| matches!(&entry.matcher, Matcher::Exact(name) if name.eq_ignore_ascii_case(method)),
        );
        if let Some(entry) = exact {
            return self.run_method(entry, args.to_vec());
        }

        let mapped = self
            .methods
            .iter()
            .find(|entry| matches!(&entry.matcher, Matcher::Pattern(re) if re.is_match(method)));
        if let Some(entry) = mapped {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(Value::Text(method.to_string()));
            full.extend_from_slice(args);
            return self.run_method(entry, full);
        }

        tracing::trace!(alias = %self.alias, method = method, "no behavior answers method");
        Dispatch::Unhandled
    }

    fn run_method(&self, entry: &MethodEntry, args: Vec<Value>) -> Dispatch {
        let Some(attached) = self.attached.iter().find(|a| a.name == entry.behavior) else {
            return Dispatch::Unhandled;
        };
        let value = attached
            .behavior
            .call(&self.context(&attached.name), &entry.method, &args);
        Dispatch::Handled {
            behavior: attached.name.clone(),
            value,
        }
    }

    // ==================== Events ====================

    fn context<'a>(&'a self, name: &str) -> BehaviorContext<'a> {
        static EMPTY: serde_json::Value = serde_json::Value::Null;
        BehaviorContext {
            alias: &self.alias,
            entity: &self.entity,
            settings: self.settings.get(name).unwrap_or(&EMPTY),
        }
    }

    fn active(&self) -> impl Iterator<Item = &Attached> {
        self.attached.iter().filter(|a| a.enabled)
    }

    /// Fire `event` on every enabled behavior in attachment order and collect
    /// the results of those that handle it.
    ///
    /// `"afterSave"` (args: `[created, record]`) and `"beforeDelete"` (args:
    /// `[id, cascade]`) run the lifecycle hooks; other events go to
    /// [`Behavior::handle`].
    pub fn trigger(&self, event: &str, args: &[Value], options: &TriggerOptions) -> Vec<Value> {
        let mut args = args.to_vec();
        let mut results = Vec::new();
        for a in self.active() {
            let ctx = self.context(&a.name);
            let result = match event {
                "afterSave" => {
                    let created = args.first().and_then(Value::as_bool).unwrap_or(false);
                    let record = match args.get(1) {
                        Some(Value::Json(json)) => Record::from_json(json).unwrap_or_default(),
                        _ => Record::new(),
                    };
                    Some(Value::Bool(a.behavior.after_save(&ctx, created, &record)))
                }
                "beforeDelete" => {
                    let id = args.first().cloned().unwrap_or_default();
                    let cascade = args.get(1).and_then(Value::as_bool).unwrap_or(true);
                    Some(Value::Bool(a.behavior.before_delete(&ctx, &id, cascade)))
                }
                _ => a.behavior.handle(&ctx, event, &args),
            };
            let Some(result) = result else {
                continue;
            };

            if options.mod_params && !matches!(result, Value::Null | Value::Bool(_)) {
                if args.is_empty() {
                    args.push(result.clone());
                } else {
                    args[0] = result.clone();
                }
            }
            let stop = options.break_ && options.break_on.contains(&result);
            results.push(result);
            if stop {
                tracing::trace!(event = event, behavior = %a.name, "trigger stopped");
                break;
            }
        }
        results
    }

    /// Run `before_find`; `None` means a behavior aborted.
    pub fn before_find(&self, mut query: FindOptions) -> Option<FindOptions> {
        for a in self.active() {
            match a.behavior.before_find(&self.context(&a.name), &query) {
                HookOutcome::NoOp => {}
                HookOutcome::Replace(q) => query = q,
                HookOutcome::Abort => {
                    tracing::debug!(alias = %self.alias, behavior = %a.name, "beforeFind aborted");
                    return None;
                }
            }
        }
        Some(query)
    }

    /// Run `after_find`, each behavior seeing the previous one's output.
    ///
    /// `Abort` clears the result set.
    pub fn after_find(&self, mut results: Vec<Tree>) -> Vec<Tree> {
        for a in self.active() {
            match a.behavior.after_find(&self.context(&a.name), &results) {
                HookOutcome::NoOp => {}
                HookOutcome::Replace(r) => results = r,
                HookOutcome::Abort => return Vec::new(),
            }
        }
        results
    }

    /// Run `before_validate`; `Err` names the vetoing behavior.
    pub fn before_validate(&self, record: Record) -> Result<Record, String> {
        self.run_record_hook(record, |b, ctx, r| b.before_validate(ctx, r))
    }

    /// Run `before_save`; `Err` names the vetoing behavior.
    pub fn before_save(&self, record: Record) -> Result<Record, String> {
        self.run_record_hook(record, |b, ctx, r| b.before_save(ctx, r))
    }

    fn run_record_hook(
        &self,
        mut record: Record,
        hook: impl Fn(&dyn Behavior, &BehaviorContext<'_>, &Record) -> HookOutcome<Record>,
    ) -> Result<Record, String> {
        for a in self.active() {
            match hook(a.behavior.as_ref(), &self.context(&a.name), &record) {
                HookOutcome::NoOp => {}
                HookOutcome::Replace(r) => record = r,
                HookOutcome::Abort => return Err(a.name.clone()),
            }
        }
        Ok(record)
    }

    /// Run `after_save` on every behavior, collecting `(name, result)`.
    pub fn after_save(&self, created: bool, record: &Record) -> Vec<(String, bool)> {
        self.active()
            .map(|a| {
                let ok = a
                    .behavior
                    .after_save(&self.context(&a.name), created, record);
                (a.name.clone(), ok)
            })
            .collect()
    }

    /// Run `before_delete`; `Err` names the vetoing behavior.
    pub fn before_delete(&self, id: &Value, cascade: bool) -> Result<(), String> {
        for a in self.active() {
            if !a.behavior.before_delete(&self.context(&a.name), id, cascade) {
                return Err(a.name.clone());
            }
        }
        Ok(())
    }

    pub fn after_delete(&self, id: &Value) {
        for a in self.active() {
            a.behavior.after_delete(&self.context(&a.name), id);
        }
    }

    pub fn on_error(&self, error: &Error) {
        for a in self.active() {
            a.behavior.on_error(&self.context(&a.name), error);
        }
    }
}

/// Merge `patch` into `target`: objects merge key by key, anything else
/// replaces.
pub fn deep_merge(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Named(&'static str);

    impl Behavior for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn default_settings(&self) -> serde_json::Value {
            json!({"mangle": "trigger"})
        }

        fn handle(&self, _ctx: &BehaviorContext<'_>, event: &str, args: &[Value]) -> Option<Value> {
            match event {
                "beforeTest" => Some(Value::Text(format!("{}behavior", self.0.to_lowercase()))),
                "append" => {
                    let prev = args.first().and_then(Value::as_str).unwrap_or("");
                    Some(Value::Text(format!("{prev}{}", self.0)))
                }
                _ => None,
            }
        }

        fn methods(&self) -> &[&'static str] {
            &["testMethod"]
        }

        fn map_methods(&self) -> &[(&'static str, &'static str)] {
            &[("^look for .*", "speakEnglish"), ("(", "broken")]
        }

        fn call(&self, ctx: &BehaviorContext<'_>, method: &str, args: &[Value]) -> Value {
            match method {
                "testMethod" => Value::Text(format!("{}:{}", self.0, ctx.alias)),
                "speakEnglish" => Value::Text(format!(
                    "{} heard {}",
                    self.0,
                    args.first().and_then(Value::as_str).unwrap_or("?")
                )),
                _ => Value::Null,
            }
        }
    }

    fn collection(names: &[&'static str]) -> BehaviorCollection {
        let mut c = BehaviorCollection::new("Apple", "Apple");
        for name in names {
            c.attach(Arc::new(Named(name)), json!({}));
        }
        c
    }

    #[test]
    fn test_attach_merges_settings() {
        let mut c = collection(&[]);
        c.attach(Arc::new(Named("Test")), json!({"key": "value", "nested": {"a": 1}}));
        c.attach(Arc::new(Named("Test")), json!({"nested": {"b": 2}}));
        assert_eq!(
            c.settings("Test"),
            Some(&json!({"mangle": "trigger", "key": "value", "nested": {"a": 1, "b": 2}}))
        );
        assert_eq!(c.attached(), vec!["Test"]);
    }

    #[test]
    fn test_enabled_key_flips_flag() {
        let mut c = collection(&["Test"]);
        c.attach(Arc::new(Named("Test")), json!({"enabled": false}));
        assert!(c.is_attached("Test"));
        assert!(!c.is_enabled("Test"));
        assert!(c.settings("Test").is_some_and(|s| s.get("enabled").is_none()));
        c.attach(Arc::new(Named("Test")), json!({"enabled": true}));
        assert!(c.is_enabled("Test"));
    }

    #[test]
    fn test_disable_keeps_settings() {
        let mut c = collection(&[]);
        c.attach(Arc::new(Named("Test")), json!({"key": "value"}));
        c.disable("Test");
        assert!(c.enabled().is_empty());
        assert_eq!(c.attached(), vec!["Test"]);
        c.enable("Test");
        assert_eq!(c.settings("Test").and_then(|s| s.get("key")), Some(&json!("value")));

        c.detach("Test");
        assert!(c.attached().is_empty());
        c.attach(Arc::new(Named("Test")), json!({}));
        assert_eq!(c.settings("Test").and_then(|s| s.get("key")), Some(&json!("value")));
    }

    #[test]
    fn test_trigger_breaks_after_match() {
        let c = collection(&["Test", "Test2", "Test3"]);
        let all = c.trigger("beforeTest", &[], &TriggerOptions::new());
        assert_eq!(all.len(), 3);

        let stopped = c.trigger("beforeTest", &[], &TriggerOptions::new().break_on("test2behavior"));
        assert_eq!(
            stopped,
            vec![Value::from("testbehavior"), Value::from("test2behavior")]
        );
    }

    #[test]
    fn test_trigger_skips_disabled_and_silent() {
        let mut c = collection(&["Test", "Test2"]);
        c.disable("Test");
        assert_eq!(
            c.trigger("beforeTest", &[], &TriggerOptions::new()),
            vec![Value::from("test2behavior")]
        );
        assert!(c.trigger("unknownEvent", &[], &TriggerOptions::new()).is_empty());
    }

    #[test]
    fn test_trigger_mod_params_chains() {
        let c = collection(&["A", "B"]);
        let results = c.trigger(
            "append",
            &[Value::from(">")],
            &TriggerOptions::new().mod_params(true),
        );
        assert_eq!(results, vec![Value::from(">A"), Value::from(">AB")]);
    }

    #[test]
    fn test_dispatch_exact_then_pattern() {
        let c = collection(&["Test"]);
        assert_eq!(
            c.dispatch_method("testMethod", &[]),
            Dispatch::Handled {
                behavior: "Test".into(),
                value: Value::from("Test:Apple"),
            }
        );
        assert_eq!(
            c.dispatch_method("look for something", &[]),
            Dispatch::Handled {
                behavior: "Test".into(),
                value: Value::from("Test heard look for something"),
            }
        );
        assert_eq!(c.dispatch_method("nothing", &[]), Dispatch::Unhandled);
        assert!(c.has_method("TESTMETHOD"));
    }

    #[test]
    fn test_collections_do_not_share_settings() {
        let shared: Arc<dyn Behavior> = Arc::new(Named("Test"));
        let mut a = BehaviorCollection::new("Apple", "Apple");
        let mut b = BehaviorCollection::new("Sample", "Apple");
        a.attach(shared.clone(), json!({"key": "value"}));
        b.attach(shared, json!({"key2": "value2"}));
        a.attach(Arc::new(Named("Test")), json!({"key": "changed"}));
        assert!(b.settings("Test").is_some_and(|s| s.get("key").is_none()));
        assert_eq!(b.settings("Test").and_then(|s| s.get("key2")), Some(&json!("value2")));
    }
}
