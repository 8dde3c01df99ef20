//! Field validation rules.
//!
//! Rules are declared per field on an entity and evaluated by the write
//! engine before `beforeSave`. Each failing rule contributes one message to
//! the field's entry in a [`ValidationError`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use regex::Regex;

use crate::error::{ValidationError, ValidationErrorKind};
use crate::value::Value;

/// Thread-safe regex cache for compiled patterns.
struct RegexCache {
    cache: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        let regex = Regex::new(pattern)?;
        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.insert(pattern.to_string(), regex.clone());
        }
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Check if a string matches a regex pattern.
///
/// Compiled patterns are cached process-wide. An invalid pattern logs a
/// warning and never matches.
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match regex_cache().get_or_compile(pattern) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
            tracing::warn!(
                pattern = pattern,
                error = %e,
                "Invalid regex pattern in validation, treating as non-match"
            );
            false
        }
    }
}

const EMAIL_PATTERN: &str = r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$";

/// Predicate used by [`Rule::Custom`]: receives the field value and the whole
/// record being saved.
pub type CustomCheck = Arc<dyn Fn(&Value, &BTreeMap<String, Value>) -> bool + Send + Sync>;

/// A single validation check.
#[derive(Clone)]
pub enum Rule {
    /// Value must not be empty or whitespace only
    NotBlank,
    /// Value must parse as a number
    Numeric,
    /// Value must look like an email address
    Email,
    /// Value must match the regex
    Pattern(String),
    /// Minimum character length
    MinLength(usize),
    /// Maximum character length
    MaxLength(usize),
    /// Character length within an inclusive range
    Between(usize, usize),
    /// Value must equal one of the listed values
    InList(Vec<Value>),
    /// Value must be a boolean or 0/1
    Boolean,
    /// Arbitrary predicate
    Custom(CustomCheck),
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::NotBlank => write!(f, "NotBlank"),
            Rule::Numeric => write!(f, "Numeric"),
            Rule::Email => write!(f, "Email"),
            Rule::Pattern(p) => write!(f, "Pattern({p:?})"),
            Rule::MinLength(n) => write!(f, "MinLength({n})"),
            Rule::MaxLength(n) => write!(f, "MaxLength({n})"),
            Rule::Between(a, b) => write!(f, "Between({a}, {b})"),
            Rule::InList(values) => write!(f, "InList({values:?})"),
            Rule::Boolean => write!(f, "Boolean"),
            Rule::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Rule {
    /// Wrap a closure as a custom rule.
    pub fn custom<F>(check: F) -> Self
    where
        F: Fn(&Value, &BTreeMap<String, Value>) -> bool + Send + Sync + 'static,
    {
        Rule::Custom(Arc::new(check))
    }

    fn check(&self, value: &Value, data: &BTreeMap<String, Value>) -> bool {
        let text = value.to_key_string();
        match self {
            Rule::NotBlank => !text.trim().is_empty(),
            Rule::Numeric => value.as_f64().is_some(),
            Rule::Email => matches_pattern(&text, EMAIL_PATTERN),
            Rule::Pattern(p) => matches_pattern(&text, p),
            Rule::MinLength(n) => text.chars().count() >= *n,
            Rule::MaxLength(n) => text.chars().count() <= *n,
            Rule::Between(min, max) => {
                let len = text.chars().count();
                len >= *min && len <= *max
            }
            Rule::InList(values) => values.iter().any(|v| v.loosely_eq(value)),
            Rule::Boolean => value.as_bool().is_some(),
            Rule::Custom(f) => f(value, data),
        }
    }

    fn kind(&self) -> ValidationErrorKind {
        match self {
            Rule::NotBlank => ValidationErrorKind::Blank,
            Rule::Numeric | Rule::Email | Rule::Boolean => ValidationErrorKind::Format,
            Rule::Pattern(_) => ValidationErrorKind::Pattern,
            Rule::MinLength(_) => ValidationErrorKind::MinLength,
            Rule::MaxLength(_) => ValidationErrorKind::MaxLength,
            Rule::Between(..) => ValidationErrorKind::Range,
            Rule::InList(_) => ValidationErrorKind::InList,
            Rule::Custom(_) => ValidationErrorKind::Custom,
        }
    }

    fn default_message(&self) -> String {
        match self {
            Rule::NotBlank => "This field cannot be left blank".to_string(),
            Rule::Numeric => "must be numeric".to_string(),
            Rule::Email => "must be a valid email address".to_string(),
            Rule::Pattern(p) => format!("must match pattern '{p}'"),
            Rule::MinLength(n) => format!("must be at least {n} characters"),
            Rule::MaxLength(n) => format!("must be at most {n} characters"),
            Rule::Between(a, b) => format!("must be between {a} and {b} characters"),
            Rule::InList(_) => "is not an allowed value".to_string(),
            Rule::Boolean => "must be a boolean".to_string(),
            Rule::Custom(_) => "is invalid".to_string(),
        }
    }
}

/// When a rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum On {
    Create,
    Update,
}

/// A rule together with its application options.
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub rule: Rule,
    /// The field must be present in the payload
    pub required: bool,
    /// Empty values pass without running the rule
    pub allow_empty: bool,
    /// Restrict the rule to creates or updates
    pub on: Option<On>,
    /// Message recorded on failure instead of the rule's default
    pub message: Option<String>,
    /// Stop evaluating this field's remaining rules after a failure
    pub last: bool,
}

impl ValidationRule {
    pub fn new(rule: Rule) -> Self {
        Self {
            rule,
            required: false,
            allow_empty: false,
            on: None,
            message: None,
            last: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn allow_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }

    pub fn on(mut self, on: On) -> Self {
        self.on = Some(on);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Keep evaluating later rules for the field after this one fails.
    pub fn continue_on_failure(mut self) -> Self {
        self.last = false;
        self
    }
}

impl From<Rule> for ValidationRule {
    fn from(rule: Rule) -> Self {
        ValidationRule::new(rule)
    }
}

/// Ordered field → rules table.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    fields: Vec<(String, Vec<ValidationRule>)>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Add a rule for `field`, after any rules already declared for it.
    pub fn add(&mut self, field: impl Into<String>, rule: impl Into<ValidationRule>) {
        let field = field.into();
        let rule = rule.into();
        match self.fields.iter_mut().find(|(name, _)| *name == field) {
            Some((_, rules)) => rules.push(rule),
            None => self.fields.push((field, vec![rule])),
        }
    }

    /// Builder form of [`Validator::add`].
    pub fn rule(mut self, field: impl Into<String>, rule: impl Into<ValidationRule>) -> Self {
        self.add(field, rule);
        self
    }

    /// Field names that carry rules, in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Validate `data`, restricted to `field_list` when it is non-empty.
    pub fn validate(
        &self,
        data: &BTreeMap<String, Value>,
        creating: bool,
        field_list: &[String],
    ) -> ValidationError {
        let mut errors = ValidationError::new();
        for (field, rules) in &self.fields {
            if !field_list.is_empty() && !field_list.iter().any(|f| f == field) {
                continue;
            }
            for rule in rules {
                match rule.on {
                    Some(On::Create) if !creating => continue,
                    Some(On::Update) if creating => continue,
                    _ => {}
                }

                let Some(value) = data.get(field) else {
                    if rule.required {
                        errors.add(
                            field.clone(),
                            ValidationErrorKind::Required,
                            rule.message.clone().unwrap_or_else(|| "is required".to_string()),
                        );
                        if rule.last {
                            break;
                        }
                    }
                    continue;
                };

                if rule.allow_empty && value.is_empty() {
                    continue;
                }

                if !rule.rule.check(value, data) {
                    let message = rule
                        .message
                        .clone()
                        .unwrap_or_else(|| rule.rule.default_message());
                    tracing::trace!(field = %field, rule = ?rule.rule, "validation rule failed");
                    errors.add(field.clone(), rule.rule.kind(), message);
                    if rule.last {
                        break;
                    }
                }
            }
        }
        errors
    }
}
