//! English inflection for naming conventions.
//!
//! Entities are named in CamelCase singular (`BlogPost`); tables are
//! snake_case plural (`blog_posts`). Foreign keys, join tables and counter
//! columns are all derived from these helpers.

const UNCOUNTABLE: &[&str] = &[
    "equipment",
    "information",
    "rice",
    "money",
    "species",
    "series",
    "fish",
    "sheep",
    "news",
    "data",
    "metadata",
];

const IRREGULAR: &[(&str, &str)] = &[
    ("person", "people"),
    ("man", "men"),
    ("woman", "women"),
    ("child", "children"),
    ("ox", "oxen"),
    ("mouse", "mice"),
    ("goose", "geese"),
    ("foot", "feet"),
    ("tooth", "teeth"),
    ("leaf", "leaves"),
    ("criterion", "criteria"),
];

/// Plural form of a snake_case or lower-case word.
///
/// Only the last `_`-separated segment is inflected.
pub fn pluralize(word: &str) -> String {
    inflect_last_segment(word, pluralize_word)
}

/// Singular form of a snake_case or lower-case word.
pub fn singularize(word: &str) -> String {
    inflect_last_segment(word, singularize_word)
}

/// `BlogPost` -> `blog_post`.
pub fn underscore(word: &str) -> String {
    let mut out = String::with_capacity(word.len() + 4);
    let chars: Vec<char> = word.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let prev_upper = i > 0 && chars[i - 1].is_uppercase();
            if prev_lower || (prev_upper && next_lower) {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else if c == '-' || c == ' ' {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    out
}

/// `blog_post` -> `BlogPost`.
pub fn camelize(word: &str) -> String {
    word.split(['_', ' ', '-'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Table name for an entity name: `BlogPost` -> `blog_posts`.
pub fn tableize(entity: &str) -> String {
    pluralize(&underscore(entity))
}

/// Entity name for a table name: `blog_posts` -> `BlogPost`.
pub fn classify(table: &str) -> String {
    camelize(&singularize(table))
}

fn inflect_last_segment(word: &str, f: fn(&str) -> String) -> String {
    match word.rsplit_once('_') {
        Some((head, last)) => format!("{}_{}", head, f(last)),
        None => f(word),
    }
}

fn pluralize_word(word: &str) -> String {
    let lower = word.to_lowercase();
    if lower.is_empty() || UNCOUNTABLE.contains(&lower.as_str()) {
        return word.to_string();
    }
    if let Some((_, plural)) = IRREGULAR.iter().find(|(s, p)| *s == lower || *p == lower) {
        return keep_case(word, plural);
    }

    if lower.ends_with("ss")
        || lower.ends_with("sh")
        || lower.ends_with("ch")
        || lower.ends_with('x')
        || lower.ends_with('z')
    {
        return format!("{word}es");
    }
    if lower.ends_with("sis") {
        return format!("{}ses", &word[..word.len() - 3]);
    }
    if lower.ends_with('s') {
        // already plural
        return word.to_string();
    }
    if let Some(stem) = lower.strip_suffix('y') {
        if !stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            return format!("{}ies", &word[..word.len() - 1]);
        }
    }
    format!("{word}s")
}

fn singularize_word(word: &str) -> String {
    let lower = word.to_lowercase();
    if lower.is_empty() || UNCOUNTABLE.contains(&lower.as_str()) {
        return word.to_string();
    }
    if let Some((singular, _)) = IRREGULAR.iter().find(|(s, p)| *p == lower || *s == lower) {
        return keep_case(word, singular);
    }

    if lower.ends_with("ies") && lower.len() > 3 {
        return format!("{}y", &word[..word.len() - 3]);
    }
    for suffix in ["sses", "shes", "ches", "xes", "zes"] {
        if lower.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    if lower.ends_with("yses") {
        return format!("{}sis", &word[..word.len() - 3]);
    }
    if lower.ends_with("ss") || lower.ends_with("us") {
        return word.to_string();
    }
    match lower.strip_suffix('s') {
        Some(_) => word[..word.len() - 1].to_string(),
        None => word.to_string(),
    }
}

fn keep_case(original: &str, replacement: &str) -> String {
    if original.chars().next().is_some_and(char::is_uppercase) {
        camelize(replacement)
    } else {
        replacement.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("post"), "posts");
        assert_eq!(pluralize("category"), "categories");
        assert_eq!(pluralize("key"), "keys");
        assert_eq!(pluralize("box"), "boxes");
        assert_eq!(pluralize("person"), "people");
        assert_eq!(pluralize("blog_post"), "blog_posts");
        assert_eq!(pluralize("posts"), "posts");
        assert_eq!(pluralize("news"), "news");
    }

    #[test]
    fn test_singularize() {
        assert_eq!(singularize("posts"), "post");
        assert_eq!(singularize("categories"), "category");
        assert_eq!(singularize("boxes"), "box");
        assert_eq!(singularize("people"), "person");
        assert_eq!(singularize("articles_tags"), "articles_tag");
        assert_eq!(singularize("status"), "status");
        assert_eq!(singularize("analyses"), "analysis");
    }

    #[test]
    fn test_underscore_and_camelize() {
        assert_eq!(underscore("BlogPost"), "blog_post");
        assert_eq!(underscore("Post"), "post");
        assert_eq!(underscore("HTMLPage"), "html_page");
        assert_eq!(underscore("Item2Part"), "item2_part");
        assert_eq!(camelize("blog_post"), "BlogPost");
        assert_eq!(camelize("articles_tag"), "ArticlesTag");
    }

    #[test]
    fn test_tableize_classify() {
        assert_eq!(tableize("Article"), "articles");
        assert_eq!(tableize("BlogPost"), "blog_posts");
        assert_eq!(tableize("Person"), "people");
        assert_eq!(classify("articles_tags"), "ArticlesTag");
        assert_eq!(classify("people"), "Person");
    }
}
