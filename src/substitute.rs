use std::borrow::Cow;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

/// Scopes searched, in order, for a flat placeholder such as `{{full_name}}`
/// that is not itself a top-level key.
const FLAT_KEY_SCOPES: [&str; 2] = ["customer", "company"];

/// Per-render key/value data used to fill `{{placeholder}}` tokens. Keys may
/// be flat (`full_name`), dotted (`customer.full_name` stored literally), or
/// nested objects walked by a dotted path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubstitutionContext {
    root: Map<String, Value>,
}

impl SubstitutionContext {
    /// Non-object documents yield an empty context.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(root) => Self { root },
            other => {
                tracing::warn!(kind = value_kind(&other), "substitution context is not an object; ignoring");
                Self::default()
            }
        }
    }

    /// Builds the context a render request uses from the stored customer and
    /// company records.
    pub fn from_records(customer: Option<Value>, company: Option<Value>) -> Self {
        let mut root = Map::new();
        if let Some(customer) = customer {
            root.insert("customer".to_owned(), customer);
        }
        if let Some(company) = company {
            root.insert("company".to_owned(), company);
        }
        Self { root }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.root.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Looks a placeholder path up. Missing paths, nulls and nested objects
    /// resolve to `None`.
    pub fn lookup(&self, path: &str) -> Option<String> {
        if let Some(value) = self.root.get(path) {
            return scalar_to_string(value);
        }
        if path.contains('.') {
            let mut segments = path.split('.');
            let first = segments.next()?;
            let mut current = self.root.get(first)?;
            for segment in segments {
                current = match current {
                    Value::Object(map) => map.get(segment)?,
                    Value::Array(list) => list.get(segment.parse::<usize>().ok()?)?,
                    _ => return None,
                };
            }
            return scalar_to_string(current);
        }
        FLAT_KEY_SCOPES.iter().find_map(|scope| {
            self.root
                .get(*scope)
                .and_then(Value::as_object)
                .and_then(|map| map.get(path))
                .and_then(scalar_to_string)
        })
    }

    /// Replaces every `{{path}}` token. Unknown paths become the empty string.
    pub fn apply<'a>(&self, text: &'a str) -> Cow<'a, str> {
        substitute(text, Some(self))
    }
}

/// Replaces `{{path}}` tokens in `text`. Without a context every token is
/// replaced by the empty string. Never fails.
pub fn substitute<'a>(text: &'a str, context: Option<&SubstitutionContext>) -> Cow<'a, str> {
    static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER_RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
            .expect("placeholder regex should compile")
    });
    re.replace_all(text, |captures: &Captures<'_>| {
        let path = &captures[1];
        let resolved = context.and_then(|ctx| ctx.lookup(path));
        if resolved.is_none() {
            tracing::debug!(placeholder = path, "unresolved placeholder; substituting empty string");
        }
        resolved.unwrap_or_default()
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn customer_context() -> SubstitutionContext {
        SubstitutionContext::from_value(json!({
            "customer": { "full_name": "Alex", "city": "Lisbon", "visits": 3 },
            "company": { "company_name": "Acme" },
            "company.tagline": "Built to last"
        }))
    }

    #[test]
    fn dotted_paths_walk_nested_records() {
        let ctx = customer_context();
        assert_eq!(ctx.apply("Hello {{customer.full_name}}"), "Hello Alex");
        assert_eq!(ctx.apply("{{ company.company_name }}!"), "Acme!");
        assert_eq!(ctx.apply("visits: {{customer.visits}}"), "visits: 3");
    }

    #[test]
    fn unknown_paths_become_empty() {
        let ctx = customer_context();
        assert_eq!(ctx.apply("Hello {{customer.missing}}"), "Hello ");
        assert_eq!(ctx.apply("{{customer}}"), "");
        assert_eq!(substitute("Hi {{customer.full_name}}", None), "Hi ");
    }

    #[test]
    fn literal_dotted_keys_win_over_nesting() {
        let ctx = customer_context();
        assert_eq!(ctx.apply("{{company.tagline}}"), "Built to last");
    }

    #[test]
    fn flat_keys_fall_back_to_customer_then_company() {
        let ctx = customer_context();
        assert_eq!(ctx.apply("{{full_name}} @ {{company_name}}"), "Alex @ Acme");
    }

    #[test]
    fn text_without_placeholders_is_borrowed() {
        let ctx = customer_context();
        assert!(matches!(ctx.apply("plain text"), Cow::Borrowed(_)));
    }

    #[test]
    fn from_records_nests_under_scopes() {
        let ctx = SubstitutionContext::from_records(
            Some(json!({ "full_name": "Sam" })),
            Some(json!({ "company_name": "Globex" })),
        );
        assert_eq!(ctx.lookup("customer.full_name").as_deref(), Some("Sam"));
        assert_eq!(ctx.lookup("company_name").as_deref(), Some("Globex"));
        assert!(SubstitutionContext::from_value(json!([1, 2])).is_empty());
    }
}
