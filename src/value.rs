//! Runtime values shared by the constant pool, filters, and the interpreter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A value on the interpreter stack or in the constant pool.
///
/// `Safe` is a string that has already been escaped (or explicitly marked
/// trusted) and is emitted verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Safe(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) | Value::Safe(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }

    /// Attribute lookup; anything but a map (or a list with a numeric key) yields `Null`.
    pub fn attr(&self, name: &str) -> Value {
        match self {
            Value::Map(map) => map.get(name).cloned().unwrap_or(Value::Null),
            Value::List(items) => name
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Plain text form used for output and string filters.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) | Value::Safe(s) => s.clone(),
            Value::List(items) => items
                .iter()
                .map(Value::to_text)
                .collect::<Vec<_>>()
                .join(", "),
            Value::Map(map) => {
                let mut out = String::from("{");
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{k}: {}", v.to_text());
                }
                out.push('}');
                out
            }
        }
    }

    /// Text as it appears in rendered output: escaped unless marked safe.
    pub fn to_output(&self) -> String {
        match self {
            Value::Safe(s) => s.clone(),
            other => escape_html(&other.to_text()),
        }
    }

    /// Items produced when the value is iterated by a loop.
    pub fn iter_items(&self) -> Vec<Value> {
        match self {
            Value::List(items) => items.clone(),
            Value::Map(map) => map.keys().cloned().map(Value::Str).collect(),
            Value::Str(s) | Value::Safe(s) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
            _ => Vec::new(),
        }
    }

    /// `~` concatenation. A single part is passed through unchanged.
    pub fn concat(parts: &[Value]) -> Value {
        match parts {
            [single] => single.clone(),
            _ => Value::Str(parts.iter().map(Value::to_text).collect()),
        }
    }

    /// Loose equality used by `==` / `!=` in conditions.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Str(a) | Value::Safe(a), Value::Str(b) | Value::Safe(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (a, b) => a == b,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

// ─── Render context ───────────────────────────────────────────

/// Variables visible to a render.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderContext {
    vars: BTreeMap<String, Value>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object; non-object JSON yields an empty context.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let vars = match json {
            serde_json::Value::Object(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v)))
                .collect(),
            _ => BTreeMap::new(),
        };
        Self { vars }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    /// Copy of `self` with `overrides` layered on top.
    pub fn overlay<I>(&self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut vars = self.vars.clone();
        vars.extend(overrides);
        Self { vars }
    }

    /// Canonical JSON form, used for context hashing.
    pub fn to_canonical_json(&self) -> serde_json::Value {
        fn to_json(value: &Value) -> serde_json::Value {
            match value {
                Value::Null => serde_json::Value::Null,
                Value::Bool(b) => serde_json::Value::Bool(*b),
                Value::Int(i) => serde_json::Value::from(*i),
                Value::Float(f) => serde_json::Value::from(*f),
                Value::Str(s) => serde_json::Value::String(s.clone()),
                Value::Safe(s) => serde_json::json!({ "$safe": s }),
                Value::List(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
                Value::Map(map) => serde_json::Value::Object(
                    map.iter().map(|(k, v)| (k.clone(), to_json(v))).collect(),
                ),
            }
        }
        serde_json::Value::Object(
            self.vars
                .iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn escapes_markup_unless_safe() {
        assert_eq!(Value::from("<b>").to_output(), "&lt;b&gt;");
        assert_eq!(Value::Safe("<b>".into()).to_output(), "<b>");
    }

    #[test]
    fn json_conversion_keeps_structure() {
        let v = Value::from_json(&json!({"user": {"name": "Ada", "tags": ["x", 2]}}));
        assert_eq!(v.attr("user").attr("name"), Value::from("Ada"));
        assert_eq!(v.attr("user").attr("tags").attr("1"), Value::Int(2));
        assert_eq!(v.attr("missing"), Value::Null);
    }

    #[test]
    fn concat_joins_text() {
        assert_eq!(
            Value::concat(&[Value::from("a"), Value::Int(1), Value::Null]),
            Value::from("a1")
        );
        assert_eq!(Value::concat(&[Value::Int(7)]), Value::Int(7));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::List(vec![Value::Null]).is_truthy());
        assert!(Value::Int(-1).is_truthy());
    }

    #[test]
    fn loose_equality_crosses_string_kinds() {
        assert!(Value::from("a").loose_eq(&Value::Safe("a".into())));
        assert!(Value::Int(2).loose_eq(&Value::Float(2.0)));
        assert!(!Value::Int(2).loose_eq(&Value::from("2")));
    }

    #[test]
    fn context_overlay_shadows() {
        let ctx = RenderContext::new().with("a", 1).with("b", 2);
        let layered = ctx.overlay([("a".to_string(), Value::Int(9))]);
        assert_eq!(layered.get("a"), Some(&Value::Int(9)));
        assert_eq!(layered.get("b"), Some(&Value::Int(2)));
        assert_eq!(ctx.get("a"), Some(&Value::Int(1)));
    }
}
