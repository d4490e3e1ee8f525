//! Builtin filters.
//!
//! Filters are pure functions of their input and literal arguments, so a
//! filter application over constant input can be evaluated at compile time.

use crate::value::{escape_html, Value};

pub type FilterFn = fn(&Value, &[Value]) -> Value;

/// Resolve a filter by name, including fused pairs.
pub fn lookup(name: &str) -> Option<FilterFn> {
    let f: FilterFn = match name {
        "upper" => upper,
        "lower" => lower,
        "trim" => trim,
        "capitalize" => capitalize,
        "title" => title,
        "length" => length,
        "reverse" => reverse,
        "escape" => escape,
        "safe" => safe,
        "default" => default,
        "truncate" => truncate,
        "replace" => replace,
        "join" => join,
        "first" => first,
        "last" => last,
        "trim_upper" => |v, _| upper(&trim(v, &[]), &[]),
        "trim_lower" => |v, _| lower(&trim(v, &[]), &[]),
        "upper_trim" => |v, _| trim(&upper(v, &[]), &[]),
        "lower_trim" => |v, _| trim(&lower(v, &[]), &[]),
        _ => return None,
    };
    Some(f)
}

pub fn is_known(name: &str) -> bool {
    lookup(name).is_some()
}

/// Fused replacement for two adjacent argument-less filters, if one exists.
pub fn fused(first: &str, second: &str) -> Option<&'static str> {
    match (first, second) {
        ("trim", "upper") => Some("trim_upper"),
        ("trim", "lower") => Some("trim_lower"),
        ("upper", "trim") => Some("upper_trim"),
        ("lower", "trim") => Some("lower_trim"),
        _ => None,
    }
}

/// Apply a filter by name. `None` when the filter does not exist.
pub fn apply(name: &str, input: &Value, args: &[Value]) -> Option<Value> {
    lookup(name).map(|f| f(input, args))
}

/// String filters keep the safe marker of their input.
fn map_text(input: &Value, f: impl FnOnce(&str) -> String) -> Value {
    match input {
        Value::Safe(s) => Value::Safe(f(s)),
        other => Value::Str(f(&other.to_text())),
    }
}

fn upper(input: &Value, _: &[Value]) -> Value {
    map_text(input, str::to_uppercase)
}

fn lower(input: &Value, _: &[Value]) -> Value {
    map_text(input, str::to_lowercase)
}

fn trim(input: &Value, _: &[Value]) -> Value {
    map_text(input, |s| s.trim().to_string())
}

fn capitalize(input: &Value, _: &[Value]) -> Value {
    map_text(input, |s| {
        let mut chars = s.chars();
        match chars.next() {
            Some(c) => c.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
            None => String::new(),
        }
    })
}

fn title(input: &Value, _: &[Value]) -> Value {
    map_text(input, |s| {
        let mut out = String::with_capacity(s.len());
        let mut at_word_start = true;
        for c in s.chars() {
            if c.is_alphanumeric() {
                if at_word_start {
                    out.extend(c.to_uppercase());
                } else {
                    out.extend(c.to_lowercase());
                }
                at_word_start = false;
            } else {
                out.push(c);
                at_word_start = true;
            }
        }
        out
    })
}

fn length(input: &Value, _: &[Value]) -> Value {
    let n = match input {
        Value::List(items) => items.len(),
        Value::Map(map) => map.len(),
        Value::Null => 0,
        other => other.to_text().chars().count(),
    };
    Value::Int(n as i64)
}

fn reverse(input: &Value, _: &[Value]) -> Value {
    match input {
        Value::List(items) => Value::List(items.iter().rev().cloned().collect()),
        other => map_text(other, |s| s.chars().rev().collect()),
    }
}

fn escape(input: &Value, _: &[Value]) -> Value {
    match input {
        Value::Safe(s) => Value::Safe(s.clone()),
        other => Value::Safe(escape_html(&other.to_text())),
    }
}

fn safe(input: &Value, _: &[Value]) -> Value {
    match input {
        Value::Safe(s) => Value::Safe(s.clone()),
        other => Value::Safe(other.to_text()),
    }
}

fn default(input: &Value, args: &[Value]) -> Value {
    let empty = match input {
        Value::Null => true,
        Value::Str(s) => s.is_empty(),
        _ => false,
    };
    if empty {
        args.first().cloned().unwrap_or(Value::Null)
    } else {
        input.clone()
    }
}

fn truncate(input: &Value, args: &[Value]) -> Value {
    let limit = match args.first() {
        Some(Value::Int(n)) if *n >= 0 => *n as usize,
        _ => 255,
    };
    map_text(input, |s| {
        if s.chars().count() <= limit {
            s.to_string()
        } else {
            let mut out: String = s.chars().take(limit).collect();
            out.push_str("...");
            out
        }
    })
}

fn replace(input: &Value, args: &[Value]) -> Value {
    match (args.first(), args.get(1)) {
        (Some(from), Some(to)) => {
            let (from, to) = (from.to_text(), to.to_text());
            if from.is_empty() {
                return input.clone();
            }
            map_text(input, |s| s.replace(&from, &to))
        }
        _ => input.clone(),
    }
}

fn join(input: &Value, args: &[Value]) -> Value {
    let sep = args.first().map(Value::to_text).unwrap_or_default();
    match input {
        Value::List(items) => Value::Str(
            items
                .iter()
                .map(Value::to_text)
                .collect::<Vec<_>>()
                .join(&sep),
        ),
        other => other.clone(),
    }
}

fn first(input: &Value, _: &[Value]) -> Value {
    match input {
        Value::List(items) => items.first().cloned().unwrap_or(Value::Null),
        Value::Null => Value::Null,
        other => other
            .to_text()
            .chars()
            .next()
            .map(|c| Value::Str(c.to_string()))
            .unwrap_or(Value::Null),
    }
}

fn last(input: &Value, _: &[Value]) -> Value {
    match input {
        Value::List(items) => items.last().cloned().unwrap_or(Value::Null),
        Value::Null => Value::Null,
        other => other
            .to_text()
            .chars()
            .last()
            .map(|c| Value::Str(c.to_string()))
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::Str(v.to_string())
    }

    #[test]
    fn string_filters() {
        assert_eq!(apply("upper", &s("abc"), &[]), Some(s("ABC")));
        assert_eq!(apply("trim", &s("  x "), &[]), Some(s("x")));
        assert_eq!(apply("capitalize", &s("hELLO"), &[]), Some(s("Hello")));
        assert_eq!(apply("title", &s("the quick-fox"), &[]), Some(s("The Quick-Fox")));
        assert_eq!(apply("truncate", &s("abcdef"), &[Value::Int(3)]), Some(s("abc...")));
        assert_eq!(
            apply("replace", &s("a-b-c"), &[s("-"), s("+")]),
            Some(s("a+b+c"))
        );
    }

    #[test]
    fn collection_filters() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(apply("length", &list, &[]), Some(Value::Int(3)));
        assert_eq!(apply("first", &list, &[]), Some(Value::Int(1)));
        assert_eq!(apply("last", &list, &[]), Some(Value::Int(3)));
        assert_eq!(apply("join", &list, &[s("/")]), Some(s("1/2/3")));
        assert_eq!(
            apply("reverse", &list, &[]),
            Some(Value::List(vec![Value::Int(3), Value::Int(2), Value::Int(1)]))
        );
    }

    #[test]
    fn default_replaces_null_and_empty() {
        assert_eq!(apply("default", &Value::Null, &[s("n/a")]), Some(s("n/a")));
        assert_eq!(apply("default", &s(""), &[s("n/a")]), Some(s("n/a")));
        assert_eq!(apply("default", &s("x"), &[s("n/a")]), Some(s("x")));
    }

    #[test]
    fn escape_and_safe_mark_output() {
        assert_eq!(
            apply("escape", &s("<b>"), &[]),
            Some(Value::Safe("&lt;b&gt;".into()))
        );
        assert_eq!(apply("safe", &s("<b>"), &[]), Some(Value::Safe("<b>".into())));
        assert_eq!(
            apply("upper", &Value::Safe("<b>".into()), &[]),
            Some(Value::Safe("<B>".into()))
        );
    }

    #[test]
    fn fused_filters_match_their_parts() {
        let input = s("  Mixed Case  ");
        for (a, b) in [("trim", "upper"), ("trim", "lower"), ("upper", "trim"), ("lower", "trim")] {
            let name = fused(a, b).unwrap();
            let stepwise = apply(b, &apply(a, &input, &[]).unwrap(), &[]);
            assert_eq!(apply(name, &input, &[]), stepwise, "{name}");
        }
        assert_eq!(fused("upper", "lower"), None);
    }

    #[test]
    fn unknown_filter() {
        assert!(!is_known("shout"));
        assert_eq!(apply("shout", &s("x"), &[]), None);
    }
}
