//! Hand-written reader/writer for the project's frontmatter grammar: lines of
//! `key: value` fenced by `---`, values typed by their surface form (quoted
//! string, bracketed array, `null`, `true`/`false`, bare number, else raw
//! string). Intentionally not a YAML parser — the grammar is narrower and the
//! quoting rules are exact, so a general-purpose library would accept input
//! this format never produces and reject input it does.

use std::fmt;

/// A parsed frontmatter scalar. Arrays only ever hold strings in this format
/// (keyword lists), so `Array` doesn't need to nest further `Value`s.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<String>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[String]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "\"{s}\""),
            Value::Array(items) => write!(f, "{}", json_string_array(items)),
        }
    }
}

/// Render a list of strings as a JSON-literal array, the way `keywords` and
/// similar fields are written.
pub fn json_string_array(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| format!("\"{}\"", escape(s))).collect();
    format!("[{}]", quoted.join(", "))
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// One frontmatter document: the ordered `key: value` pairs plus the body
/// that followed the closing `---`. Order is preserved so a round-tripped
/// record looks the same as the one that produced it.
#[derive(Debug, Clone, Default)]
pub struct Frontmatter {
    pub fields: Vec<(String, Value)>,
    pub body: String,
}

impl Frontmatter {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

/// Parse a `.md` file's full content into frontmatter fields and body.
/// Returns `None` if the content doesn't start with a `---` fence or the
/// closing fence is missing — both mark the record as malformed.
pub fn parse(content: &str) -> Option<Frontmatter> {
    if !content.starts_with("---") {
        return None;
    }
    let rest = &content[3..];
    let end_idx = rest.find("---")?;
    let raw = rest[..end_idx].trim();
    let body = rest[end_idx + 3..].trim().to_string();

    let mut fields = Vec::new();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = parse_value(value.trim());
        fields.push((key, value));
    }

    Some(Frontmatter { fields, body })
}

/// Parse a single frontmatter value: quoted string, JSON array, `null`,
/// `true`/`false`, integer, float (if it contains a `.`), else the raw
/// token.
pub fn parse_value(raw: &str) -> Value {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Value::Str(unescape(&raw[1..raw.len() - 1]));
    }
    if raw.starts_with('[') && raw.ends_with(']') {
        if let Ok(arr) = serde_json::from_str::<Vec<String>>(raw) {
            return Value::Array(arr);
        }
        return Value::Str(raw.to_string());
    }
    match raw {
        "null" => return Value::Null,
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    let looks_numeric = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '-');
    if looks_numeric {
        if raw.contains('.') {
            if let Ok(f) = raw.parse::<f64>() {
                return Value::Float(f);
            }
        } else if let Ok(n) = raw.parse::<i64>() {
            return Value::Int(n);
        }
    }
    Value::Str(raw.to_string())
}

fn unescape(s: &str) -> String {
    s.replace("\\\"", "\"").replace("\\\\", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_array_null_bool_and_numbers() {
        let content = "---\nid: \"CHK-AUTH-001-001\"\nkeywords: [\"login\", \"token\"]\nlast_retrieved: null\nverified: true\ntokens: 120\nusefulness_score: 0.5\n---\n\nbody text\n";
        let fm = parse(content).unwrap();
        assert_eq!(fm.get_str("id"), Some("CHK-AUTH-001-001"));
        assert_eq!(
            fm.get("keywords").and_then(Value::as_array),
            Some(&["login".to_string(), "token".to_string()][..])
        );
        assert_eq!(fm.get("last_retrieved"), Some(&Value::Null));
        assert_eq!(fm.get("verified").and_then(Value::as_bool), Some(true));
        assert_eq!(fm.get("tokens").and_then(Value::as_i64), Some(120));
        assert_eq!(fm.get("usefulness_score").and_then(Value::as_f64), Some(0.5));
        assert_eq!(fm.body, "body text");
    }

    #[test]
    fn missing_closing_fence_is_none() {
        assert!(parse("---\nid: x\n").is_none());
    }

    #[test]
    fn not_frontmatter_is_none() {
        assert!(parse("just text").is_none());
    }

    #[test]
    fn json_array_render_quotes_each_item() {
        assert_eq!(
            json_string_array(&["a".to_string(), "b".to_string()]),
            "[\"a\", \"b\"]"
        );
    }
}
