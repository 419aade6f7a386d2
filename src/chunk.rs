//! The `Chunk` data model: a contiguous, embedded slice of a source
//! document, plus the keyword extraction shared by the Chunker and the
//! Memory Store.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::frontmatter::{self, Value};

/// A bounded, embedded slice of a source document. Identity is encoded in
/// `id` (`CHK-<DOMAIN>-<DDD>-<SSS>`); every other field is an attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub source_doc: String,
    pub source_section: String,
    pub source_lines: (u32, u32),
    pub tokens: usize,
    pub keywords: Vec<String>,
    pub content: String,
    pub created: String,
    pub source_path: String,
    pub source_hash: String,
    pub last_retrieved: Option<String>,
    pub retrieval_count: u32,
}

impl Chunk {
    /// Render the frontmatter + body exactly as `save_chunk` in the source
    /// material does: scalar quoting, bracketed arrays, `null` for absent
    /// optional fields.
    pub fn to_markdown(&self) -> String {
        format!(
            "---\nid: {id}\nsource_doc: {source_doc}\nsource_section: \"{source_section}\"\nsource_lines: [{start}, {end}]\nsource_path: \"{source_path}\"\nsource_hash: \"{source_hash}\"\ntokens: {tokens}\nkeywords: {keywords}\ncreated: \"{created}\"\nlast_retrieved: {last_retrieved}\nretrieval_count: {retrieval_count}\n---\n\n{content}\n",
            id = self.id,
            source_doc = self.source_doc,
            source_section = self.source_section,
            start = self.source_lines.0,
            end = self.source_lines.1,
            source_path = self.source_path,
            source_hash = self.source_hash,
            tokens = self.tokens,
            keywords = frontmatter::json_string_array(&self.keywords),
            created = self.created,
            last_retrieved = self
                .last_retrieved
                .as_ref()
                .map(|s| format!("\"{s}\""))
                .unwrap_or_else(|| "null".to_string()),
            retrieval_count = self.retrieval_count,
            content = self.content,
        )
    }

    /// Parse a chunk back from its on-disk `.md` content. Returns `None`
    /// (a malformed record) if the frontmatter fence or any required scalar
    /// is missing.
    pub fn from_markdown(content: &str) -> Option<Chunk> {
        let fm = frontmatter::parse(content)?;
        let lines = fm.get("source_lines")?;
        let (start, end) = parse_line_range(lines)?;

        Some(Chunk {
            id: fm.get_str("id")?.to_string(),
            source_doc: fm.get_str("source_doc")?.to_string(),
            source_section: fm.get_str("source_section")?.to_string(),
            source_lines: (start, end),
            tokens: fm.get("tokens")?.as_i64()? as usize,
            keywords: fm
                .get("keywords")
                .and_then(Value::as_array)
                .map(|a| a.to_vec())
                .unwrap_or_default(),
            content: fm.body,
            created: fm.get_str("created").unwrap_or_default().to_string(),
            source_path: fm.get_str("source_path").unwrap_or_default().to_string(),
            source_hash: fm.get_str("source_hash").unwrap_or_default().to_string(),
            last_retrieved: fm.get_str("last_retrieved").map(|s| s.to_string()),
            retrieval_count: fm
                .get("retrieval_count")
                .and_then(Value::as_i64)
                .unwrap_or(0) as u32,
        })
    }
}

fn parse_line_range(value: &Value) -> Option<(u32, u32)> {
    // `source_lines` is written as a bracketed array of two bare integers,
    // which the frontmatter parser only accepts as a string array — so it
    // round-trips through the raw fallback form instead.
    match value {
        Value::Str(s) => parse_bracket_ints(s),
        _ => None,
    }
}

fn parse_bracket_ints(raw: &str) -> Option<(u32, u32)> {
    let inner = raw.trim().trim_start_matches('[').trim_end_matches(']');
    let mut parts = inner.split(',').map(|p| p.trim().parse::<u32>());
    let start = parts.next()?.ok()?;
    let end = parts.next()?.ok()?;
    Some((start, end))
}

/// Stopwords shared by the Chunker's and Memory Store's keyword extraction
/// — a single 48-word unified set, distinct from (and larger than) the
/// Retriever's query-time stopword list.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was", "one",
    "our", "out", "has", "have", "been", "were", "being", "their", "there", "this", "that",
    "with", "they", "from", "will", "would", "could", "should", "which", "when", "where", "what",
    "each", "into", "than", "then", "also", "only", "other", "such", "more", "some", "very",
    "just", "about", "over", "after", "before",
];

fn code_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```.*?```").unwrap())
}

fn inline_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`[^`]+`").unwrap())
}

fn md_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap())
}

fn md_syntax_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[#*_~`>\-|]").unwrap())
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[a-z]{3,}\b").unwrap())
}

/// TF-based keyword extraction used at ingest time by the Chunker and the
/// Memory Store: strip code/markdown noise, tokenize, drop stopwords, keep
/// the top `max_keywords` by frequency (ties broken by first occurrence).
pub fn extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    let lower = text.to_lowercase();
    let cleaned = code_block_re().replace_all(&lower, "");
    let cleaned = inline_code_re().replace_all(&cleaned, "");
    let cleaned = md_link_re().replace_all(&cleaned, "$1");
    let cleaned = md_syntax_re().replace_all(&cleaned, " ");

    let mut freq: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for m in word_re().find_iter(&cleaned) {
        let word = m.as_str();
        if STOPWORDS.contains(&word) {
            continue;
        }
        if !freq.contains_key(word) {
            order.push(word.to_string());
        }
        *freq.entry(word.to_string()).or_insert(0) += 1;
    }

    order.sort_by(|a, b| freq[b].cmp(&freq[a]));
    order.truncate(max_keywords);
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> Chunk {
        Chunk {
            id: "CHK-AUTH-001-001".to_string(),
            source_doc: "DOC-AUTH-001".to_string(),
            source_section: "Login Flow".to_string(),
            source_lines: (1, 40),
            tokens: 120,
            keywords: vec!["login".to_string(), "token".to_string()],
            content: "Users authenticate with a short-lived token.".to_string(),
            created: "2026-07-28T10:00:00".to_string(),
            source_path: "docs/auth/login.md".to_string(),
            source_hash: "abc123".to_string(),
            last_retrieved: None,
            retrieval_count: 0,
        }
    }

    #[test]
    fn round_trips_through_markdown() {
        let chunk = sample_chunk();
        let rendered = chunk.to_markdown();
        let parsed = Chunk::from_markdown(&rendered).unwrap();
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn extract_keywords_strips_code_and_stopwords() {
        let text = "The `quick` login ```code block``` token token flow, and the session.";
        let keywords = extract_keywords(text, 10);
        assert!(keywords.contains(&"token".to_string()));
        assert!(keywords.contains(&"login".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
        assert!(!keywords.iter().any(|k| k == "code" || k == "block"));
        // "token" appears twice, should rank before single-occurrence words.
        assert_eq!(keywords[0], "token");
    }

    #[test]
    fn extract_keywords_caps_at_max() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda";
        let keywords = extract_keywords(text, 5);
        assert_eq!(keywords.len(), 5);
    }
}
