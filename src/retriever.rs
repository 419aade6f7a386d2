//! Embeds a query and scores every indexed item by a fixed convex
//! combination of four signals. Read-only: never mutates chunk or memory
//! state (the Assembler does that for memories, on retrieval-with-render).

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::{DateTime, Local};
use regex::Regex;
use serde_json::Value as Json;

use crate::config::CortexPaths;
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{CortexError, Result};
use crate::indexer::{self, KIND_CHUNKS, KIND_MEMORIES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Chunks,
    Memories,
    Both,
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub id: String,
    pub kind: &'static str,
    pub score: f32,
    pub semantic_score: f32,
    pub keyword_score: f32,
    pub recency_score: f32,
    pub frequency_score: f32,
    pub metadata: Json,
    pub content: Option<String>,
}

/// A superset of the chunker's ingest-time stopword list but intentionally
/// narrower — query keywords are extracted at search time, not index time,
/// so they don't need to filter markdown-adjacent fillers.
const QUERY_STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "how", "what", "when", "where",
    "which", "this", "that", "with",
];

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[a-z]{3,}\b").unwrap())
}

pub fn extract_query_keywords(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    word_re()
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .filter(|w| !QUERY_STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// `|Q ∩ K| / min(|Q|, |K|)`; 0 if either set is empty.
pub fn compute_keyword_overlap(query_keywords: &[String], item_keywords: &[String]) -> f32 {
    if query_keywords.is_empty() || item_keywords.is_empty() {
        return 0.0;
    }
    let q: HashSet<String> = query_keywords.iter().map(|s| s.to_lowercase()).collect();
    let k: HashSet<String> = item_keywords.iter().map(|s| s.to_lowercase()).collect();
    let overlap = q.intersection(&k).count();
    let max_possible = q.len().min(k.len());
    if max_possible == 0 {
        return 0.0;
    }
    overlap as f32 / max_possible as f32
}

/// `1 / (1 + days_since_created / 30)`; 0.5 if `created` is missing or
/// unparsable.
pub fn compute_recency_score(created: Option<&str>) -> f32 {
    let Some(created) = created else { return 0.5 };
    let Ok(created_dt) = DateTime::parse_from_rfc3339(created) else {
        return 0.5;
    };
    let now = Local::now();
    let days_old = (now.with_timezone(created_dt.offset()) - created_dt).num_milliseconds() as f32
        / (1000.0 * 60.0 * 60.0 * 24.0);
    let score = 1.0 / (1.0 + days_old / 30.0);
    score.clamp(0.0, 1.0)
}

/// `log(1 + count) / log(1 + 100)`.
pub fn compute_frequency_score(retrieval_count: u64) -> f32 {
    let max_expected = 100.0f32;
    let score = (1.0 + retrieval_count as f32).ln() / (1.0 + max_expected).ln();
    score.clamp(0.0, 1.0)
}

fn round4(x: f32) -> f32 {
    (x * 10_000.0).round() / 10_000.0
}

fn meta_str<'a>(meta: &'a Json, key: &str) -> Option<&'a str> {
    meta.get(key).and_then(Json::as_str)
}

fn meta_keywords(meta: &Json) -> Vec<String> {
    meta.get("keywords")
        .and_then(Json::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn meta_retrieval_count(meta: &Json) -> u64 {
    meta.get("retrieval_count")
        .and_then(Json::as_u64)
        .unwrap_or(0)
}

fn search_index(
    query_embedding: &[f32],
    query_keywords: &[String],
    paths: &CortexPaths,
    kind: &'static str,
    include_content: bool,
) -> Result<Vec<RetrievalResult>> {
    let data = match indexer::load(paths, kind) {
        Ok(data) => data,
        Err(CortexError::IndexMissing(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut results = Vec::with_capacity(data.len());
    for (i, id) in data.ids.iter().enumerate() {
        let metadata = data.metadata.get(id).cloned().unwrap_or(Json::Null);
        let semantic_score = cosine_similarity(data.row(i), query_embedding);
        let keyword_score = compute_keyword_overlap(query_keywords, &meta_keywords(&metadata));
        let recency_score = compute_recency_score(meta_str(&metadata, "created"));
        let frequency_score = compute_frequency_score(meta_retrieval_count(&metadata));

        let final_score = crate::config::SCORE_SEMANTIC * semantic_score
            + crate::config::SCORE_KEYWORD * keyword_score
            + crate::config::SCORE_RECENCY * recency_score
            + crate::config::SCORE_FREQUENCY * frequency_score;

        let content = if include_content {
            load_content(paths, id, kind)
        } else {
            None
        };

        results.push(RetrievalResult {
            id: id.clone(),
            kind,
            score: round4(final_score),
            semantic_score: round4(semantic_score),
            keyword_score: round4(keyword_score),
            recency_score: round4(recency_score),
            frequency_score: round4(frequency_score),
            metadata,
            content,
        });
    }

    Ok(results)
}

fn load_content(paths: &CortexPaths, id: &str, kind: &str) -> Option<String> {
    if kind != KIND_CHUNKS {
        return None;
    }
    let domain = id.split('-').nth(1)?;
    let md_path = paths.chunks_domain_dir(domain).join(format!("{id}.md"));
    let content = std::fs::read_to_string(md_path).ok()?;
    frontmatter_body(&content)
}

fn frontmatter_body(content: &str) -> Option<String> {
    crate::frontmatter::parse(content).map(|fm| fm.body)
}

/// Embed `query`, score every indexed item, and return the top `top_k` by
/// descending `score` (ties broken by insertion/scan order). Missing
/// indexes are treated as empty, never an error.
pub fn retrieve(
    paths: &CortexPaths,
    embedder: &dyn Embedder,
    query: &str,
    top_k: usize,
    kind: Kind,
    include_content: bool,
) -> Result<Vec<RetrievalResult>> {
    let query_embedding = embedder.embed_query(query);
    let query_keywords = extract_query_keywords(query);

    let mut all_results = Vec::new();

    if matches!(kind, Kind::Chunks | Kind::Both) {
        all_results.extend(search_index(
            &query_embedding,
            &query_keywords,
            paths,
            KIND_CHUNKS,
            include_content,
        )?);
    }
    if matches!(kind, Kind::Memories | Kind::Both) {
        all_results.extend(search_index(
            &query_embedding,
            &query_keywords,
            paths,
            KIND_MEMORIES,
            include_content,
        )?);
    }

    all_results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    all_results.truncate(top_k);
    Ok(all_results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_overlap_identity_and_empty() {
        let a = vec!["auth".to_string(), "login".to_string()];
        assert_eq!(compute_keyword_overlap(&a, &a), 1.0);
        assert_eq!(compute_keyword_overlap(&a, &[]), 0.0);
        assert_eq!(compute_keyword_overlap(&[], &a), 0.0);
    }

    #[test]
    fn recency_score_decays_as_expected() {
        assert!(compute_recency_score(Some(&Local::now().to_rfc3339())) > 0.9);
        let thirty_days_ago = (Local::now() - chrono::Duration::days(30)).to_rfc3339();
        let score = compute_recency_score(Some(&thirty_days_ago));
        assert!((score - 0.5).abs() < 0.05);
        let a_year_ago = (Local::now() - chrono::Duration::days(365)).to_rfc3339();
        assert!(compute_recency_score(Some(&a_year_ago)) < 0.1);
        assert_eq!(compute_recency_score(None), 0.5);
    }

    #[test]
    fn frequency_score_is_monotone_and_zero_at_zero() {
        assert_eq!(compute_frequency_score(0), 0.0);
        assert!(compute_frequency_score(10) < compute_frequency_score(50));
        assert!(compute_frequency_score(50) <= compute_frequency_score(100));
    }

    #[test]
    fn query_keywords_drop_stopwords() {
        let keywords = extract_query_keywords("How does the authentication login flow work?");
        assert!(keywords.contains(&"authentication".to_string()));
        assert!(!keywords.contains(&"how".to_string()));
        assert!(!keywords.contains(&"does".to_string()));
    }

    #[test]
    fn score_is_convex_combination_within_component_bounds() {
        let semantic = 0.8f32;
        let keyword = 0.2f32;
        let recency = 0.9f32;
        let frequency = 0.1f32;
        let score = crate::config::SCORE_SEMANTIC * semantic
            + crate::config::SCORE_KEYWORD * keyword
            + crate::config::SCORE_RECENCY * recency
            + crate::config::SCORE_FREQUENCY * frequency;
        let max = semantic.max(keyword).max(recency).max(frequency);
        let min = semantic.min(keyword).min(recency).min(frequency);
        assert!(score <= max + 1e-6);
        assert!(score >= min - 1e-6);
    }
}
