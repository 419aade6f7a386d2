//! Splits a markdown document into semantic chunks with provenance tracking
//! and staleness detection. The only component that creates chunk records
//! (it may also delete them, on `refresh`).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::Local;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::chunk::{extract_keywords, Chunk};
use crate::config::{Config, CortexPaths};
use crate::embedding::Embedder;
use crate::error::{CortexError, Result};
use crate::frontmatter;
use crate::tokenizer::count_tokens;

const GENERIC_PARENTS: &[&str] = &["DOCS", "DOC", "DOCUMENTATION", "."];

/// Infer a domain tag from a file path when the caller doesn't supply one:
/// the immediate parent directory name (unless generic), else the filename
/// prefix before the first hyphen (if at least two characters), else
/// `GENERAL`.
pub fn detect_domain(path: &Path) -> String {
    if let Some(parent) = path.parent().and_then(|p| p.file_name()) {
        let parent = parent.to_string_lossy().to_uppercase();
        if !parent.is_empty() && !GENERIC_PARENTS.contains(&parent.as_str()) {
            return parent;
        }
    }

    if let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) {
        if let Some((prefix, _)) = stem.split_once('-') {
            let prefix = prefix.to_uppercase();
            if prefix.len() >= 2 {
                return prefix;
            }
        }
    }

    "GENERAL".to_string()
}

struct Section {
    title: String,
    content: String,
    start_line: u32,
    end_line: u32,
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#{1,6}\s+(.+)$").unwrap())
}

fn sentence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Rust's regex crate has no lookbehind; split on the delimiter and keep
    // it attached to the preceding sentence by re-joining below.
    RE.get_or_init(|| Regex::new(r"([.!?])\s+").unwrap())
}

/// Parse markdown into sections on `^#{1,6}\s+(.+)$` heading lines. Content
/// before the first heading becomes a section titled `Introduction`.
fn parse_sections(content: &str) -> Vec<Section> {
    let lines: Vec<&str> = content.lines().collect();
    let mut sections = Vec::new();
    let mut title: Option<String> = None;
    let mut body_lines: Vec<&str> = Vec::new();
    let mut start = 0u32;

    for (i, line) in lines.iter().enumerate() {
        if let Some(caps) = heading_re().captures(line) {
            if title.is_some() || !body_lines.is_empty() {
                sections.push(Section {
                    title: title.clone().unwrap_or_else(|| "Introduction".to_string()),
                    content: body_lines.join("\n").trim().to_string(),
                    start_line: start + 1,
                    end_line: i as u32,
                });
            }
            title = Some(caps[1].trim().to_string());
            body_lines = Vec::new();
            start = i as u32;
        } else {
            body_lines.push(line);
        }
    }

    if title.is_some() || !body_lines.is_empty() {
        sections.push(Section {
            title: title.unwrap_or_else(|| "Introduction".to_string()),
            content: body_lines.join("\n").trim().to_string(),
            start_line: start + 1,
            end_line: lines.len() as u32,
        });
    }

    sections
}

pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut last = 0;
    for m in sentence_re().find_iter(text) {
        let delim_end = m.start() + 1; // keep the punctuation with the sentence
        sentences.push(text[last..delim_end].to_string());
        last = m.end();
    }
    if last < text.len() {
        sentences.push(text[last..].to_string());
    }
    sentences
}

/// Split text into paragraph-packed chunks under `max_tokens`, falling back
/// to sentence-level packing for any paragraph that alone exceeds the
/// budget.
fn split_by_paragraphs(text: &str, max_tokens: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0usize;

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        let para_tokens = count_tokens(para);

        if para_tokens > max_tokens {
            if !current.is_empty() {
                chunks.push(current.join("\n\n"));
                current = Vec::new();
                current_tokens = 0;
            }

            let mut sent_chunk: Vec<String> = Vec::new();
            let mut sent_tokens = 0usize;
            for sent in split_sentences(para) {
                let sent_tok = count_tokens(&sent);
                if sent_tokens + sent_tok > max_tokens && !sent_chunk.is_empty() {
                    chunks.push(sent_chunk.join(" "));
                    sent_chunk = Vec::new();
                    sent_tokens = 0;
                }
                sent_chunk.push(sent);
                sent_tokens += sent_tok;
            }
            if !sent_chunk.is_empty() {
                chunks.push(sent_chunk.join(" "));
            }
            continue;
        }

        if current_tokens + para_tokens > max_tokens && !current.is_empty() {
            chunks.push(current.join("\n\n"));
            current = Vec::new();
            current_tokens = 0;
        }
        current.push(para.to_string());
        current_tokens += para_tokens;
    }

    if !current.is_empty() {
        chunks.push(current.join("\n\n"));
    }

    chunks
}

/// Prepend an overlap preamble drawn from each chunk's predecessor: the
/// last `floor(overlap_tokens / 1.3)` whitespace-delimited words, formatted
/// as `...<words>\n\n<chunk>`.
fn add_overlap(chunks: Vec<String>, overlap_tokens: usize) -> Vec<String> {
    if chunks.len() <= 1 || overlap_tokens == 0 {
        return chunks;
    }

    let overlap_words = (overlap_tokens as f64 / 1.3) as usize;
    let mut result = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            result.push(chunk.clone());
            continue;
        }
        let prev_words: Vec<&str> = chunks[i - 1].split_whitespace().collect();
        if overlap_words > 0 && prev_words.len() > overlap_words {
            let overlap_text = prev_words[prev_words.len() - overlap_words..].join(" ");
            result.push(format!("...{overlap_text}\n\n{chunk}"));
        } else {
            result.push(chunk.clone());
        }
    }
    result
}

fn file_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn next_doc_number(chunks_dir: &Path, domain: &str) -> u32 {
    let domain_path = chunks_dir.join(domain);
    let Ok(entries) = fs::read_dir(&domain_path) else {
        return 1;
    };
    let mut max_seen = 0u32;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|s| s.strip_suffix(".md")) else {
            continue;
        };
        let parts: Vec<&str> = stem.split('-').collect();
        if parts.len() >= 4 {
            if let Ok(n) = parts[2].parse::<u32>() {
                max_seen = max_seen.max(n);
            }
        }
    }
    if max_seen == 0 {
        1
    } else {
        max_seen + 1
    }
}

fn embedding_path_for(md_path: &Path) -> PathBuf {
    md_path.with_extension("emb")
}

fn write_embedding(path: &Path, vector: &[f32]) -> Result<()> {
    let bytes: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
    fs::write(path, bytes)?;
    Ok(())
}

/// Chunk one markdown file: split semantically, persist per-chunk `.md` +
/// `.emb` files, and return the emitted chunks in emission order.
pub fn chunk(
    paths: &CortexPaths,
    config: &Config,
    embedder: &dyn Embedder,
    path: &Path,
    domain: Option<&str>,
) -> Result<Vec<Chunk>> {
    if !path.exists() {
        return Err(CortexError::SourceMissing(path.to_path_buf()));
    }

    let domain = domain
        .map(|d| d.to_uppercase())
        .unwrap_or_else(|| detect_domain(path));

    let chunks_dir = paths.chunks_dir();
    let domain_dir = chunks_dir.join(&domain);
    fs::create_dir_all(&domain_dir)?;

    let doc_num = next_doc_number(&chunks_dir, &domain);
    let doc_id = format!("DOC-{domain}-{doc_num:03}");

    let content = fs::read_to_string(path)?;
    let source_hash = file_hash(&content);
    let source_path = paths.relativize(path).to_string_lossy().replace('\\', "/");

    let sections = parse_sections(&content);

    let mut all_chunks: Vec<Chunk> = Vec::new();
    let mut seq = 1u32;

    for section in sections {
        if section.content.trim().is_empty() {
            continue;
        }
        let section_tokens = count_tokens(&section.content);

        let text_chunks = if section_tokens <= config.chunk_size {
            if section_tokens < config.chunk_min {
                continue;
            }
            vec![section.content.clone()]
        } else {
            split_by_paragraphs(&section.content, config.chunk_size)
        };

        let text_chunks = add_overlap(text_chunks, config.chunk_overlap);

        for text in text_chunks {
            let tokens = count_tokens(&text);
            if tokens < config.chunk_min {
                continue;
            }

            let id = format!("CHK-{domain}-{doc_num:03}-{seq:03}");
            all_chunks.push(Chunk {
                id,
                source_doc: doc_id.clone(),
                source_section: section.title.clone(),
                source_lines: (section.start_line, section.end_line),
                tokens,
                keywords: extract_keywords(&text, 10),
                content: text,
                created: Local::now().to_rfc3339(),
                source_path: source_path.clone(),
                source_hash: source_hash.clone(),
                last_retrieved: None,
                retrieval_count: 0,
            });
            seq += 1;
        }
    }

    for c in &all_chunks {
        let md_path = domain_dir.join(format!("{}.md", c.id));
        fs::write(&md_path, c.to_markdown())?;
        let embedding = embedder.embed_passage(&c.content);
        write_embedding(&embedding_path_for(&md_path), &embedding)?;
    }

    Ok(all_chunks)
}

#[derive(Debug, Clone, PartialEq)]
pub enum StaleStatus {
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct StaleChunk {
    pub chunk_id: String,
    pub source_path: String,
    pub stored_hash: String,
    pub current_hash: Option<String>,
    pub status: StaleStatus,
}

fn parse_chunk_metadata(md_path: &Path) -> Option<(String, String, String)> {
    let content = fs::read_to_string(md_path).ok()?;
    let fm = frontmatter::parse(&content)?;
    let id = fm
        .get_str("id")
        .map(|s| s.to_string())
        .unwrap_or_else(|| md_path.file_stem().unwrap().to_string_lossy().to_string());
    let source_path = fm.get_str("source_path")?.to_string();
    let source_hash = fm.get_str("source_hash")?.to_string();
    Some((id, source_path, source_hash))
}

/// Find chunks whose recorded source hash no longer matches the current
/// file. Hashes are memoized per source path within one call; chunks
/// lacking provenance metadata are silently skipped.
pub fn get_stale_chunks(paths: &CortexPaths) -> Result<Vec<StaleChunk>> {
    let chunks_dir = paths.chunks_dir();
    if !chunks_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut stale = Vec::new();
    let mut checked: HashMap<String, Option<String>> = HashMap::new();

    for domain_entry in fs::read_dir(&chunks_dir)? {
        let domain_path = domain_entry?.path();
        if !domain_path.is_dir() {
            continue;
        }
        for file_entry in fs::read_dir(&domain_path)? {
            let md_path = file_entry?.path();
            if md_path.extension().map(|e| e != "md").unwrap_or(true) {
                continue;
            }
            let Some((id, source_path, stored_hash)) = parse_chunk_metadata(&md_path) else {
                continue;
            };

            let current_hash = checked.entry(source_path.clone()).or_insert_with(|| {
                let full = paths.project_root.join(&source_path);
                fs::read_to_string(&full).ok().map(|c| file_hash(&c))
            });

            match current_hash {
                None => stale.push(StaleChunk {
                    chunk_id: id,
                    source_path,
                    stored_hash,
                    current_hash: None,
                    status: StaleStatus::Deleted,
                }),
                Some(hash) if *hash != stored_hash => stale.push(StaleChunk {
                    chunk_id: id,
                    source_path,
                    stored_hash,
                    current_hash: Some(hash.clone()),
                    status: StaleStatus::Modified,
                }),
                _ => {}
            }
        }
    }

    Ok(stale)
}

/// Find all chunk ids whose stored `source_path` matches `source_path`
/// after normalization to project-relative form.
pub fn get_chunks_by_source(paths: &CortexPaths, source_path: &Path) -> Result<Vec<String>> {
    let normalized = paths
        .relativize(source_path)
        .to_string_lossy()
        .replace('\\', "/");

    let chunks_dir = paths.chunks_dir();
    if !chunks_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    for domain_entry in fs::read_dir(&chunks_dir)? {
        let domain_path = domain_entry?.path();
        if !domain_path.is_dir() {
            continue;
        }
        for file_entry in fs::read_dir(&domain_path)? {
            let md_path = file_entry?.path();
            if md_path.extension().map(|e| e != "md").unwrap_or(true) {
                continue;
            }
            let Some((id, stored_source, _)) = parse_chunk_metadata(&md_path) else {
                continue;
            };
            if stored_source == normalized {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

/// Delete each id's paired `.md` and embedding files. Returns the count of
/// `.md` files actually deleted.
pub fn delete_chunks(paths: &CortexPaths, chunk_ids: &[String]) -> Result<usize> {
    let chunks_dir = paths.chunks_dir();
    let mut deleted = 0;

    for chunk_id in chunk_ids {
        let parts: Vec<&str> = chunk_id.split('-').collect();
        if parts.len() < 2 {
            continue;
        }
        let domain = parts[1];
        let domain_dir = chunks_dir.join(domain);
        let md_path = domain_dir.join(format!("{chunk_id}.md"));
        let emb_path = domain_dir.join(format!("{chunk_id}.emb"));

        if md_path.exists() {
            fs::remove_file(&md_path)?;
            deleted += 1;
        }
        if emb_path.exists() {
            fs::remove_file(&emb_path)?;
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::test_support::StubEmbedder;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CortexPaths, Config, StubEmbedder) {
        let dir = TempDir::new().unwrap();
        let paths = CortexPaths::new(dir.path());
        let mut config = Config::default();
        config.chunk_size = 40;
        config.chunk_min = 5;
        config.chunk_overlap = 10;
        (dir, paths, config, StubEmbedder::new(16))
    }

    fn write_source(dir: &TempDir, rel: &str, content: &str) -> PathBuf {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn detect_domain_prefers_parent_directory() {
        assert_eq!(detect_domain(Path::new("docs/auth/login.md")), "AUTH");
        assert_eq!(detect_domain(Path::new("docs/auth-spec.md")), "AUTH");
        assert_eq!(detect_domain(Path::new("docs/readme.md")), "GENERAL");
    }

    #[test]
    fn chunk_and_retrieve_scenario() {
        let (dir, paths, config, embedder) = setup();
        let body = "Users log in with a password.\nA session token is issued on success.\nThe token expires after a short window to limit exposure from leaked credentials.";
        let content = format!("# Auth\n\n{body}\n\n# API\n\n{body}\n\n# DB\n\n{body}\n");
        let path = write_source(&dir, "docs/auth/login.md", &content);

        let chunks = chunk(&paths, &config, &embedder, &path, None).unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks[0].id.starts_with("CHK-AUTH-"));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.id, format!("CHK-AUTH-001-{:03}", i + 1));
        }
    }

    #[test]
    fn staleness_detects_modified_and_deleted() {
        let (dir, paths, config, embedder) = setup();
        let content = "# Intro\n\nThis is a stable piece of documentation about retries and backoff windows used across the service.";
        let path = write_source(&dir, "docs/api/spec.md", content);
        chunk(&paths, &config, &embedder, &path, None).unwrap();

        assert!(get_stale_chunks(&paths).unwrap().is_empty());

        fs::write(&path, format!("{content} mutated")).unwrap();
        let stale = get_stale_chunks(&paths).unwrap();
        assert!(!stale.is_empty());
        assert!(stale.iter().all(|s| s.status == StaleStatus::Modified));

        fs::remove_file(&path).unwrap();
        let stale = get_stale_chunks(&paths).unwrap();
        assert!(stale.iter().all(|s| s.status == StaleStatus::Deleted));
        assert!(stale.iter().all(|s| s.current_hash.is_none()));
    }

    #[test]
    fn refresh_discards_and_recreates_without_orphans() {
        let (dir, paths, config, embedder) = setup();
        let content = "# Intro\n\nOriginal text about connection pooling and retry budgets under load.";
        let path = write_source(&dir, "docs/db/spec.md", content);
        chunk(&paths, &config, &embedder, &path, None).unwrap();

        let ids = get_chunks_by_source(&paths, &path).unwrap();
        assert!(!ids.is_empty());
        let deleted = delete_chunks(&paths, &ids).unwrap();
        assert_eq!(deleted, ids.len());

        for id in &ids {
            let domain = id.split('-').nth(1).unwrap();
            let domain_dir = paths.chunks_domain_dir(domain);
            assert!(!domain_dir.join(format!("{id}.emb")).exists());
        }

        let fresh = chunk(&paths, &config, &embedder, &path, None).unwrap();
        assert!(fresh[0].id.ends_with("-001-001"));
    }
}
