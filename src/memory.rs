//! Memory Store: CRUD over atomic learnings plus similarity-based relation
//! discovery. Exclusive owner of `.cortex/memories/*.md` and its sidecar
//! embedding files.

use std::fs;
use std::path::Path;

use chrono::Local;

use crate::chunk::extract_keywords;
use crate::config::CortexPaths;
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{CortexError, Result};
use crate::frontmatter::{self, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Memory {
    pub id: String,
    pub memory_type: String,
    pub domain: String,
    pub confidence: String,
    pub keywords: Vec<String>,
    pub learning: String,
    pub context: String,
    pub source_session: Option<String>,
    pub source_task: Option<String>,
    pub trigger: Option<String>,
    pub created: String,
    pub updated: String,
    pub verified: bool,
    pub retrieval_count: u32,
    pub last_retrieved: Option<String>,
    pub usefulness_score: f64,
}

/// Fields accepted by `update`; any subset may be set. `None` means leave
/// the stored value unchanged.
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub confidence: Option<String>,
    pub verified: Option<bool>,
    pub usefulness_score: Option<f64>,
    pub learning: Option<String>,
    pub context: Option<String>,
}

pub struct NewMemory<'a> {
    pub learning: &'a str,
    pub context: &'a str,
    pub memory_type: &'a str,
    pub domain: &'a str,
    pub confidence: &'a str,
    pub source_session: Option<&'a str>,
    pub source_task: Option<&'a str>,
    pub trigger: Option<&'a str>,
}

impl Memory {
    fn embedding_text(&self) -> String {
        format!("{}\n{}", self.learning, self.context)
    }

    fn to_markdown(&self) -> String {
        format!(
            "---\nid: {id}\ntype: {memory_type}\ndomain: {domain}\nconfidence: {confidence}\nkeywords: {keywords}\nsource_session: {source_session}\nsource_task: {source_task}\ntrigger: {trigger}\ncreated: \"{created}\"\nupdated: \"{updated}\"\nverified: {verified}\nretrieval_count: {retrieval_count}\nlast_retrieved: {last_retrieved}\nusefulness_score: {usefulness_score}\n---\n\n## Learning\n\n{learning}\n\n## Context\n\n{context}\n",
            id = self.id,
            memory_type = self.memory_type,
            domain = self.domain,
            confidence = self.confidence,
            keywords = frontmatter::json_string_array(&self.keywords),
            source_session = opt_json(&self.source_session),
            source_task = opt_json(&self.source_task),
            trigger = opt_json(&self.trigger),
            created = self.created,
            updated = self.updated,
            verified = self.verified,
            retrieval_count = self.retrieval_count,
            last_retrieved = opt_json(&self.last_retrieved),
            usefulness_score = self.usefulness_score,
            learning = self.learning,
            context = self.context,
        )
    }

    fn from_markdown(content: &str) -> Option<Memory> {
        let fm = frontmatter::parse(content)?;

        let mut learning = String::new();
        let mut context = String::new();
        if let Some(rest) = fm.body.split("## Learning").nth(1) {
            if let Some((l, c)) = rest.split_once("## Context") {
                learning = l.trim().to_string();
                context = c.trim().to_string();
            } else {
                learning = rest.trim().to_string();
            }
        }

        Some(Memory {
            id: fm.get_str("id").unwrap_or_default().to_string(),
            memory_type: fm.get_str("type").unwrap_or("experiential").to_string(),
            domain: fm.get_str("domain").unwrap_or("GENERAL").to_string(),
            confidence: fm.get_str("confidence").unwrap_or("medium").to_string(),
            keywords: fm
                .get("keywords")
                .and_then(Value::as_array)
                .map(|a| a.to_vec())
                .unwrap_or_default(),
            learning,
            context,
            source_session: fm.get_str("source_session").map(|s| s.to_string()),
            source_task: fm.get_str("source_task").map(|s| s.to_string()),
            trigger: fm.get_str("trigger").map(|s| s.to_string()),
            created: fm.get_str("created").unwrap_or_default().to_string(),
            updated: fm.get_str("updated").unwrap_or_default().to_string(),
            verified: fm.get("verified").and_then(Value::as_bool).unwrap_or(false),
            retrieval_count: fm
                .get("retrieval_count")
                .and_then(Value::as_i64)
                .unwrap_or(0) as u32,
            last_retrieved: fm.get_str("last_retrieved").map(|s| s.to_string()),
            usefulness_score: fm
                .get("usefulness_score")
                .and_then(Value::as_f64)
                .unwrap_or(0.5),
        })
    }
}

fn opt_json(value: &Option<String>) -> String {
    match value {
        Some(s) => format!("\"{s}\""),
        None => "null".to_string(),
    }
}

fn memory_path(paths: &CortexPaths, id: &str) -> std::path::PathBuf {
    paths.memories_dir().join(format!("{id}.md"))
}

fn embedding_path(paths: &CortexPaths, id: &str) -> std::path::PathBuf {
    paths.memories_dir().join(format!("{id}.emb"))
}

fn write_embedding(path: &Path, vector: &[f32]) -> Result<()> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    fs::write(path, bytes)?;
    Ok(())
}

fn read_embedding(path: &Path) -> Result<Vec<f32>> {
    let bytes = fs::read(path)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn next_memory_id(memories_path: &Path, today: &str) -> u32 {
    let Ok(entries) = fs::read_dir(memories_path) else {
        return 1;
    };
    let prefix = format!("MEM-{today}-");
    let mut max_seq = 0u32;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|s| s.strip_suffix(".md")) else {
            continue;
        };
        if !stem.starts_with(&prefix) {
            continue;
        }
        // The sequence is the segment after the *last* dash, not after the
        // `MEM-<date>-` prefix position-wise — the date itself has dashes.
        if let Some(seq_str) = stem.rsplit('-').next() {
            if let Ok(seq) = seq_str.parse::<u32>() {
                max_seq = max_seq.max(seq);
            }
        }
    }
    max_seq + 1
}

/// Create a new memory, assign its id, persist record + embedding.
pub fn create(
    paths: &CortexPaths,
    embedder: &dyn Embedder,
    new: NewMemory,
) -> Result<Memory> {
    let memories_path = paths.memories_dir();
    fs::create_dir_all(&memories_path)?;

    let today = Local::now().format("%Y-%m-%d").to_string();
    let seq = next_memory_id(&memories_path, &today);
    let id = format!("MEM-{today}-{seq:03}");

    let keywords = extract_keywords(&format!("{}\n{}", new.learning, new.context), 10);
    let now = Local::now().to_rfc3339();

    let memory = Memory {
        id,
        memory_type: new.memory_type.to_string(),
        domain: new.domain.to_uppercase(),
        confidence: new.confidence.to_string(),
        keywords,
        learning: new.learning.to_string(),
        context: new.context.to_string(),
        source_session: new.source_session.map(|s| s.to_string()),
        source_task: new.source_task.map(|s| s.to_string()),
        trigger: new.trigger.map(|s| s.to_string()),
        created: now.clone(),
        updated: now,
        verified: false,
        retrieval_count: 0,
        last_retrieved: None,
        usefulness_score: 0.5,
    };

    save(paths, embedder, &memory)?;
    Ok(memory)
}

fn save(paths: &CortexPaths, embedder: &dyn Embedder, memory: &Memory) -> Result<()> {
    let memories_path = paths.memories_dir();
    fs::create_dir_all(&memories_path)?;
    fs::write(memory_path(paths, &memory.id), memory.to_markdown())?;
    let embedding = embedder.embed_passage(&memory.embedding_text());
    write_embedding(&embedding_path(paths, &memory.id), &embedding)?;
    Ok(())
}

pub fn get(paths: &CortexPaths, id: &str) -> Result<Option<Memory>> {
    let path = memory_path(paths, id);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)?;
    Ok(Memory::from_markdown(&content))
}

#[derive(Debug, Clone, Default)]
pub struct MemoryFilter<'a> {
    pub domain: Option<&'a str>,
    pub memory_type: Option<&'a str>,
    pub confidence: Option<&'a str>,
}

/// List memories, newest `created` first, optionally filtered.
pub fn list(paths: &CortexPaths, filter: &MemoryFilter) -> Result<Vec<Memory>> {
    let memories_path = paths.memories_dir();
    if !memories_path.is_dir() {
        return Ok(Vec::new());
    }

    let mut memories = Vec::new();
    for entry in fs::read_dir(&memories_path)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".md") {
            continue;
        }
        let content = fs::read_to_string(entry.path())?;
        let Some(memory) = Memory::from_markdown(&content) else {
            crate::debug_log!("[cortex] skipping malformed memory: {name}");
            continue;
        };

        if let Some(domain) = filter.domain {
            if !memory.domain.eq_ignore_ascii_case(domain) {
                continue;
            }
        }
        if let Some(t) = filter.memory_type {
            if memory.memory_type != t {
                continue;
            }
        }
        if let Some(c) = filter.confidence {
            if memory.confidence != c {
                continue;
            }
        }
        memories.push(memory);
    }

    memories.sort_by(|a, b| b.created.cmp(&a.created));
    Ok(memories)
}

/// Apply a patch and rewrite the record. Recomputes keywords and the
/// embedding when `learning` or `context` changes; `updated` is always
/// refreshed.
pub fn update(
    paths: &CortexPaths,
    embedder: &dyn Embedder,
    id: &str,
    patch: MemoryPatch,
) -> Result<Option<Memory>> {
    let Some(mut memory) = get(paths, id)? else {
        return Ok(None);
    };

    if let Some(confidence) = patch.confidence {
        memory.confidence = confidence;
    }
    if let Some(verified) = patch.verified {
        memory.verified = verified;
    }
    if let Some(score) = patch.usefulness_score {
        memory.usefulness_score = score;
    }
    let content_changed = patch.learning.is_some() || patch.context.is_some();
    if let Some(learning) = patch.learning {
        memory.learning = learning;
    }
    if let Some(context) = patch.context {
        memory.context = context;
    }
    if content_changed {
        memory.keywords = extract_keywords(&format!("{}\n{}", memory.learning, memory.context), 10);
    }
    memory.updated = Local::now().to_rfc3339();

    save(paths, embedder, &memory)?;
    Ok(Some(memory))
}

pub fn delete(paths: &CortexPaths, id: &str) -> Result<bool> {
    let md = memory_path(paths, id);
    if !md.exists() {
        return Ok(false);
    }
    fs::remove_file(&md)?;
    let emb = embedding_path(paths, id);
    if emb.exists() {
        fs::remove_file(&emb)?;
    }
    Ok(true)
}

/// Bump `retrieval_count` and `last_retrieved`, rewriting the record (and
/// its embedding — re-embedding an unchanged body is wasteful but keeps
/// "persistence is declarative" exact; an implementer may skip the
/// embedding write here since only counters changed).
pub fn increment_retrieval(paths: &CortexPaths, embedder: &dyn Embedder, id: &str) -> Result<()> {
    let Some(mut memory) = get(paths, id)? else {
        return Ok(());
    };
    memory.retrieval_count += 1;
    memory.last_retrieved = Some(Local::now().to_rfc3339());
    save(paths, embedder, &memory)
}

/// Find the `top_k` memories most similar to `id` by embedding dot product.
/// Excludes the memory itself and any sibling whose embedding filename
/// starts with `id` as a string prefix, including the edge case that a
/// different memory whose id happens to share `id` as a prefix is also
/// excluded.
pub fn find_related(
    paths: &CortexPaths,
    id: &str,
    top_k: usize,
) -> Result<Vec<(Memory, f32)>> {
    let memories_path = paths.memories_dir();
    let source_path = embedding_path(paths, id);
    if !source_path.exists() {
        return Ok(Vec::new());
    }
    let source_emb = read_embedding(&source_path)?;

    let mut scored = Vec::new();
    if memories_path.is_dir() {
        for entry in fs::read_dir(&memories_path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(other_id) = name.strip_suffix(".emb") else {
                continue;
            };
            if other_id.starts_with(id) {
                continue;
            }
            let other_emb = read_embedding(&entry.path())?;
            let similarity = cosine_similarity(&source_emb, &other_emb);
            if let Some(memory) = get(paths, other_id)? {
                scored.push((memory, similarity));
            }
        }
    }

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);
    Ok(scored)
}

/// Require `.cortex/` to exist before any memory operation runs.
pub fn require_initialized(paths: &CortexPaths) -> Result<()> {
    if !paths.is_initialized() {
        return Err(CortexError::NotInitialized(paths.project_root.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::test_support::StubEmbedder;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CortexPaths, StubEmbedder) {
        let dir = TempDir::new().unwrap();
        let paths = CortexPaths::new(dir.path());
        fs::create_dir_all(paths.memories_dir()).unwrap();
        (dir, paths, StubEmbedder::new(32))
    }

    #[test]
    fn create_and_get_round_trip() {
        let (_dir, paths, embedder) = setup();
        let created = create(
            &paths,
            &embedder,
            NewMemory {
                learning: "Tokens expire after 15 minutes",
                context: "Discovered during a login bug investigation",
                memory_type: "experiential",
                domain: "auth",
                confidence: "high",
                source_session: None,
                source_task: None,
                trigger: None,
            },
        )
        .unwrap();

        assert_eq!(created.domain, "AUTH");
        let fetched = get(&paths, &created.id).unwrap().unwrap();
        assert_eq!(fetched.learning, created.learning);
        assert_eq!(fetched.context, created.context);
        assert_eq!(fetched.memory_type, created.memory_type);
        assert_eq!(fetched.domain, created.domain);
        assert_eq!(fetched.confidence, created.confidence);
    }

    #[test]
    fn update_recomputes_keywords_only_on_content_change() {
        let (_dir, paths, embedder) = setup();
        let created = create(
            &paths,
            &embedder,
            NewMemory {
                learning: "Retry with backoff on 429",
                context: "Rate limiting from the billing API",
                memory_type: "procedural",
                domain: "api",
                confidence: "medium",
                source_session: None,
                source_task: None,
                trigger: None,
            },
        )
        .unwrap();

        let updated = update(
            &paths,
            &embedder,
            &created.id,
            MemoryPatch {
                verified: Some(true),
                ..Default::default()
            },
        )
        .unwrap()
        .unwrap();
        assert_eq!(updated.keywords, created.keywords);
        assert!(updated.verified);
    }

    #[test]
    fn find_related_excludes_self_and_prefix_namesakes() {
        let (_dir, paths, embedder) = setup();
        let m1 = create(
            &paths,
            &embedder,
            NewMemory {
                learning: "Database connections must be pooled",
                context: "Pool exhaustion caused an outage",
                memory_type: "factual",
                domain: "db",
                confidence: "high",
                source_session: None,
                source_task: None,
                trigger: None,
            },
        )
        .unwrap();
        let _m2 = create(
            &paths,
            &embedder,
            NewMemory {
                learning: "Database connections must be pooled carefully",
                context: "Same outage, follow-up",
                memory_type: "factual",
                domain: "db",
                confidence: "high",
                source_session: None,
                source_task: None,
                trigger: None,
            },
        )
        .unwrap();
        let _unrelated = create(
            &paths,
            &embedder,
            NewMemory {
                learning: "CSS grid requires a display property",
                context: "Layout bug in the dashboard",
                memory_type: "factual",
                domain: "ui",
                confidence: "low",
                source_session: None,
                source_task: None,
                trigger: None,
            },
        )
        .unwrap();

        let related = find_related(&paths, &m1.id, 5).unwrap();
        assert!(related.iter().all(|(m, _)| m.id != m1.id));
    }

    #[test]
    fn delete_removes_both_files() {
        let (_dir, paths, embedder) = setup();
        let created = create(
            &paths,
            &embedder,
            NewMemory {
                learning: "Something learned",
                context: "",
                memory_type: "factual",
                domain: "general",
                confidence: "low",
                source_session: None,
                source_task: None,
                trigger: None,
            },
        )
        .unwrap();
        assert!(delete(&paths, &created.id).unwrap());
        assert!(!memory_path(&paths, &created.id).exists());
        assert!(!embedding_path(&paths, &created.id).exists());
        assert!(!delete(&paths, &created.id).unwrap());
    }
}
