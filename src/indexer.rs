//! Aggregates per-item embeddings into a flat matrix index with parallel
//! id/meta side-files. The Indexer is the sole writer of `.cortex/index/`;
//! everything else only reads it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde_json::Value as Json;

use crate::config::CortexPaths;
use crate::error::{CortexError, Result};
use crate::frontmatter::{self, Value as FmValue};

pub const KIND_CHUNKS: &str = "chunks";
pub const KIND_MEMORIES: &str = "memories";

/// A loaded index: the flat `(N, D)` embedding matrix, the id list in row
/// order, and the id→metadata map.
#[derive(Debug, Clone, Default)]
pub struct IndexData {
    pub matrix: Vec<f32>,
    pub dim: usize,
    pub ids: Vec<String>,
    pub metadata: HashMap<String, Json>,
}

impl IndexData {
    pub fn row(&self, i: usize) -> &[f32] {
        &self.matrix[i * self.dim..(i + 1) * self.dim]
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

struct ScannedItem {
    id: String,
    md_path: PathBuf,
    emb_path: PathBuf,
}

fn scan_chunks(chunks_dir: &Path) -> Vec<ScannedItem> {
    let mut items = Vec::new();
    let Ok(domains) = fs::read_dir(chunks_dir) else {
        return items;
    };
    let mut domain_dirs: Vec<PathBuf> = domains
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    domain_dirs.sort();

    for domain_dir in domain_dirs {
        let Ok(files) = fs::read_dir(&domain_dir) else {
            continue;
        };
        let mut names: Vec<PathBuf> = files
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "md").unwrap_or(false))
            .collect();
        names.sort();
        for md_path in names {
            let id = md_path.file_stem().unwrap().to_string_lossy().to_string();
            let emb_path = domain_dir.join(format!("{id}.emb"));
            items.push(ScannedItem { id, md_path, emb_path });
        }
    }
    items
}

fn scan_memories(memories_dir: &Path) -> Vec<ScannedItem> {
    let mut items = Vec::new();
    let Ok(files) = fs::read_dir(memories_dir) else {
        return items;
    };
    let mut names: Vec<PathBuf> = files
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "md").unwrap_or(false))
        .collect();
    names.sort();
    for md_path in names {
        let id = md_path.file_stem().unwrap().to_string_lossy().to_string();
        let emb_path = memories_dir.join(format!("{id}.emb"));
        items.push(ScannedItem { id, md_path, emb_path });
    }
    items
}

fn read_embedding(path: &Path) -> Result<Vec<f32>> {
    let bytes = fs::read(path)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn frontmatter_to_json(fields: &[(String, FmValue)]) -> Json {
    let mut map = serde_json::Map::new();
    for (key, value) in fields {
        let json_value = match value {
            FmValue::Null => Json::Null,
            FmValue::Bool(b) => Json::Bool(*b),
            FmValue::Int(n) => Json::from(*n),
            FmValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            FmValue::Str(s) => Json::String(s.clone()),
            FmValue::Array(items) => {
                Json::Array(items.iter().map(|s| Json::String(s.clone())).collect())
            }
        };
        map.insert(key.clone(), json_value);
    }
    Json::Object(map)
}

/// Build (or rebuild) the index for `kind`. Walks the source tree, requires
/// every item to have a paired embedding file (skipping and warning
/// otherwise), and writes the three sidecar files as a unit.
pub fn build(paths: &CortexPaths, kind: &str) -> Result<(usize, PathBuf)> {
    let items = if kind == KIND_CHUNKS {
        scan_chunks(&paths.chunks_dir())
    } else {
        scan_memories(&paths.memories_dir())
    };

    if items.is_empty() {
        return Ok((0, paths.index_dir().join(format!("{kind}.matrix"))));
    }

    // Read-only phase: parallel file reads, order preserved by `map`.
    let read: Vec<Option<(String, Vec<u8>, Vec<f32>)>> = items
        .par_iter()
        .map(|item| -> Option<(String, Vec<u8>, Vec<f32>)> {
            if !item.emb_path.exists() {
                crate::debug_log!("[cortex] no embedding for {}, skipping", item.id);
                return None;
            }
            let content = fs::read(&item.md_path).ok()?;
            let embedding = read_embedding(&item.emb_path).ok()?;
            Some((item.id.clone(), content, embedding))
        })
        .collect();

    let mut matrix = Vec::new();
    let mut dim = 0usize;
    let mut ids = Vec::new();
    let mut metadata = HashMap::new();

    for entry in read.into_iter().flatten() {
        let (id, content, embedding) = entry;
        let text = String::from_utf8_lossy(&content);
        let Some(fm) = frontmatter::parse(&text) else {
            crate::debug_log!("[cortex] malformed frontmatter for {id}, skipping");
            continue;
        };
        if dim == 0 {
            dim = embedding.len();
        } else if embedding.len() != dim {
            crate::debug_log!("[cortex] dimension mismatch for {id}, skipping");
            continue;
        }
        matrix.extend_from_slice(&embedding);
        metadata.insert(id.clone(), frontmatter_to_json(&fm.fields));
        ids.push(id);
    }

    let index_dir = paths.index_dir();
    fs::create_dir_all(&index_dir)?;

    let matrix_path = index_dir.join(format!("{kind}.matrix"));
    let ids_path = index_dir.join(format!("{kind}.ids"));
    let meta_path = index_dir.join(format!("{kind}.meta"));

    let matrix_bytes: Vec<u8> = matrix.iter().flat_map(|f| f.to_le_bytes()).collect();
    let ids_json = serde_json::to_vec(&ids)?;
    let meta_json = serde_json::to_vec(&metadata)?;

    // Write to temp paths, then rename into place, so a reader never
    // observes one of the three files updated without the other two.
    let matrix_tmp = index_dir.join(format!("{kind}.matrix.tmp"));
    let ids_tmp = index_dir.join(format!("{kind}.ids.tmp"));
    let meta_tmp = index_dir.join(format!("{kind}.meta.tmp"));

    fs::write(&matrix_tmp, &matrix_bytes)?;
    fs::write(&ids_tmp, &ids_json)?;
    fs::write(&meta_tmp, &meta_json)?;

    fs::rename(&matrix_tmp, &matrix_path)?;
    fs::rename(&ids_tmp, &ids_path)?;
    fs::rename(&meta_tmp, &meta_path)?;

    Ok((ids.len(), matrix_path))
}

/// Load an index. Fails with `IndexMissing` if the matrix file is absent;
/// tolerates missing `ids`/`meta` sidecars by returning empty collections.
pub fn load(paths: &CortexPaths, kind: &'static str) -> Result<IndexData> {
    let index_dir = paths.index_dir();
    let matrix_path = index_dir.join(format!("{kind}.matrix"));
    if !matrix_path.exists() {
        return Err(CortexError::IndexMissing(kind));
    }

    let matrix_bytes = fs::read(&matrix_path)?;
    let matrix: Vec<f32> = matrix_bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let ids_path = index_dir.join(format!("{kind}.ids"));
    let ids: Vec<String> = if ids_path.exists() {
        serde_json::from_slice(&fs::read(&ids_path)?).unwrap_or_default()
    } else {
        Vec::new()
    };

    let meta_path = index_dir.join(format!("{kind}.meta"));
    let metadata: HashMap<String, Json> = if meta_path.exists() {
        serde_json::from_slice(&fs::read(&meta_path)?).unwrap_or_default()
    } else {
        HashMap::new()
    };

    let dim = if ids.is_empty() { 0 } else { matrix.len() / ids.len() };

    Ok(IndexData {
        matrix,
        dim,
        ids,
        metadata,
    })
}

#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub count: usize,
    pub dim: usize,
    pub size_bytes: u64,
}

pub fn stats(paths: &CortexPaths, kind: &'static str) -> Option<IndexStats> {
    let matrix_path = paths.index_dir().join(format!("{kind}.matrix"));
    let size_bytes = fs::metadata(&matrix_path).ok()?.len();
    let data = load(paths, kind).ok()?;
    Some(IndexStats {
        count: data.len(),
        dim: data.dim,
        size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_chunk(paths: &CortexPaths, domain: &str, id: &str, embedding: &[f32]) {
        let dir = paths.chunks_domain_dir(domain);
        fs::create_dir_all(&dir).unwrap();
        let md = format!(
            "---\nid: {id}\nsource_doc: DOC-{domain}-001\nsource_section: \"Intro\"\nsource_lines: [1, 5]\nsource_path: \"doc.md\"\nsource_hash: \"h\"\ntokens: 60\nkeywords: []\ncreated: \"2026-01-01T00:00:00\"\nlast_retrieved: null\nretrieval_count: 0\n---\n\nbody\n"
        );
        fs::write(dir.join(format!("{id}.md")), md).unwrap();
        let bytes: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();
        fs::write(dir.join(format!("{id}.emb")), bytes).unwrap();
    }

    #[test]
    fn build_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let paths = CortexPaths::new(dir.path());
        write_chunk(&paths, "AUTH", "CHK-AUTH-001-001", &[1.0, 0.0, 0.0]);
        write_chunk(&paths, "AUTH", "CHK-AUTH-001-002", &[0.0, 1.0, 0.0]);

        let (count, _) = build(&paths, KIND_CHUNKS).unwrap();
        assert_eq!(count, 2);

        let data = load(&paths, KIND_CHUNKS).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.metadata.len(), 2);
        assert_eq!(data.dim, 3);
        assert_eq!(data.row(0), &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn load_missing_index_errors() {
        let dir = TempDir::new().unwrap();
        let paths = CortexPaths::new(dir.path());
        let err = load(&paths, KIND_CHUNKS).unwrap_err();
        assert!(matches!(err, CortexError::IndexMissing("chunks")));
    }

    #[test]
    fn build_skips_item_with_missing_embedding() {
        let dir = TempDir::new().unwrap();
        let paths = CortexPaths::new(dir.path());
        write_chunk(&paths, "AUTH", "CHK-AUTH-001-001", &[1.0, 0.0]);
        let orphan_dir = paths.chunks_domain_dir("AUTH");
        fs::write(
            orphan_dir.join("CHK-AUTH-001-002.md"),
            "---\nid: CHK-AUTH-001-002\n---\n\nbody\n",
        )
        .unwrap();

        let (count, _) = build(&paths, KIND_CHUNKS).unwrap();
        assert_eq!(count, 1);
    }
}
