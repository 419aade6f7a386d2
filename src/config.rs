use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Resolves the on-disk layout rooted at `<project>/.cortex/`.
///
/// Every other component takes a `&CortexPaths` rather than re-deriving these
/// join()s itself, so the on-disk layout has exactly one place it's spelled
/// out.
#[derive(Debug, Clone)]
pub struct CortexPaths {
    pub project_root: PathBuf,
}

impl CortexPaths {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    pub fn cortex_dir(&self) -> PathBuf {
        self.project_root.join(".cortex")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.cortex_dir().join("chunks")
    }

    pub fn chunks_domain_dir(&self, domain: &str) -> PathBuf {
        self.chunks_dir().join(domain)
    }

    pub fn memories_dir(&self) -> PathBuf {
        self.cortex_dir().join("memories")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.cortex_dir().join("index")
    }

    pub fn config_path(&self) -> PathBuf {
        self.cortex_dir().join("config.json")
    }

    pub fn is_initialized(&self) -> bool {
        self.cortex_dir().is_dir()
    }

    /// Normalize an absolute or relative path to project-root-relative form,
    /// the form `source_path` is always stored in.
    pub fn relativize(&self, path: &Path) -> PathBuf {
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        };
        match abs.strip_prefix(&self.project_root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => abs,
        }
    }
}

/// Fixed scoring weights, embedding dimension, and size knobs. Every field
/// here has an environment variable override; scoring weights are
/// deliberately not configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub embedding_model: String,
    pub embedding_dimensions: usize,

    pub chunk_size: usize,
    pub chunk_min: usize,
    pub chunk_overlap: usize,

    pub retrieval_top_k: usize,
    pub memory_top_k: usize,

    pub token_budget: usize,
}

pub const SCORE_SEMANTIC: f32 = 0.6;
pub const SCORE_KEYWORD: f32 = 0.2;
pub const SCORE_RECENCY: f32 = 0.1;
pub const SCORE_FREQUENCY: f32 = 0.1;

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding_model: "minishlab/potion-retrieval-32M".to_string(),
            embedding_dimensions: 384,
            chunk_size: 500,
            chunk_min: 50,
            chunk_overlap: 50,
            retrieval_top_k: 10,
            memory_top_k: 5,
            token_budget: 15_000,
        }
    }
}

impl Config {
    /// Load `.cortex/config.json` if present, falling back to defaults for a
    /// missing or unparsable file, then apply environment variable overrides
    /// on top: a project-local JSON file read once at startup, env vars
    /// winning last.
    pub fn load(paths: &CortexPaths) -> Self {
        let mut cfg = Self::from_file(&paths.config_path());
        cfg.apply_env_overrides();
        cfg
    }

    fn from_file(path: &Path) -> Self {
        let Ok(text) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&text).unwrap_or_else(|_| Self::default())
    }

    /// Build a config from environment variables alone, ignoring any config
    /// file. Used by tests that want deterministic config without a project
    /// directory.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CORTEX_EMBEDDING_MODEL") {
            self.embedding_model = v;
        }
        if let Some(v) = env_usize("CORTEX_CHUNK_SIZE") {
            self.chunk_size = v;
        }
        if let Some(v) = env_usize("CORTEX_CHUNK_MIN") {
            self.chunk_min = v;
        }
        if let Some(v) = env_usize("CORTEX_CHUNK_OVERLAP") {
            self.chunk_overlap = v;
        }
        if let Some(v) = env_usize("CORTEX_RETRIEVAL_TOP_K") {
            self.retrieval_top_k = v;
        }
        if let Some(v) = env_usize("CORTEX_MEMORY_TOP_K") {
            self.memory_top_k = v;
        }
        if let Some(v) = env_usize("CORTEX_TOKEN_BUDGET") {
            self.token_budget = v;
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.chunk_size, 500);
        assert_eq!(cfg.chunk_min, 50);
        assert_eq!(cfg.chunk_overlap, 50);
        assert_eq!(cfg.retrieval_top_k, 10);
        assert_eq!(cfg.memory_top_k, 5);
        assert_eq!(cfg.token_budget, 15_000);
        assert_eq!(cfg.embedding_dimensions, 384);
    }

    #[test]
    fn paths_relativize_absolute_and_relative() {
        let paths = CortexPaths::new("/tmp/proj");
        assert_eq!(
            paths.relativize(Path::new("/tmp/proj/docs/auth.md")),
            PathBuf::from("docs/auth.md")
        );
        assert_eq!(
            paths.relativize(Path::new("docs/auth.md")),
            PathBuf::from("docs/auth.md")
        );
    }

    #[test]
    fn layout_is_rooted_under_dot_cortex() {
        let paths = CortexPaths::new("/tmp/proj");
        assert_eq!(paths.cortex_dir(), PathBuf::from("/tmp/proj/.cortex"));
        assert_eq!(paths.chunks_dir(), PathBuf::from("/tmp/proj/.cortex/chunks"));
        assert_eq!(paths.memories_dir(), PathBuf::from("/tmp/proj/.cortex/memories"));
        assert_eq!(paths.index_dir(), PathBuf::from("/tmp/proj/.cortex/index"));
    }

    #[test]
    fn load_reads_config_json_when_present() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = CortexPaths::new(dir.path());
        std::fs::create_dir_all(paths.cortex_dir()).unwrap();
        std::fs::write(
            paths.config_path(),
            r#"{"chunk_size": 900, "memory_top_k": 8}"#,
        )
        .unwrap();

        let cfg = Config::load(&paths);
        assert_eq!(cfg.chunk_size, 900);
        assert_eq!(cfg.memory_top_k, 8);
        // Fields absent from the file fall back to Config::default() via #[serde(default)].
        assert_eq!(cfg.chunk_min, 50);
    }

    #[test]
    fn load_falls_back_to_defaults_without_a_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = CortexPaths::new(dir.path());
        let cfg = Config::load(&paths);
        assert_eq!(cfg.chunk_size, Config::default().chunk_size);
    }
}
