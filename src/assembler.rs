//! Retrieves, loads bodies, truncates each section to its token budget, and
//! renders a position-optimized markdown context frame. Exploits known
//! "lost in the middle" attention bias: the most critical directives sit at
//! the two ends of the frame.

use chrono::Local;

use crate::config::{Config, CortexPaths};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::memory;
use crate::retriever::{self, Kind, RetrievalResult};
use crate::tokenizer::{count_tokens, truncate_to_budget};

const CHUNK_CAP: usize = 10;
const MEMORY_CAP: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub task_definition: usize,
    pub chunks: usize,
    pub memories: usize,
    pub current_state: usize,
    pub instructions: usize,
}

impl ContextBudget {
    /// Proportional split of a total budget: task 13%, chunks 65%,
    /// memories 13%, current_state 6%, instructions 3%.
    pub fn from_total(total: usize) -> Self {
        Self {
            task_definition: (total as f64 * 0.13) as usize,
            chunks: (total as f64 * 0.65) as usize,
            memories: (total as f64 * 0.13) as usize,
            current_state: (total as f64 * 0.06) as usize,
            instructions: (total as f64 * 0.03) as usize,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssembledChunk {
    pub result: RetrievalResult,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct AssembledMemory {
    pub result: RetrievalResult,
    pub learning: String,
}

#[derive(Debug, Clone)]
pub struct ContextFrame {
    pub task: String,
    pub acceptance_criteria: Vec<String>,
    pub chunks: Vec<AssembledChunk>,
    pub memories: Vec<AssembledMemory>,
    pub current_state: Option<String>,
    pub instructions: Option<String>,
    pub generated_at: String,
    pub budget_total: usize,
    pub budget_used: usize,
}

impl ContextFrame {
    pub fn to_markdown(&self) -> String {
        let mut lines: Vec<String> = Vec::new();

        let title: String = self.task.chars().take(50).collect();
        lines.push(format!("<!-- CONTEXT FRAME: {title} -->"));
        lines.push(format!("<!-- Generated: {} -->", self.generated_at));
        lines.push(format!(
            "<!-- Budget: {} / Used: {} -->",
            self.budget_total, self.budget_used
        ));
        lines.push(String::new());

        lines.push("## CRITICAL: Task Definition".to_string());
        lines.push(String::new());
        lines.push(format!("**Task:** {}", self.task));
        lines.push(String::new());
        if !self.acceptance_criteria.is_empty() {
            lines.push("**Acceptance Criteria:**".to_string());
            for criterion in &self.acceptance_criteria {
                lines.push(format!("- {criterion}"));
            }
            lines.push(String::new());
        }
        lines.push("---".to_string());
        lines.push(String::new());

        if !self.chunks.is_empty() {
            lines.push("## Relevant Knowledge".to_string());
            lines.push(String::new());
            for chunk in &self.chunks {
                let section = chunk
                    .result
                    .metadata
                    .get("source_section")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown");
                let source = chunk
                    .result
                    .metadata
                    .get("source_doc")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                lines.push(format!("### {section} ({source})"));
                lines.push(format!("<!-- Relevance: {:.2} -->", chunk.result.score));
                lines.push(String::new());
                lines.push(chunk.content.clone());
                lines.push(String::new());
            }
            lines.push("---".to_string());
            lines.push(String::new());
        }

        if !self.memories.is_empty() {
            lines.push("## Past Learnings".to_string());
            lines.push(String::new());
            for mem in &self.memories {
                let confidence = mem
                    .result
                    .metadata
                    .get("confidence")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                let domain = mem
                    .result
                    .metadata
                    .get("domain")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                lines.push(format!(
                    "- **{}** ({confidence}, {domain}): {}",
                    mem.result.id, mem.learning
                ));
            }
            lines.push(String::new());
            lines.push("---".to_string());
            lines.push(String::new());
        }

        if let Some(state) = &self.current_state {
            lines.push("## Current State".to_string());
            lines.push(String::new());
            lines.push(state.clone());
            lines.push(String::new());
            lines.push("---".to_string());
            lines.push(String::new());
        }

        lines.push("## Instructions".to_string());
        lines.push(String::new());
        match &self.instructions {
            Some(instructions) => lines.push(instructions.clone()),
            None => lines.push(
                "Complete the task described above using the relevant knowledge and learnings provided."
                    .to_string(),
            ),
        }
        lines.push(String::new());

        lines.join("\n")
    }
}

pub struct AssembleRequest<'a> {
    pub task: &'a str,
    pub acceptance_criteria: Vec<String>,
    pub current_state: Option<String>,
    pub instructions: Option<String>,
    pub budget: Option<usize>,
}

fn populate_chunks(
    paths: &CortexPaths,
    embedder: &dyn Embedder,
    task: &str,
    budget: usize,
) -> Result<Vec<AssembledChunk>> {
    let results = retriever::retrieve(paths, embedder, task, CHUNK_CAP, Kind::Chunks, true)?;

    let mut chunks = Vec::new();
    let mut used = 0usize;

    for mut result in results {
        let Some(content) = result.content.take() else {
            continue;
        };
        let content_tokens = count_tokens(&content);

        if used + content_tokens <= budget {
            used += content_tokens;
            chunks.push(AssembledChunk { result, content });
            continue;
        }

        let remaining = budget.saturating_sub(used);
        if remaining > 100 {
            let truncated = truncate_to_budget(&content, remaining);
            chunks.push(AssembledChunk {
                result,
                content: truncated,
            });
        }
        break;
    }

    Ok(chunks)
}

fn populate_memories(
    paths: &CortexPaths,
    embedder: &dyn Embedder,
    task: &str,
    budget: usize,
) -> Result<Vec<AssembledMemory>> {
    let results = retriever::retrieve(paths, embedder, task, MEMORY_CAP, Kind::Memories, false)?;

    let mut memories = Vec::new();
    let mut used = 0usize;

    for result in results {
        let Some(learning) = memory::get(paths, &result.id)?.map(|m| m.learning) else {
            continue;
        };
        let content_tokens = count_tokens(&learning);

        // Unlike chunks, a memory is never truncated: either it fits whole
        // or it's dropped.
        if used + content_tokens <= budget {
            used += content_tokens;
            memory::increment_retrieval(paths, embedder, &result.id)?;
            memories.push(AssembledMemory { result, learning });
        }
    }

    Ok(memories)
}

/// Assemble a context frame for `task`.
pub fn assemble(
    paths: &CortexPaths,
    config: &Config,
    embedder: &dyn Embedder,
    request: AssembleRequest,
) -> Result<ContextFrame> {
    let total_budget = request.budget.unwrap_or(config.token_budget);
    let allocation = ContextBudget::from_total(total_budget);

    let chunks = populate_chunks(paths, embedder, request.task, allocation.chunks)?;
    let memories = populate_memories(paths, embedder, request.task, allocation.memories)?;

    let mut task_section = format!("**Task:** {}\n", request.task);
    if !request.acceptance_criteria.is_empty() {
        task_section.push_str("\n**Acceptance Criteria:**\n");
        for criterion in &request.acceptance_criteria {
            task_section.push_str(&format!("- {criterion}\n"));
        }
    }
    let _ = truncate_to_budget(&task_section, allocation.task_definition);

    let current_state = request
        .current_state
        .map(|s| truncate_to_budget(&s, allocation.current_state));
    let instructions = request
        .instructions
        .map(|s| truncate_to_budget(&s, allocation.instructions));

    let mut frame = ContextFrame {
        task: request.task.to_string(),
        acceptance_criteria: request.acceptance_criteria,
        chunks,
        memories,
        current_state,
        instructions,
        generated_at: Local::now().to_rfc3339(),
        budget_total: total_budget,
        budget_used: 0,
    };

    let markdown = frame.to_markdown();
    frame.budget_used = count_tokens(&markdown);
    Ok(frame)
}

/// Assemble and render to markdown, optionally writing the result to
/// `output_path`. Always returns the rendered string.
pub fn assemble_and_render(
    paths: &CortexPaths,
    config: &Config,
    embedder: &dyn Embedder,
    request: AssembleRequest,
    output_path: Option<&std::path::Path>,
) -> Result<String> {
    let frame = assemble(paths, config, embedder, request)?;
    let markdown = frame.to_markdown();
    if let Some(path) = output_path {
        std::fs::write(path, &markdown)?;
    }
    Ok(markdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::test_support::StubEmbedder;
    use crate::indexer;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CortexPaths, Config, StubEmbedder) {
        let dir = TempDir::new().unwrap();
        let paths = CortexPaths::new(dir.path());
        let mut config = Config::default();
        config.chunk_size = 60;
        config.chunk_min = 5;
        config.chunk_overlap = 5;
        (dir, paths, config, StubEmbedder::new(16))
    }

    #[test]
    fn budget_allocation_matches_fixed_proportions() {
        let budget = ContextBudget::from_total(1000);
        assert_eq!(budget.task_definition, 130);
        assert_eq!(budget.chunks, 650);
        assert_eq!(budget.memories, 130);
        assert_eq!(budget.current_state, 60);
        assert_eq!(budget.instructions, 30);
    }

    #[test]
    fn assemble_with_empty_store_falls_back_to_default_instructions() {
        let (_dir, paths, config, embedder) = setup();
        std::fs::create_dir_all(paths.cortex_dir()).unwrap();

        let frame = assemble(
            &paths,
            &config,
            &embedder,
            AssembleRequest {
                task: "Implement password reset",
                acceptance_criteria: vec![],
                current_state: None,
                instructions: None,
                budget: None,
            },
        )
        .unwrap();

        assert!(frame.chunks.is_empty());
        assert!(frame.memories.is_empty());
        let markdown = frame.to_markdown();
        assert!(markdown.contains("## Instructions"));
        assert!(markdown.contains("Complete the task described above"));
    }

    #[test]
    fn increment_on_retrieve_bumps_retrieval_count() {
        let (_dir, paths, config, embedder) = setup();
        std::fs::create_dir_all(paths.memories_dir()).unwrap();

        let created = memory::create(
            &paths,
            &embedder,
            memory::NewMemory {
                learning: "Password reset tokens must be single use",
                context: "Found while reviewing the reset flow",
                memory_type: "experiential",
                domain: "auth",
                confidence: "high",
                source_session: None,
                source_task: None,
                trigger: None,
            },
        )
        .unwrap();
        indexer::build(&paths, indexer::KIND_MEMORIES).unwrap();

        let frame = assemble(
            &paths,
            &config,
            &embedder,
            AssembleRequest {
                task: "Password reset tokens must be single use",
                acceptance_criteria: vec![],
                current_state: None,
                instructions: None,
                budget: None,
            },
        )
        .unwrap();

        assert_eq!(frame.memories.len(), 1);
        let reloaded = memory::get(&paths, &created.id).unwrap().unwrap();
        assert_eq!(reloaded.retrieval_count, 1);
        assert!(reloaded.last_retrieved.is_some());
    }
}
