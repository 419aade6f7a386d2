use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;

use cortex_memory::assembler::{self, AssembleRequest};
use cortex_memory::chunker;
use cortex_memory::config::{Config, CortexPaths};
use cortex_memory::embedding::{Embedder, StaticEmbedder};
use cortex_memory::extractor;
use cortex_memory::indexer::{self, KIND_CHUNKS, KIND_MEMORIES};
use cortex_memory::memory::{self, MemoryFilter, NewMemory};
use cortex_memory::retriever::{self, Kind};

#[derive(Debug, Parser)]
#[command(name = "cortex")]
#[command(version)]
#[command(about = "Local, file-backed knowledge store for LLM coding agents")]
struct Cli {
    /// Project root directory (default: current directory)
    #[arg(long, short = 'r', global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Initialize Cortex in a project directory
    Init,
    /// Chunk documents into semantic units
    Chunk {
        #[arg(long, short = 'p')]
        path: PathBuf,
        #[arg(long, short = 'd')]
        domain: Option<String>,
        /// Delete old chunks from this source and re-chunk
        #[arg(long)]
        refresh: bool,
    },
    /// Build or rebuild vector indices
    Index,
    /// Search for relevant chunks or memories
    Retrieve {
        #[arg(long, short = 'q')]
        query: String,
        #[arg(long, short = 'k', default_value_t = 5)]
        top_k: usize,
        #[arg(long = "type", short = 't', default_value = "both")]
        kind: String,
    },
    /// Assemble a context frame for a task
    Assemble {
        #[arg(long, short = 't')]
        task: String,
        #[arg(long, short = 'b')]
        budget: Option<usize>,
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Memory management commands
    Memory {
        #[command(subcommand)]
        action: MemoryCommand,
    },
    /// Extract learnings from session text
    Extract {
        #[arg(long, short = 't')]
        text: String,
        #[arg(long)]
        auto_save: bool,
    },
    /// Show Cortex status and statistics
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Chunk agents/ directory into Cortex as the METHODOLOGY domain
    Bootstrap {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
enum MemoryCommand {
    /// Add a new memory
    Add {
        #[arg(long, short = 'l')]
        learning: String,
        #[arg(long, short = 'c', default_value = "")]
        context: String,
        #[arg(long, short = 'd', default_value = "GENERAL")]
        domain: String,
        #[arg(long = "type", short = 't', default_value = "experiential")]
        memory_type: String,
        #[arg(long, default_value = "medium")]
        confidence: String,
    },
    /// List memories
    List {
        #[arg(long, short = 'd')]
        domain: Option<String>,
        #[arg(long = "type", short = 't')]
        memory_type: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Delete a memory
    Delete { memory_id: String },
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar.set_message(message.to_string());
    bar
}

fn load_embedder(config: &Config) -> Result<StaticEmbedder> {
    StaticEmbedder::load(&config.embedding_model)
        .with_context(|| format!("failed to load embedding model `{}`", config.embedding_model))
}

fn require_initialized(paths: &CortexPaths) -> Result<()> {
    memory::require_initialized(paths)?;
    Ok(())
}

fn cmd_init(paths: &CortexPaths) -> Result<()> {
    if paths.is_initialized() {
        println!("Cortex already initialized at: {}", paths.cortex_dir().display());
        return Ok(());
    }
    std::fs::create_dir_all(paths.chunks_dir())?;
    std::fs::create_dir_all(paths.index_dir())?;
    std::fs::create_dir_all(paths.memories_dir())?;
    println!("Initialized Cortex at: {}", paths.cortex_dir().display());
    println!("  Created: chunks/");
    println!("  Created: index/");
    println!("  Created: memories/");
    Ok(())
}

fn walk_markdown_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().map(|e| e == "md").unwrap_or(false) {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn cmd_chunk(
    paths: &CortexPaths,
    config: &Config,
    embedder: &dyn Embedder,
    path: &Path,
    domain: Option<&str>,
    refresh: bool,
) -> Result<()> {
    require_initialized(paths)?;
    if !path.exists() {
        anyhow::bail!("Path not found: {}", path.display());
    }

    let targets = if path.is_dir() {
        walk_markdown_files(path)
    } else {
        vec![path.to_path_buf()]
    };

    if refresh {
        let mut deleted_total = 0usize;
        for target in &targets {
            let ids = chunker::get_chunks_by_source(paths, target)?;
            if !ids.is_empty() {
                deleted_total += chunker::delete_chunks(paths, &ids)?;
            }
        }
        if deleted_total > 0 {
            println!("Deleted {deleted_total} old chunks");
        }
    }

    let mut total = 0usize;
    for target in &targets {
        let chunks = chunker::chunk(paths, config, embedder, target, domain)?;
        total += chunks.len();
    }
    println!("Created {total} chunks");

    if refresh {
        println!("Note: Run 'cortex index' to rebuild indices");
    }
    Ok(())
}

fn cmd_index(paths: &CortexPaths) -> Result<()> {
    require_initialized(paths)?;
    println!("Building indices...");
    for (label, kind) in [("chunks", KIND_CHUNKS), ("memories", KIND_MEMORIES)] {
        match indexer::build(paths, kind) {
            Ok((count, _)) => println!("  {label}: {count} vectors indexed"),
            Err(e) => println!("  {label}: skipped ({e})"),
        }
    }
    println!("Done.");
    Ok(())
}

fn cmd_retrieve(
    paths: &CortexPaths,
    embedder: &dyn Embedder,
    query: &str,
    top_k: usize,
    kind_str: &str,
) -> Result<()> {
    require_initialized(paths)?;
    let kind = match kind_str {
        "chunks" => Kind::Chunks,
        "memories" => Kind::Memories,
        "both" => Kind::Both,
        other => anyhow::bail!("unknown --type `{other}`, expected chunks, memories, or both"),
    };

    let results = retriever::retrieve(paths, embedder, query, top_k, kind, true)?;
    if results.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("Found {} results:\n", results.len());
    for (i, result) in results.iter().enumerate() {
        let content: String = result.content.as_deref().unwrap_or("").chars().take(200).collect();
        println!("{}. [{}] (score: {:.3})", i + 1, result.id, result.score);
        println!("   {content}...");
        println!();
    }
    Ok(())
}

fn cmd_assemble(
    paths: &CortexPaths,
    config: &Config,
    embedder: &dyn Embedder,
    task: &str,
    budget: Option<usize>,
    output: Option<&Path>,
) -> Result<()> {
    require_initialized(paths)?;
    let markdown = assembler::assemble_and_render(
        paths,
        config,
        embedder,
        AssembleRequest {
            task,
            acceptance_criteria: vec![],
            current_state: None,
            instructions: None,
            budget,
        },
        output,
    )?;

    match output {
        Some(path) => println!("Context frame written to: {}", path.display()),
        None => println!("{markdown}"),
    }
    Ok(())
}

fn cmd_memory_add(
    paths: &CortexPaths,
    embedder: &dyn Embedder,
    learning: &str,
    context: &str,
    domain: &str,
    memory_type: &str,
    confidence: &str,
) -> Result<()> {
    require_initialized(paths)?;
    let created = memory::create(
        paths,
        embedder,
        NewMemory {
            learning,
            context,
            memory_type,
            domain,
            confidence,
            source_session: None,
            source_task: None,
            trigger: None,
        },
    )?;
    println!("Created memory: {}", created.id);
    Ok(())
}

fn cmd_memory_list(
    paths: &CortexPaths,
    domain: Option<&str>,
    memory_type: Option<&str>,
    json_output: bool,
) -> Result<()> {
    require_initialized(paths)?;
    let memories = memory::list(
        paths,
        &MemoryFilter {
            domain,
            memory_type,
            confidence: None,
        },
    )?;

    if json_output {
        let out: Vec<_> = memories
            .iter()
            .map(|m| {
                json!({
                    "id": m.id,
                    "type": m.memory_type,
                    "domain": m.domain,
                    "confidence": m.confidence,
                    "learning": m.learning,
                    "created": m.created,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if memories.is_empty() {
        println!("No memories found.");
        return Ok(());
    }
    for m in &memories {
        println!("{} [{}] ({})", m.id, m.memory_type, m.confidence);
        println!("  Domain: {}", m.domain);
        let preview: String = m.learning.chars().take(80).collect();
        println!("  {preview}...");
        println!();
    }
    Ok(())
}

fn cmd_memory_delete(paths: &CortexPaths, id: &str) -> Result<()> {
    require_initialized(paths)?;
    if memory::delete(paths, id)? {
        println!("Deleted memory: {id}");
        Ok(())
    } else {
        eprintln!("Memory not found: {id}");
        std::process::exit(1);
    }
}

fn cmd_extract(
    paths: &CortexPaths,
    embedder: &dyn Embedder,
    text: &str,
    auto_save: bool,
) -> Result<()> {
    require_initialized(paths)?;
    let proposed = extractor::extract_memories(text, "low");

    println!("Extracted Learnings:");
    println!("{}", "=".repeat(40));
    println!();

    if proposed.is_empty() {
        println!("No learnings extracted.");
        return Ok(());
    }

    for (i, mem) in proposed.iter().enumerate() {
        println!("{}. [{}] ({})", i + 1, mem.domain, mem.confidence);
        println!("   Type: {}", mem.memory_type);
        println!("   Learning: {}", mem.learning);
        println!();
    }

    if auto_save {
        let indices: Vec<usize> = (1..=proposed.len()).collect();
        let saved = extractor::save_proposed_memories(paths, embedder, &proposed, &indices, None)?;
        println!("Saved {} memories.", saved.len());
    } else {
        println!("Use --auto-save to save these memories, or save selectively via 'cortex memory add'");
    }
    Ok(())
}

fn cmd_status(paths: &CortexPaths, json_output: bool) -> Result<()> {
    let initialized = paths.is_initialized();

    if !initialized {
        if json_output {
            println!("{}", serde_json::to_string_pretty(&json!({"initialized": false}))?);
        } else {
            println!("Cortex Status");
            println!("=============");
            println!();
            println!("Status: NOT INITIALIZED");
            println!();
            println!("Run: cortex init");
        }
        return Ok(());
    }

    let mut chunk_domains = Vec::new();
    let mut chunk_count = 0usize;
    if let Ok(entries) = std::fs::read_dir(paths.chunks_dir()) {
        let mut domains: Vec<PathBuf> = entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect();
        domains.sort();
        for domain_path in domains {
            let name = domain_path.file_name().unwrap().to_string_lossy().to_string();
            let count = std::fs::read_dir(&domain_path)
                .map(|it| it.flatten().filter(|e| e.path().extension().map(|x| x == "md").unwrap_or(false)).count())
                .unwrap_or(0);
            if count > 0 {
                chunk_count += count;
                chunk_domains.push((name, count));
            }
        }
    }

    let stale = chunker::get_stale_chunks(paths)?;
    let mut stale_by_source: std::collections::BTreeMap<String, (usize, &'static str)> = std::collections::BTreeMap::new();
    for s in &stale {
        let status = match &s.status {
            chunker::StaleStatus::Modified => "modified",
            chunker::StaleStatus::Deleted => "source deleted",
        };
        let entry = stale_by_source.entry(s.source_path.clone()).or_insert((0, status));
        entry.0 += 1;
    }

    let memories = memory::list(paths, &MemoryFilter::default())?;
    let mut by_type: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    let mut by_domain: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    for m in &memories {
        *by_type.entry(m.memory_type.clone()).or_insert(0) += 1;
        *by_domain.entry(m.domain.clone()).or_insert(0) += 1;
    }

    let chunks_stats = indexer::stats(paths, KIND_CHUNKS);
    let memories_stats = indexer::stats(paths, KIND_MEMORIES);
    let last_updated = last_index_update(paths);

    if json_output {
        let out = json!({
            "initialized": true,
            "chunks": {
                "count": chunk_count,
                "domains": chunk_domains.iter().map(|(n, c)| json!({"name": n, "count": c})).collect::<Vec<_>>(),
            },
            "memories": {
                "count": memories.len(),
                "by_type": by_type,
                "by_domain": by_domain,
            },
            "indices": {
                "chunks": chunks_stats.as_ref().map(|s| json!({"count": s.count, "size_bytes": s.size_bytes})),
                "memories": memories_stats.as_ref().map(|s| json!({"count": s.count, "size_bytes": s.size_bytes})),
            },
            "stale": stale_by_source.iter().map(|(src, (count, status))| json!({"source": src, "count": count, "status": status})).collect::<Vec<_>>(),
            "last_updated": last_updated,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Cortex Status");
    println!("=============");
    println!();
    println!("Status: INITIALIZED");
    println!();
    println!("Chunks: {chunk_count} total");
    for (name, count) in &chunk_domains {
        println!("  - {name}: {count}");
    }

    if !stale_by_source.is_empty() {
        println!();
        println!("Stale Chunks:");
        for (src, (count, status)) in &stale_by_source {
            println!("  - {src} ({count} chunks, {status})");
        }
        println!();
        println!("  Refresh with: cortex chunk --path <source> --refresh");
    }
    println!();

    println!("Memories: {} total", memories.len());
    if !by_type.is_empty() {
        println!("  By type:");
        for (t, c) in &by_type {
            println!("    - {t}: {c}");
        }
    }
    if !by_domain.is_empty() {
        println!("  By domain:");
        for (d, c) in &by_domain {
            println!("    - {d}: {c}");
        }
    }
    println!();

    println!("Indices:");
    match &chunks_stats {
        Some(s) => println!("  - chunks: {} vectors ({:.1} KB)", s.count, s.size_bytes as f64 / 1024.0),
        None => println!("  - chunks: NOT BUILT"),
    }
    match &memories_stats {
        Some(s) => println!("  - memories: {} vectors ({:.1} KB)", s.count, s.size_bytes as f64 / 1024.0),
        None => println!("  - memories: NOT BUILT"),
    }

    if let Some(last_updated) = &last_updated {
        println!();
        println!("Last updated: {last_updated}");
    }
    Ok(())
}

/// Latest mtime across `.cortex/index/*`, as an RFC 3339 timestamp. `None` if
/// the index directory is absent or empty.
fn last_index_update(paths: &CortexPaths) -> Option<String> {
    let entries = std::fs::read_dir(paths.index_dir()).ok()?;
    let latest = entries
        .flatten()
        .filter_map(|e| e.metadata().ok()?.modified().ok())
        .max()?;
    Some(DateTime::<Local>::from(latest).to_rfc3339())
}

fn cmd_bootstrap(paths: &CortexPaths, config: &Config, embedder: &dyn Embedder, force: bool) -> Result<()> {
    require_initialized(paths)?;
    let agents_path = paths.project_root.join("agents");
    if !agents_path.exists() {
        anyhow::bail!("agents/ directory not found");
    }

    let domain = "METHODOLOGY";
    let extensions = ["md", "yaml", "yml"];
    let mut total_chunks = 0usize;
    let mut total_deleted = 0usize;

    let mut stack = vec![agents_path];
    let mut files = Vec::new();
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        let mut names: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        names.sort();
        for path in names {
            if path.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .map(|e| extensions.contains(&e.to_string_lossy().as_ref()))
                .unwrap_or(false)
            {
                files.push(path);
            }
        }
    }

    for file_path in &files {
        if force {
            let old_chunks = chunker::get_chunks_by_source(paths, file_path)?;
            if !old_chunks.is_empty() {
                total_deleted += chunker::delete_chunks(paths, &old_chunks)?;
            }
        }
        let chunks = chunker::chunk(paths, config, embedder, file_path, Some(domain))?;
        total_chunks += chunks.len();
    }

    if total_deleted > 0 {
        println!("Deleted {total_deleted} old chunks");
    }
    println!("Bootstrapped {total_chunks} chunks from agents/ (domain: {domain})");
    println!("Run 'cortex index' to rebuild indices");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = cli.root.clone().unwrap_or(std::env::current_dir().context("failed to get current directory")?);
    let paths = CortexPaths::new(root);
    let config = Config::load(&paths);

    match cli.command {
        Command::Init => cmd_init(&paths),
        Command::Chunk { path, domain, refresh } => {
            let bar = spinner("loading embedding model...");
            let embedder = load_embedder(&config)?;
            bar.finish_and_clear();
            cmd_chunk(&paths, &config, &embedder, &path, domain.as_deref(), refresh)
        }
        Command::Index => cmd_index(&paths),
        Command::Retrieve { query, top_k, kind } => {
            let embedder = load_embedder(&config)?;
            cmd_retrieve(&paths, &embedder, &query, top_k, &kind)
        }
        Command::Assemble { task, budget, output } => {
            let embedder = load_embedder(&config)?;
            cmd_assemble(&paths, &config, &embedder, &task, budget, output.as_deref())
        }
        Command::Memory { action } => match action {
            MemoryCommand::Add { learning, context, domain, memory_type, confidence } => {
                let embedder = load_embedder(&config)?;
                cmd_memory_add(&paths, &embedder, &learning, &context, &domain, &memory_type, &confidence)
            }
            MemoryCommand::List { domain, memory_type, json } => {
                cmd_memory_list(&paths, domain.as_deref(), memory_type.as_deref(), json)
            }
            MemoryCommand::Delete { memory_id } => cmd_memory_delete(&paths, &memory_id),
        },
        Command::Extract { text, auto_save } => {
            let embedder = load_embedder(&config)?;
            cmd_extract(&paths, &embedder, &text, auto_save)
        }
        Command::Status { json } => cmd_status(&paths, json),
        Command::Bootstrap { force } => {
            let embedder = load_embedder(&config)?;
            cmd_bootstrap(&paths, &config, &embedder, force)
        }
    }
}
