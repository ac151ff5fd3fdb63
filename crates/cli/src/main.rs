//! graphkb CLI
//!
//! A command-line interface for the graph knowledge base.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use graphkb_core::{CommunityAlgorithm, DetectionReport, Document, SearchMode};
use graphkb_db::{GraphStore, MemoryStore, SurrealStore};
use graphkb_engine::{
    AddOptions, DetectOptions, EngineError, KnowledgeBase, KnowledgeBaseConfig, SearchOptions,
    TeiClient, TgiClient,
};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// graphkb - a graph-enhanced knowledge base for your documents
#[derive(Parser)]
#[command(name = "graphkb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database path (defaults to ~/.graphkb/data)
    #[arg(short, long, global = true)]
    db_path: Option<PathBuf>,

    /// Use an in-memory store (nothing is persisted)
    #[arg(long, global = true)]
    memory: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Skip entity extraction
    #[arg(long, global = true)]
    no_entities: bool,

    /// Skip relationship extraction
    #[arg(long, global = true)]
    no_relationships: bool,

    /// Enable community detection
    #[arg(long, global = true)]
    communities: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add documents from files or inline text
    Add {
        /// Files to ingest, one document per file
        files: Vec<PathBuf>,

        /// Inline text to ingest as a single document
        #[arg(short, long)]
        text: Option<String>,
    },

    /// Retrieve documents for a query
    Retrieve {
        /// Search query
        query: String,

        /// vector, graph, hybrid or global
        #[arg(short, long, default_value = "hybrid")]
        mode: String,

        /// Maximum results
        #[arg(short, long, default_value = "5")]
        limit: usize,

        /// Minimum similarity for vector results
        #[arg(long)]
        threshold: Option<f32>,

        /// Graph traversal depth
        #[arg(long, default_value = "2")]
        max_hops: u32,

        /// Hybrid weight of the vector score
        #[arg(long, default_value = "0.5")]
        vector_weight: f32,

        /// Hybrid weight of the graph score
        #[arg(long, default_value = "0.5")]
        graph_weight: f32,
    },

    /// Detect and summarize entity communities
    DetectCommunities {
        /// leiden or louvain (defaults to the configured algorithm)
        #[arg(short, long)]
        algorithm: Option<String>,
    },

    /// Interactive mode
    Interactive,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = KnowledgeBaseConfig::from_env()?;
    if cli.no_entities {
        config.enable_entity_extraction = false;
    }
    if cli.no_relationships {
        config.enable_relationship_extraction = false;
    }
    if cli.communities {
        config.enable_community_detection = true;
    }

    // Validate everything that needs no services first
    let documents = match &cli.command {
        Commands::Add { files, text } => load_documents(files, text.as_deref())?,
        _ => Vec::new(),
    };
    let mode = match &cli.command {
        Commands::Retrieve { mode, .. } => Some(parse_mode(mode)?),
        _ => None,
    };
    let algorithm = match &cli.command {
        Commands::DetectCommunities { algorithm } => {
            if !config.enable_community_detection {
                bail!("Community detection is disabled; pass --communities to enable it");
            }
            algorithm.as_deref().map(parse_algorithm).transpose()?
        }
        _ => None,
    };

    let tei = TeiClient::from_env();
    let tgi = TgiClient::from_env();
    let needs_tgi = config.needs_generator()
        && matches!(cli.command, Commands::Add { .. } | Commands::Interactive);
    check_services(&tei, needs_tgi.then_some(&tgi)).await?;

    let store = open_store(cli.memory, cli.db_path.clone()).await?;
    let kb = KnowledgeBase::builder(Arc::new(tei))
        .graph_store(store)
        .generator(Arc::new(tgi))
        .config(config)
        .build()?;

    match cli.command {
        Commands::Add { .. } => {
            cmd_add(&kb, documents).await?;
        }
        Commands::Retrieve {
            query,
            limit,
            threshold,
            max_hops,
            vector_weight,
            graph_weight,
            ..
        } => {
            let options = SearchOptions::default()
                .with_max_hops(max_hops)
                .with_weights(vector_weight, graph_weight);
            let mode = mode.unwrap_or_default();
            cmd_retrieve(&kb, &query, limit, threshold, mode, &options).await?;
        }
        Commands::DetectCommunities { .. } => {
            let report = kb
                .detect_communities(algorithm, &DetectOptions::default())
                .await?;
            print_report(&report)?;
        }
        Commands::Interactive => {
            cmd_interactive(&kb).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn parse_mode(raw: &str) -> Result<SearchMode> {
    Ok(raw.parse::<SearchMode>().map_err(EngineError::from)?)
}

fn parse_algorithm(raw: &str) -> Result<CommunityAlgorithm> {
    Ok(raw.parse::<CommunityAlgorithm>().map_err(EngineError::from)?)
}

async fn check_services(tei: &TeiClient, tgi: Option<&TgiClient>) -> Result<()> {
    let tei_ok = tei.health().await.unwrap_or(false);
    if !tei_ok {
        eprintln!("Error: embeddings service is not reachable.");
        eprintln!("  Embeddings: {}", tei.base_url());
        bail!("Embeddings service unavailable");
    }

    if let Some(tgi) = tgi {
        let tgi_ok = tgi.health().await.unwrap_or(false);
        if !tgi_ok {
            eprintln!("Error: text generation service is not reachable.");
            eprintln!("  Generation: {}", tgi.base_url());
            eprintln!("Pass --no-entities --no-relationships to ingest without it.");
            bail!("Text generation service unavailable");
        }
    }
    Ok(())
}

fn default_db_path() -> Result<PathBuf> {
    let mut path = dirs::home_dir().context("Could not find home directory")?;
    path.push(".graphkb");
    path.push("data");
    Ok(path)
}

async fn open_store(memory: bool, db_path: Option<PathBuf>) -> Result<Arc<dyn GraphStore>> {
    if memory {
        info!("Using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let db_path = match db_path {
        Some(path) => path,
        None => default_db_path()?,
    };
    open_surreal(&db_path).await
}

#[cfg(feature = "rocksdb")]
async fn open_surreal(db_path: &Path) -> Result<Arc<dyn GraphStore>> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!("Using database at: {}", db_path.display());
    let db = graphkb_db::init_persistent(db_path).await?;
    Ok(Arc::new(SurrealStore::new(db)))
}

#[cfg(not(feature = "rocksdb"))]
async fn open_surreal(db_path: &Path) -> Result<Arc<dyn GraphStore>> {
    warn!(
        "Built without the rocksdb feature, {} will not be used and nothing is persisted",
        db_path.display()
    );
    let db = graphkb_db::init_memory().await?;
    Ok(Arc::new(SurrealStore::new(db)))
}

/// Split text into paragraphs separated by blank lines
fn split_paragraphs(content: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }
    paragraphs
}

/// One document per paragraph, ids `<doc_id>#<chunk>`
fn chunk_document(doc_id: &str, content: &str) -> Vec<Document> {
    let paragraphs = split_paragraphs(content);
    let total = paragraphs.len();
    paragraphs
        .into_iter()
        .enumerate()
        .map(|(i, paragraph)| {
            Document::chunk(format!("{}#{}", doc_id, i), doc_id, i, total, paragraph)
        })
        .collect()
}

fn load_documents(files: &[PathBuf], text: Option<&str>) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for path in files {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read file: {}", path.display()))?;
        let doc_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document");
        documents.extend(chunk_document(doc_id, &content));
    }
    if let Some(text) = text {
        let doc_id = format!("text-{}", uuid::Uuid::new_v4().simple());
        documents.extend(chunk_document(&doc_id, text));
    }

    if documents.is_empty() {
        bail!("Nothing to add: pass files or --text with some content");
    }
    Ok(documents)
}

async fn cmd_add(kb: &KnowledgeBase, documents: Vec<Document>) -> Result<()> {
    let count = documents.len();
    kb.add_documents(documents, &AddOptions::default()).await?;
    println!("✓ Added {} documents", count);

    if let Some(result) = kb.wait_for_background_detection().await {
        match result {
            Ok(report) => print_report(&report)?,
            Err(e) => warn!("Community detection failed: {}", e),
        }
    }
    Ok(())
}

fn preview(content: &str, max: usize) -> String {
    let preview: String = content.chars().take(max).collect();
    if content.chars().count() > max {
        format!("{}...", preview)
    } else {
        preview
    }
}

fn print_results(results: &[Document]) {
    if results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, doc) in results.iter().enumerate() {
        let score = doc
            .score
            .map(|s| format!("{:.3}", s))
            .unwrap_or_else(|| "-".into());
        println!("{}. [{}] {} - {}", i + 1, score, doc.id, preview(doc.text(), 100));
    }
}

fn print_report(report: &DetectionReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

async fn cmd_retrieve(
    kb: &KnowledgeBase,
    query: &str,
    limit: usize,
    threshold: Option<f32>,
    mode: SearchMode,
    options: &SearchOptions,
) -> Result<()> {
    let results = kb.retrieve(query, limit, threshold, mode, options).await?;
    println!("Found {} results ({} search):", results.len(), mode);
    print_results(&results);
    Ok(())
}

async fn cmd_interactive(kb: &KnowledgeBase) -> Result<()> {
    println!("graphkb - Interactive Mode");
    println!("Commands: add, search, mode, detect, help, quit");
    println!();

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut mode = SearchMode::default();
    let mut added = 0usize;

    loop {
        print!("graphkb> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }

        let parts: Vec<&str> = line.trim().splitn(2, ' ').collect();
        let cmd = parts.first().copied().unwrap_or("");
        let arg = parts.get(1).copied().unwrap_or("").trim();

        match cmd {
            "" => continue,

            "add" | "a" => {
                if arg.is_empty() {
                    println!("Usage: add <text>");
                    continue;
                }
                added += 1;
                let doc = Document::new(format!("note-{}", added), arg);
                match kb.add_documents(vec![doc], &AddOptions::default()).await {
                    Ok(()) => println!("✓ Added note-{}", added),
                    Err(e) => println!("Error: {}", e),
                }
            }

            "search" | "s" => {
                if arg.is_empty() {
                    println!("Usage: search <query>");
                    continue;
                }
                match kb
                    .retrieve(arg, 5, None, mode, &SearchOptions::default())
                    .await
                {
                    Ok(results) => print_results(&results),
                    Err(e) => println!("Error: {}", e),
                }
            }

            "mode" | "m" => match parse_mode(arg) {
                Ok(new_mode) => {
                    mode = new_mode;
                    println!("Search mode: {}", mode);
                }
                Err(e) => println!("Error: {}", e),
            },

            "detect" | "d" => {
                match kb
                    .detect_communities(None, &DetectOptions::default())
                    .await
                {
                    Ok(report) => print_report(&report)?,
                    Err(e) => println!("Error: {}", e),
                }
            }

            "help" | "h" | "?" => {
                println!("Commands:");
                println!("  add <text>       Add a document");
                println!("  search <query>   Search with the current mode");
                println!("  mode <name>      vector, graph, hybrid or global");
                println!("  detect           Detect communities now");
                println!("  quit             Exit");
            }

            "quit" | "q" | "exit" => break,

            _ => println!("Unknown command: {}. Type 'help' for commands.", cmd),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_paragraphs() {
        let text = "First line\ncontinues\n\n\n  \nSecond paragraph\n";
        assert_eq!(
            split_paragraphs(text),
            vec!["First line\ncontinues".to_string(), "Second paragraph".to_string()]
        );
        assert!(split_paragraphs("  \n\n").is_empty());
    }

    #[test]
    fn test_chunk_metadata() {
        let docs = chunk_document("notes", "one\n\ntwo\n\nthree");
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[1].id, "notes#1");
        assert_eq!(docs[1].metadata.doc_id, "notes");
        assert_eq!(docs[1].metadata.chunk_id, 1);
        assert_eq!(docs[1].metadata.total_chunks, 3);
        assert_eq!(docs[1].text(), "two");
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdef", 3), "abc...");
    }
}
