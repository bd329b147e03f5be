//! `sbx`, the sandbox-harness entry command.
//!
//! `sbx serve` starts the host process (tool server, callback server,
//! lazy kernel). The remaining subcommands are maintenance paths over the
//! same core functions the tool surface uses: search, ingest, fetch,
//! status, timeline, clear.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use sandbox_harness::config;
use sandbox_harness::fetch::Fetcher;
use sandbox_harness::models::IngestDoc;
use sandbox_harness::project::{default_project_id, project_id_for, ProjectRegistry};
use sandbox_harness::store::SearchMode;

#[derive(Parser)]
#[command(
    name = "sbx",
    about = "Sandbox Harness, a kernel-backed tool bridge with persistent knowledge retrieval",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/sbx.toml")]
    config: PathBuf,

    /// Project to address (defaults to a hash of the working directory)
    #[arg(long, global = true)]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the host process
    Serve {
        /// Run the kernel as a bare subprocess even if a container runtime exists
        #[arg(long)]
        no_kernel_container: bool,

        /// Attach to an externally managed kernel instead of starting one
        #[arg(long)]
        kernel_url: Option<String>,
    },

    /// Search a project's knowledge store
    Search {
        /// Search query
        query: String,

        /// Search mode: lexical, vector, or hybrid
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Filter by thread
        #[arg(long)]
        thread: Option<String>,

        /// Filter by label
        #[arg(long)]
        label: Option<String>,

        /// Maximum number of hits
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Ingest a file or stdin into the knowledge store
    Ingest {
        /// Logical document title
        title: String,

        /// File to read; stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,

        /// Coarse label bucket
        #[arg(long, default_value = "note")]
        label: String,

        /// Thread namespace
        #[arg(long)]
        thread: Option<String>,
    },

    /// Fetch a URL into the cache and index
    Fetch {
        /// URL to fetch
        url: String,

        /// Bypass the freshness window
        #[arg(long)]
        force: bool,
    },

    /// Show index size and label breakdown
    Status,

    /// List ingested titles in time order
    Timeline,

    /// Delete the project's index
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sandbox_harness=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load_config(&cli.config)?;

    let project = cli
        .project
        .as_deref()
        .map(project_id_for)
        .unwrap_or_else(default_project_id);
    let http = reqwest::Client::new();

    match cli.command {
        Commands::Serve {
            no_kernel_container,
            kernel_url,
        } => {
            if no_kernel_container {
                cfg.kernel.tier = 1;
            }
            if let Some(url) = kernel_url {
                cfg.kernel.url = Some(url);
            }
            let host = sandbox_harness::host::Host::build(cfg).await?;
            host.serve().await?;
        }
        Commands::Search {
            query,
            mode,
            thread,
            label,
            top_k,
        } => {
            let cfg = Arc::new(cfg);
            let registry = ProjectRegistry::new(cfg.clone(), http.clone());
            let store = registry.store(&project).await?;
            let hits = store
                .search(
                    &query,
                    top_k.unwrap_or(cfg.retrieval.top_k),
                    SearchMode::parse(&mode)?,
                    thread.as_deref(),
                    label.as_deref(),
                )
                .await?;

            if hits.is_empty() {
                println!("No hits.");
            } else {
                for (i, hit) in hits.iter().enumerate() {
                    println!("{}. [{:.3}] {} ({})", i + 1, hit.score, hit.title, hit.label);
                    println!("    chunk: {}", hit.chunk_index);
                    println!("    excerpt: \"{}\"", excerpt(&hit.text));
                    println!();
                }
            }
            registry.close_all().await;
        }
        Commands::Ingest {
            title,
            file,
            label,
            thread,
        } => {
            let text = match file {
                Some(path) => std::fs::read_to_string(&path)?,
                None => std::io::read_to_string(std::io::stdin())?,
            };
            let cfg = Arc::new(cfg);
            let registry = ProjectRegistry::new(cfg.clone(), http.clone());
            let store = registry.store(&project).await?;
            let mut doc = IngestDoc::new(title, label, text);
            doc.thread = thread;
            let report = store.ingest(&doc).await?;
            if report.duplicate {
                println!("duplicate, already indexed");
            } else {
                println!("ingested: {} ({} chunks)", report.title, report.chunks);
            }
            registry.close_all().await;
        }
        Commands::Fetch { url, force } => {
            let cfg = Arc::new(cfg);
            let registry = ProjectRegistry::new(cfg.clone(), http.clone());
            let store = registry.store(&project).await?;
            let fetcher = Fetcher::new(cfg.clone(), http.clone());
            match fetcher.fetch(&store, &url, force).await {
                Ok(outcome) => {
                    println!(
                        "fetched: {} ({}, {} bytes, {} chunks{})",
                        outcome.url,
                        outcome.markdown_source.as_str(),
                        outcome.size_bytes,
                        outcome.chunks,
                        if outcome.from_cache { ", cached" } else { "" }
                    );
                }
                Err(err) => {
                    eprintln!("fetch failed ({}): {}", err.kind.as_str(), err.message);
                    std::process::exit(1);
                }
            }
            registry.close_all().await;
        }
        Commands::Status => {
            let cfg = Arc::new(cfg);
            let registry = ProjectRegistry::new(cfg.clone(), http.clone());
            let store = registry.store(&project).await?;
            let status = store.status().await?;
            println!("project: {project}");
            println!("  documents: {}", status.doc_count);
            println!("  chunks:    {}", status.chunk_count);
            println!("  size:      {} bytes", status.size_bytes);
            if !status.labels.is_empty() {
                println!("  labels:");
                for label in &status.labels {
                    println!("    {:<20} {}", label.label, label.doc_count);
                }
            }
            if !status.threads.is_empty() {
                println!("  threads: {}", status.threads.join(", "));
            }
            registry.close_all().await;
        }
        Commands::Timeline => {
            let cfg = Arc::new(cfg);
            let registry = ProjectRegistry::new(cfg.clone(), http.clone());
            let store = registry.store(&project).await?;
            let entries = store.timeline(None, None).await?;
            if entries.is_empty() {
                println!("Nothing ingested yet.");
            }
            for entry in entries {
                let when = chrono::DateTime::from_timestamp(entry.ingested_at, 0)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| entry.ingested_at.to_string());
                println!("{}  {} ({})", when, entry.title, entry.label);
            }
            registry.close_all().await;
        }
        Commands::Clear => {
            let cfg = Arc::new(cfg);
            let registry = ProjectRegistry::new(cfg.clone(), http.clone());
            let store = registry.store(&project).await?;
            store.clear().await?;
            registry.evict(&project).await;
            println!("cleared project {project}");
        }
    }

    Ok(())
}

fn excerpt(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    if flat.chars().count() <= 140 {
        flat.to_string()
    } else {
        let cut: String = flat.chars().take(140).collect();
        format!("{cut}…")
    }
}
