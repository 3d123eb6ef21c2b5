use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    recall_config::RecallConfig,
    recall_memory::{
        MemoryManager, MemoryRegistry, SearchOptions, SyncOptions, SyncReport, WriteMode,
    },
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "recall", about = "recall: searchable memory for agent workspaces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Only look for `recall.{toml,yaml,yml,json}` in this directory.
    #[arg(long, global = true, env = "RECALL_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Workspace root. Overrides the config file.
    #[arg(long, short = 'w', global = true, env = "RECALL_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Agent id. Overrides the config file.
    #[arg(long, global = true, env = "RECALL_AGENT")]
    agent: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the index up to date with the workspace.
    Sync {
        /// Re-chunk and re-embed every file.
        #[arg(long)]
        force: bool,
    },
    /// Search memory.
    Search {
        query: String,
        #[arg(short, long, default_value_t = 5)]
        k: usize,
        /// 1 = meaning only, 0 = exact words only.
        #[arg(long)]
        weight: Option<f32>,
        #[arg(long)]
        min_score: Option<f32>,
        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print a chunk by id.
    Get { id: String },
    /// Print lines from a memory file.
    Read {
        path: String,
        #[arg(long)]
        from: Option<usize>,
        #[arg(long)]
        lines: Option<usize>,
    },
    /// Write to a memory file, then sync.
    Remember {
        /// Workspace-relative markdown path, e.g. `memory/notes.md`.
        path: String,
        text: String,
        /// Overwrite the file instead of appending.
        #[arg(long)]
        replace: bool,
    },
    /// Show index status.
    Status,
    /// Sync, then keep syncing as memory files change until interrupted.
    Watch,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> RecallConfig {
    if let Some(dir) = &cli.config_dir {
        recall_config::set_config_dir(dir.clone());
    }
    let mut config = recall_config::discover_and_load();
    if let Some(workspace) = &cli.workspace {
        config.workspace = Some(workspace.clone());
    }
    if let Some(agent) = &cli.agent {
        config.agent_id = agent.clone();
    }
    config
}

fn print_report(report: &SyncReport) {
    println!(
        "indexed {} / unchanged {} / removed {} ({} chunks, {} embedding requests, {} cache hits) in {} ms",
        report.indexed,
        report.unchanged,
        report.removed,
        report.chunks_written,
        report.embedding_requests,
        report.cache_hits,
        report.elapsed.as_millis(),
    );
    for failure in &report.failures {
        eprintln!("  {}: {} ({})", failure.path, failure.message, failure.kind);
    }
    if report.cancelled {
        eprintln!("sync cancelled before completion");
    }
}

async fn run(command: Commands, manager: &Arc<MemoryManager>) -> anyhow::Result<()> {
    match command {
        Commands::Sync { force } => {
            let report = manager.sync(SyncOptions { force }).await?;
            print_report(&report);
        },
        Commands::Search {
            query,
            k,
            weight,
            min_score,
            json,
        } => {
            manager.sync(SyncOptions::default()).await?;
            let response = manager
                .search(&query, SearchOptions {
                    limit: k,
                    weight,
                    min_score,
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }
            for note in &response.degraded {
                warn!(?note, "search degraded");
            }
            for hit in &response.hits {
                println!(
                    "{:.3}  {}:{}-{}  [{}]",
                    hit.score, hit.source_path, hit.start_line, hit.end_line, hit.id
                );
                println!("    {}", hit.text.lines().next().unwrap_or_default());
            }
            if response.hits.is_empty() {
                println!("no matches");
            }
        },
        Commands::Get { id } => {
            let chunk = manager.get(&id).await?;
            println!(
                "# {}:{}-{}",
                chunk.source_path, chunk.start_line, chunk.end_line
            );
            println!("{}", chunk.text);
        },
        Commands::Read { path, from, lines } => {
            println!("{}", manager.read_source(&path, from, lines).await?);
        },
        Commands::Remember {
            path,
            text,
            replace,
        } => {
            let mode = if replace {
                WriteMode::Replace
            } else {
                WriteMode::Append
            };
            let written = manager.append_or_update(&path, &text, mode).await?;
            println!("wrote {written}");
            print_report(&manager.sync(SyncOptions::default()).await?);
        },
        Commands::Status => {
            println!("{}", serde_json::to_string_pretty(&manager.status().await?)?);
        },
        Commands::Watch => {
            print_report(&manager.sync(SyncOptions::default()).await?);
            if !manager.start_watching().await? {
                anyhow::bail!("watching is disabled in the memory settings");
            }
            info!(workspace = %manager.workspace().display(), "watching memory files");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "recall starting");

    let config = load_config(&cli);
    let workspace = config
        .workspace_or_cwd()
        .context("cannot determine workspace directory")?;
    let settings = config.memory_settings();
    let registry = MemoryRegistry::from_settings(&settings)?;
    let manager = registry
        .get(&config.agent_id, &workspace, &settings)
        .await
        .with_context(|| format!("failed to open memory for {}", workspace.display()))?;

    let result = run(cli.command, &manager).await;
    registry.close_all().await;
    result
}
