mod demo;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stratum_core::config::StratumConfig;
use stratum_core::types::CorrelationId;
use stratum_graph::{StartOptions, WorkflowService};

#[derive(Parser)]
#[command(name = "stratum", version, about = "Checkpointed multi-agent workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stratum.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the research pipeline on a query
    Run {
        /// The query (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
        /// Conversation id; reuse it to continue a conversation
        #[arg(short, long)]
        thread: Option<String>,
        /// Continue an interrupted run instead of starting a new turn
        #[arg(long)]
        resume: bool,
        /// Data sources to treat as unavailable
        #[arg(long, value_delimiter = ',')]
        offline: Vec<String>,
    },
    /// List stored checkpoints
    Checkpoints,
    /// Print the stored context of a conversation
    Show {
        /// Conversation id
        thread: String,
    },
    /// Print the pipeline graph in DOT format
    Graph,
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stratum=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        StratumConfig::load(&cli.config)?
    } else {
        let home_config = StratumConfig::default_path();
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
        }
        StratumConfig::load_or_default(&home_config)?
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Graph => {
            let graph = demo::graph(&config.routing)?;
            print!("{}", graph.to_dot());
        }
        Commands::Checkpoints => {
            let service = service(config)?;
            let ids = service.list_checkpoints().await?;
            if ids.is_empty() {
                println!("No checkpoints.");
            }
            for id in ids {
                let cp = service.load_checkpoint(&id).await?;
                println!(
                    "{}  turn {}  step {}  {}  {}",
                    id,
                    cp.context.turn,
                    cp.step,
                    cp.next_node.as_deref().unwrap_or("finished"),
                    cp.timestamp.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Commands::Show { thread } => {
            let service = service(config)?;
            let cp = service.load_checkpoint(&CorrelationId::from_str(&thread)).await?;
            println!("{}", serde_json::to_string_pretty(&cp)?);
        }
        Commands::Run {
            query,
            thread,
            resume,
            offline,
        } => {
            let mut text = query.join(" ");
            if text.is_empty() && !resume {
                text = io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            let service = Arc::new(service(config)?);
            run_once(&service, text, thread, resume, offline).await?;
        }
    }

    Ok(())
}

fn service(config: StratumConfig) -> anyhow::Result<WorkflowService> {
    let graph = demo::graph(&config.routing)?;
    Ok(WorkflowService::from_config(Arc::new(graph), config)?)
}

async fn run_once(
    service: &Arc<WorkflowService>,
    query: String,
    thread: Option<String>,
    resume: bool,
    offline: Vec<String>,
) -> anyhow::Result<()> {
    let mut options = StartOptions {
        resume,
        ..StartOptions::default()
    };
    if !offline.is_empty() {
        options = options.with_option("offline", serde_json::json!(offline));
    }

    let id = thread.map(|t| CorrelationId::from_str(&t));
    let mut handle = service.start_streaming(query, id, options)?;
    let id = handle.correlation_id.clone();

    let stopper = {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            eprintln!("\n[stopping...]");
            service.stop(&id);
        })
    };

    while let Some(increment) = handle.tokens.recv().await {
        print!("{}", increment.token);
        io::stdout().flush().ok();
    }
    let report = handle.task.await??;
    stopper.abort();

    let ctx = &report.context;
    eprintln!(
        "\n[{}: {} steps, {} errors, {}ms, thread {}]",
        report.outcome,
        report.steps,
        ctx.errors.len(),
        report.elapsed_ms,
        id
    );
    for e in &ctx.errors {
        eprintln!("[{}: {}] {}", e.node, e.kind.as_str(), e.message);
    }
    if !report.is_completed() {
        eprintln!("Resume with: stratum run --thread {} --resume", id);
    }
    Ok(())
}
