//! Chatmem CLI
//!
//! Interactive chat with summary-buffer memory over an OpenAI-compatible API.

use chatmem::config::default_home;
use chatmem::{ChatSession, ChatmemConfig, OpenAiChatModel, SessionStore, TokenMeasure};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Chatmem - chat with summary-buffer memory
#[derive(Parser, Debug)]
#[command(name = "chatmem")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config.toml (default: $CHATMEM_HOME/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model used for replies
    #[arg(short, long)]
    model: Option<String>,

    /// Model used for summarizing evicted turns
    #[arg(long)]
    summary_model: Option<String>,

    /// Buffer threshold before the oldest turn is summarized
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Keep summarizing until the buffer fits, instead of once per turn
    #[arg(long)]
    evict_until_under_threshold: bool,

    /// How buffer size is measured: chars or approx_tokens
    #[arg(long)]
    measure: Option<TokenMeasure>,

    /// Persist and resume memory under this session id
    #[arg(short, long)]
    session: Option<String>,

    /// List saved sessions and exit
    #[arg(long)]
    list_sessions: bool,

    /// Delete all but the KEEP most recently saved sessions and exit
    #[arg(long, value_name = "KEEP")]
    cleanup_sessions: Option<usize>,

    /// Input line that ends the conversation
    #[arg(long)]
    sentinel: Option<String>,

    /// Verbose output: debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so streamed replies on stdout stay clean
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let home = default_home()?;
    let config = load_config(&cli, home).await?;
    config.validate()?;

    let store = SessionStore::new(&config.sessions_dir()).await?;
    if cli.list_sessions {
        for session_id in store.list_sessions().await? {
            println!("{}", session_id);
        }
        return Ok(());
    }
    if let Some(keep) = cli.cleanup_sessions {
        let removed = store.cleanup(keep).await?;
        println!("Removed {} session(s)", removed);
        return Ok(());
    }

    info!(
        "Starting Chatmem: model={}, max_tokens={}, measure={}, evict_until_under_threshold={}",
        config.model,
        config.memory.max_size_tokens,
        config.memory.measure,
        config.memory.evict_until_under_threshold
    );

    let model = Arc::new(OpenAiChatModel::new(&config)?);
    let mut session = ChatSession::from_config(&config, model)?;
    if let Some(session_id) = cli.session {
        session = session.with_session_store(store, session_id);
        session.resume().await?;
    }

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = io::stdout();
    session.run(stdin, &mut stdout).await?;

    Ok(())
}

/// Resolve config file, environment, then CLI flags.
async fn load_config(cli: &Cli, home: PathBuf) -> anyhow::Result<ChatmemConfig> {
    let mut config = match &cli.config {
        Some(path) => ChatmemConfig::load_file(&home, path).await?,
        None => ChatmemConfig::load(&home).await?,
    };

    if let Some(model) = &cli.model {
        config = config.with_model(model.clone());
    }
    if let Some(model) = &cli.summary_model {
        config = config.with_summary_model(model.clone());
    }
    if let Some(max_tokens) = cli.max_tokens {
        config = config.with_max_tokens(max_tokens);
    }
    if cli.evict_until_under_threshold {
        config = config.with_evict_until_under_threshold(true);
    }
    if let Some(measure) = cli.measure {
        config = config.with_measure(measure);
    }
    if let Some(sentinel) = &cli.sentinel {
        config = config.with_sentinel(sentinel.clone());
    }

    Ok(config)
}
