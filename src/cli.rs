//! Command line front end: argument parsing, logging setup and the
//! subcommands, driving the engine against the local machine.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use foothold_core::config::LoggingConfig;
use foothold_core::FootholdConfig;
use foothold_engine::{
    parse_kv_args, Context, ModuleEvent, ModuleOutput, RevertOutcome, Session, TypePattern,
};
use foothold_platform::{Linux, LocalTransport, Platform};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "foothold",
    about = "Post-exploitation module engine",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Fact store directory (overrides the config file)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a module: foothold run <module> [key=value...]
    Run {
        module: String,
        args: Vec<String>,
    },
    /// List modules, optionally filtered by a glob
    Modules { pattern: Option<String> },
    /// Show stored facts, optionally of one type (exact or glob)
    Facts { fact_type: Option<String> },
    /// Inspect or undo changes made to the target
    Tamper {
        #[command(subcommand)]
        action: TamperAction,
    },
    /// Show version
    Version,
}

#[derive(Subcommand, Debug)]
pub enum TamperAction {
    List,
    Revert { id: String },
}

impl Cli {
    /// Config file contents with command line overrides applied.
    pub fn load_config(&self) -> FootholdConfig {
        let path = self.config.clone().or_else(FootholdConfig::default_path);
        let mut config = match path {
            Some(path) => FootholdConfig::load(&path),
            None => FootholdConfig::default(),
        };
        if let Some(store) = &self.store {
            config.store.path = Some(store.clone());
        }
        if self.json_logs {
            config.logging.json = true;
        }
        config
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// file writer to flush.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let dir = path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .context("log file path has no file name")?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }
    Ok(guard)
}

/// Execute one subcommand, writing its output to `out`.
pub async fn execute(cli: &Cli, config: FootholdConfig, out: &mut (dyn Write + Send)) -> anyhow::Result<()> {
    if let Commands::Version = cli.command {
        writeln!(out, "foothold v{}", env!("CARGO_PKG_VERSION"))?;
        return Ok(());
    }

    let registry = foothold_modules::create_default_registry()?;
    let platform_config = config.platform.clone();
    let ctx = Context::new(config, registry)?;

    if let Commands::Modules { pattern } = &cli.command {
        let pattern = pattern.as_deref().unwrap_or("*");
        for d in ctx.registry().search(pattern)? {
            writeln!(out, "{:<32} {:<10} {}", d.name, format!("{:?}", d.kind).to_lowercase(), d.description)?;
        }
        return Ok(());
    }

    let platform: Arc<dyn Platform> = Arc::new(Linux::with_config(Arc::new(LocalTransport::new()), platform_config));
    let session = ctx.open_session(platform).await?;
    info!(target_id = session.target().short(), "local session ready");

    let result = match &cli.command {
        Commands::Run { module, args } => run_module(&session, module, args, out).await,
        Commands::Facts { fact_type } => list_facts(&session, fact_type.as_deref(), out).await,
        Commands::Tamper { action: TamperAction::List } => {
            for record in session.tamper().await {
                writeln!(out, "{}  {}", record.id, record)?;
            }
            Ok(())
        }
        Commands::Tamper { action: TamperAction::Revert { id } } => {
            let id = id.parse().with_context(|| format!("invalid tamper id {}", id))?;
            match session.revert(id).await? {
                RevertOutcome::Reverted => writeln!(out, "reverted {}", id)?,
                RevertOutcome::Unknown => writeln!(out, "no such record: {}", id)?,
                RevertOutcome::NotRevertible => writeln!(out, "{} cannot be reverted", id)?,
                RevertOutcome::Mismatch(reason) => writeln!(out, "left in place: {}", reason)?,
            }
            Ok(())
        }
        Commands::Version | Commands::Modules { .. } => Ok(()),
    };
    ctx.close_session(session.id());
    result
}

async fn run_module(
    session: &Arc<Session>,
    module: &str,
    words: &[String],
    out: &mut (dyn Write + Send),
) -> anyhow::Result<()> {
    let args = parse_kv_args(words)?;
    let mut run = session.run(module, args).await?;
    let mut output = ModuleOutput {
        module: module.to_string(),
        collapse: session.registry().get(module)?.descriptor().collapse_result,
        ..Default::default()
    };

    loop {
        let event = tokio::select! {
            event = run.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                warn!(module, "interrupted");
                session.cancel();
                continue;
            }
        };
        match event {
            Some(ModuleEvent::Status(msg)) => info!(module, "{}", msg),
            Some(ModuleEvent::Progress { .. }) => {}
            Some(ModuleEvent::Fact(fact)) => output.facts.push(fact),
            Some(ModuleEvent::Result(value)) => output.results.push(value),
            Some(ModuleEvent::Done(value)) => {
                output.value = value;
                break;
            }
            Some(ModuleEvent::Failed(e)) => return Err(e.into()),
            None => break,
        }
    }

    writeln!(out, "{}", serde_json::to_string_pretty(&output.presented())?)?;
    Ok(())
}

async fn list_facts(
    session: &Session,
    fact_type: Option<&str>,
    out: &mut (dyn Write + Send),
) -> anyhow::Result<()> {
    let facts = match fact_type {
        Some(t) => session.stored_facts(&TypePattern::new(t)?).await,
        None => session.facts().await.into_iter().filter(|f| !f.hidden).collect(),
    };
    for fact in facts {
        writeln!(out, "{:<28} {}", fact.source, fact.display_title())?;
    }
    Ok(())
}
