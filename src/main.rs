use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use offcache::agent::{AgentContext, AgentReply};
use offcache::cache::SqliteStorage;
use offcache::config::Config;
use offcache::event::{Event, EventHandler};
use offcache::manifest::Manifest;
use offcache::net::HttpNetwork;

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "An offline-capable resource cache agent")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offcache.yaml or $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Published manifest to use instead of the configured one
  #[arg(short, long)]
  manifest: Option<PathBuf>,

  /// SQLite database to use instead of the configured one
  #[arg(long)]
  database: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read JSON events from stdin, write one JSON reply per line to stdout
  Run {
    /// Install (and activate, if skip_waiting is set) before reading events
    #[arg(long)]
    boot: bool,
  },
  /// Show the active version, tier sizes and queued requests
  Status,
  /// Delete every tier and the manifest record
  Clear,
  /// Replay queued requests now
  Drain,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(manifest) = args.manifest {
    config.manifest = manifest;
  }
  if let Some(database) = args.database {
    config.database = Some(database);
  }

  let _guard = init_tracing(config.log_dir.as_deref());

  let manifest = Manifest::load(&config.manifest)?;
  let storage = Arc::new(SqliteStorage::open(config.database.as_deref())?);
  let network = HttpNetwork::new(&config)?;
  let agent = AgentContext::new(&config, manifest, storage, network);

  match args.command {
    Command::Run { boot } => run(&agent, boot).await?,
    Command::Status => print_json(&agent.status()?)?,
    Command::Clear => {
      let cleared = agent.clear_all()?;
      println!("Cleared {} tiers", cleared);
    }
    Command::Drain => print_json(&agent.drain().await?)?,
  }

  Ok(())
}

async fn run(agent: &AgentContext<HttpNetwork>, boot: bool) -> Result<()> {
  if boot {
    let installed = agent.install().await?;
    let activate_next = matches!(installed, AgentReply::Installed { activate_next: true, .. });
    write_reply(&installed)?;
    if activate_next {
      write_reply(&agent.activate()?)?;
    }
  }

  let mut events = EventHandler::from_reader(BufReader::new(tokio::io::stdin()));
  while let Some(event) = events.next().await {
    let reply = match event {
      Event::Agent(event) => match agent.dispatch(event).await {
        Ok(reply) => reply,
        Err(e) => {
          warn!(error = %e, "event failed");
          AgentReply::Failed {
            message: e.to_string(),
          }
        }
      },
      Event::Malformed { line, error } => {
        warn!(line = %line, error = %error, "malformed event");
        AgentReply::Failed {
          message: format!("malformed event: {}", error),
        }
      }
    };
    write_reply(&reply)?;
  }

  agent.flush_writes().await;
  info!("input closed, exiting");
  Ok(())
}

fn write_reply(reply: &AgentReply) -> Result<()> {
  let line = serde_json::to_string(reply).map_err(|e| eyre!("Failed to serialize reply: {}", e))?;
  let mut stdout = std::io::stdout().lock();
  writeln!(stdout, "{}", line).map_err(|e| eyre!("Failed to write reply: {}", e))?;
  stdout
    .flush()
    .map_err(|e| eyre!("Failed to flush stdout: {}", e))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", text);
  Ok(())
}

/// Logs go to stderr, or to a daily file under `log_dir`; stdout carries replies.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_env("OFFCACHE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "offcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(
          tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false),
        )
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
      None
    }
  }
}
