use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trambar_sync::notification::{Backoff, HttpNotificationTransport};
use trambar_sync::{
  Config, Criteria, HttpRemote, LocalCache, Location, Query, RemoteDataSource, SearchOptions,
  SqliteStore,
};

#[derive(Parser, Debug)]
#[command(name = "trambar-sync")]
#[command(about = "Query and watch Trambar data through a local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/trambar-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run a query and print the rows as JSON
  Query {
    schema: String,
    table: String,
    #[arg(long)]
    server: Option<String>,
    /// Criteria as a JSON object
    #[arg(long, default_value = "{}")]
    criteria: String,
    #[arg(long)]
    minimum: Option<usize>,
    /// Always ask the server
    #[arg(long)]
    remote: bool,
    /// Fail instead of printing partial results
    #[arg(long)]
    required: bool,
  },
  /// Print change notifications and connection events until interrupted
  Watch {
    #[arg(long)]
    server: Option<String>,
  },
  /// Read or write client-only settings
  Settings {
    #[command(subcommand)]
    action: SettingsAction,
  },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
  Get { table: String, key: String },
  Set { table: String, key: String, value: String },
}

fn setup_tracing(config: &Config, verbose: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.log.level))
    .map_err(|e| eyre!("Invalid log filter {}: {}", config.log.level, e))?;

  if verbose {
    tracing_subscriber::registry()
      .with(filter)
      .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
      .init();
    return Ok(None);
  }

  let directory = config.log_directory()?;
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;
  let appender = tracing_appender::rolling::daily(&directory, "trambar-sync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();
  Ok(Some(guard))
}

fn parse_json(text: &str) -> Result<serde_json::Value> {
  serde_json::from_str(text).map_err(|e| eyre!("Invalid JSON {}: {}", text, e))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", text);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = setup_tracing(&config, args.verbose)?;

  let store = SqliteStore::open(config.cache.path.as_deref())?;
  let cache = LocalCache::open(store, &config.cache.database);
  let remote = HttpRemote::new(&config.protocol)?;
  let source = RemoteDataSource::new(remote, cache, &config);

  match args.command {
    Command::Query {
      schema,
      table,
      server,
      criteria,
      minimum,
      remote,
      required,
    } => {
      let criteria = Criteria::from_value(parse_json(&criteria)?)
        .ok_or_else(|| eyre!("Criteria must be a JSON object"))?;
      let mut query = Query::new(&schema, &table, criteria).with_options(SearchOptions {
        minimum,
        remote,
        required,
        ..Default::default()
      });
      if let Some(server) = &server {
        query = query.on_server(server);
      }
      let rows = source.find(&query).await?;
      print_json(&rows)?;
    }
    Command::Watch { server } => {
      let server = server
        .or_else(|| config.server.clone())
        .ok_or_else(|| eyre!("No server given and none configured"))?;
      let transport = HttpNotificationTransport::new(&config.protocol)?;
      let mut events = source.subscribe();
      let handle = source.attach(transport, &server, Backoff::from(&config.reconnect));
      info!("Watching {}", server);

      loop {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => break,
          event = events.recv() => match event {
            Ok(event) => print_json(&event)?,
            Err(RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
            Err(RecvError::Closed) => break,
          },
        }
      }
      handle.shutdown().await;
    }
    Command::Settings { action } => match action {
      SettingsAction::Get { table, key } => {
        let query = Query::new("local", &table, Criteria::new().with("key", key.as_str()));
        let rows = source.find(&query).await?;
        match rows.first().and_then(|row| row.get("value")) {
          Some(value) => print_json(value)?,
          None => return Err(eyre!("No setting {} in {}", key, table)),
        }
      }
      SettingsAction::Set { table, key, value } => {
        let mut row = trambar_sync::Row::new();
        row.insert("key".to_string(), key.into());
        row.insert("value".to_string(), parse_json(&value)?);
        source.save(&Location::local(&table), &[row]).await?;
      }
    },
  }

  Ok(())
}
