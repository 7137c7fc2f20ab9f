use apphive_query::config::Config;
use apphive_query::logging::{self, LogTarget};
use apphive_query::server::SearchParams;
use apphive_query::{ModelPropRef, QueryOptions, QueryState, ServerContext, SuspenseQuery};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "apphive-query")]
#[command(about = "Query the Apphive server and follow realtime model updates")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/apphive-query/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Signed-in user uid (overrides the config file)
  #[arg(short, long, global = true)]
  user: Option<String>,

  /// Log to stderr instead of the log directory
  #[arg(long, global = true)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a path once and print its result
  Get {
    /// API path, e.g. /apps/list
    path: String,

    /// Search param as name=value; repeatable
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
  },

  /// Fetch a path and print it again every time a watched model changes
  Watch {
    path: String,

    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Model property to watch as Model:prop:identifier; repeatable
    #[arg(short, long = "listen")]
    listen: Vec<ModelPropRef>,

    /// Drop the cached value before each refetch
    #[arg(long)]
    clean: bool,
  },
}

fn parse_param(s: &str) -> Result<(String, String), String> {
  s.split_once('=')
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

fn query_options(config: &Config, params: Vec<(String, String)>) -> QueryOptions<Value> {
  let mut options = QueryOptions::default();
  if let Some(stale_time) = config.query.stale_time() {
    options = options.with_stale_time(stale_time);
  }
  if !params.is_empty() {
    let params: SearchParams = params
      .into_iter()
      .map(|(name, value)| (name, Some(value)))
      .collect();
    options = options.with_search_params(params);
  }
  options
}

fn print_json(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = logging::init(if args.log_stderr {
    LogTarget::Stderr
  } else {
    LogTarget::File
  })?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override user if specified on command line
  let config = if let Some(user) = args.user {
    Config {
      user_uid: Some(user),
      ..config
    }
  } else {
    config
  };

  let ctx = ServerContext::from_config(&config, Arc::new(Config::token_provider()))?;

  match args.command {
    Command::Get { path, params } => {
      let mut query = SuspenseQuery::new(&ctx, path, query_options(&config, params))?;
      print_json(&query.read().await?)?;
    }
    Command::Watch {
      path,
      params,
      listen,
      clean,
    } => {
      if config.realtime.database_url.is_none() {
        return Err(eyre!(
          "watch needs realtime.database_url in the configuration"
        ));
      }

      let options = query_options(&config, params)
        .clean_on_refetch(clean)
        .listen_to(move |_: &Value| listen.clone());
      let mut query = SuspenseQuery::new(&ctx, path, options)?;

      print_json(&query.read().await?)?;
      info!(paths = ?query.listened_paths(), "Watching");

      let mut changes = query.subscribe();
      loop {
        tokio::select! {
          changed = changes.changed() => {
            if changed.is_err() {
              break;
            }
            let state = changes.borrow_and_update().clone();
            match state {
              QueryState::Success(_) => print_json(&query.read().await?)?,
              QueryState::Error(e) => eprintln!("error: {}", e),
              QueryState::Idle | QueryState::Loading => {}
            }
          }
          _ = tokio::signal::ctrl_c() => break,
        }
      }
    }
  }

  Ok(())
}
