use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing::info;

use redmine_tt::config::Config;
use redmine_tt::logging::{self, LogTarget};
use redmine_tt::settings::Settings;
use redmine_tt::storage::{KvStore, SqliteBackend};
use redmine_tt::ExtensionContext;

#[derive(Parser, Debug)]
#[command(name = "redmine-tt")]
#[command(about = "Inspect and edit the shared state of the Redmine time tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/redmine-tt/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the shared store (overrides config and REDMINE_TT_STORE)
  #[arg(short, long)]
  store: Option<PathBuf>,

  /// Log to stderr instead of the log directory
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read or change the settings
  #[command(subcommand)]
  Settings(SettingsCommand),
  /// Inspect or reset the query cache
  #[command(subcommand)]
  Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
  /// Print the settings, API key masked
  Show,
  /// Change some settings; the query cache is cleared on save
  Set {
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    /// "browser" or a language tag such as "de"
    #[arg(long)]
    language: Option<String>,
    #[arg(long)]
    auto_pause_on_switch: Option<bool>,
    #[arg(long)]
    extended_search: Option<bool>,
    #[arg(long)]
    round_time_nearest_quarter_hour: Option<bool>,
  },
  /// Print the settings every time any context changes them
  Watch,
  /// Remove the stored settings
  Reset,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// List cached queries
  Show,
  /// Drop every cached query
  Clear,
  /// Drop entries past their gc time
  Gc,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let target = if args.log_stderr {
    LogTarget::Stderr
  } else {
    LogTarget::default_directory()?
  };
  let _guard = logging::init(target)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let path = match args.store {
    Some(path) => path,
    None => config.store_path()?,
  };
  info!(path = %path.display(), "opening store");
  let backend = SqliteBackend::open_at(&path, config.poll_interval())?;
  let context = ExtensionContext::init(KvStore::new(backend), config.context_options()).await;

  let result = match args.command {
    Command::Settings(command) => run_settings(&context, command).await,
    Command::Cache(command) => run_cache(&context, command),
  };

  context.shutdown().await;
  result
}

async fn run_settings(context: &ExtensionContext, command: SettingsCommand) -> Result<()> {
  match command {
    SettingsCommand::Show => {
      let settings = context.settings().read().await;
      print_settings(&settings)?;
    }
    SettingsCommand::Set {
      url,
      api_key,
      language,
      auto_pause_on_switch,
      extended_search,
      round_time_nearest_quarter_hour,
    } => {
      let mut settings = context.settings().read().await;
      if let Some(url) = url {
        settings.redmine_url = url.trim().to_string();
      }
      if let Some(api_key) = api_key {
        settings.redmine_api_key = api_key.trim().to_string();
      }
      if let Some(language) = language {
        settings.language = language;
      }
      if let Some(value) = auto_pause_on_switch {
        settings.options.auto_pause_on_switch = value;
      }
      if let Some(value) = extended_search {
        settings.options.extended_search = value;
      }
      if let Some(value) = round_time_nearest_quarter_hour {
        settings.options.round_time_nearest_quarter_hour = value;
      }

      context.save_settings(&settings).map_err(|errors| {
        let lines: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
        eyre!("Invalid settings:\n{}", lines.join("\n"))
      })?;
      context.flush().await;
      print_settings(&settings)?;
    }
    SettingsCommand::Watch => {
      let current = context.settings().read().await;
      print_settings(&current)?;
      let _subscription = context.settings().subscribe(|settings| {
        if let Err(e) = print_settings(&settings) {
          tracing::warn!(error = %e, "failed to print settings");
        }
      });
      tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to wait for Ctrl-C: {}", e))?;
    }
    SettingsCommand::Reset => {
      context.settings().reset();
      context.cache().clear();
      context.flush().await;
      println!("Settings reset");
    }
  }
  Ok(())
}

fn run_cache(context: &ExtensionContext, command: CacheCommand) -> Result<()> {
  let cache = context.cache();
  match command {
    CacheCommand::Show => {
      let now = cache.now();
      let entries = cache.snapshot();
      if entries.is_empty() {
        println!("Cache is empty");
      }
      for (key, entry) in entries {
        let state = if entry.is_fresh(now) { "fresh" } else { "stale" };
        println!(
          "{:<40} {:<5} fetched {}",
          key,
          state,
          entry.fetched_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
    }
    CacheCommand::Clear => {
      cache.clear();
      println!("Cache cleared");
    }
    CacheCommand::Gc => {
      let removed = cache.garbage_collect(cache.now());
      println!("Removed {} entries", removed);
    }
  }
  Ok(())
}

fn print_settings(settings: &Settings) -> Result<()> {
  let yaml = serde_yaml::to_string(&settings.redacted())
    .map_err(|e| eyre!("Failed to format settings: {}", e))?;
  println!("{}", yaml.trim_end());
  Ok(())
}
