use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use sosmeta::config::Config;
use sosmeta::metadata::{MetadataCaches, MetadataKind, SnapshotSource};
use sosmeta::{EntityCache, RefreshOutcome};

#[derive(Parser, Debug)]
#[command(name = "sosmeta")]
#[command(about = "Scheduled metadata cache for sensor observation backends")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/sosmeta/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also write logs to this file, rotated daily
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Keep the caches refreshed until interrupted
  Run,
  /// Run one refresh and exit
  Refresh,
  /// Show lock state and cache freshness
  Status,
  /// Print the entries of one cache as JSON lines
  Show {
    #[arg(value_enum)]
    kind: MetadataKind,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let caches = MetadataCaches::open(&config.cache_dir()?, &config.source.identity, config.freshness())?;
  let source = Arc::new(SnapshotSource::new(&config.source.snapshot_dir));

  match args.command {
    Command::Run => {
      let scheduler = caches.start_scheduler(source, config.schedule_config()?);
      info!(dir = %caches.dir().display(), "Cache scheduler running, press Ctrl-C to stop");
      tokio::signal::ctrl_c().await?;
      scheduler.shutdown().await;
    }
    Command::Refresh => {
      let schedule = sosmeta::refresh::ScheduleConfig {
        update_on_startup: false,
        ..config.schedule_config()?
      };
      let scheduler = caches.start_scheduler(source, schedule);
      let outcome = scheduler.run_now().await?;
      scheduler.shutdown().await;
      match outcome {
        RefreshOutcome::Completed { updated } => println!("Refreshed {updated} caches"),
        RefreshOutcome::Skipped => println!("Another refresh is in progress"),
        RefreshOutcome::Cancelled => return Err(eyre!("Refresh was cancelled")),
        RefreshOutcome::Aborted { cache, error } => {
          return Err(eyre!("Refresh aborted at cache '{}': {}", cache, error))
        }
      }
    }
    Command::Status => {
      println!("Cache directory: {}", caches.dir().display());
      match caches.lock().age() {
        Some(age) => println!("Update lock:     held for {}s", age.as_secs()),
        None if caches.lock().is_locked() => println!("Update lock:     held"),
        None => println!("Update lock:     free"),
      }
      for status in caches.status() {
        let updated = status
          .last_updated
          .map(|t| t.to_rfc3339())
          .unwrap_or_else(|| "never".to_string());
        let state = if status.partial {
          "partial"
        } else if status.requires_update {
          "needs update"
        } else {
          "fresh"
        };
        println!("{:<16} {:<13} last updated {}", status.name, state, updated);
      }
    }
    Command::Show { kind } => match kind {
      MetadataKind::UnitMappings => print_entries(caches.unit_mappings())?,
      MetadataKind::Offerings => print_entries(caches.offerings())?,
    },
  }

  Ok(())
}

fn print_entries<T: sosmeta::Cacheable>(cache: &EntityCache<T>) -> Result<()> {
  let mut entries: Vec<(String, T)> = cache.get()?.into_iter().collect();
  entries.sort_by(|a, b| a.0.cmp(&b.0));
  for (_, entity) in entries {
    println!("{}", serde_json::to_string(&entity)?);
  }
  Ok(())
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sosmeta=info"));

  match log_file {
    Some(path) => {
      let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}
