//! chipbot maintenance entry point.
//!
//! The conversation front end embeds [`chipbot_storage::Storage`] directly.
//! This binary covers the operations an operator runs by hand:
//!
//! - **`migrate`**: open the store through the storage actor, bring it to the
//!   latest schema version, drain and exit.
//! - **`export`**: dump every logged action, joined with its user's
//!   registration, as tab-separated text. Run it against a store whose bot
//!   process has exited, or against a copy.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chipbot_storage::{export, migration, Storage};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::BotConfig;

const DEFAULT_EXPORT_FILE: &str = "db_export.txt";

#[derive(Parser)]
#[command(name = "chipbot", about = "Storage maintenance for the chipbot front end")]
struct Cli {
    /// Data directory. Defaults to CHIPBOT_DATA_DIR or ~/.config/chipbot/data.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file. Defaults to <data-dir>/bot_config.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file. Defaults to CHIPBOT_DB_PATH or <data-dir>/db.sqlite3.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store if needed and upgrade it to the latest schema.
    Migrate,
    /// Write all logged actions as tab-separated text.
    Export {
        /// Output file. Defaults to <data-dir>/db_export.txt.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn init_tracing(config: &BotConfig, data_dir: &Path) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging_level))
        .with_context(|| format!("invalid logging_level {:?}", config.logging_level))?;

    if config.log_to_console {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    }

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let file_appender = tracing_appender::rolling::never(data_dir, config::LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true),
        )
        .with(filter)
        .init();
    Ok(Some(guard))
}

async fn run_migrate(db_path: &Path) -> anyhow::Result<i64> {
    let storage = Storage::init(db_path.to_path_buf());
    let ready = storage.ready().await;
    // Join even on failure so the actor's own error is what gets reported.
    let joined = storage.terminate().join().await;
    ready.context("storage failed to start")?;
    joined.context("storage failed to shut down cleanly")?;

    let version = migration::stored_version(db_path)
        .await
        .with_context(|| format!("failed to read back {}", db_path.display()))?;
    tracing::info!(version, "Migration finished");
    println!("{} is at schema version {}", db_path.display(), version);
    Ok(version)
}

async fn run_export(db_path: &Path, out_path: &Path) -> anyhow::Result<()> {
    if !db_path.exists() {
        bail!("{} does not exist", db_path.display());
    }

    let rows = export::snapshot(db_path)
        .await
        .with_context(|| format!("failed to read {}", db_path.display()))?;

    let file = File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.display()))?;
    let mut out = BufWriter::new(file);
    export::write_tsv(&rows, &mut out)?;

    tracing::info!(rows = rows.len(), out = %out_path.display(), "Export written");
    println!("Exported {} actions to {}", rows.len(), out_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(config::get_data_dir);
    let config_path = cli
        .config
        .unwrap_or_else(|| config::get_config_path(&data_dir));
    let bot_config = BotConfig::load_or_init(&config_path)?;
    let _guard = init_tracing(&bot_config, &data_dir)?;

    let db_path = cli
        .db
        .unwrap_or_else(|| config::get_database_path(&data_dir));
    tracing::info!(data_dir = %data_dir.display(), db = %db_path.display(), "chipbot starting");

    match cli.command {
        Commands::Migrate => run_migrate(&db_path).await.map(|_| ()),
        Commands::Export { out } => {
            let out_path = out.unwrap_or_else(|| data_dir.join(DEFAULT_EXPORT_FILE));
            run_export(&db_path, &out_path).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chipbot_storage::{ActionKind, ChipRegistration, LoggedAction, LATEST_VERSION};

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["chipbot", "export", "--db", "x.sqlite3", "-o", "out.txt"])
            .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("x.sqlite3")));
        assert!(matches!(
            cli.command,
            Commands::Export { out: Some(ref p) } if p == Path::new("out.txt")
        ));
    }

    #[tokio::test]
    async fn test_migrate_then_export() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db.sqlite3");
        let out_path = dir.path().join("export.txt");

        let version = run_migrate(&db_path).await.unwrap();
        assert_eq!(version, LATEST_VERSION);
        assert!(db_path.exists());

        let storage = Storage::init(db_path.clone());
        storage.write(ChipRegistration::new(9, 9000));
        storage.write(LoggedAction::now(9, ActionKind::FoodOther));
        storage.terminate().join().await.unwrap();

        run_export(&db_path, &out_path).await.unwrap();
        let text = std::fs::read_to_string(&out_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\tfood_other\t\t9000\t9\t"));
    }

    #[tokio::test]
    async fn test_export_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_export(&dir.path().join("nope.sqlite3"), &dir.path().join("out.txt"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
