use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::info;

use db_core::{
    update_database, ConnectionManager, ConnectionSpec, DbError, EnvSettings, ReplicaTopology,
    Settings, UpdateOutcome,
};
use migration::{count_applied_migrations, count_pending_migrations, SchemaRunner};

#[derive(Clone, ValueEnum)]
enum Command {
    /// Connect and run the coordinated database update
    Update,
    /// Show pending and applied migration counts
    Status,
    /// Measure database round-trip latency
    Ping,
}

#[derive(Parser)]
#[command(name = "dbctl")]
#[command(about = "Database connection and migration tool")]
struct Args {
    /// Command to run
    #[arg(value_enum)]
    command: Command,

    /// Caller id recorded in coordination logs
    #[arg(short, long, default_value = "dbctl")]
    caller: String,
}

/// Builds the connection spec from environment variables.
///
/// Environment variables must be set by the runtime environment:
/// - Docker: via docker-compose env_file or docker run --env-file
/// - Local dev: source env files manually (e.g. set -a; . ./.env; set +a)
fn spec_from_env(settings: &dyn Settings) -> Result<ConnectionSpec, DbError> {
    let must = |key: &str| {
        settings.get_string(key).ok_or_else(|| {
            DbError::config(format!("Required environment variable '{key}' is not set"))
        })
    };

    let replication = match (
        settings.get_string("POSTGRES_WRITE_HOST"),
        settings.get_string("POSTGRES_READ_HOSTS"),
    ) {
        (Some(write_host), Some(read_hosts)) => Some(ReplicaTopology {
            write_host,
            read_hosts: read_hosts
                .split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect(),
        }),
        _ => None,
    };

    Ok(ConnectionSpec {
        host: settings
            .get_string("POSTGRES_HOST")
            .unwrap_or_else(|| "localhost".to_string()),
        port: settings
            .get_i64("POSTGRES_PORT")
            .and_then(|n| u16::try_from(n).ok())
            .unwrap_or(5432),
        database: must("POSTGRES_DB")?,
        database_modifier_key: settings.get_string("DB_NAME_MODIFIER_KEY"),
        user: must("POSTGRES_USER")?,
        password: must("POSTGRES_PASSWORD")?,
        ssl_mode: settings.get_bool("POSTGRES_SSL").unwrap_or(false),
        cert_path: settings.get_string("POSTGRES_SSL_ROOT_CERT"),
        retry: None,
        replication,
    })
}

async fn run(args: Args) -> Result<(), DbError> {
    let settings = Arc::new(EnvSettings);
    let spec = spec_from_env(&*settings)?;

    let mut manager = ConnectionManager::new(settings.clone());
    manager.connect(&spec).await?;

    let result = async {
        let handle = manager
            .handle()
            .ok_or_else(|| DbError::config("no database handle after connect"))?;

        match &args.command {
            Command::Update => {
                let runner = SchemaRunner::from_shared(handle.write_shared());
                match update_database(handle, &runner, &*settings, &args.caller).await? {
                    UpdateOutcome::Applied { executed } => {
                        info!(executed, "database update applied by this process");
                    }
                    UpdateOutcome::CompletedByPeer => {
                        info!("database update completed by another process");
                    }
                }
            }
            Command::Status => {
                let pending = count_pending_migrations(handle.write())
                    .await
                    .map_err(|e| DbError::migration(format!("could not read status: {e}")))?;
                let applied = count_applied_migrations(handle.write())
                    .await
                    .map_err(|e| DbError::migration(format!("could not read status: {e}")))?;
                println!("applied: {applied}");
                println!("pending: {pending}");
            }
            Command::Ping => {
                let elapsed = manager.ping().await;
                println!("ping: {elapsed} ms");
            }
        }
        Ok(())
    }
    .await;

    manager.disconnect().await?;
    result
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .without_time()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(false)
        .with_file(false)
        .with_env_filter("db_core=info,migration=info,dbctl=info,sqlx=warn")
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("dbctl failed [{}]: {e}", e.code());
        std::process::exit(1);
    }
}
