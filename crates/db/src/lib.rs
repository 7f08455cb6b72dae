//! Database initialization and migration logic for the order pipeline.
//!
//! Provides `init_db_pool` for creating a connection pool and
//! auto-applying SQL migrations from the migrations directory.

use anyhow::{Context, Result};
use app_config::AppConfig;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio::fs;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::{info, warn};

/// Initializes the database connection pool and runs migrations.
///
/// # Arguments
/// * `cfg` - The loaded application configuration.
///
/// # Returns
/// * `Pool` - A pool of PostgreSQL connections, ready for async use.
///
/// # Errors
/// Returns an error if the pool cannot be created or migrations fail.
pub async fn init_db_pool(cfg: &AppConfig) -> Result<Pool> {
    let dsn = format!(
        "host={} port={} user={} password={} dbname={} sslmode=disable",
        cfg.db_host, cfg.db_port, cfg.db_user, cfg.db_password, cfg.db_name
    );

    let pg_config: PgConfig = dsn.parse().context("Failed to parse Postgres DSN")?;

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(mgr)
        .max_size(16)
        .runtime(Runtime::Tokio1)
        .build()
        .context("Failed to create database pool")?;

    // The database may still be starting; probe with a few retries before
    // giving up.
    let max_retries = 5;
    for attempt in 1..=max_retries {
        match pool.get().await {
            Ok(client) => {
                info!("Connected to database on attempt {attempt}");
                apply_migrations(&client).await?;
                return Ok(pool);
            }
            Err(e) if attempt < max_retries => {
                warn!(
                    "Failed to connect to database (attempt {attempt}/{max_retries}): {e}, retrying in 1 second..."
                );
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to get DB connection after {max_retries} retries: {e}"
                ));
            }
        }
    }
    unreachable!("retry loop either returns or errors on the last attempt")
}

/// Locates the migrations directory and applies its contents.
///
/// Tries the working directory first, then the container path.
async fn apply_migrations(client: &Client) -> Result<()> {
    for migrations_dir in ["./migrations", "/app/migrations"] {
        if fs::metadata(migrations_dir).await.is_ok() {
            info!("Using migrations directory: {migrations_dir}");
            return run_migrations(client, migrations_dir).await;
        }
    }
    info!("No migrations directory found. Skipping migrations.");
    Ok(())
}

/// Applies all SQL migrations from the given directory to the provided database client.
///
/// Files are applied in lexicographic order, so migration files carry a
/// numeric prefix.
///
/// # Arguments
/// * `client` - An active Postgres client.
/// * `migrations_dir` - Path to the folder containing .sql migration files.
///
/// # Errors
/// Returns an error if migration files cannot be read or applied.
pub async fn run_migrations(client: &Client, migrations_dir: &str) -> Result<()> {
    let mut entries = fs::read_dir(migrations_dir)
        .await
        .context("Failed to read migrations directory")?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sql") {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        info!("Applying migration: {file_name}");
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read migration file {file_name}"))?;

        client
            .batch_execute(&content)
            .await
            .with_context(|| format!("Failed to execute migration {file_name}"))?;
    }
    Ok(())
}
