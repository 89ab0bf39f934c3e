use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing_subscriber::EnvFilter;

use trainmate::{
    auth::session,
    config::AppConfig,
    db,
    executions::CouchExecutionStore,
    reconciler::{TaskLayout, TaskReconciler},
    storage::WebDavStorage,
};

const USAGE: &str = "Usage: maintenance <purge-sessions|prune-orphans>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("purge-sessions") => purge_sessions()?,
        Some("prune-orphans") => prune_orphans().await?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn load_config() -> Result<AppConfig> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        "loaded configuration"
    );
    Ok(config)
}

fn purge_sessions() -> Result<()> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let purged = session::purge_expired_sessions(&mut conn, Utc::now().naive_utc())
        .context("failed to purge sessions")?;
    println!("Purged {purged} expired sessions.");
    Ok(())
}

async fn prune_orphans() -> Result<()> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;

    let storage = WebDavStorage::new(
        &config.webdav_url,
        config.webdav_token.clone(),
        config.remote_timeout(),
    )?;
    let executions = CouchExecutionStore::new(
        &config.couchdb_url,
        &config.couchdb_name,
        config.couchdb_user.clone(),
        config.couchdb_password.clone(),
        config.remote_timeout(),
    )?;
    let layout = TaskLayout::new(&config.task_storage_root, &config.task_remote_name);
    let reconciler = TaskReconciler::new(pool, Arc::new(storage), Arc::new(executions), layout);

    let pruned = reconciler
        .prune_orphans()
        .await
        .context("failed to prune orphaned tasks")?;
    println!("Removed {pruned} tasks without execution documents.");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
