use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tower::make::Shared;
use tracing_subscriber::EnvFilter;

use trainmate::auth::roles::reseed_roles;
use trainmate::config::AppConfig;
use trainmate::db;
use trainmate::executions::CouchExecutionStore;
use trainmate::routes::create_router;
use trainmate::state::AppState;
use trainmate::storage::WebDavStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "server",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        server_host = %config.server_host,
        server_port = config.server_port,
        webdav_url = %config.webdav_url,
        couchdb_url = %config.couchdb_url,
        couchdb_name = %config.couchdb_name,
        task_storage_root = %config.task_storage_root,
        "loaded configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    {
        let mut conn = pool.get().context("failed to get database connection")?;
        db::run_migrations(&mut conn)?;
        reseed_roles(&mut conn).context("failed to reseed roles")?;
    }

    let storage = Arc::new(WebDavStorage::new(
        &config.webdav_url,
        config.webdav_token.clone(),
        config.remote_timeout(),
    )?);
    let executions = CouchExecutionStore::new(
        &config.couchdb_url,
        &config.couchdb_name,
        config.couchdb_user.clone(),
        config.couchdb_password.clone(),
        config.remote_timeout(),
    )?;
    if let Err(err) = executions.ensure_database().await {
        tracing::warn!(error = %err, "could not ensure execution database exists");
    }

    let listen_addr: SocketAddr =
        format!("{}:{}", config.server_host, config.server_port).parse()?;
    let state = AppState::new(pool, config, storage, Arc::new(executions));
    let router = create_router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("listening on {}", listen_addr);

    axum::serve(listener, Shared::new(router)).await?;
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
