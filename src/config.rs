use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub session_cookie_secure: bool,
    pub cors_allowed_origin: Option<String>,
    pub webdav_url: String,
    pub webdav_token: Option<String>,
    pub couchdb_url: String,
    pub couchdb_name: String,
    pub couchdb_user: Option<String>,
    pub couchdb_password: Option<String>,
    pub remote_timeout_seconds: u64,
    pub task_storage_root: String,
    pub task_remote_name: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .context("SERVER_PORT must be a valid u16")?;
        let session_cookie_secure = env::var("SESSION_COOKIE_SECURE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN").ok();
        let webdav_url = env::var("WEBDAV_URL").context("WEBDAV_URL must be set")?;
        let webdav_token = env::var("WEBDAV_TOKEN").ok();
        let couchdb_url = env::var("COUCHDB_URL").context("COUCHDB_URL must be set")?;
        let couchdb_name = env::var("COUCHDB_NAME").unwrap_or_else(|_| "tokens".to_string());
        let couchdb_user = env::var("COUCHDB_USER").ok();
        let couchdb_password = env::var("COUCHDB_PASSWORD").ok();
        let remote_timeout_seconds = env::var("REMOTE_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .context("REMOTE_TIMEOUT_SECONDS must be an integer")?;
        let task_storage_root = env::var("TASK_STORAGE_ROOT")
            .unwrap_or_else(|_| "projects/imagen".to_string())
            .trim_matches('/')
            .to_string();
        let task_remote_name =
            env::var("TASK_REMOTE_NAME").unwrap_or_else(|_| "dCache".to_string());

        Ok(Self {
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            session_cookie_secure,
            cors_allowed_origin,
            webdav_url: with_scheme(&webdav_url),
            webdav_token,
            couchdb_url: with_scheme(&couchdb_url),
            couchdb_name,
            couchdb_user,
            couchdb_password,
            remote_timeout_seconds,
            task_storage_root,
            task_remote_name,
        })
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_seconds.max(1))
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }
}

fn with_scheme(raw: &str) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    }
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            let _ = parsed.set_password(Some("*****"));
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
