use axum::http::HeaderValue;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::prelude::*;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::config::AppConfig;
use crate::models::{NewSession, Session, User};
use crate::schema::{sessions, users};

pub const SESSION_COOKIE_NAME: &str = "session-id";
pub const SESSION_LIFETIME_HOURS: i64 = 8;

pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_session_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn create_session(
    conn: &mut PgConnection,
    user_id: i32,
) -> QueryResult<(String, DateTime<Utc>)> {
    let token = generate_session_token();
    let expires_at = Utc::now() + ChronoDuration::hours(SESSION_LIFETIME_HOURS);
    diesel::insert_into(sessions::table)
        .values(&NewSession {
            token_hash: hash_session_token(&token),
            user_id,
            expires_at: expires_at.naive_utc(),
        })
        .execute(conn)?;
    Ok((token, expires_at))
}

pub fn resolve_session(
    conn: &mut PgConnection,
    token: &str,
    now: NaiveDateTime,
) -> QueryResult<Option<User>> {
    let token_hash = hash_session_token(token);
    let session = sessions::table
        .filter(sessions::token_hash.eq(&token_hash))
        .first::<Session>(conn)
        .optional()?;

    let session = match session {
        Some(session) if now < session.expires_at => session,
        _ => {
            delete_session_by_hash(conn, &token_hash)?;
            return Ok(None);
        }
    };

    users::table
        .find(session.user_id)
        .select(User::as_select())
        .first(conn)
        .optional()
}

pub fn delete_session(conn: &mut PgConnection, token: &str) -> QueryResult<usize> {
    delete_session_by_hash(conn, &hash_session_token(token))
}

fn delete_session_by_hash(conn: &mut PgConnection, token_hash: &str) -> QueryResult<usize> {
    diesel::delete(sessions::table.filter(sessions::token_hash.eq(token_hash))).execute(conn)
}

pub fn purge_expired_sessions(conn: &mut PgConnection, now: NaiveDateTime) -> QueryResult<usize> {
    diesel::delete(sessions::table.filter(sessions::expires_at.le(now))).execute(conn)
}

pub fn build_session_cookie(
    config: &AppConfig,
    token: &str,
    expires_at: DateTime<Utc>,
) -> HeaderValue {
    let max_age = ChronoDuration::hours(SESSION_LIFETIME_HOURS).num_seconds();

    let mut parts = vec![format!("{}={}", SESSION_COOKIE_NAME, token)];
    parts.push("Path=/".into());
    parts.push("HttpOnly".into());
    parts.push("SameSite=Lax".into());
    parts.push(format!("Max-Age={}", max_age));
    parts.push(format!("Expires={}", expires_at.to_rfc2822()));
    if config.session_cookie_secure {
        parts.push("Secure".into());
    }

    HeaderValue::from_str(&parts.join("; ")).expect("valid session cookie")
}

pub fn build_clear_session_cookie(config: &AppConfig) -> HeaderValue {
    let mut parts = vec![format!("{}=", SESSION_COOKIE_NAME)];
    parts.push("Path=/".into());
    parts.push("HttpOnly".into());
    parts.push("SameSite=Lax".into());
    parts.push("Max-Age=0".into());
    parts.push("Expires=Thu, 01 Jan 1970 00:00:00 GMT".into());
    if config.session_cookie_secure {
        parts.push("Secure".into());
    }

    HeaderValue::from_str(&parts.join("; ")).expect("valid session cookie")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn config(secure: bool) -> AppConfig {
        AppConfig {
            database_url: "postgres://localhost/test".into(),
            database_max_pool_size: 1,
            server_host: "127.0.0.1".into(),
            server_port: 0,
            session_cookie_secure: secure,
            cors_allowed_origin: None,
            webdav_url: "http://localhost/dav".into(),
            webdav_token: None,
            couchdb_url: "http://localhost:5984".into(),
            couchdb_name: "tokens".into(),
            couchdb_user: None,
            couchdb_password: None,
            remote_timeout_seconds: 5,
            task_storage_root: "projects/imagen".into(),
            task_remote_name: "dCache".into(),
        }
    }

    #[test]
    fn tokens_are_unique_hex_and_hash_deterministically() {
        let first = generate_session_token();
        let second = generate_session_token();
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
        assert_eq!(hash_session_token(&first), hash_session_token(&first));
        assert_ne!(hash_session_token(&first), first);
    }

    #[test]
    fn session_cookie_is_http_only_with_eight_hour_lifetime() {
        let expires = Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).single().expect("date");
        let cookie = build_session_cookie(&config(false), "abc", expires);
        let rendered = cookie.to_str().expect("ascii");
        assert!(rendered.starts_with("session-id=abc; Path=/; HttpOnly"));
        assert!(rendered.contains("Max-Age=28800"));
        assert!(!rendered.contains("Secure"));
    }

    #[test]
    fn clearing_cookie_expires_immediately() {
        let cookie = build_clear_session_cookie(&config(true));
        let rendered = cookie.to_str().expect("ascii");
        assert!(rendered.starts_with("session-id=;"));
        assert!(rendered.contains("Max-Age=0"));
        assert!(rendered.ends_with("Secure"));
    }
}
