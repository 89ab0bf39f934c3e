use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    Json,
};
use axum_extra::{headers::Cookie, typed_header::TypedHeader};
use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    auth::{password, session, session_token, CurrentUser},
    error::{AppError, AppResult},
    models::{NewTag, NewUser, TAG_KIND_USER},
    queries,
    response::{success, success_with},
    schema::{tags, users},
    state::AppState,
    utils::json::Payload,
};

const INVALID_CREDENTIALS: &str = "Invalid Email or Password";
const MAX_EMAIL_LENGTH: usize = 150;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PageRequest {
    #[serde(alias = "sessionId")]
    pub session_id: Option<String>,
    pub page: Option<String>,
}

fn invalid_credentials() -> AppError {
    AppError::not_acceptable(INVALID_CREDENTIALS)
}

pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !local.is_empty()
        && !host.is_empty()
        && !tld.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
}

pub async fn register(
    State(state): State<AppState>,
    payload: Result<Payload<Credentials>, AppError>,
) -> AppResult<Json<Value>> {
    let Payload(credentials) = payload.map_err(|_| invalid_credentials())?;
    let email = credentials.email.trim().to_string();
    if email.len() > MAX_EMAIL_LENGTH || !is_valid_email(&email) || credentials.password.is_empty()
    {
        return Err(invalid_credentials());
    }

    let password_hash = password::hash_password(&credentials.password)?;
    let mut conn = state.db()?;

    if queries::find_user_by_email(&mut conn, &email)?.is_some()
        || queries::ownership_tag(&mut conn, &email)?.is_some()
    {
        return Err(AppError::conflict("User already exists."));
    }

    conn.transaction(|conn| {
        diesel::insert_into(users::table)
            .values(&NewUser {
                email: email.clone(),
                password_hash,
            })
            .execute(conn)?;
        diesel::insert_into(tags::table)
            .values(&NewTag {
                name: &email,
                kind: TAG_KIND_USER,
            })
            .execute(conn)?;
        Ok::<_, diesel::result::Error>(())
    })?;

    tracing::info!(user = %email, "registered user");
    Ok(success("User registered successfully."))
}

pub async fn login(
    State(state): State<AppState>,
    payload: Result<Payload<Credentials>, AppError>,
) -> AppResult<(HeaderMap, Json<Value>)> {
    let Payload(credentials) = payload.map_err(|_| invalid_credentials())?;
    if credentials.email.is_empty() || credentials.password.is_empty() {
        return Err(invalid_credentials());
    }

    let mut conn = state.db()?;
    let user = queries::find_user_by_email(&mut conn, &credentials.email)?
        .ok_or_else(invalid_credentials)?;

    let valid = password::verify_password(&credentials.password, &user.password_hash)
        .map_err(|_| invalid_credentials())?;
    if !valid {
        tracing::debug!(user = %user.email, "rejected login");
        return Err(invalid_credentials());
    }

    let (token, expires_at) = session::create_session(&mut conn, user.id)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        session::build_session_cookie(&state.config, &token, expires_at),
    );

    Ok((headers, success("Authentication Successful.")))
}

pub async fn logout(
    State(state): State<AppState>,
    jar: Option<TypedHeader<Cookie>>,
) -> AppResult<(HeaderMap, Json<Value>)> {
    if let Some(token) = session_token(jar.as_ref()) {
        let mut conn = state.db()?;
        session::delete_session(&mut conn, &token)?;
    }

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, session::build_clear_session_cookie(&state.config));
    Ok((headers, success("User logout successful")))
}

pub async fn viewable_pages(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Json<Value> {
    let links = state.pages.viewable(&user.roles);
    success_with("Roles found", json!({ "links": links }))
}

pub async fn user_authorized(
    State(state): State<AppState>,
    Payload(request): Payload<PageRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let Some(session_id) = request.session_id.filter(|value| !value.is_empty()) else {
        return Ok(redirect(StatusCode::NOT_ACCEPTABLE, "No session id provided", "/login"));
    };
    let Some(page) = request.page.filter(|value| !value.is_empty()) else {
        return Ok(redirect(StatusCode::NOT_ACCEPTABLE, "No page provided", "/login"));
    };

    let mut conn = state.db()?;
    let Some(user) = session::resolve_session(&mut conn, &session_id, Utc::now().naive_utc())?
    else {
        return Ok(redirect(StatusCode::UNAUTHORIZED, "Session not found", "/login"));
    };
    let caller = CurrentUser::load(&mut conn, user)?;

    if state.pages.can_visit(&caller.roles, &page) {
        Ok((StatusCode::OK, success("Authorized")))
    } else {
        Ok(redirect(
            StatusCode::UNAUTHORIZED,
            crate::error::UNAUTHORIZED_MESSAGE,
            "/app/401",
        ))
    }
}

fn redirect(status: StatusCode, message: &str, target: &str) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({ "success": false, "message": message, "redirect": target })),
    )
}
