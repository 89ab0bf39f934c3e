pub mod middleware;
pub mod pages;
pub mod password;
pub mod policy;
pub mod roles;
pub mod session;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::Cookie;
use axum_extra::TypedHeader;
use chrono::Utc;
use diesel::prelude::*;
use serde::Serialize;

use crate::{
    error::AppError,
    models::User,
    state::AppState,
};

use self::roles::Role;

#[derive(Debug, Clone, Serialize)]
pub struct CurrentUser {
    pub id: i32,
    pub email: String,
    pub roles: Vec<Role>,
}

impl CurrentUser {
    pub fn load(conn: &mut PgConnection, user: User) -> QueryResult<Self> {
        let roles = roles::roles_for_user(conn, user.id)?;
        Ok(Self {
            id: user.id,
            email: user.email,
            roles,
        })
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

pub fn session_token(cookies: Option<&TypedHeader<Cookie>>) -> Option<String> {
    cookies
        .and_then(|TypedHeader(cookie)| cookie.get(session::SESSION_COOKIE_NAME))
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<CurrentUser>() {
            return Ok(user.clone());
        }

        let cookies = TypedHeader::<Cookie>::from_request_parts(parts, state)
            .await
            .ok();
        let token = session_token(cookies.as_ref()).ok_or_else(AppError::unauthorized)?;

        let mut conn = state.db()?;
        let user = session::resolve_session(&mut conn, &token, Utc::now().naive_utc())?
            .ok_or_else(AppError::unauthorized)?;
        Ok(CurrentUser::load(&mut conn, user)?)
    }
}
