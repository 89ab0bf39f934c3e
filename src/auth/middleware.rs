use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::Cookie;
use axum_extra::TypedHeader;
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use tracing::debug;

use super::{
    policy::{task_token, AccessPolicy},
    session, session_token, CurrentUser,
};
use crate::{
    error::{AppError, AppResult},
    queries,
    state::AppState,
};

#[derive(Debug)]
pub enum Access {
    Allow(CurrentUser),
    Deny(&'static str),
}

pub fn evaluate(
    conn: &mut PgConnection,
    policy: &AccessPolicy,
    path: &str,
    token: &str,
    now: NaiveDateTime,
) -> QueryResult<Access> {
    let Some(user) = session::resolve_session(conn, token, now)? else {
        return Ok(Access::Deny("no live session"));
    };
    let caller = CurrentUser::load(conn, user)?;

    if let Some(token_id) = task_token(path) {
        // Unknown tokens fall through so the handler can answer 404.
        if let Some(task) = queries::find_task(conn, token_id)? {
            let route_shape = &path[..path.len() - token_id.len()];
            if !policy.role_authorized(&caller.roles, route_shape) {
                return Ok(Access::Deny("roles do not cover task routes"));
            }
            if !queries::task_has_tag_named(conn, task.id, &caller.email)? {
                return Ok(Access::Deny("caller does not own task"));
            }
        }
    } else if policy.is_registered_route(path) && !policy.role_authorized(&caller.roles, path) {
        return Ok(Access::Deny("roles do not cover route"));
    }

    Ok(Access::Allow(caller))
}

pub async fn authorize(
    State(state): State<AppState>,
    cookies: Option<TypedHeader<Cookie>>,
    mut request: Request,
    next: Next,
) -> AppResult<Response> {
    let path = request.uri().path().to_owned();
    if state.policy.is_excluded(&path) {
        return Ok(next.run(request).await);
    }

    let Some(token) = session_token(cookies.as_ref()) else {
        debug!(%path, "denied request without session cookie");
        return Err(AppError::unauthorized());
    };

    let access = {
        let mut conn = state.db()?;
        evaluate(&mut conn, &state.policy, &path, &token, Utc::now().naive_utc())?
    };

    match access {
        Access::Allow(caller) => {
            request.extensions_mut().insert(caller);
            Ok(next.run(request).await)
        }
        Access::Deny(reason) => {
            debug!(%path, reason, "denied request");
            Err(AppError::unauthorized())
        }
    }
}
