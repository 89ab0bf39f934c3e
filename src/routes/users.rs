use std::collections::BTreeMap;

use axum::{extract::State, Json};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    auth::CurrentUser,
    error::{AppError, AppResult},
    models::TAG_KIND_USER,
    queries,
    response::{success, success_with},
    schema::{roles, tags, users, users_roles},
    state::AppState,
    utils::json::Payload,
};

#[derive(Serialize)]
struct UserEntry {
    email: String,
    roles: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteUserRequest {
    pub email: String,
}

pub async fn list_users(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;

    let emails: Vec<(i32, String)> = users::table
        .select((users::id, users::email))
        .order(users::email.asc())
        .load(&mut conn)?;
    let assignments: Vec<(i32, String)> = users_roles::table
        .inner_join(roles::table)
        .select((users_roles::user_id, roles::name))
        .order(roles::name.asc())
        .load(&mut conn)?;

    let mut by_user: BTreeMap<i32, Vec<String>> = BTreeMap::new();
    for (user_id, role) in assignments {
        by_user.entry(user_id).or_default().push(role);
    }

    let entries: Vec<UserEntry> = emails
        .into_iter()
        .map(|(id, email)| UserEntry {
            email,
            roles: by_user.remove(&id).unwrap_or_default(),
        })
        .collect();

    Ok(success_with("Users fetched.", json!({ "users": entries })))
}

pub async fn delete_user(
    State(state): State<AppState>,
    payload: Result<Payload<DeleteUserRequest>, AppError>,
) -> AppResult<Json<Value>> {
    let invalid = || AppError::not_acceptable("Invalid email");
    let Payload(request) = payload.map_err(|_| invalid())?;

    let mut conn = state.db()?;
    let user = queries::find_user_by_email(&mut conn, &request.email)?.ok_or_else(invalid)?;

    conn.transaction(|conn| {
        diesel::delete(users::table.find(user.id)).execute(conn)?;
        diesel::delete(
            tags::table
                .filter(tags::name.eq(&user.email))
                .filter(tags::kind.eq(TAG_KIND_USER)),
        )
        .execute(conn)?;
        Ok::<_, diesel::result::Error>(())
    })?;

    tracing::info!(user = %user.email, "deleted user");
    Ok(success("User deleted successfully."))
}

pub async fn current_user(
    State(state): State<AppState>,
    user: CurrentUser,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let tag = queries::ownership_tag(&mut conn, &user.email)?
        .filter(|tag| tag.kind == TAG_KIND_USER)
        .ok_or_else(|| AppError::not_found("User does not exist."))?;

    Ok(success_with(
        "Current user fetched.",
        json!({
            "id": user.id,
            "email": user.email,
            "roles": user.roles,
            "tag": { "id": tag.id, "name": tag.name, "type": tag.kind },
        }),
    ))
}

pub async fn current_email(user: CurrentUser) -> Json<Value> {
    success_with("Email fetch successful.", json!({ "email": user.email }))
}

pub async fn role_status(user: CurrentUser) -> Json<Value> {
    if user.roles.is_empty() {
        success("Please contact the system admin to assign you role(s)!")
    } else {
        success("Welcome to Trainmate!")
    }
}
