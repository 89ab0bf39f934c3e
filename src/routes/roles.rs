use axum::{extract::State, Json};
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    auth::roles::Role,
    error::{AppError, AppResult},
    models::{NewUserRole, RoleRow},
    queries,
    response::{success, success_with},
    schema::{roles, users_roles},
    state::AppState,
    utils::json::Payload,
};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateRolesRequest {
    pub email: String,
    pub roles: Vec<String>,
}

pub async fn list_roles(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let names: Vec<String> = roles::table
        .select(roles::name)
        .order(roles::id.asc())
        .load(&mut conn)?;
    Ok(success_with("Roles fetched.", json!({ "roles": names })))
}

pub async fn update_user_roles(
    State(state): State<AppState>,
    Payload(request): Payload<UpdateRolesRequest>,
) -> AppResult<Json<Value>> {
    if request.roles.iter().any(|name| Role::from_name(name).is_none()) {
        return Err(AppError::invalid_payload());
    }

    let mut conn = state.db()?;
    let user = queries::find_user_by_email(&mut conn, &request.email)?
        .ok_or_else(|| AppError::not_found("User does not exist."))?;

    let rows: Vec<RoleRow> = roles::table
        .filter(roles::name.eq_any(&request.roles))
        .select(RoleRow::as_select())
        .load(&mut conn)?;

    conn.transaction(|conn| {
        diesel::delete(users_roles::table.filter(users_roles::user_id.eq(user.id)))
            .execute(conn)?;
        let assignments: Vec<NewUserRole> = rows
            .iter()
            .map(|role| NewUserRole {
                user_id: user.id,
                role_id: role.id,
            })
            .collect();
        if !assignments.is_empty() {
            diesel::insert_into(users_roles::table)
                .values(&assignments)
                .on_conflict_do_nothing()
                .execute(conn)?;
        }
        Ok::<_, diesel::result::Error>(())
    })?;

    tracing::info!(user = %user.email, roles = ?request.roles, "updated user roles");
    Ok(success("Role(s) updated successfully."))
}
