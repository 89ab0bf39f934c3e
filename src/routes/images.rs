use std::collections::BTreeMap;

use axum::{extract::State, Json};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    auth::{roles::Role, CurrentUser},
    error::{AppError, AppResult},
    models::{Image, NewImage, NewImageRole, RoleRow},
    queries,
    response::{success, success_with},
    schema::{images, images_roles, roles},
    state::AppState,
    utils::json::Payload,
};

const MAX_IMAGE_FIELD_LENGTH: usize = 150;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateImageRequest {
    pub name: String,
    pub roles: Vec<String>,
    pub parameters: Vec<String>,
    pub container_path: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameImageRequest {
    pub previous_name: String,
    pub new_name: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageRolesRequest {
    pub name: String,
    pub roles: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageNameRequest {
    pub name: String,
}

#[derive(Serialize)]
struct ImageView {
    id: i32,
    name: String,
    container_path: String,
    parameters: Vec<String>,
    roles: Vec<String>,
}

fn field_ok(value: &str) -> bool {
    !value.is_empty() && value.len() <= MAX_IMAGE_FIELD_LENGTH
}

fn resolve_roles(conn: &mut PgConnection, names: &[String]) -> QueryResult<Option<Vec<RoleRow>>> {
    if names.iter().any(|name| Role::from_name(name).is_none()) {
        return Ok(None);
    }
    let rows: Vec<RoleRow> = roles::table
        .filter(roles::name.eq_any(names))
        .select(RoleRow::as_select())
        .load(conn)?;
    Ok(Some(rows))
}

fn replace_image_roles(conn: &mut PgConnection, image_id: i32, rows: &[RoleRow]) -> QueryResult<()> {
    diesel::delete(images_roles::table.filter(images_roles::image_id.eq(image_id))).execute(conn)?;
    let links: Vec<NewImageRole> = rows
        .iter()
        .map(|role| NewImageRole {
            image_id,
            role_id: role.id,
        })
        .collect();
    if !links.is_empty() {
        diesel::insert_into(images_roles::table)
            .values(&links)
            .on_conflict_do_nothing()
            .execute(conn)?;
    }
    Ok(())
}

pub async fn list_images(
    State(state): State<AppState>,
    user: CurrentUser,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;

    let visible: Vec<Image> = if user.has_role(Role::Maintainer) {
        images::table
            .select(Image::as_select())
            .order(images::id.asc())
            .load(&mut conn)?
    } else {
        let names: Vec<&str> = user.roles.iter().map(|role| role.name()).collect();
        images::table
            .inner_join(images_roles::table.inner_join(roles::table))
            .filter(roles::name.eq_any(names))
            .select(Image::as_select())
            .distinct()
            .order(images::id.asc())
            .load(&mut conn)?
    };

    let ids: Vec<i32> = visible.iter().map(|image| image.id).collect();
    let links: Vec<(i32, String)> = images_roles::table
        .inner_join(roles::table)
        .filter(images_roles::image_id.eq_any(&ids))
        .select((images_roles::image_id, roles::name))
        .order(roles::name.asc())
        .load(&mut conn)?;
    let mut by_image: BTreeMap<i32, Vec<String>> = BTreeMap::new();
    for (image_id, role) in links {
        by_image.entry(image_id).or_default().push(role);
    }

    let views: Vec<ImageView> = visible
        .into_iter()
        .map(|image| ImageView {
            parameters: image.parameter_names(),
            roles: by_image.remove(&image.id).unwrap_or_default(),
            id: image.id,
            name: image.name,
            container_path: image.container_path,
        })
        .collect();

    Ok(success_with("Images fetched.", json!({ "images": views })))
}

pub async fn create_image(
    State(state): State<AppState>,
    Payload(request): Payload<CreateImageRequest>,
) -> AppResult<Json<Value>> {
    if !field_ok(&request.name) || !field_ok(&request.container_path) || request.roles.is_empty() {
        return Err(AppError::invalid_payload());
    }

    let mut conn = state.db()?;
    let taken = queries::find_image_by_name(&mut conn, &request.name)?.is_some()
        || queries::find_image_by_container_path(&mut conn, &request.container_path)?.is_some();
    if taken {
        return Err(AppError::conflict(
            "Container path and image name must be unique.",
        ));
    }

    let role_rows = resolve_roles(&mut conn, &request.roles)?
        .ok_or_else(|| AppError::not_acceptable("Roles are not valid."))?;

    conn.transaction(|conn| {
        let image_id: i32 = diesel::insert_into(images::table)
            .values(&NewImage {
                name: &request.name,
                container_path: &request.container_path,
                parameters: json!(request.parameters),
            })
            .returning(images::id)
            .get_result(conn)?;
        replace_image_roles(conn, image_id, &role_rows)
    })?;

    tracing::info!(image = %request.name, "created image");
    Ok(success("Image created successfully."))
}

pub async fn rename_image(
    State(state): State<AppState>,
    Payload(request): Payload<RenameImageRequest>,
) -> AppResult<Json<Value>> {
    if !field_ok(&request.previous_name) || !field_ok(&request.new_name) {
        return Err(AppError::invalid_payload());
    }

    let mut conn = state.db()?;
    let image = queries::find_image_by_name(&mut conn, &request.previous_name)?
        .ok_or_else(|| AppError::not_found("Image does not exist."))?;
    if queries::find_image_by_name(&mut conn, &request.new_name)?.is_some() {
        return Err(AppError::conflict("An image with this name already exists."));
    }

    diesel::update(images::table.find(image.id))
        .set(images::name.eq(&request.new_name))
        .execute(&mut conn)?;

    Ok(success("Image name changed successfully."))
}

pub async fn update_image_roles(
    State(state): State<AppState>,
    Payload(request): Payload<ImageRolesRequest>,
) -> AppResult<Json<Value>> {
    if request.name.is_empty() || request.roles.is_empty() {
        return Err(AppError::invalid_payload());
    }

    let mut conn = state.db()?;
    let image = queries::find_image_by_name(&mut conn, &request.name)?
        .ok_or_else(|| AppError::not_found("Image does not exist."))?;
    let role_rows = resolve_roles(&mut conn, &request.roles)?
        .ok_or_else(|| AppError::not_acceptable("Roles are not valid."))?;

    conn.transaction(|conn| replace_image_roles(conn, image.id, &role_rows))?;

    Ok(success("Image roles updated successfully."))
}

pub async fn delete_image(
    State(state): State<AppState>,
    Payload(request): Payload<ImageNameRequest>,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let removed =
        diesel::delete(images::table.filter(images::name.eq(&request.name))).execute(&mut conn)?;
    if removed == 0 {
        return Err(AppError::not_found("Image does not exist."));
    }

    Ok(success("Image deleted successfully."))
}

pub async fn stored_parameters(
    State(state): State<AppState>,
    user: CurrentUser,
    Payload(request): Payload<ImageNameRequest>,
) -> AppResult<Json<Value>> {
    if request.name.is_empty() {
        return Err(AppError::invalid_payload());
    }
    let stored = state.tasks.stored_parameters(&user, &request.name).await?;
    Ok(success_with(
        "Stored parameters fetched.",
        json!({ "parameters": stored }),
    ))
}
