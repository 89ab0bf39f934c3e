use axum::{extract::State, Json};
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    models::{NewTag, Tag, TAG_KIND_CUSTOM},
    reconciler::TagView,
    response::{success, success_with},
    schema::tags,
    state::AppState,
    utils::json::Payload,
};

const MAX_TAG_NAME_LENGTH: usize = 150;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagNameRequest {
    pub name: String,
}

pub async fn list_tags(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let rows: Vec<Tag> = tags::table
        .select(Tag::as_select())
        .order(tags::id.asc())
        .load(&mut conn)?;
    let views: Vec<TagView> = rows.iter().map(TagView::from).collect();
    Ok(success_with("Tags fetched.", json!({ "tags": views })))
}

pub async fn list_custom_tags(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let rows: Vec<Tag> = tags::table
        .filter(tags::kind.eq(TAG_KIND_CUSTOM))
        .select(Tag::as_select())
        .order(tags::id.asc())
        .load(&mut conn)?;
    let views: Vec<Value> = rows
        .into_iter()
        .map(|tag| json!({ "id": tag.id, "name": tag.name }))
        .collect();
    Ok(success_with("Custom tags fetched.", json!({ "tags": views })))
}

pub async fn create_custom_tag(
    State(state): State<AppState>,
    Payload(request): Payload<TagNameRequest>,
) -> AppResult<Json<Value>> {
    let name = request.name.trim();
    if name.is_empty() || name.len() > MAX_TAG_NAME_LENGTH {
        return Err(AppError::invalid_payload());
    }

    let mut conn = state.db()?;
    let inserted = diesel::insert_into(tags::table)
        .values(&NewTag {
            name,
            kind: TAG_KIND_CUSTOM,
        })
        .on_conflict(tags::name)
        .do_nothing()
        .execute(&mut conn)?;
    if inserted == 0 {
        return Err(AppError::conflict("Tag name exists."));
    }

    Ok(success("Custom tag created successfully."))
}

pub async fn delete_custom_tag(
    State(state): State<AppState>,
    Payload(request): Payload<TagNameRequest>,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let removed = diesel::delete(
        tags::table
            .filter(tags::name.eq(&request.name))
            .filter(tags::kind.eq(TAG_KIND_CUSTOM)),
    )
    .execute(&mut conn)?;
    if removed == 0 {
        return Err(AppError::not_found("Tag does not exist."));
    }

    Ok(success("Custom tag deleted successfully."))
}
