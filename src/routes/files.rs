use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Write};

use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use diesel::prelude::*;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use crate::{
    auth::CurrentUser,
    error::{AppError, AppResult},
    models::{File, Tag, FILE_KIND_DIRECTORY, FILE_KIND_FILE},
    queries,
    reconciler::{catalog_index, TagView},
    response::{success, success_with},
    schema::{files, files_tags, tags},
    state::AppState,
    storage::{normalize_path, read_all, StorageError},
    utils::json::Payload,
};

const FILES_ROUTE: &str = "/api/files";
const DOWNLOAD_ROUTE: &str = "/api/files/download";
const DEFAULT_PER_PAGE: i64 = 20;
const MAX_PER_PAGE: i64 = 200;

#[derive(Deserialize)]
pub struct FileListQuery {
    pub search: Option<String>,
    pub tags: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileTagsRequest {
    pub tags: Vec<i32>,
}

#[derive(Serialize)]
struct FileView {
    id: i32,
    index: String,
    #[serde(rename = "type")]
    kind: String,
    tags: Vec<TagView>,
}

fn next_page_link(search: Option<&str>, tags: Option<&str>, page: i64, per_page: i64) -> String {
    let mut link = format!("{FILES_ROUTE}?page={}&per_page={per_page}", page + 1);
    if let Some(search) = search {
        link.push_str("&search=");
        link.extend(utf8_percent_encode(search, NON_ALPHANUMERIC));
    }
    if let Some(tags) = tags {
        link.push_str("&tags=");
        link.extend(utf8_percent_encode(tags, NON_ALPHANUMERIC));
    }
    link
}

fn parse_tag_ids(raw: &str) -> Option<Vec<i32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse().ok())
        .collect()
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn clean_relative_path(raw: &str) -> Option<String> {
    let segments: Vec<&str> = raw.trim_matches('/').split('/').collect();
    if segments
        .iter()
        .any(|segment| segment.is_empty() || *segment == "." || *segment == "..")
    {
        return None;
    }
    Some(segments.join("/"))
}

fn join_path(folder: &str, relative: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        relative.to_string()
    } else {
        format!("{folder}/{relative}")
    }
}

fn upload_catalog_entry(folder: &str, relative: &str) -> (String, &'static str) {
    match relative.split_once('/') {
        None => (catalog_index(&join_path(folder, relative)), FILE_KIND_FILE),
        Some((top, _)) => (
            format!("{}/", catalog_index(&join_path(folder, top))),
            FILE_KIND_DIRECTORY,
        ),
    }
}

fn pack_zip(entries: Vec<(String, Vec<u8>)>) -> zip::result::ZipResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut archive = ZipWriter::new(&mut buffer);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, bytes) in entries {
            archive.start_file(name, options)?;
            archive.write_all(&bytes)?;
        }
        archive.finish()?;
    }
    Ok(buffer.into_inner())
}

fn attachment(filename: &str) -> HeaderValue {
    let sanitized: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            _ => ch,
        })
        .collect();
    let encoded = utf8_percent_encode(&sanitized, NON_ALPHANUMERIC);
    HeaderValue::from_str(&format!(
        "attachment; filename=\"{sanitized}\"; filename*=UTF-8''{encoded}"
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn require_route(state: &AppState, user: &CurrentUser, route: &str) -> AppResult<()> {
    if state.policy.role_authorized(&user.roles, route) {
        Ok(())
    } else {
        Err(AppError::unauthorized())
    }
}

fn owned_file(conn: &mut PgConnection, user: &CurrentUser, file_id: i32) -> AppResult<File> {
    let file = queries::find_file(conn, file_id)?
        .ok_or_else(|| AppError::not_found("File does not exist."))?;
    if !queries::file_has_tag_named(conn, file.id, &user.email)? {
        return Err(AppError::unauthorized());
    }
    Ok(file)
}

pub async fn list_files(
    State(state): State<AppState>,
    user: CurrentUser,
    params: Result<Query<FileListQuery>, axum::extract::rejection::QueryRejection>,
) -> AppResult<Json<Value>> {
    let Query(params) = params.map_err(|_| AppError::invalid_payload())?;
    let page = params.page.unwrap_or(1);
    let per_page = params.per_page.unwrap_or(DEFAULT_PER_PAGE);
    if page < 1 || !(1..=MAX_PER_PAGE).contains(&per_page) {
        return Err(AppError::invalid_payload());
    }
    let search = params
        .search
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let tags_param = params
        .tags
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let required_tags = match tags_param {
        Some(raw) => parse_tag_ids(raw).ok_or_else(AppError::invalid_payload)?,
        None => Vec::new(),
    };

    let mut conn = state.db()?;

    let owned = files_tags::table
        .inner_join(tags::table)
        .filter(tags::name.eq(&user.email))
        .select(files_tags::file_id);
    let mut query = files::table
        .filter(files::id.eq_any(owned))
        .select(File::as_select())
        .into_boxed();
    if let Some(search) = search {
        query = query.filter(files::index.ilike(format!("%{}%", escape_like(search))));
    }
    for tag_id in &required_tags {
        query = query.filter(
            files::id.eq_any(
                files_tags::table
                    .filter(files_tags::tag_id.eq(*tag_id))
                    .select(files_tags::file_id),
            ),
        );
    }

    let mut rows: Vec<File> = query
        .order(files::id.asc())
        .offset((page - 1) * per_page)
        .limit(per_page + 1)
        .load(&mut conn)?;
    let has_more = rows.len() as i64 > per_page;
    rows.truncate(per_page as usize);

    let ids: Vec<i32> = rows.iter().map(|file| file.id).collect();
    let tag_rows: Vec<(i32, Tag)> = files_tags::table
        .inner_join(tags::table)
        .filter(files_tags::file_id.eq_any(&ids))
        .select((files_tags::file_id, Tag::as_select()))
        .order(tags::id.asc())
        .load(&mut conn)?;
    let mut by_file: HashMap<i32, Vec<TagView>> = HashMap::new();
    for (file_id, tag) in &tag_rows {
        by_file.entry(*file_id).or_default().push(TagView::from(tag));
    }

    let views: Vec<FileView> = rows
        .into_iter()
        .map(|file| FileView {
            tags: by_file.remove(&file.id).unwrap_or_default(),
            id: file.id,
            index: file.index,
            kind: file.kind,
        })
        .collect();
    let next = has_more.then(|| next_page_link(search, tags_param, page, per_page));

    Ok(success_with(
        "Files fetched.",
        json!({ "files": views, "page": page, "per_page": per_page, "next": next }),
    ))
}

pub async fn update_file_tags(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(file_id): Path<i32>,
    Payload(request): Payload<FileTagsRequest>,
) -> AppResult<Json<Value>> {
    require_route(&state, &user, FILES_ROUTE)?;
    let mut conn = state.db()?;
    let file = owned_file(&mut conn, &user, file_id)?;

    let requested: BTreeSet<i32> = request.tags.into_iter().collect();
    let found: Vec<i32> = tags::table
        .filter(tags::id.eq_any(&requested))
        .select(tags::id)
        .load(&mut conn)?;
    if found.len() != requested.len() {
        return Err(AppError::not_found("Tag does not exist."));
    }

    let owner_tag = queries::ownership_tag(&mut conn, &user.email)?
        .ok_or_else(AppError::unauthorized)?;
    let mut tag_ids: Vec<i32> = requested.into_iter().collect();
    if !tag_ids.contains(&owner_tag.id) {
        tag_ids.push(owner_tag.id);
    }

    conn.transaction(|conn| queries::replace_file_tags(conn, file.id, &tag_ids))?;
    Ok(success("File tags updated successfully."))
}

pub async fn delete_file(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(file_id): Path<i32>,
) -> AppResult<Json<Value>> {
    require_route(&state, &user, FILES_ROUTE)?;
    let file = {
        let mut conn = state.db()?;
        owned_file(&mut conn, &user, file_id)?
    };

    let path = normalize_path(&file.index);
    if file.kind == FILE_KIND_DIRECTORY {
        let objects = match state.storage.list_recursive(path).await {
            Ok(objects) => objects,
            Err(StorageError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        for object in objects {
            state.storage.delete(&object).await?;
        }
    }
    match state.storage.delete(path).await {
        Ok(()) | Err(StorageError::NotFound(_)) => {}
        Err(err) => return Err(err.into()),
    }

    let mut conn = state.db()?;
    diesel::delete(files::table.find(file.id)).execute(&mut conn)?;
    info!(file = %file.index, user = %user.email, "deleted file");
    Ok(success("File deleted successfully."))
}

pub async fn download_file(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(file_id): Path<i32>,
) -> AppResult<Response> {
    require_route(&state, &user, DOWNLOAD_ROUTE)?;
    let file = {
        let mut conn = state.db()?;
        owned_file(&mut conn, &user, file_id)?
    };

    let path = normalize_path(&file.index);
    let name = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();

    if file.kind != FILE_KIND_DIRECTORY {
        let stream = state.storage.get(path).await?;
        let headers = [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            ),
            (header::CONTENT_DISPOSITION, attachment(&name)),
        ];
        return Ok((headers, Body::from_stream(stream)).into_response());
    }

    let prefix = format!("{}/", path.trim_end_matches('/'));
    let mut entries = Vec::new();
    for object in state.storage.list_recursive(path).await? {
        let bytes = read_all(state.storage.get(&object).await?).await?;
        let entry = object.strip_prefix(&prefix).unwrap_or(&object).to_string();
        entries.push((entry, bytes));
    }
    let archive = pack_zip(entries).map_err(|err| {
        error!(error = %err, file = %file.index, "failed to pack directory");
        AppError::internal(err)
    })?;

    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static("application/zip")),
        (header::CONTENT_DISPOSITION, attachment(&format!("{name}.zip"))),
    ];
    Ok((headers, Body::from(archive)).into_response())
}

struct UploadPart {
    relative: String,
    bytes: Bytes,
}

pub async fn upload_files(
    State(state): State<AppState>,
    user: CurrentUser,
    mut multipart: Multipart,
) -> AppResult<Json<Value>> {
    let mut folder = String::new();
    let mut extra_tags: BTreeSet<i32> = BTreeSet::new();
    let mut parts: Vec<UploadPart> = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        tracing::debug!(error = %err, "invalid multipart data");
        AppError::invalid_payload()
    })? {
        let field_name = field.name().unwrap_or_default().to_string();
        if let Some(file_name) = field.file_name().map(str::to_owned) {
            let relative = clean_relative_path(&file_name).ok_or_else(AppError::invalid_payload)?;
            let bytes = field.bytes().await.map_err(|_| AppError::invalid_payload())?;
            parts.push(UploadPart { relative, bytes });
            continue;
        }
        let value = field.text().await.map_err(|_| AppError::invalid_payload())?;
        match field_name.as_str() {
            "folder" => folder = value.trim().trim_matches('/').to_string(),
            "tags" | "tags[]" => {
                let id = value.trim().parse().map_err(|_| AppError::invalid_payload())?;
                extra_tags.insert(id);
            }
            _ => {}
        }
    }

    if parts.is_empty() || (!folder.is_empty() && clean_relative_path(&folder).is_none()) {
        return Err(AppError::invalid_payload());
    }

    let tag_ids = {
        let mut conn = state.db()?;
        let owner_tag = queries::ownership_tag(&mut conn, &user.email)?
            .ok_or_else(AppError::unauthorized)?;
        let found: Vec<i32> = tags::table
            .filter(tags::id.eq_any(&extra_tags))
            .select(tags::id)
            .load(&mut conn)?;
        if found.len() != extra_tags.len() {
            return Err(AppError::not_found("Tag does not exist."));
        }
        let mut tag_ids = vec![owner_tag.id];
        tag_ids.extend(extra_tags.into_iter().filter(|id| *id != owner_tag.id));
        tag_ids
    };

    let mut entries: Vec<(String, &'static str)> = Vec::new();
    for part in &parts {
        let target = join_path(&folder, &part.relative);
        state.storage.put(&target, part.bytes.clone()).await?;
        let entry = upload_catalog_entry(&folder, &part.relative);
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }

    let mut conn = state.db()?;
    for (index, kind) in &entries {
        queries::create_file_if_absent(&mut conn, index, kind, &tag_ids)?;
    }

    info!(user = %user.email, objects = parts.len(), "uploaded files");
    Ok(success_with(
        "Files uploaded successfully.",
        json!({ "uploaded": parts.len() }),
    ))
}
