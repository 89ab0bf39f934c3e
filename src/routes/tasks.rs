use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    auth::CurrentUser,
    error::{AppError, AppResult},
    reconciler::{ParameterValue, TaskSubmission},
    response::{success, success_with},
    state::AppState,
    utils::json::Payload,
};

const MAX_TASK_NAME_LENGTH: usize = 149;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TaskInput {
    One(String),
    Many(Vec<String>),
}

impl TaskInput {
    fn into_paths(self) -> Vec<String> {
        match self {
            TaskInput::One(path) => vec![path],
            TaskInput::Many(paths) => paths,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTaskRequest {
    pub name: String,
    pub image: String,
    pub input: TaskInput,
    pub parameters: Vec<ParameterValue>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskTagsRequest {
    pub tags: Vec<String>,
}

impl CreateTaskRequest {
    fn into_submission(self) -> AppResult<TaskSubmission> {
        let name_length = self.name.trim().chars().count();
        if name_length == 0 || name_length > MAX_TASK_NAME_LENGTH || self.image.is_empty() {
            return Err(AppError::invalid_payload());
        }
        let inputs: Vec<String> = self
            .input
            .into_paths()
            .into_iter()
            .filter(|path| !path.trim().is_empty())
            .collect();
        if inputs.is_empty() {
            return Err(AppError::invalid_payload());
        }
        Ok(TaskSubmission {
            name: self.name.trim().to_string(),
            image: self.image,
            inputs,
            parameters: self.parameters,
            tags: self.tags,
        })
    }
}

pub async fn list_tasks(
    State(state): State<AppState>,
    user: CurrentUser,
) -> AppResult<Json<Value>> {
    let tasks = state.tasks.list_tasks(&user).await?;
    Ok(success_with("Tasks fetched.", json!({ "tasks": tasks })))
}

pub async fn create_task(
    State(state): State<AppState>,
    user: CurrentUser,
    Payload(request): Payload<CreateTaskRequest>,
) -> AppResult<Json<Value>> {
    let submission = request.into_submission()?;
    state.tasks.create_task(&user, submission).await?;
    Ok(success("Task created successfully."))
}

pub async fn get_task(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(token_id): Path<String>,
) -> AppResult<Json<Value>> {
    let task = state.tasks.get_task(&user, &token_id).await?;
    Ok(success_with("Task fetched.", json!({ "task": task })))
}

pub async fn update_task_tags(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(token_id): Path<String>,
    Payload(request): Payload<TaskTagsRequest>,
) -> AppResult<Json<Value>> {
    state.tasks.update_task_tags(&user, &token_id, &request.tags)?;
    Ok(success("Token tags updated."))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> AppResult<Json<Value>> {
    state.tasks.delete_task(&token_id).await?;
    Ok(success("Task has been deleted."))
}
