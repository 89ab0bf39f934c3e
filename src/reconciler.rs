use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::auth::CurrentUser;
use crate::db::{PgPool, PgPooledConnection};
use crate::error::AppError;
use crate::executions::{ExecutionDocument, ExecutionStore, ExecutionStoreError};
use crate::models::{Tag, Task, FILE_KIND_DIRECTORY};
use crate::queries;
use crate::storage::{normalize_path, ObjectStorage, StorageError, TransferMode};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task does not exist.")]
    TaskNotFound,
    #[error("Image does not exist.")]
    ImageNotFound,
    #[error("User does not have access to this image.")]
    ImageForbidden,
    #[error("Unauthorized request!")]
    Forbidden,
    #[error("Parameters are not valid.")]
    InvalidParameters,
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Executions(#[from] ExecutionStoreError),
}

pub type TaskResult<T> = Result<T, TaskError>;

impl From<TaskError> for AppError {
    fn from(value: TaskError) -> Self {
        match value {
            TaskError::TaskNotFound | TaskError::ImageNotFound => {
                AppError::not_found(value.to_string())
            }
            TaskError::ImageForbidden => {
                AppError::new(axum::http::StatusCode::UNAUTHORIZED, value.to_string())
            }
            TaskError::Forbidden => AppError::unauthorized(),
            TaskError::InvalidParameters => AppError::not_acceptable(value.to_string()),
            TaskError::Database(err) => err.into(),
            TaskError::Storage(err) => err.into(),
            other => AppError::internal(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Locked,
    Done,
    Error,
}

pub fn derive_status(lock: i64, done: i64, exit_code: Option<i64>) -> TaskStatus {
    match (lock, done, exit_code) {
        (0, 0, _) => TaskStatus::Todo,
        (l, 0, _) if l > 0 => TaskStatus::Locked,
        (l, d, Some(0)) if l > 0 && d > 0 => TaskStatus::Done,
        _ => TaskStatus::Error,
    }
}

impl From<&ExecutionDocument> for TaskStatus {
    fn from(document: &ExecutionDocument) -> Self {
        derive_status(document.lock, document.done, document.exit_code)
    }
}

#[derive(Debug, Clone)]
pub struct TaskLayout {
    root: String,
    remote: String,
}

impl TaskLayout {
    pub fn new(root: &str, remote: &str) -> Self {
        Self {
            root: root.trim_matches('/').to_string(),
            remote: remote.to_string(),
        }
    }

    pub fn input_dir(&self, token_id: &str) -> String {
        format!("{}/input_data_{token_id}/", self.root)
    }

    pub fn output_dir(&self, token_id: &str) -> String {
        format!("{}/output_data_{token_id}/", self.root)
    }

    pub fn remote_location(&self, dir: &str) -> String {
        format!("{}:/{}", self.remote, normalize_path(dir))
    }
}

pub fn strip_remote(location: &str) -> &str {
    let path = match location.split_once(":/") {
        Some((_, rest)) => rest,
        None => location,
    };
    normalize_path(path)
}

pub fn staged_destination(input_dir: &str, source: &str) -> String {
    let trimmed = source.trim_end_matches('/');
    let basename = trimmed.rsplit('/').next().unwrap_or(trimmed);
    format!("{input_dir}{basename}")
}

pub fn catalog_index(path: &str) -> String {
    format!("/{}", normalize_path(path))
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TagView {
    pub id: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<&Tag> for TagView {
    fn from(tag: &Tag) -> Self {
        Self {
            id: tag.id,
            name: tag.name.clone(),
            kind: tag.kind.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: i32,
    pub token_id: String,
    pub name: String,
    pub tags: Vec<TagView>,
    pub status: TaskStatus,
    pub status_code: Value,
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ParameterValue {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub summary: TaskSummary,
    pub start_time: String,
    pub time_taken: String,
    pub parameters: Vec<ParameterValue>,
    pub output_data: String,
}

#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub name: String,
    pub image: String,
    pub inputs: Vec<String>,
    pub parameters: Vec<ParameterValue>,
    pub tags: Vec<String>,
}

fn exit_code_value(exit_code: Option<i64>) -> Value {
    match exit_code {
        Some(code) => Value::from(code),
        None => Value::String(String::new()),
    }
}

pub fn declared_parameters(
    declared: &[String],
    values: &BTreeMap<String, Value>,
) -> Vec<ParameterValue> {
    declared
        .iter()
        .map(|name| ParameterValue {
            name: name.clone(),
            value: values.get(name).cloned().unwrap_or(Value::Null),
        })
        .collect()
}

pub struct TaskReconciler {
    pool: PgPool,
    storage: Arc<dyn ObjectStorage>,
    executions: Arc<dyn ExecutionStore>,
    layout: TaskLayout,
}

impl TaskReconciler {
    pub fn new(
        pool: PgPool,
        storage: Arc<dyn ObjectStorage>,
        executions: Arc<dyn ExecutionStore>,
        layout: TaskLayout,
    ) -> Self {
        Self {
            pool,
            storage,
            executions,
            layout,
        }
    }

    fn conn(&self) -> TaskResult<PgPooledConnection> {
        Ok(self.pool.get()?)
    }

    pub async fn list_tasks(&self, caller: &CurrentUser) -> TaskResult<Vec<TaskSummary>> {
        let (tasks, mut tags) = {
            let mut conn = self.conn()?;
            let tasks = queries::tasks_owned_by(&mut conn, &caller.email)?;
            let ids: Vec<i32> = tasks.iter().map(|task| task.id).collect();
            let tags = queries::tags_for_tasks(&mut conn, &ids)?;
            (tasks, tags)
        };

        let mut summaries = Vec::with_capacity(tasks.len());
        for task in tasks {
            let document = match self.executions.get(&task.token_id).await {
                Ok(Some(document)) => document,
                Ok(None) => {
                    self.repair_orphan(&task).await?;
                    continue;
                }
                Err(ExecutionStoreError::Malformed { token_id, reason }) => {
                    warn!(task = %token_id, %reason, "skipping task with malformed execution document");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let image = {
                let mut conn = self.conn()?;
                queries::find_image_by_container_path(&mut conn, &document.container_path)?
            };
            let Some(image) = image else {
                continue;
            };

            let task_tags = tags.remove(&task.id).unwrap_or_default();
            let status = TaskStatus::from(&document);
            if status == TaskStatus::Done {
                self.settle_finished(&task, &task_tags, &document).await?;
            }

            summaries.push(TaskSummary {
                id: task.id,
                token_id: task.token_id,
                name: task.name,
                tags: task_tags.iter().map(TagView::from).collect(),
                status,
                status_code: exit_code_value(document.exit_code),
                image: image.name,
            });
        }

        Ok(summaries)
    }

    pub async fn get_task(&self, caller: &CurrentUser, token_id: &str) -> TaskResult<TaskDetail> {
        let (task, task_tags) = {
            let mut conn = self.conn()?;
            let task = queries::find_task(&mut conn, token_id)?.ok_or(TaskError::TaskNotFound)?;
            if !queries::task_has_tag_named(&mut conn, task.id, &caller.email)? {
                return Err(TaskError::Forbidden);
            }
            let task_tags = queries::tags_for_tasks(&mut conn, &[task.id])?
                .remove(&task.id)
                .unwrap_or_default();
            (task, task_tags)
        };

        let Some(document) = self.executions.get(&task.token_id).await? else {
            self.repair_orphan(&task).await?;
            return Err(TaskError::TaskNotFound);
        };

        let image = {
            let mut conn = self.conn()?;
            queries::find_image_by_container_path(&mut conn, &document.container_path)?
        }
        .ok_or(TaskError::ImageNotFound)?;

        let parameters = declared_parameters(&image.parameter_names(), &document.parameters);
        Ok(TaskDetail {
            summary: TaskSummary {
                id: task.id,
                token_id: task.token_id,
                name: task.name,
                tags: task_tags.iter().map(TagView::from).collect(),
                status: TaskStatus::from(&document),
                status_code: exit_code_value(document.exit_code),
                image: image.name,
            },
            start_time: document.start_time,
            time_taken: document.time_taken,
            parameters,
            output_data: document.output,
        })
    }

    pub async fn create_task(
        &self,
        caller: &CurrentUser,
        submission: TaskSubmission,
    ) -> TaskResult<String> {
        let (image, owner_tag, extra_tags) = {
            let mut conn = self.conn()?;
            let image = queries::find_image_by_name(&mut conn, &submission.image)?
                .ok_or(TaskError::ImageNotFound)?;
            if !queries::image_shared_with(&mut conn, image.id, &caller.roles)? {
                return Err(TaskError::ImageForbidden);
            }
            let supplied: Vec<String> = submission
                .parameters
                .iter()
                .map(|parameter| parameter.name.clone())
                .collect();
            if supplied != image.parameter_names() {
                return Err(TaskError::InvalidParameters);
            }
            let owner_tag =
                queries::ownership_tag(&mut conn, &caller.email)?.ok_or(TaskError::Forbidden)?;
            let extra_tags = queries::tags_named(&mut conn, &submission.tags)?;
            (image, owner_tag, extra_tags)
        };

        // Failures past this point leave the reserved document and any copied
        // inputs behind; nothing is rolled back.
        let reservation = self.executions.reserve().await?;
        let token_id = reservation.token_id.clone();
        let input_dir = self.layout.input_dir(&token_id);
        let output_dir = self.layout.output_dir(&token_id);

        self.storage.make_dir(&input_dir).await?;
        for input in &submission.inputs {
            let sources = self.storage.list_recursive(normalize_path(input)).await?;
            for source in sources {
                let destination = staged_destination(&input_dir, &source);
                self.storage
                    .copy_or_move(&source, &destination, TransferMode::Copy)
                    .await?;
            }
        }

        let parameters = submission
            .parameters
            .into_iter()
            .map(|parameter| (parameter.name, parameter.value))
            .collect();
        let document = ExecutionDocument::submission(
            &reservation,
            self.layout.remote_location(&input_dir),
            self.layout.remote_location(&output_dir),
            image.container_path.clone(),
            parameters,
        );
        self.executions.put(&document).await?;

        let mut tag_ids = vec![owner_tag.id];
        tag_ids.extend(
            extra_tags
                .iter()
                .map(|tag| tag.id)
                .filter(|id| *id != owner_tag.id),
        );
        {
            let mut conn = self.conn()?;
            queries::insert_task(&mut conn, &token_id, &submission.name, &tag_ids)?;
        }

        info!(task = %token_id, user = %caller.email, image = %image.name, "created task");
        Ok(token_id)
    }

    pub async fn delete_task(&self, token_id: &str) -> TaskResult<()> {
        {
            let mut conn = self.conn()?;
            queries::find_task(&mut conn, token_id)?.ok_or(TaskError::TaskNotFound)?;
        }
        let removed = self.executions.delete(token_id).await?;
        let mut conn = self.conn()?;
        queries::delete_task_row(&mut conn, token_id)?;
        info!(task = %token_id, document_removed = removed, "deleted task");
        Ok(())
    }

    pub fn update_task_tags(
        &self,
        caller: &CurrentUser,
        token_id: &str,
        names: &[String],
    ) -> TaskResult<()> {
        let mut conn = self.conn()?;
        let task = queries::find_task(&mut conn, token_id)?.ok_or(TaskError::TaskNotFound)?;
        let owner_tag =
            queries::ownership_tag(&mut conn, &caller.email)?.ok_or(TaskError::Forbidden)?;
        let mut tag_ids: Vec<i32> = queries::tags_named(&mut conn, names)?
            .iter()
            .map(|tag| tag.id)
            .collect();
        if !tag_ids.contains(&owner_tag.id) {
            tag_ids.push(owner_tag.id);
        }
        queries::replace_task_tags(&mut conn, task.id, &tag_ids)?;
        Ok(())
    }

    pub async fn stored_parameters(
        &self,
        caller: &CurrentUser,
        image_name: &str,
    ) -> TaskResult<Vec<BTreeMap<String, BTreeMap<String, Value>>>> {
        let (image, tasks) = {
            let mut conn = self.conn()?;
            let image = queries::find_image_by_name(&mut conn, image_name)?
                .ok_or(TaskError::ImageNotFound)?;
            if !queries::image_shared_with(&mut conn, image.id, &caller.roles)? {
                return Err(TaskError::ImageForbidden);
            }
            let tasks = queries::tasks_owned_by(&mut conn, &caller.email)?;
            (image, tasks)
        };

        let mut stored = Vec::new();
        for task in tasks {
            let document = match self.executions.get(&task.token_id).await {
                Ok(Some(document)) => document,
                Ok(None) | Err(ExecutionStoreError::Malformed { .. }) => continue,
                Err(err) => return Err(err.into()),
            };
            if document.container_path == image.container_path {
                stored.push(BTreeMap::from([(task.name, document.parameters)]));
            }
        }
        Ok(stored)
    }

    pub async fn prune_orphans(&self) -> TaskResult<usize> {
        let tasks = {
            let mut conn = self.conn()?;
            queries::all_tasks(&mut conn)?
        };
        let mut pruned = 0;
        for task in tasks {
            match self.executions.get(&task.token_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    self.repair_orphan(&task).await?;
                    pruned += 1;
                }
                Err(ExecutionStoreError::Malformed { token_id, reason }) => {
                    warn!(task = %token_id, %reason, "leaving task with malformed execution document");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(pruned)
    }

    async fn repair_orphan(&self, task: &Task) -> TaskResult<()> {
        // The document may have reappeared between the read and this call.
        self.executions.delete(&task.token_id).await?;
        let mut conn = self.conn()?;
        let removed = queries::delete_task_row(&mut conn, &task.token_id)?;
        if removed > 0 {
            info!(task = %task.token_id, "removed task without execution document");
        }
        Ok(())
    }

    async fn settle_finished(
        &self,
        task: &Task,
        task_tags: &[Tag],
        document: &ExecutionDocument,
    ) -> TaskResult<()> {
        let output_index = catalog_index(strip_remote(&document.output));
        let tag_ids: Vec<i32> = task_tags.iter().map(|tag| tag.id).collect();
        let created = {
            let mut conn = self.conn()?;
            queries::create_file_if_absent(&mut conn, &output_index, FILE_KIND_DIRECTORY, &tag_ids)?
        };
        if created {
            info!(task = %task.token_id, index = %output_index, "catalogued task output");
        }
        self.clear_folder(strip_remote(&document.input)).await
    }

    async fn clear_folder(&self, folder: &str) -> TaskResult<()> {
        let paths = match self.storage.list_recursive(folder).await {
            Ok(paths) => paths,
            Err(StorageError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for path in paths {
            match self.storage.delete(&path).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
