use std::sync::Arc;

use crate::{
    auth::{pages::PageTable, policy::AccessPolicy},
    config::AppConfig,
    db::{PgPool, PgPooledConnection},
    error::{AppError, AppResult},
    executions::ExecutionStore,
    reconciler::{TaskLayout, TaskReconciler},
    storage::ObjectStorage,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub policy: Arc<AccessPolicy>,
    pub pages: Arc<PageTable>,
    pub tasks: Arc<TaskReconciler>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        executions: Arc<dyn ExecutionStore>,
    ) -> Self {
        let layout = TaskLayout::new(&config.task_storage_root, &config.task_remote_name);
        let tasks = TaskReconciler::new(pool.clone(), storage.clone(), executions, layout);
        Self {
            pool,
            config: Arc::new(config),
            storage,
            policy: Arc::new(AccessPolicy::standard()),
            pages: Arc::new(PageTable::standard()),
            tasks: Arc::new(tasks),
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
