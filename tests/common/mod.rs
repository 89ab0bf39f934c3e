use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::MigrationHarness;
use futures_util::stream;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use trainmate::auth::{password, roles::reseed_roles, session::SESSION_COOKIE_NAME};
use trainmate::config::AppConfig;
use trainmate::db::{self, PgPool, MIGRATIONS};
use trainmate::executions::{
    ExecutionDocument, ExecutionResult, ExecutionStore, ExecutionStoreError, Reservation,
};
use trainmate::models::{NewImage, NewImageRole, NewTag, NewUser, NewUserRole, TAG_KIND_USER};
use trainmate::routes;
use trainmate::schema::{images, images_roles, roles, tags, users, users_roles};
use trainmate::state::AppState;
use trainmate::storage::{ObjectStorage, ObjectStream, StorageError, StorageResult, TransferMode};
use uuid::Uuid;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

fn trim(path: &str) -> &str {
    path.trim_matches('/')
}

fn under(prefix: &str, key: &str) -> bool {
    prefix.is_empty() || key.starts_with(&format!("{prefix}/"))
}

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<BTreeMap<String, Bytes>>,
    dirs: Mutex<BTreeSet<String>>,
    failing_sources: Mutex<BTreeSet<String>>,
}

impl FakeStorage {
    async fn exists_dir(&self, path: &str) -> bool {
        let dirs = self.dirs.lock().await;
        let objects = self.objects.lock().await;
        dirs.iter().any(|dir| dir == path || under(path, dir))
            || objects.keys().any(|key| under(path, key))
    }

    #[allow(dead_code)]
    pub async fn seed(&self, path: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .await
            .insert(trim(path).to_string(), Bytes::copy_from_slice(bytes));
    }

    #[allow(dead_code)]
    pub async fn fail_transfers_from(&self, path: &str) {
        self.failing_sources.lock().await.insert(trim(path).to_string());
    }

    #[allow(dead_code)]
    pub async fn object(&self, path: &str) -> Option<Bytes> {
        self.objects.lock().await.get(trim(path)).cloned()
    }

    #[allow(dead_code)]
    pub async fn keys_under(&self, path: &str) -> Vec<String> {
        let prefix = trim(path);
        self.objects
            .lock()
            .await
            .keys()
            .filter(|key| under(prefix, key))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn list(&self, path: &str) -> StorageResult<Vec<String>> {
        let prefix = trim(path);
        if !self.exists_dir(prefix).await {
            return Err(StorageError::NotFound(prefix.to_string()));
        }
        let objects = self.objects.lock().await;
        Ok(objects
            .keys()
            .filter(|key| under(prefix, key))
            .filter(|key| !key[prefix.len()..].trim_start_matches('/').contains('/'))
            .cloned()
            .collect())
    }

    async fn list_recursive(&self, path: &str) -> StorageResult<Vec<String>> {
        let prefix = trim(path);
        if self.object(prefix).await.is_some() {
            return Ok(vec![prefix.to_string()]);
        }
        if !self.exists_dir(prefix).await {
            return Err(StorageError::NotFound(prefix.to_string()));
        }
        Ok(self.keys_under(prefix).await)
    }

    async fn make_dir(&self, path: &str) -> StorageResult<()> {
        self.dirs.lock().await.insert(trim(path).to_string());
        Ok(())
    }

    async fn get(&self, path: &str) -> StorageResult<ObjectStream> {
        let bytes = self
            .object(path)
            .await
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        Ok(Box::pin(stream::once(async move { Ok(bytes) })))
    }

    async fn put(&self, path: &str, bytes: Bytes) -> StorageResult<()> {
        self.objects.lock().await.insert(trim(path).to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let key = trim(path);
        let removed_object = self.objects.lock().await.remove(key).is_some();
        let removed_dir = self.dirs.lock().await.remove(key);
        if removed_object || removed_dir {
            Ok(())
        } else {
            Err(StorageError::NotFound(key.to_string()))
        }
    }

    async fn copy_or_move(
        &self,
        source: &str,
        destination: &str,
        mode: TransferMode,
    ) -> StorageResult<()> {
        if self.failing_sources.lock().await.contains(trim(source)) {
            return Err(StorageError::Status {
                method: "COPY".to_string(),
                path: source.to_string(),
                status: 502,
            });
        }
        let mut objects = self.objects.lock().await;
        let bytes = match mode {
            TransferMode::Copy => objects.get(trim(source)).cloned(),
            TransferMode::Move => objects.remove(trim(source)),
        }
        .ok_or_else(|| StorageError::NotFound(source.to_string()))?;
        objects.insert(trim(destination).to_string(), bytes);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeExecutionStore {
    documents: Mutex<HashMap<String, Value>>,
}

impl FakeExecutionStore {
    #[allow(dead_code)]
    pub async fn insert_raw(&self, token_id: &str, document: Value) {
        self.documents
            .lock()
            .await
            .insert(token_id.to_string(), document);
    }

    #[allow(dead_code)]
    pub async fn raw(&self, token_id: &str) -> Option<Value> {
        self.documents.lock().await.get(token_id).cloned()
    }

    #[allow(dead_code)]
    pub async fn set_progress(&self, token_id: &str, lock: i64, done: i64, exit_code: Value) {
        let mut documents = self.documents.lock().await;
        if let Some(Value::Object(fields)) = documents.get_mut(token_id) {
            fields.insert("lock".into(), json!(lock));
            fields.insert("done".into(), json!(done));
            fields.insert("exit_code".into(), exit_code);
        }
    }

    #[allow(dead_code)]
    pub async fn remove(&self, token_id: &str) {
        self.documents.lock().await.remove(token_id);
    }

    #[allow(dead_code)]
    pub async fn count(&self) -> usize {
        self.documents.lock().await.len()
    }
}

#[async_trait]
impl ExecutionStore for FakeExecutionStore {
    async fn reserve(&self) -> ExecutionResult<Reservation> {
        let token_id = Uuid::new_v4().simple().to_string();
        let revision = "1-reserved".to_string();
        self.documents.lock().await.insert(
            token_id.clone(),
            json!({ "_id": token_id, "_rev": revision }),
        );
        Ok(Reservation { token_id, revision })
    }

    async fn get(&self, token_id: &str) -> ExecutionResult<Option<ExecutionDocument>> {
        match self.raw(token_id).await {
            Some(value) => ExecutionDocument::from_value(token_id, value).map(Some),
            None => Ok(None),
        }
    }

    async fn put(&self, document: &ExecutionDocument) -> ExecutionResult<String> {
        let mut documents = self.documents.lock().await;
        let current = documents
            .get(&document.token_id)
            .and_then(|stored| stored.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        if current.is_some() && current != document.revision {
            return Err(ExecutionStoreError::Conflict(document.token_id.clone()));
        }
        let revision = format!("{}-written", documents.len() + 1);
        let mut value = serde_json::to_value(document).map_err(|err| {
            ExecutionStoreError::Malformed {
                token_id: document.token_id.clone(),
                reason: err.to_string(),
            }
        })?;
        value["_rev"] = json!(revision);
        documents.insert(document.token_id.clone(), value);
        Ok(revision)
    }

    async fn delete(&self, token_id: &str) -> ExecutionResult<bool> {
        Ok(self.documents.lock().await.remove(token_id).is_some())
    }
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    storage: Arc<FakeStorage>,
    executions: Arc<FakeExecutionStore>,
}

pub fn test_config(database_url: String) -> AppConfig {
    AppConfig {
        database_url,
        database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        session_cookie_secure: false,
        cors_allowed_origin: None,
        webdav_url: "http://dav.invalid".to_string(),
        webdav_token: None,
        couchdb_url: "http://couch.invalid".to_string(),
        couchdb_name: "tokens".to_string(),
        couchdb_user: None,
        couchdb_password: None,
        remote_timeout_seconds: 1,
        task_storage_root: "projects/imagen".to_string(),
        task_remote_name: "dCache".to_string(),
    }
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;
        let config = test_config(database_url);

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let executions = Arc::new(FakeExecutionStore::default());
        let storage_for_state: Arc<dyn ObjectStorage> = storage.clone();
        let executions_for_state: Arc<dyn ExecutionStore> = executions.clone();
        let state = AppState::new(pool, config, storage_for_state, executions_for_state);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            storage,
            executions,
        })
    }

    #[allow(dead_code)]
    pub fn storage(&self) -> Arc<FakeStorage> {
        self.storage.clone()
    }

    #[allow(dead_code)]
    pub fn executions(&self) -> Arc<FakeExecutionStore> {
        self.executions.clone()
    }

    pub async fn insert_user(&self, email: &str, password: &str, role_names: &[&str]) -> Result<i32> {
        let email = email.to_string();
        let password_hash = password::hash_password(password)?;
        let role_names: Vec<String> = role_names.iter().map(|name| name.to_string()).collect();
        self.with_conn(move |conn| {
            let user_id: i32 = diesel::insert_into(users::table)
                .values(&NewUser {
                    email: email.clone(),
                    password_hash,
                })
                .returning(users::id)
                .get_result(conn)
                .context("failed to insert user")?;
            diesel::insert_into(tags::table)
                .values(&NewTag {
                    name: &email,
                    kind: TAG_KIND_USER,
                })
                .execute(conn)
                .context("failed to insert ownership tag")?;
            let role_ids: Vec<i32> = roles::table
                .filter(roles::name.eq_any(&role_names))
                .select(roles::id)
                .load(conn)?;
            ensure!(role_ids.len() == role_names.len(), "unknown role in {role_names:?}");
            let assignments: Vec<NewUserRole> = role_ids
                .into_iter()
                .map(|role_id| NewUserRole { user_id, role_id })
                .collect();
            if !assignments.is_empty() {
                diesel::insert_into(users_roles::table)
                    .values(&assignments)
                    .execute(conn)?;
            }
            Ok(user_id)
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_image(
        &self,
        name: &str,
        container_path: &str,
        parameters: &[&str],
        role_names: &[&str],
    ) -> Result<i32> {
        let name = name.to_string();
        let container_path = container_path.to_string();
        let parameters = json!(parameters);
        let role_names: Vec<String> = role_names.iter().map(|name| name.to_string()).collect();
        self.with_conn(move |conn| {
            let image_id: i32 = diesel::insert_into(images::table)
                .values(&NewImage {
                    name: &name,
                    container_path: &container_path,
                    parameters,
                })
                .returning(images::id)
                .get_result(conn)
                .context("failed to insert image")?;
            let role_ids: Vec<i32> = roles::table
                .filter(roles::name.eq_any(&role_names))
                .select(roles::id)
                .load(conn)?;
            let links: Vec<NewImageRole> = role_ids
                .into_iter()
                .map(|role_id| NewImageRole { image_id, role_id })
                .collect();
            if !links.is_empty() {
                diesel::insert_into(images_roles::table)
                    .values(&links)
                    .execute(conn)?;
            }
            Ok(image_id)
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_custom_tag(&self, name: &str) -> Result<i32> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let id = diesel::insert_into(tags::table)
                .values(&NewTag {
                    name: &name,
                    kind: trainmate::models::TAG_KIND_CUSTOM,
                })
                .returning(tags::id)
                .get_result(conn)
                .context("failed to insert tag")?;
            Ok(id)
        })
        .await
    }

    pub async fn login_cookie(&self, email: &str, password: &str) -> Result<String> {
        let response = self
            .post_json(
                "/api/auth/login",
                &json!({ "email": email, "password": password }),
                None,
            )
            .await?;
        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| anyhow!("login response did not set a cookie"))?;
        let pair = set_cookie
            .split(';')
            .next()
            .filter(|pair| pair.starts_with(&format!("{SESSION_COOKIE_NAME}=")))
            .ok_or_else(|| anyhow!("unexpected cookie {set_cookie}"))?;
        Ok(pair.to_string())
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        cookie: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(body)?))?,
            None => builder.body(Body::empty())?,
        };
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        cookie: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_value(payload)?;
        self.send(Method::POST, path, Some(&body), cookie).await
    }

    #[allow(dead_code)]
    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        cookie: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_value(payload)?;
        self.send(Method::PATCH, path, Some(&body), cookie).await
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str, cookie: Option<&str>) -> Result<hyper::Response<Body>> {
        self.send(Method::GET, path, None, cookie).await
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, cookie: Option<&str>) -> Result<hyper::Response<Body>> {
        self.send(Method::DELETE, path, None, cookie).await
    }

    #[allow(dead_code)]
    pub async fn upload_files(
        &self,
        folder: Option<&str>,
        files: &[(&str, &str)],
        tag_ids: &[i32],
        cookie: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        if let Some(folder) = folder {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(b"Content-Disposition: form-data; name=\"folder\"\r\n\r\n");
            body.extend(folder.as_bytes());
            body.extend(b"\r\n");
        }
        for tag_id in tag_ids {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(b"Content-Disposition: form-data; name=\"tags[]\"\r\n\r\n");
            body.extend(tag_id.to_string().as_bytes());
            body.extend(b"\r\n");
        }
        for (path, data) in files {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(
                format!(
                    "Content-Disposition: form-data; name=\"files\"; filename=\"{path}\"\r\n"
                )
                .as_bytes(),
            );
            body.extend(b"Content-Type: application/octet-stream\r\n\r\n");
            body.extend(data.as_bytes());
            body.extend(b"\r\n");
        }
        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/files/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header(header::COOKIE, cookie)
            .body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn body_json(response: hyper::Response<Body>) -> Result<Value> {
    let bytes = body_to_vec(response.into_body()).await?;
    serde_json::from_slice(&bytes).context("response body is not JSON")
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        reseed_roles(&mut conn).context("failed to reseed roles")?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE files_tags, files, tasks_tags, tasks, images_roles, images, \
         sessions, users_roles, users, roles, tags RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
