use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

pub const DOCUMENT_KIND: &str = "token";

#[derive(Debug, Error)]
pub enum ExecutionStoreError {
    #[error("execution document {token_id} is malformed: {reason}")]
    Malformed { token_id: String, reason: String },
    #[error("execution document {0} was modified concurrently")]
    Conflict(String),
    #[error("execution store answered {operation} with status {status}")]
    Status {
        operation: &'static str,
        status: u16,
    },
    #[error("execution store request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

pub type ExecutionResult<T> = Result<T, ExecutionStoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub token_id: String,
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDocument {
    #[serde(rename = "_id")]
    pub token_id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub lock: i64,
    pub done: i64,
    #[serde(with = "exit_code_format")]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub scrub_count: i64,
    #[serde(rename = "Input")]
    pub input: String,
    #[serde(rename = "Output")]
    pub output: String,
    pub container_path: String,
    #[serde(rename = "Parameters", default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub start_time: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub end_time: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub time_taken: String,
}

impl ExecutionDocument {
    pub fn submission(
        reservation: &Reservation,
        input: String,
        output: String,
        container_path: String,
        parameters: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            token_id: reservation.token_id.clone(),
            revision: Some(reservation.revision.clone()),
            kind: DOCUMENT_KIND.to_string(),
            lock: 0,
            done: 0,
            exit_code: None,
            scrub_count: 0,
            input,
            output,
            container_path,
            parameters,
            start_time: String::new(),
            end_time: String::new(),
            time_taken: String::new(),
        }
    }

    pub fn from_value(token_id: &str, value: Value) -> ExecutionResult<Self> {
        serde_json::from_value(value).map_err(|err| ExecutionStoreError::Malformed {
            token_id: token_id.to_string(),
            reason: err.to_string(),
        })
    }
}

mod exit_code_format {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(code) => serializer.serialize_i64(*code),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(None),
            Value::Number(number) => number
                .as_i64()
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom("exit_code must be an integer")),
            Value::String(text) if text.is_empty() => Ok(None),
            other => Err(serde::de::Error::custom(format!(
                "unexpected exit_code {other}"
            ))),
        }
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    async fn reserve(&self) -> ExecutionResult<Reservation>;

    async fn get(&self, token_id: &str) -> ExecutionResult<Option<ExecutionDocument>>;

    async fn put(&self, document: &ExecutionDocument) -> ExecutionResult<String>;

    async fn delete(&self, token_id: &str) -> ExecutionResult<bool>;
}

pub struct CouchExecutionStore {
    client: Client,
    database_url: String,
    credentials: Option<(String, String)>,
}

#[derive(Deserialize)]
struct WriteReceipt {
    id: String,
    rev: String,
}

#[derive(Deserialize)]
struct RevisionOnly {
    #[serde(rename = "_rev")]
    rev: String,
}

impl CouchExecutionStore {
    pub fn new(
        server_url: &str,
        database: &str,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build CouchDB client")?;
        let database_url = format!(
            "{}/{}",
            server_url.trim_end_matches('/'),
            utf8_percent_encode(database, NON_ALPHANUMERIC)
        );
        let credentials = user.map(|user| (user, password.unwrap_or_default()));
        Ok(Self {
            client,
            database_url,
            credentials,
        })
    }

    pub async fn ensure_database(&self) -> ExecutionResult<()> {
        let response = self.authorized(self.client.put(&self.database_url)).send().await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => {
                info!(database = %self.database_url, "created execution database");
                Ok(())
            }
            StatusCode::PRECONDITION_FAILED => Ok(()),
            status => Err(ExecutionStoreError::Status {
                operation: "create database",
                status: status.as_u16(),
            }),
        }
    }

    fn document_url(&self, token_id: &str) -> String {
        format!(
            "{}/{}",
            self.database_url,
            utf8_percent_encode(token_id, NON_ALPHANUMERIC)
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }

    async fn fetch_raw(&self, token_id: &str) -> ExecutionResult<Option<Value>> {
        let response = self
            .authorized(self.client.get(self.document_url(token_id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_success(response, "get")?;
        Ok(Some(response.json::<Value>().await?))
    }
}

#[async_trait]
impl ExecutionStore for CouchExecutionStore {
    async fn reserve(&self) -> ExecutionResult<Reservation> {
        let response = self
            .authorized(self.client.post(&self.database_url))
            .json(&json!({}))
            .send()
            .await?;
        let receipt: WriteReceipt = expect_success(response, "reserve")?.json().await?;
        debug!(task = %receipt.id, "reserved execution document");
        Ok(Reservation {
            token_id: receipt.id,
            revision: receipt.rev,
        })
    }

    async fn get(&self, token_id: &str) -> ExecutionResult<Option<ExecutionDocument>> {
        match self.fetch_raw(token_id).await? {
            Some(value) => ExecutionDocument::from_value(token_id, value).map(Some),
            None => Ok(None),
        }
    }

    async fn put(&self, document: &ExecutionDocument) -> ExecutionResult<String> {
        let response = self
            .authorized(self.client.put(self.document_url(&document.token_id)))
            .json(document)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(ExecutionStoreError::Conflict(document.token_id.clone()));
        }
        let receipt: WriteReceipt = expect_success(response, "put")?.json().await?;
        Ok(receipt.rev)
    }

    async fn delete(&self, token_id: &str) -> ExecutionResult<bool> {
        let Some(raw) = self.fetch_raw(token_id).await? else {
            return Ok(false);
        };
        let RevisionOnly { rev } = serde_json::from_value(raw).map_err(|err| {
            ExecutionStoreError::Malformed {
                token_id: token_id.to_string(),
                reason: err.to_string(),
            }
        })?;
        let response = self
            .authorized(self.client.delete(self.document_url(token_id)))
            .query(&[("rev", rev.as_str())])
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::CONFLICT => Err(ExecutionStoreError::Conflict(token_id.to_string())),
            _ => {
                expect_success(response, "delete")?;
                Ok(true)
            }
        }
    }
}

fn expect_success(response: Response, operation: &'static str) -> ExecutionResult<Response> {
    let status = response.status();
    if !status.is_success() {
        return Err(ExecutionStoreError::Status {
            operation,
            status: status.as_u16(),
        });
    }
    Ok(response)
}
