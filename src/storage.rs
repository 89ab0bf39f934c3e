use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tracing::debug;
use url::Url;

const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?><D:propfind xmlns:D="DAV:"><D:prop><D:resourcetype/></D:prop></D:propfind>"#;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object store answered {method} {path} with status {status}")]
    Status {
        method: String,
        path: String,
        status: u16,
    },
    #[error("object store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed multistatus response: {0}")]
    Xml(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

pub type ObjectStream = BoxStream<'static, StorageResult<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Copy,
    Move,
}

impl TransferMode {
    fn method_name(self) -> &'static str {
        match self {
            TransferMode::Copy => "COPY",
            TransferMode::Move => "MOVE",
        }
    }
}

#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    async fn list(&self, path: &str) -> StorageResult<Vec<String>>;

    async fn list_recursive(&self, path: &str) -> StorageResult<Vec<String>>;

    async fn make_dir(&self, path: &str) -> StorageResult<()>;

    async fn get(&self, path: &str) -> StorageResult<ObjectStream>;

    async fn put(&self, path: &str, bytes: Bytes) -> StorageResult<()>;

    async fn delete(&self, path: &str) -> StorageResult<()>;

    async fn copy_or_move(
        &self,
        source: &str,
        destination: &str,
        mode: TransferMode,
    ) -> StorageResult<()>;
}

pub async fn read_all(stream: ObjectStream) -> StorageResult<Vec<u8>> {
    stream
        .try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
}

pub fn normalize_path(path: &str) -> &str {
    path.trim_start_matches('/')
}

pub struct WebDavStorage {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl WebDavStorage {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let mut base = Url::parse(base_url).context("WEBDAV_URL must be a valid URL")?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build WebDAV client")?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn url_for(&self, path: &str) -> String {
        let path = normalize_path(path);
        let encoded = path
            .split('/')
            .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}{}", self.base, encoded)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self.client.request(method, self.url_for(path));
        if let Some(token) = &self.token {
            builder = builder.header(header::AUTHORIZATION, token);
        }
        builder
    }

    async fn propfind(&self, path: &str) -> StorageResult<Vec<DavEntry>> {
        let response = self
            .request(dav_method("PROPFIND"), path)
            .header("Depth", "1")
            .header(header::CONTENT_TYPE, "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        let response = expect_success(response, "PROPFIND", path)?;
        let body = response.text().await?;
        parse_multistatus(&body, self.base.path())
    }
}

#[async_trait]
impl ObjectStorage for WebDavStorage {
    async fn list(&self, path: &str) -> StorageResult<Vec<String>> {
        let entries = self.propfind(path).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| !entry.is_collection)
            .map(|entry| entry.path)
            .collect())
    }

    async fn list_recursive(&self, path: &str) -> StorageResult<Vec<String>> {
        let mut files = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = VecDeque::from([normalize_path(path).to_string()]);

        while let Some(directory) = pending.pop_front() {
            if !visited.insert(directory.trim_end_matches('/').to_string()) {
                continue;
            }
            debug!(%directory, "listing object store collection");
            for entry in self.propfind(&directory).await? {
                if !entry.is_collection {
                    files.push(entry.path);
                } else if entry.path.trim_end_matches('/') != directory.trim_end_matches('/') {
                    pending.push_back(entry.path);
                }
            }
        }

        Ok(files)
    }

    async fn make_dir(&self, path: &str) -> StorageResult<()> {
        let response = self.request(dav_method("MKCOL"), path).send().await?;
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            debug!(%path, "collection already exists");
            return Ok(());
        }
        expect_success(response, "MKCOL", path)?;
        Ok(())
    }

    async fn get(&self, path: &str) -> StorageResult<ObjectStream> {
        let response = self.request(Method::GET, path).send().await?;
        let response = expect_success(response, "GET", path)?;
        Ok(response.bytes_stream().map_err(StorageError::from).boxed())
    }

    async fn put(&self, path: &str, bytes: Bytes) -> StorageResult<()> {
        let content_type = mime_guess::from_path(path).first_or_octet_stream();
        let response = self
            .request(Method::PUT, path)
            .header(header::CONTENT_TYPE, content_type.as_ref())
            .body(bytes)
            .send()
            .await?;
        expect_success(response, "PUT", path)?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let response = self
            .request(Method::DELETE, path)
            .header("Depth", "0")
            .send()
            .await?;
        expect_success(response, "DELETE", path)?;
        Ok(())
    }

    async fn copy_or_move(
        &self,
        source: &str,
        destination: &str,
        mode: TransferMode,
    ) -> StorageResult<()> {
        let method = mode.method_name();
        let response = self
            .request(dav_method(method), source)
            .header("Destination", self.url_for(destination))
            .header("Overwrite", "T")
            .send()
            .await?;
        expect_success(response, method, source)?;
        Ok(())
    }
}

fn dav_method(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes()).expect("valid WebDAV method")
}

fn expect_success(response: Response, method: &str, path: &str) -> StorageResult<Response> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(StorageError::NotFound(path.to_string()));
    }
    if !status.is_success() {
        return Err(StorageError::Status {
            method: method.to_string(),
            path: path.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DavEntry {
    path: String,
    is_collection: bool,
}

fn parse_multistatus(body: &str, base_path: &str) -> StorageResult<Vec<DavEntry>> {
    let mut reader = Reader::from_str(body);
    let mut entries = Vec::new();
    let mut href: Option<String> = None;
    let mut in_href = false;
    let mut is_collection = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => match element.local_name().as_ref() {
                b"response" => {
                    href = None;
                    is_collection = false;
                }
                b"href" => in_href = true,
                b"collection" => is_collection = true,
                _ => {}
            },
            Ok(Event::Empty(element)) => {
                if element.local_name().as_ref() == b"collection" {
                    is_collection = true;
                }
            }
            Ok(Event::Text(text)) if in_href => {
                let value = text
                    .unescape()
                    .map_err(|err| StorageError::Xml(err.to_string()))?;
                href = Some(value.trim().to_string());
            }
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"href" => in_href = false,
                b"response" => {
                    if let Some(raw) = href.take() {
                        entries.push(DavEntry {
                            path: relative_path(&raw, base_path),
                            is_collection,
                        });
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(StorageError::Xml(err.to_string())),
        }
    }

    Ok(entries)
}

fn relative_path(href: &str, base_path: &str) -> String {
    let path = match Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    };
    let decoded = percent_decode_str(&path).decode_utf8_lossy().into_owned();
    let base = base_path.trim_end_matches('/');
    let stripped = decoded.strip_prefix(base).unwrap_or(&decoded);
    stripped.trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{HeaderMap, Uri};
    use axum::Router;

    use super::*;

    type Seen = Arc<Mutex<Vec<String>>>;

    async fn record(
        State(seen): State<Seen>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
    ) -> (StatusCode, String) {
        let destination = headers
            .get("Destination")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-");
        seen.lock()
            .expect("seen lock")
            .push(format!("{method} {} {destination}", uri.path()));
        if method.as_str() == "PROPFIND" {
            let body = LISTING.replace("/dav/projects/imagen/data", "/dav/projects/data");
            (StatusCode::MULTI_STATUS, body)
        } else {
            (StatusCode::CREATED, String::new())
        }
    }

    async fn serve_dav() -> (WebDavStorage, String, Seen) {
        let seen = Seen::default();
        let router = Router::new().fallback(record).with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let base = format!("http://{}/dav", listener.local_addr().expect("local addr"));
        tokio::spawn(async move { axum::serve(listener, router).await });
        let storage = WebDavStorage::new(&base, None, Duration::from_secs(5)).expect("storage");
        (storage, base, seen)
    }

    const LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/projects/imagen/data/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/projects/imagen/data/frame%20001.png</d:href>
    <d:propstat><d:prop><d:resourcetype/></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>http://store.example.org/dav/projects/imagen/data/nested/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection></d:collection></d:resourcetype></d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn parses_files_and_collections_relative_to_base() {
        let entries = parse_multistatus(LISTING, "/dav/").expect("parse listing");
        assert_eq!(
            entries,
            vec![
                DavEntry {
                    path: "projects/imagen/data/".into(),
                    is_collection: true,
                },
                DavEntry {
                    path: "projects/imagen/data/frame 001.png".into(),
                    is_collection: false,
                },
                DavEntry {
                    path: "projects/imagen/data/nested/".into(),
                    is_collection: true,
                },
            ]
        );
    }

    #[test]
    fn rejects_broken_xml() {
        let result = parse_multistatus("<d:multistatus><d:response></d:oops>", "/");
        assert!(matches!(result, Err(StorageError::Xml(_))));
    }

    #[test]
    fn encodes_path_segments_but_keeps_separators() {
        let storage = WebDavStorage::new(
            "http://store.example.org/dav",
            None,
            Duration::from_secs(1),
        )
        .expect("storage");
        assert_eq!(
            storage.url_for("/projects/input data/a+b.txt"),
            "http://store.example.org/dav/projects/input%20data/a%2Bb.txt"
        );
    }

    #[test]
    fn transfer_modes_map_to_dav_methods() {
        assert_eq!(TransferMode::Copy.method_name(), "COPY");
        assert_eq!(TransferMode::Move.method_name(), "MOVE");
    }

    #[tokio::test]
    async fn list_returns_only_files_of_one_collection() {
        let (storage, _, seen) = serve_dav().await;
        let files = storage.list("projects/data").await.expect("list");
        assert_eq!(files, vec!["projects/data/frame 001.png".to_string()]);
        assert_eq!(
            seen.lock().expect("seen lock").as_slice(),
            ["PROPFIND /dav/projects/data -"]
        );
    }

    #[tokio::test]
    async fn move_sends_destination_url() {
        let (storage, base, seen) = serve_dav().await;
        storage
            .copy_or_move("projects/in/a.txt", "projects/out/a.txt", TransferMode::Move)
            .await
            .expect("move");
        assert_eq!(
            seen.lock().expect("seen lock").as_slice(),
            [format!("MOVE /dav/projects/in/a.txt {base}/projects/out/a.txt")]
        );
    }
}
