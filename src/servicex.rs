use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::delivery::{DeliveryClient, RemoteFile, RemoteLocation, Submission};
use crate::domain::{DatasetSpec, DeliveryMode};
use crate::error::BinderError;
use crate::store::{self, write_bytes_atomic};

const QUERY_CACHE_FILE: &str = "query_cache.json";
pub const DEFAULT_TRANSFORM_DEADLINE: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct TransformRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    did: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_list: Option<&'a [String]>,
    selection: &'a str,
    codegen: String,
    result_format: &'static str,
    result_destination: &'static str,
}

#[derive(Debug, Deserialize)]
struct TransformCreated {
    request_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct TransformStatus {
    status: String,
    #[serde(default)]
    files_remaining: Option<u64>,
    #[serde(default)]
    files_failed: u64,
}

#[derive(Debug, Deserialize)]
struct ResultEntry {
    filename: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// Completed transformations keyed by what was asked for, so a repeated
/// request reuses the earlier result set instead of resubmitting.
#[derive(Debug)]
struct QueryCache {
    path: Utf8PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
    writer: tokio::sync::Mutex<()>,
}

impl QueryCache {
    fn open(path: Utf8PathBuf) -> Self {
        let entries = std::fs::read_to_string(path.as_std_path())
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            path,
            entries: Mutex::new(entries),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    fn key(submission: &Submission<'_>) -> String {
        format!(
            "{}|{}|{}|{}",
            submission.dataset, submission.query, submission.codegen, submission.encoding
        )
    }

    fn lookup(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    async fn record(&self, key: String, request_id: &str) {
        self.entries.lock().insert(key, request_id.to_string());

        let _writing = self.writer.lock().await;
        let snapshot = self.entries.lock().clone();
        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || {
            let content = serde_json::to_vec_pretty(&snapshot).map_err(|err| err.to_string())?;
            write_bytes_atomic(&path, &content).map_err(|err| err.to_string())
        })
        .await
        .map_err(|err| err.to_string())
        .and_then(|written| written);
        if let Err(err) = written {
            warn!(path = %self.path, error = %err, "cannot update query cache");
        }
    }

    fn forget(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// Delivery client for an HTTP transformation service.
pub struct ServiceXHttpClient {
    client: Client,
    endpoint: String,
    cache_dir: Utf8PathBuf,
    poll_interval: Duration,
    deadline: Duration,
    cache: QueryCache,
}

impl ServiceXHttpClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, BinderError> {
        let cache_dir = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("databinder")).ok()
            })
            .ok_or_else(|| {
                BinderError::InvalidConfig("unable to resolve cache directory".to_string())
            })?;
        Self::with_cache_dir(endpoint, cache_dir)
    }

    pub fn with_cache_dir(
        endpoint: impl Into<String>,
        cache_dir: impl Into<Utf8PathBuf>,
    ) -> Result<Self, BinderError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("databinder/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BinderError::InvalidConfig(err.to_string()))?,
        );
        if let Ok(token) = std::env::var("SERVICEX_TOKEN") {
            if !token.trim().is_empty() {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                        .map_err(|err| BinderError::InvalidConfig(err.to_string()))?,
                );
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| BinderError::Delivery(err.to_string()))?;

        let cache_dir = cache_dir.into();
        let cache = QueryCache::open(cache_dir.join(QUERY_CACHE_FILE));
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            cache_dir,
            poll_interval: Duration::from_secs(5),
            deadline: DEFAULT_TRANSFORM_DEADLINE,
            cache,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Longest time a transformation may take before the request is given up.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn cache_dir(&self) -> &Utf8Path {
        &self.cache_dir
    }

    fn transformation_url(&self) -> String {
        format!("{}/servicex/transformation", self.endpoint)
    }

    async fn create(&self, submission: &Submission<'_>) -> Result<String, BinderError> {
        let (did, file_list) = match submission.dataset {
            DatasetSpec::Single(did) => (Some(did.as_str()), None),
            DatasetSpec::Files(files) => (None, Some(files.as_slice())),
        };
        let body = TransformRequest {
            did,
            file_list,
            selection: submission.query,
            codegen: submission.codegen.to_string(),
            result_format: submission.encoding.result_format(),
            result_destination: submission.mode.result_destination(),
        };
        let response = self
            .client
            .post(self.transformation_url())
            .json(&body)
            .send()
            .await
            .map_err(|err| BinderError::Delivery(err.to_string()))?;
        let created: TransformCreated = read_json(response).await?;
        info!(request_id = %created.request_id, dataset = %submission.dataset, "transformation submitted");
        Ok(created.request_id)
    }

    async fn wait_for_completion(&self, request_id: &str) -> Result<(), BinderError> {
        within_deadline(self.deadline, request_id, self.poll_status(request_id)).await
    }

    async fn poll_status(&self, request_id: &str) -> Result<(), BinderError> {
        let url = format!("{}/{request_id}/status", self.transformation_url());
        loop {
            let response = self.send_with_retries(|| self.client.get(&url)).await?;
            let status: TransformStatus = read_json(response).await?;
            match status.status.as_str() {
                "Complete" if status.files_failed > 0 => {
                    return Err(BinderError::TransformFailed {
                        request_id: request_id.to_string(),
                        status: format!("Complete with {} failed files", status.files_failed),
                    });
                }
                "Complete" => return Ok(()),
                "Fatal" | "Canceled" => {
                    return Err(BinderError::TransformFailed {
                        request_id: request_id.to_string(),
                        status: status.status.clone(),
                    });
                }
                other => {
                    debug!(request_id, status = other, remaining = ?status.files_remaining, "waiting");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn results(&self, request_id: &str) -> Result<Vec<ResultEntry>, BinderError> {
        let url = format!("{}/{request_id}/results", self.transformation_url());
        let response = self.send_with_retries(|| self.client.get(&url)).await?;
        read_json(response).await
    }

    async fn resolve(
        &self,
        request_id: &str,
        mode: DeliveryMode,
    ) -> Result<Vec<RemoteFile>, BinderError> {
        let entries = self.results(request_id).await?;
        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = sanitize_file_name(&entry.filename);
            let file = match (mode, entry.path, entry.url) {
                (DeliveryMode::LocalPath, Some(path), _) => RemoteFile {
                    name,
                    location: RemoteLocation::Local(Utf8PathBuf::from(path)),
                },
                (DeliveryMode::ObjectStore, _, Some(url)) => RemoteFile::uri(name, url),
                (DeliveryMode::LocalCache, _, Some(url)) => {
                    let dir = self.cache_dir.join(request_id);
                    let path = dir.join(&name);
                    if !path.exists() {
                        store::ensure_dir(&dir)
                            .await
                            .map_err(|err| BinderError::Delivery(format!("create {dir}: {err}")))?;
                        let remote = RemoteFile::uri(name.clone(), url);
                        let staged = store::staging_path(&dir)
                            .map_err(|err| BinderError::Delivery(format!("stage {path}: {err}")))?;
                        let staging = Utf8Path::from_path(&staged)
                            .ok_or_else(|| {
                                BinderError::Delivery(format!("non-utf8 staging path for {path}"))
                            })?
                            .to_path_buf();
                        self.download(&remote, &staging).await?;
                        staged.persist(path.as_std_path()).map_err(|err| {
                            BinderError::Delivery(format!("cache {path}: {}", err.error))
                        })?;
                    }
                    RemoteFile {
                        name,
                        location: RemoteLocation::Local(path),
                    }
                }
                (mode, _, _) => {
                    return Err(BinderError::Delivery(format!(
                        "result {} has no location usable for {mode:?} delivery",
                        entry.filename
                    )));
                }
            };
            files.push(file);
        }
        Ok(files)
    }

    async fn send_with_retries<F>(&self, make_req: F) -> Result<Response, BinderError>
    where
        F: Fn() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            match make_req().send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && (err.is_timeout() || err.is_connect()) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(BinderError::Delivery(err.to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl DeliveryClient for ServiceXHttpClient {
    async fn submit(&self, submission: &Submission<'_>) -> Result<Vec<RemoteFile>, BinderError> {
        let key = QueryCache::key(submission);
        if !submission.ignore_cache {
            if let Some(request_id) = self.cache.lookup(&key) {
                debug!(request_id = %request_id, "reusing cached transformation");
                match self.resolve(&request_id, submission.mode).await {
                    Ok(files) => return Ok(files),
                    Err(err) => {
                        warn!(request_id = %request_id, error = %err, "cached transformation unusable, resubmitting");
                        self.cache.forget(&key);
                    }
                }
            }
        }

        let request_id = self.create(submission).await?;
        self.wait_for_completion(&request_id).await?;
        let files = self.resolve(&request_id, submission.mode).await?;
        self.cache.record(key, &request_id).await;
        Ok(files)
    }

    async fn download(&self, file: &RemoteFile, destination: &Utf8Path) -> Result<(), BinderError> {
        let RemoteLocation::Uri(url) = &file.location else {
            return Err(BinderError::Delivery(format!(
                "{} is not a remote object",
                file.name
            )));
        };
        let mut response = self.send_with_retries(|| self.client.get(url)).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let mut out = tokio::fs::File::create(destination.as_std_path())
            .await
            .map_err(|err| BinderError::Delivery(format!("create {destination}: {err}")))?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| BinderError::Delivery(err.to_string()))?
        {
            out.write_all(&chunk)
                .await
                .map_err(|err| BinderError::Delivery(format!("write {destination}: {err}")))?;
        }
        out.flush()
            .await
            .map_err(|err| BinderError::Delivery(format!("write {destination}: {err}")))?;
        debug!(name = %file.name, destination = %destination, "downloaded");
        Ok(())
    }
}

async fn within_deadline<T, F>(
    deadline: Duration,
    request_id: &str,
    work: F,
) -> Result<T, BinderError>
where
    F: Future<Output = Result<T, BinderError>>,
{
    tokio::time::timeout(deadline, work).await.map_err(|_| {
        BinderError::Delivery(format!(
            "transformation {request_id} did not finish within {}s",
            deadline.as_secs()
        ))
    })?
}

async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, BinderError> {
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    response
        .json()
        .await
        .map_err(|err| BinderError::Delivery(err.to_string()))
}

async fn status_error(response: Response) -> BinderError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "transformation service request failed".to_string());
    BinderError::DeliveryStatus { status, message }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Result names carry dataset paths and scope separators; keep them to a
/// single visible path component.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| match ch {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '_' | '-' | '+' => ch,
            _ => '_',
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "result".to_string()
    } else {
        trimmed.to_string()
    }
}
