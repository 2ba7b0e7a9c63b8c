use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, multipart, Client};
use serde::Deserialize;

use crate::{DrvError, DrvResult};

/// Wire-level access to one chunk blob. The chunk manager drives retries and
/// endpoint rotation; implementations only translate a single transfer.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Upload one chunk through `endpoint`, returning the opaque remote
    /// reference the blob can later be fetched by.
    async fn upload(&self, endpoint: &str, data: &[u8]) -> DrvResult<String>;

    /// Fetch a chunk blob, optionally restricted to a byte range.
    async fn download(&self, remote_ref: &str, range: Option<Range<u64>>) -> DrvResult<Vec<u8>>;

    /// Remove a chunk blob. A missing blob is not an error.
    async fn delete(&self, remote_ref: &str) -> DrvResult<()>;
}

#[derive(Debug, Deserialize)]
struct AttachmentInfo {
    url: String,
}

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    #[serde(default)]
    attachments: Vec<AttachmentInfo>,
}

/// Transport for message-attachment webhooks: a chunk is POSTed as a
/// multipart attachment and the response message carries its download URL.
pub struct WebhookTransport {
    client: Client,
}

impl WebhookTransport {
    pub fn new(timeout: Duration) -> DrvResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DrvError::Internal(format!("Failed to create client: {}", e)))?;
        Ok(Self { client })
    }
}

fn request_error(err: reqwest::Error, target: &str) -> DrvError {
    if err.is_timeout() || err.is_connect() {
        DrvError::Transient(format!("request to {} failed: {}", target, err))
    } else {
        DrvError::Permanent(format!("request to {} failed: {}", target, err))
    }
}

#[async_trait]
impl ChunkTransport for WebhookTransport {
    async fn upload(&self, endpoint: &str, data: &[u8]) -> DrvResult<String> {
        let part = multipart::Part::bytes(data.to_vec())
            .file_name("chunk")
            .mime_str("application/octet-stream")
            .map_err(|e| DrvError::Internal(e.to_string()))?;
        let form = multipart::Form::new().part("file", part);

        let res = self
            .client
            .post(endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| request_error(e, endpoint))?;
        if !res.status().is_success() {
            return Err(DrvError::from_http_status(res.status(), endpoint.to_string()));
        }

        let msg: WebhookMessage = res.json().await.map_err(|e| {
            DrvError::Permanent(format!("malformed webhook response from {}: {}", endpoint, e))
        })?;
        let attachment = msg.attachments.into_iter().next().ok_or_else(|| {
            DrvError::Permanent(format!("no attachment in webhook response from {}", endpoint))
        })?;
        debug!("uploaded chunk => {}", attachment.url);
        Ok(attachment.url)
    }

    async fn download(&self, remote_ref: &str, range: Option<Range<u64>>) -> DrvResult<Vec<u8>> {
        let mut req = self.client.get(remote_ref);
        if let Some(range) = &range {
            req = req.header(
                header::RANGE,
                format!("bytes={}-{}", range.start, range.end - 1),
            );
        }
        let res = req.send().await.map_err(|e| request_error(e, remote_ref))?;
        if !res.status().is_success() {
            return Err(DrvError::from_http_status(
                res.status(),
                remote_ref.to_string(),
            ));
        }
        let body = res.bytes().await.map_err(|e| {
            DrvError::Transient(format!("failed to read body from {}: {}", remote_ref, e))
        })?;
        Ok(body.to_vec())
    }

    async fn delete(&self, remote_ref: &str) -> DrvResult<()> {
        let res = self
            .client
            .delete(remote_ref)
            .send()
            .await
            .map_err(|e| request_error(e, remote_ref))?;
        // already gone is fine for a best-effort deletion
        if !res.status().is_success() && res.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(DrvError::from_http_status(
                res.status(),
                remote_ref.to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    blobs: HashMap<String, Vec<u8>>,
    /// Remaining forced upload failures per endpoint url.
    fail_uploads: HashMap<String, u32>,
    /// Next N uploads answer with a rate-limit error, regardless of endpoint.
    rate_limit_uploads: u32,
    /// Next N downloads fail with a transient error.
    fail_downloads: u32,
}

/// In-process transport keeping blobs in a map, with failure injection for
/// retry/cooldown testing. Also usable as a standalone volatile backend.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    next_ref: AtomicU64,
    upload_attempts: AtomicU64,
    download_attempts: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the next `times` uploads through `endpoint` to fail.
    pub fn fail_endpoint(&self, endpoint: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .fail_uploads
            .insert(endpoint.to_string(), times);
    }

    /// Answer the next `times` uploads with a rate-limit error.
    pub fn rate_limit_next(&self, times: u32) {
        self.state.lock().unwrap().rate_limit_uploads = times;
    }

    /// Fail the next `times` downloads with a transient error.
    pub fn fail_next_downloads(&self, times: u32) {
        self.state.lock().unwrap().fail_downloads = times;
    }

    /// Flip the stored bytes of a blob, so the next full download fails its
    /// checksum verification.
    pub fn corrupt(&self, remote_ref: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(blob) = state.blobs.get_mut(remote_ref) {
            for byte in blob.iter_mut() {
                *byte = !*byte;
            }
        }
    }

    pub fn blob_count(&self) -> usize {
        self.state.lock().unwrap().blobs.len()
    }

    pub fn contains(&self, remote_ref: &str) -> bool {
        self.state.lock().unwrap().blobs.contains_key(remote_ref)
    }

    pub fn upload_attempts(&self) -> u64 {
        self.upload_attempts.load(Ordering::SeqCst)
    }

    pub fn download_attempts(&self) -> u64 {
        self.download_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkTransport for MemoryTransport {
    async fn upload(&self, endpoint: &str, data: &[u8]) -> DrvResult<String> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.rate_limit_uploads > 0 {
            state.rate_limit_uploads -= 1;
            return Err(DrvError::RateLimited(format!(
                "endpoint {} is rate limited",
                endpoint
            )));
        }
        if let Some(remaining) = state.fail_uploads.get_mut(endpoint) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DrvError::Transient(format!(
                    "injected upload failure for {}",
                    endpoint
                )));
            }
        }
        let id = self.next_ref.fetch_add(1, Ordering::SeqCst);
        let remote_ref = format!("mem://chunk/{}", id);
        state.blobs.insert(remote_ref.clone(), data.to_vec());
        Ok(remote_ref)
    }

    async fn download(&self, remote_ref: &str, range: Option<Range<u64>>) -> DrvResult<Vec<u8>> {
        self.download_attempts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.fail_downloads > 0 {
            state.fail_downloads -= 1;
            return Err(DrvError::Transient(format!(
                "injected download failure for {}",
                remote_ref
            )));
        }
        let blob = state
            .blobs
            .get(remote_ref)
            .ok_or_else(|| DrvError::NotFound(format!("blob not found: {}", remote_ref)))?;
        match range {
            Some(range) => {
                if range.end > blob.len() as u64 || range.start > range.end {
                    return Err(DrvError::Invalid(format!(
                        "range {}..{} out of bounds for {} ({} bytes)",
                        range.start,
                        range.end,
                        remote_ref,
                        blob.len()
                    )));
                }
                Ok(blob[range.start as usize..range.end as usize].to_vec())
            }
            None => Ok(blob.clone()),
        }
    }

    async fn delete(&self, remote_ref: &str) -> DrvResult<()> {
        self.state.lock().unwrap().blobs.remove(remote_ref);
        Ok(())
    }
}
