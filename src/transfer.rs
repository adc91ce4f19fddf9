use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Body, Client, Response};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{SdkError, TransferError};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub direction: Direction,
    pub url: String,
    pub local_path: Utf8PathBuf,
    pub content_type: Option<String>,
}

impl TransferJob {
    pub fn download(url: impl Into<String>, local_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            direction: Direction::Download,
            url: url.into(),
            local_path: local_path.into(),
            content_type: None,
        }
    }

    pub fn upload(
        url: impl Into<String>,
        local_path: impl Into<Utf8PathBuf>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            direction: Direction::Upload,
            url: url.into(),
            local_path: local_path.into(),
            content_type: Some(content_type.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReceipt {
    pub bytes: u64,
}

pub type TransferResult = Result<TransferReceipt, TransferError>;

// One attempt, no retries.
#[async_trait]
pub trait ObjectTransport: Send + Sync {
    async fn transfer(&self, job: &TransferJob, cancel: &CancellationToken) -> TransferResult;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    chunk_size: usize,
}

impl HttpTransport {
    pub fn new(timeout: Duration, chunk_size: usize) -> Result<Self, SdkError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("starbreeder-sdk/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SdkError::HttpClient(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|err| SdkError::HttpClient(err.to_string()))?;
        Ok(Self::with_client(client, chunk_size))
    }

    pub fn with_client(client: Client, chunk_size: usize) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
        }
    }

    async fn download(
        &self,
        url: &str,
        destination: &Utf8Path,
        cancel: &CancellationToken,
    ) -> TransferResult {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            sent = self.client.get(url).send() => sent.map_err(TransferError::from_reqwest)?,
        };
        let response = handle_status(response).await?;

        let file = File::create(destination.as_std_path())
            .await
            .map_err(|err| TransferError::local(destination, err))?;
        let mut writer = BufWriter::with_capacity(self.chunk_size, file);
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(TransferError::from_reqwest)?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|err| TransferError::local(destination, err))?;
            written += chunk.len() as u64;
        }
        writer
            .flush()
            .await
            .map_err(|err| TransferError::local(destination, err))?;
        Ok(TransferReceipt { bytes: written })
    }

    async fn upload(
        &self,
        url: &str,
        source: &Utf8Path,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> TransferResult {
        let file = File::open(source.as_std_path())
            .await
            .map_err(|err| TransferError::local(source, err))?;
        let size = file
            .metadata()
            .await
            .map_err(|err| TransferError::local(source, err))?
            .len();
        let body = Body::wrap_stream(ReaderStream::with_capacity(file, self.chunk_size));
        let request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, size)
            .body(body);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            sent = request.send() => sent.map_err(TransferError::from_reqwest)?,
        };
        handle_status(response).await?;
        Ok(TransferReceipt { bytes: size })
    }
}

#[async_trait]
impl ObjectTransport for HttpTransport {
    async fn transfer(&self, job: &TransferJob, cancel: &CancellationToken) -> TransferResult {
        debug!(direction = ?job.direction, path = %job.local_path, "transfer start");
        let result = match job.direction {
            Direction::Download => self.download(&job.url, &job.local_path, cancel).await,
            Direction::Upload => {
                let content_type = job.content_type.as_deref().unwrap_or(OCTET_STREAM);
                self.upload(&job.url, &job.local_path, content_type, cancel)
                    .await
            }
        };
        if let Err(err) = &result {
            debug!(direction = ?job.direction, path = %job.local_path, error = %err, "transfer failed");
        }
        result
    }
}

async fn handle_status(response: Response) -> Result<Response, TransferError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .ok()
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| "object store request failed".to_string());
    Err(TransferError::Status { status, message })
}
