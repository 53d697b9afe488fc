//! Run artifact storage, HTTP fetch, and blob upload utilities for the quote pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "qm-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub name: String,
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub already_written: bool,
}

/// Write-once store for per-run output files (CSV, JSONL, tracking JSON).
///
/// Artifact names carry a run timestamp, so a name collision means the same
/// run re-emitting the same artifact; the existing file is kept untouched.
#[derive(Debug, Clone)]
pub struct RunArtifactStore {
    root: PathBuf,
}

impl RunArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Store bytes under `name` using an atomic temp-file rename.
    pub async fn store_bytes(&self, name: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let path = self.artifact_path(name);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking artifact path {}", path.display()))?
        {
            return Ok(StoredArtifact {
                name: name.to_string(),
                path,
                content_hash,
                byte_size: bytes.len(),
                already_written: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = path
            .parent()
            .unwrap_or(&self.root)
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(StoredArtifact {
                name: name.to_string(),
                path,
                content_hash,
                byte_size: bytes.len(),
                already_written: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredArtifact {
                    name: name.to_string(),
                    path,
                    content_hash,
                    byte_size: bytes.len(),
                    already_written: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }
}

/// Transient server statuses that warrant another attempt.
pub const RETRYABLE_STATUSES: [u16; 4] = [500, 502, 503, 504];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if RETRYABLE_STATUSES.contains(&status.as_u16()) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            accept_language: Some("en-US,en;q=0.9".to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// GET client with bounded retries against the fixed retryable status set.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(accept_language) = &config.accept_language {
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(
                reqwest::header::ACCEPT_LANGUAGE,
                accept_language
                    .parse()
                    .context("parsing accept-language header value")?,
            );
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct BlobRef {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob account key is not valid base64")]
    InvalidKey,
    #[error("blob request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("blob status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Object storage collaborator: durable named uploads plus signed,
/// time-limited read URLs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, name: &str, bytes: &[u8], content_type: &str)
        -> Result<BlobRef, BlobError>;

    fn signed_url(&self, name: &str, expires_in: Duration) -> Result<String, BlobError>;
}

#[derive(Debug, Clone)]
pub struct BlobAccountConfig {
    pub account: String,
    pub container: String,
    pub account_key: String,
    /// Override for the account endpoint, mostly for tests.
    pub endpoint: Option<String>,
}

/// Shared-key blob container client with SAS-style URL signing.
pub struct AccountBlobStore {
    config: BlobAccountConfig,
    client: reqwest::Client,
}

impl AccountBlobStore {
    pub fn new(config: BlobAccountConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("building blob client")?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        match &self.config.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", self.config.account),
        }
    }

    pub fn blob_url(&self, name: &str) -> String {
        format!("{}/{}/{}", self.endpoint(), self.config.container, name)
    }

    /// Deterministic SAS token over (permissions, expiry, canonical path).
    pub fn sas_token(
        &self,
        name: &str,
        permissions: &str,
        expiry_unix: i64,
    ) -> Result<String, BlobError> {
        let key = BASE64
            .decode(&self.config.account_key)
            .map_err(|_| BlobError::InvalidKey)?;
        let string_to_sign = format!(
            "{permissions}\n{expiry_unix}\n/{}/{}/{}",
            self.config.account, self.config.container, name
        );
        let mut mac = Hmac::<Sha256>::new_from_slice(&key).map_err(|_| BlobError::InvalidKey)?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        Ok(format!(
            "sp={permissions}&se={expiry_unix}&sig={}",
            urlencoding::encode(&signature)
        ))
    }
}

#[async_trait]
impl BlobStore for AccountBlobStore {
    async fn upload(
        &self,
        name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<BlobRef, BlobError> {
        let expiry = (Utc::now() + chrono::Duration::minutes(15)).timestamp();
        let token = self.sas_token(name, "cw", expiry)?;
        let url = format!("{}?{}", self.blob_url(name), token);

        let span = info_span!("blob_upload", name, bytes = bytes.len());
        let _guard = span.enter();

        let resp = self
            .client
            .put(&url)
            .header("x-ms-blob-type", "BlockBlob")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BlobError::HttpStatus {
                status: status.as_u16(),
                url: self.blob_url(name),
            });
        }

        Ok(BlobRef {
            name: name.to_string(),
            url: self.blob_url(name),
        })
    }

    fn signed_url(&self, name: &str, expires_in: Duration) -> Result<String, BlobError> {
        let expiry = (Utc::now()
            + chrono::Duration::from_std(expires_in).unwrap_or(chrono::Duration::days(1)))
        .timestamp();
        let token = self.sas_token(name, "r", expiry)?;
        Ok(format!("{}?{}", self.blob_url(name), token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = RunArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn artifacts_are_write_once_by_name() {
        let dir = tempdir().expect("tempdir");
        let store = RunArtifactStore::new(dir.path());

        let first = store
            .store_bytes("structured_quotes_1700000000.csv", b"Author\nBob\n")
            .await
            .expect("first store");
        let second = store
            .store_bytes("structured_quotes_1700000000.csv", b"Author\nAnn\n")
            .await
            .expect("second store");

        assert!(!first.already_written);
        assert!(second.already_written);
        assert_eq!(first.path, second.path);
        let kept = std::fs::read(&first.path).expect("read artifact");
        assert_eq!(kept, b"Author\nBob\n");
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn only_the_fixed_server_error_set_is_retryable() {
        for code in RETRYABLE_STATUSES {
            let status = StatusCode::from_u16(code).expect("status");
            assert_eq!(classify_status(status), RetryDisposition::Retryable);
        }
        for code in [400u16, 403, 404, 429, 501] {
            let status = StatusCode::from_u16(code).expect("status");
            assert_eq!(classify_status(status), RetryDisposition::NonRetryable);
        }
    }

    fn test_store() -> AccountBlobStore {
        AccountBlobStore::new(BlobAccountConfig {
            account: "quoteblob".to_string(),
            container: "quotebatch".to_string(),
            account_key: BASE64.encode(b"0123456789abcdef0123456789abcdef"),
            endpoint: None,
        })
        .expect("blob store")
    }

    #[test]
    fn sas_tokens_are_deterministic_for_fixed_inputs() {
        let store = test_store();
        let a = store
            .sas_token("batch_results_1700000000.jsonl", "r", 1_700_086_400)
            .expect("token");
        let b = store
            .sas_token("batch_results_1700000000.jsonl", "r", 1_700_086_400)
            .expect("token");
        assert_eq!(a, b);
        assert!(a.starts_with("sp=r&se=1700086400&sig="));
    }

    #[test]
    fn signed_urls_are_fully_qualified_and_expiring() {
        let store = test_store();
        let url = store
            .signed_url("batch_results_1700000000.jsonl", Duration::from_secs(86_400))
            .expect("signed url");
        assert!(url.starts_with(
            "https://quoteblob.blob.core.windows.net/quotebatch/batch_results_1700000000.jsonl?"
        ));
        assert!(url.contains("sp=r&se="));
        assert!(url.contains("&sig="));
    }
}
