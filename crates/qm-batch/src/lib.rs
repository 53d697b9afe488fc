//! Asynchronous generation-job collaborator: wire types + batch API client.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "qm-batch";

/// Completion window requested for every batch job.
pub const COMPLETION_WINDOW: &str = "24h";

/// Input and output files are kept for 14 days on the batch service.
pub const FILE_EXPIRY_SECONDS: u64 = 1_209_600;

/// One role/content pair of the request conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request body forwarded untouched to the generation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// One line of the batch input file, keyed by the run-scoped identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: BatchBody,
}

impl BatchRequest {
    pub fn chat_completion(
        custom_id: impl Into<String>,
        model: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            custom_id: custom_id.into(),
            method: "POST".to_string(),
            url: "/chat/completions".to_string(),
            body: BatchBody {
                model: model.into(),
                messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            },
        }
    }
}

/// Newline-delimited JSON: one request per line, input order preserved.
pub fn to_jsonl(requests: &[BatchRequest]) -> Result<String, serde_json::Error> {
    let mut lines = Vec::with_capacity(requests.len());
    for request in requests {
        lines.push(serde_json::to_string(request)?);
    }
    Ok(lines.join("\n"))
}

/// Everything needed to poll a submitted job later, from a different run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingInfo {
    pub ts: String,
    pub batch_id: String,
    pub file_id: String,
    pub jsonl_file: String,
    pub csv_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileObject {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
}

impl BatchJob {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    /// Completed jobs expose results through the output file, or the error
    /// file when every request failed.
    pub fn result_file_id(&self) -> Option<&str> {
        self.output_file_id
            .as_deref()
            .or(self.error_file_id.as_deref())
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("batch api status {status}: {body}")]
    Api { status: u16, body: String },
}

#[derive(Serialize)]
struct ExpiresAfter {
    seconds: u64,
    anchor: &'static str,
}

#[derive(Serialize)]
struct CreateBatchBody<'a> {
    input_file_id: &'a str,
    endpoint: &'static str,
    completion_window: &'static str,
    output_expires_after: ExpiresAfter,
}

/// Thin client for the batch generation service.
///
/// Retrieval calls are read-only; re-invoking them is always safe.
pub struct BatchClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_version: String,
}

impl BatchClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_version: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("building batch client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_version: api_version.into(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}{}?api-version={}",
            self.base_url, path, self.api_version
        )
    }

    async fn checked(resp: reqwest::Response) -> Result<reqwest::Response, BatchError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BatchError::Api {
            status: status.as_u16(),
            body,
        })
    }

    /// Upload a JSONL document as a batch input file.
    pub async fn upload_input_file(
        &self,
        filename: &str,
        jsonl: String,
    ) -> Result<FileObject, BatchError> {
        let part = reqwest::multipart::Part::text(jsonl)
            .file_name(filename.to_string())
            .mime_str("application/jsonl")?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .text("expires_after[anchor]", "created_at")
            .text("expires_after[seconds]", FILE_EXPIRY_SECONDS.to_string())
            .part("file", part);

        let resp = self
            .client
            .post(self.endpoint("/files"))
            .header("api-key", &self.api_key)
            .multipart(form)
            .send()
            .await?;
        let file: FileObject = Self::checked(resp).await?.json().await?;
        info!(file_id = %file.id, filename, "batch input file uploaded");
        Ok(file)
    }

    /// Submit a batch job over a previously uploaded input file.
    pub async fn create_batch(&self, input_file_id: &str) -> Result<BatchJob, BatchError> {
        let body = CreateBatchBody {
            input_file_id,
            endpoint: "/chat/completions",
            completion_window: COMPLETION_WINDOW,
            output_expires_after: ExpiresAfter {
                seconds: FILE_EXPIRY_SECONDS,
                anchor: "created_at",
            },
        };
        let resp = self
            .client
            .post(self.endpoint("/batches"))
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let job: BatchJob = Self::checked(resp).await?.json().await?;
        info!(batch_id = %job.id, status = %job.status, "batch job submitted");
        Ok(job)
    }

    /// Read-only status fetch for a submitted batch job.
    pub async fn retrieve_batch(&self, batch_id: &str) -> Result<BatchJob, BatchError> {
        let resp = self
            .client
            .get(self.endpoint(&format!("/batches/{batch_id}")))
            .header("api-key", &self.api_key)
            .send()
            .await?;
        Ok(Self::checked(resp).await?.json().await?)
    }

    /// Download the text content of a stored file (batch output or errors).
    pub async fn fetch_file_content(&self, file_id: &str) -> Result<String, BatchError> {
        let resp = self
            .client
            .get(self.endpoint(&format!("/files/{file_id}/content")))
            .header("api-key", &self.api_key)
            .send()
            .await?;
        Ok(Self::checked(resp).await?.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_requests() -> Vec<BatchRequest> {
        vec![
            BatchRequest::chat_completion("1-Marie_Curie-1", "gpt-4o-global-batch", "sys", "user one"),
            BatchRequest::chat_completion("2-Albert_Einstein-1", "gpt-4o-global-batch", "sys", "user two"),
        ]
    }

    #[test]
    fn jsonl_has_exactly_one_request_per_line() {
        let jsonl = to_jsonl(&sample_requests()).expect("encode");
        let lines: Vec<&str> = jsonl.lines().collect();
        assert_eq!(lines.len(), 2);

        for line in &lines {
            let value: serde_json::Value = serde_json::from_str(line).expect("each line is JSON");
            assert!(value.get("custom_id").is_some());
        }
    }

    #[test]
    fn jsonl_preserves_request_order() {
        let jsonl = to_jsonl(&sample_requests()).expect("encode");
        let ids: Vec<String> = jsonl
            .lines()
            .map(|line| {
                let parsed: BatchRequest = serde_json::from_str(line).expect("round trip");
                parsed.custom_id
            })
            .collect();
        assert_eq!(ids, vec!["1-Marie_Curie-1", "2-Albert_Einstein-1"]);
    }

    #[test]
    fn chat_completion_requests_carry_fixed_job_metadata() {
        let request = BatchRequest::chat_completion("1-Bob-1", "gpt-4o-global-batch", "sys", "user");
        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "/chat/completions");
        assert_eq!(request.body.model, "gpt-4o-global-batch");
        assert_eq!(request.body.messages.len(), 2);
        assert_eq!(request.body.messages[0].role, "system");
        assert_eq!(request.body.messages[1].role, "user");
    }

    #[test]
    fn result_file_falls_back_to_the_error_file() {
        let job = BatchJob {
            id: "batch_1".into(),
            status: "completed".into(),
            output_file_id: None,
            error_file_id: Some("file_err".into()),
        };
        assert!(job.is_completed());
        assert_eq!(job.result_file_id(), Some("file_err"));
    }

    #[test]
    fn tracking_info_round_trips_through_json() {
        let tracking = TrackingInfo {
            ts: "1700000000".into(),
            batch_id: "batch_1".into(),
            file_id: "file_1".into(),
            jsonl_file: "quotefancy_batch_1700000000.jsonl".into(),
            csv_file: "structured-data-id_1700000000.csv".into(),
        };
        let json = serde_json::to_string(&tracking).expect("serialize");
        let back: TrackingInfo = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, tracking);
    }
}
