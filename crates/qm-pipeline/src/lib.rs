//! Pipeline stages turning scraped quote rows into metadata-enriched records.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use qm_adapters::{extract_slug, QuoteSiteAdapter, QuoteSource, ScrapeLimits};
use qm_batch::{BatchClient, BatchRequest, TrackingInfo};
use qm_core::{
    GeneratedMetadata, IdentifiedRecord, MergedRecord, QuoteRecord, QuoteSlot, ScrapedRow,
    MAX_QUOTE_CHARS, QUOTE_SLOTS,
};
use qm_storage::{
    AccountBlobStore, BlobAccountConfig, BlobStore, HttpClientConfig, HttpFetcher,
    RunArtifactStore,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "qm-pipeline";

pub const QUOTE_COLUMN: &str = "Quote";
pub const AUTHOR_COLUMN: &str = "Author";
pub const CUSTOM_ID_COLUMN: &str = "custom_id";
pub const SCRAPE_HEADERS: [&str; 4] = ["Serial No", "Quote", "Link", "Author"];

pub const SYSTEM_INSTRUCTION: &str = "You are a creative and SEO-savvy content writer.";

/// Structured-table slot column names, in slot order.
pub fn paragraph_columns() -> [String; QUOTE_SLOTS] {
    std::array::from_fn(|i| format!("s{}paragraph1", i + 2))
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Schema violation: the whole input is rejected, not just one row.
    #[error("missing required column `{column}`")]
    MissingColumn { column: String },
    /// Validation failure: an author cell is empty after trimming.
    #[error("author is empty after trimming")]
    EmptyAuthor,
    #[error("unreadable table: {0}")]
    Table(#[from] csv::Error),
}

// ---------------------------------------------------------------------------
// CSV interfaces
// ---------------------------------------------------------------------------

fn read_headered_csv(path: &Path) -> Result<(Vec<String>, Vec<csv::StringRecord>), PipelineError> {
    let mut reader = csv::ReaderBuilder::new().from_path(path)?;
    let headers = reader
        .headers()?
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let mut rows = Vec::new();
    for row in reader.records() {
        rows.push(row?);
    }
    Ok((headers, rows))
}

fn column_index(headers: &[String], column: &str) -> Result<usize, PipelineError> {
    headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| PipelineError::MissingColumn {
            column: column.to_string(),
        })
}

fn cell<'a>(row: &'a csv::StringRecord, index: usize) -> &'a str {
    row.get(index).unwrap_or_default()
}

pub fn scrape_csv_bytes(rows: &[ScrapedRow]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buf);
        writer.write_record(SCRAPE_HEADERS)?;
        for row in rows {
            writer.write_record([
                row.serial.to_string().as_str(),
                &row.quote,
                &row.link,
                &row.author,
            ])?;
        }
        writer.flush().context("flushing scrape csv")?;
    }
    Ok(buf)
}

pub fn structured_csv_bytes(records: &[QuoteRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buf);
        let mut headers = paragraph_columns().to_vec();
        headers.push(AUTHOR_COLUMN.to_string());
        writer.write_record(&headers)?;
        for record in records {
            let mut cells: Vec<&str> = record.quote_cells().collect();
            cells.push(&record.author);
            writer.write_record(&cells)?;
        }
        writer.flush().context("flushing structured csv")?;
    }
    Ok(buf)
}

pub fn identified_csv_bytes(records: &[IdentifiedRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buf);
        let mut headers = vec![CUSTOM_ID_COLUMN.to_string()];
        headers.extend(paragraph_columns());
        headers.push(AUTHOR_COLUMN.to_string());
        writer.write_record(&headers)?;
        for identified in records {
            let mut cells: Vec<&str> = vec![&identified.custom_id];
            cells.extend(identified.record.quote_cells());
            cells.push(&identified.record.author);
            writer.write_record(&cells)?;
        }
        writer.flush().context("flushing identified csv")?;
    }
    Ok(buf)
}

pub fn merged_csv_bytes(records: &[MergedRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buf);
        let mut headers = vec![CUSTOM_ID_COLUMN.to_string()];
        headers.extend(paragraph_columns());
        headers.extend([
            AUTHOR_COLUMN.to_string(),
            "storytitle".to_string(),
            "metadescription".to_string(),
            "metakeywords".to_string(),
        ]);
        writer.write_record(&headers)?;
        for merged in records {
            let mut cells: Vec<&str> = vec![&merged.custom_id];
            cells.extend(merged.record.quote_cells());
            cells.extend([
                merged.record.author.as_str(),
                merged.metadata.storytitle.as_str(),
                merged.metadata.metadescription.as_str(),
                merged.metadata.metakeywords.as_str(),
            ]);
            writer.write_record(&cells)?;
        }
        writer.flush().context("flushing merged csv")?;
    }
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Quote store builder
// ---------------------------------------------------------------------------

/// Retention filter applied before grouping: non-empty, trimmed length
/// within the slot limit.
pub fn quote_survives(quote: &str) -> bool {
    let trimmed = quote.trim();
    !trimmed.is_empty() && trimmed.chars().count() <= MAX_QUOTE_CHARS
}

/// Group quote/author pairs into fixed-width records, one per distinct
/// author, in first-seen author order.
pub fn build_quote_store(pairs: impl IntoIterator<Item = (String, String)>) -> Vec<QuoteRecord> {
    let mut first_seen: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();

    for (quote, author) in pairs {
        if !quote_survives(&quote) {
            continue;
        }
        if !groups.contains_key(&author) {
            first_seen.push(author.clone());
        }
        groups.entry(author).or_default().push(quote);
    }

    first_seen
        .into_iter()
        .map(|author| {
            let survivors = groups.remove(&author).unwrap_or_default();
            QuoteRecord::from_survivors(author, survivors)
        })
        .collect()
}

/// Read a raw scrape table and structure it by author.
pub fn structure_from_csv(path: &Path) -> Result<Vec<QuoteRecord>, PipelineError> {
    let (headers, rows) = read_headered_csv(path)?;
    let quote_idx = column_index(&headers, QUOTE_COLUMN)?;
    let author_idx = column_index(&headers, AUTHOR_COLUMN)?;

    let pairs = rows.iter().map(|row| {
        (
            cell(row, quote_idx).to_string(),
            cell(row, author_idx).to_string(),
        )
    });
    Ok(build_quote_store(pairs))
}

// ---------------------------------------------------------------------------
// Sanitation filter
// ---------------------------------------------------------------------------

/// Strict row-wise partition into complete and incomplete records. Both
/// sides are returned; the incomplete side is surfaced, never discarded.
pub fn sanitize(records: Vec<QuoteRecord>) -> (Vec<QuoteRecord>, Vec<QuoteRecord>) {
    records.into_iter().partition(QuoteRecord::is_complete)
}

/// Read the structured table back as records, one per row.
pub fn read_structured_csv(path: &Path) -> Result<Vec<QuoteRecord>, PipelineError> {
    let (headers, rows) = read_headered_csv(path)?;
    let author_idx = column_index(&headers, AUTHOR_COLUMN)?;
    let mut slot_indices = [0usize; QUOTE_SLOTS];
    for (slot, column) in slot_indices.iter_mut().zip(paragraph_columns()) {
        *slot = column_index(&headers, &column)?;
    }

    Ok(rows
        .iter()
        .map(|row| QuoteRecord {
            author: cell(row, author_idx).to_string(),
            quotes: slot_indices.map(|index| QuoteSlot::from_cell(cell(row, index))),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Identifier assigner
// ---------------------------------------------------------------------------

/// Run-scoped identifier state: author ordinals in first-seen order plus
/// per-author occurrence counts. Re-running over reordered input yields
/// different ordinals, which is why identifiers are run-scoped.
#[derive(Debug, Default)]
pub struct IdAssigner {
    ordinals: HashMap<String, usize>,
    occurrences: HashMap<String, usize>,
}

impl IdAssigner {
    pub fn assign(&mut self, author: &str) -> Result<String, PipelineError> {
        let author = author.trim();
        if author.is_empty() {
            return Err(PipelineError::EmptyAuthor);
        }

        let next_ordinal = self.ordinals.len() + 1;
        let ordinal = *self
            .ordinals
            .entry(author.to_string())
            .or_insert(next_ordinal);
        let occurrence = self
            .occurrences
            .entry(author.to_string())
            .and_modify(|count| *count += 1)
            .or_insert(1);

        Ok(format!(
            "{ordinal}-{}-{occurrence}",
            author.replace(' ', "_")
        ))
    }
}

/// Tag each clean record with its custom identifier, preserving row order.
pub fn assign_identifiers(
    clean: Vec<QuoteRecord>,
) -> Result<Vec<IdentifiedRecord>, PipelineError> {
    let mut assigner = IdAssigner::default();
    clean
        .into_iter()
        .map(|record| {
            let custom_id = assigner.assign(&record.author)?;
            Ok(IdentifiedRecord { custom_id, record })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Prompt / batch payload builder
// ---------------------------------------------------------------------------

/// Render the generation instruction for one record: author line, bulleted
/// block of present quotes in slot order, and the exact response contract.
pub fn render_prompt(record: &QuoteRecord) -> String {
    let block = record
        .quotes
        .iter()
        .filter_map(|slot| match slot {
            QuoteSlot::Present(quote) => Some(format!("- {quote}")),
            QuoteSlot::Absent => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You're given a series of quotes by {}.\n\
         Use them to generate metadata for a web story.\n\
         Quotes:\n{}\n\n\
         Please respond ONLY in this exact JSON format:\n\
         {{\n  \"storytitle\": \"...\",\n  \"metadescription\": \"...\",\n  \"metakeywords\": \"...\"\n}}",
        record.author, block
    )
}

pub fn build_batch_requests(records: &[IdentifiedRecord], model: &str) -> Vec<BatchRequest> {
    records
        .iter()
        .map(|identified| {
            BatchRequest::chat_completion(
                &identified.custom_id,
                model,
                SYSTEM_INSTRUCTION,
                render_prompt(&identified.record),
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Result normalizer & merger
// ---------------------------------------------------------------------------

/// Canonicalize an identifier for comparison: lowercase, trim, and strip
/// leading zeros from a `<digits>-<rest>` ordinal prefix. Identifiers
/// without that shape pass through (lowercased and trimmed) unchanged.
pub fn normalize_custom_id(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    if let Some((digits, rest)) = lowered.split_once('-') {
        if !digits.is_empty() && !rest.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(ordinal) = digits.parse::<u128>() {
                return format!("{ordinal}-{rest}");
            }
        }
    }
    lowered
}

/// Strip an optional leading code fence (with or without a language tag)
/// and an optional trailing fence from generated text.
pub fn strip_code_fence(raw: &str) -> String {
    let mut body = raw.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = match rest.split_once('\n') {
            Some((_language_tag, after_fence_line)) => after_fence_line,
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
        };
    }
    if let Some(before_fence) = body.trim_end().strip_suffix("```") {
        body = before_fence;
    }
    body.trim().to_string()
}

fn generated_content(value: &serde_json::Value) -> Option<&str> {
    value
        .get("response")?
        .get("body")?
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}

/// Parse one result line into `(normalized id, metadata triple)`.
///
/// Total per line: any malformed line, missing identifier, missing
/// response path, or unparseable triple yields `None` and is skipped.
pub fn parse_result_line(line: &str) -> Option<(String, GeneratedMetadata)> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let custom_id = value.get("custom_id")?.as_str()?;
    let key = normalize_custom_id(custom_id);
    let content = generated_content(&value)?;
    let metadata: GeneratedMetadata = serde_json::from_str(&strip_code_fence(content)).ok()?;
    Some((key, metadata))
}

/// Fold result lines into a key → triple map. Duplicate keys keep the last
/// successfully parsed triple.
pub fn collect_metadata(results_jsonl: &str) -> HashMap<String, GeneratedMetadata> {
    let mut metadata_by_key = HashMap::new();
    let mut skipped = 0usize;
    for line in results_jsonl.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_result_line(line) {
            Some((key, metadata)) => {
                metadata_by_key.insert(key, metadata);
            }
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(skipped, "result lines skipped during merge");
    }
    metadata_by_key
}

/// Attach metadata to every record by normalized identifier. Rows with no
/// match get the empty triple; no row is dropped or reordered.
pub fn apply_metadata(
    records: Vec<IdentifiedRecord>,
    metadata_by_key: &HashMap<String, GeneratedMetadata>,
) -> Vec<MergedRecord> {
    records
        .into_iter()
        .map(|identified| {
            let metadata = metadata_by_key
                .get(&normalize_custom_id(&identified.custom_id))
                .cloned()
                .unwrap_or_default();
            MergedRecord {
                custom_id: identified.custom_id,
                record: identified.record,
                metadata,
            }
        })
        .collect()
}

pub fn merge_records(
    records: Vec<IdentifiedRecord>,
    results_jsonl: &str,
) -> Vec<MergedRecord> {
    apply_metadata(records, &collect_metadata(results_jsonl))
}

/// Read the batch-ready table: custom_id, slot columns, author.
pub fn read_identified_csv(path: &Path) -> Result<Vec<IdentifiedRecord>, PipelineError> {
    let (headers, rows) = read_headered_csv(path)?;
    let id_idx = column_index(&headers, CUSTOM_ID_COLUMN)?;
    let author_idx = column_index(&headers, AUTHOR_COLUMN)?;
    let mut slot_indices = [0usize; QUOTE_SLOTS];
    for (slot, column) in slot_indices.iter_mut().zip(paragraph_columns()) {
        *slot = column_index(&headers, &column)?;
    }

    Ok(rows
        .iter()
        .map(|row| IdentifiedRecord {
            custom_id: cell(row, id_idx).to_string(),
            record: QuoteRecord {
                author: cell(row, author_idx).to_string(),
                quotes: slot_indices.map(|index| QuoteSlot::from_cell(cell(row, index))),
            },
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Distinct author extractor
// ---------------------------------------------------------------------------

/// Sorted, comma-joined distinct author list from any table with an
/// author column.
pub fn distinct_authors(path: &Path) -> Result<String, PipelineError> {
    let (headers, rows) = read_headered_csv(path)?;
    let author_idx = column_index(&headers, AUTHOR_COLUMN)?;
    let authors: BTreeSet<String> = rows
        .iter()
        .map(|row| cell(row, author_idx))
        .filter(|author| !author.trim().is_empty())
        .map(ToString::to_string)
        .collect();
    Ok(authors.into_iter().collect::<Vec<_>>().join(", "))
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub artifacts_dir: PathBuf,
    pub quote_site_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_pages: usize,
    pub page_delay_ms: u64,
    pub batch_api_base: String,
    pub batch_api_key: String,
    pub batch_api_version: String,
    pub deployment_model: String,
    pub blob_account: String,
    pub blob_container: String,
    pub blob_account_key: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            artifacts_dir: std::env::var("QM_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            quote_site_base: std::env::var("QM_QUOTE_SITE")
                .unwrap_or_else(|_| "https://quotefancy.com".to_string()),
            user_agent: std::env::var("QM_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/90.0.4430.93 Safari/537.36"
                    .to_string()
            }),
            http_timeout_secs: std::env::var("QM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            max_pages: std::env::var("QM_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            page_delay_ms: std::env::var("QM_PAGE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            batch_api_base: std::env::var("QM_BATCH_API_BASE").unwrap_or_default(),
            batch_api_key: std::env::var("QM_BATCH_API_KEY").unwrap_or_default(),
            batch_api_version: std::env::var("QM_BATCH_API_VERSION")
                .unwrap_or_else(|_| "2025-03-01-preview".to_string()),
            deployment_model: std::env::var("QM_DEPLOYMENT_MODEL")
                .unwrap_or_else(|_| "gpt-4o-global-batch".to_string()),
            blob_account: std::env::var("QM_BLOB_ACCOUNT").unwrap_or_default(),
            blob_container: std::env::var("QM_BLOB_CONTAINER")
                .unwrap_or_else(|_| "quotebatch".to_string()),
            blob_account_key: std::env::var("QM_BLOB_ACCOUNT_KEY").unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub slugs: usize,
    pub rows: usize,
    pub artifact: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StructureSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: usize,
    pub artifact: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrepareSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub clean_rows: usize,
    pub removed_rows: usize,
    pub requests: usize,
    pub batch_id: String,
    pub input_file_id: String,
    pub cleaned_csv: String,
    pub removed_csv: String,
    pub identified_csv: String,
    pub batch_jsonl: String,
    pub tracking_json: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub run_id: Uuid,
    pub batch_id: String,
    pub status: String,
    pub completed: bool,
    pub results_artifact: Option<String>,
    pub blob_url: Option<String>,
    pub signed_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows: usize,
    pub matched_rows: usize,
    pub artifact: String,
}

pub struct QuotePipeline {
    config: PipelineConfig,
    artifacts: RunArtifactStore,
    http: HttpFetcher,
}

impl QuotePipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let artifacts = RunArtifactStore::new(config.artifacts_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            artifacts,
            http,
        })
    }

    fn batch_client(&self) -> Result<BatchClient> {
        BatchClient::new(
            self.config.batch_api_base.clone(),
            self.config.batch_api_key.clone(),
            self.config.batch_api_version.clone(),
        )
    }

    fn blob_store(&self) -> Result<AccountBlobStore> {
        AccountBlobStore::new(BlobAccountConfig {
            account: self.config.blob_account.clone(),
            container: self.config.blob_container.clone(),
            account_key: self.config.blob_account_key.clone(),
            endpoint: None,
        })
    }

    /// Scrape every slug named by the comma-separated URL list and store
    /// one combined scrape CSV.
    pub async fn run_scrape(&self, urls: &str, prefix: &str) -> Result<ScrapeSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let adapter = QuoteSiteAdapter::new(
            self.config.quote_site_base.clone(),
            ScrapeLimits {
                max_pages: self.config.max_pages,
                page_delay: Duration::from_millis(self.config.page_delay_ms),
            },
        );

        let mut slugs = 0usize;
        let mut rows: Vec<ScrapedRow> = Vec::new();
        for url in urls.split(',') {
            let url = url.trim();
            if url.is_empty() {
                continue;
            }
            let Some(slug) = extract_slug(url) else {
                warn!(url, "no slug in url; skipping");
                continue;
            };
            info!(%slug, "scraping slug");
            slugs += 1;
            rows.extend(adapter.scrape_slug(&self.http, &slug).await);
        }

        let artifact_name = format!("{prefix}_{}.csv", started_at.timestamp());
        let stored = self
            .artifacts
            .store_bytes(&artifact_name, &scrape_csv_bytes(&rows)?)
            .await?;

        Ok(ScrapeSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            slugs,
            rows: rows.len(),
            artifact: stored.path.display().to_string(),
        })
    }

    /// Structure a raw scrape table by author into the fixed-width form.
    pub async fn run_structure(&self, input: &Path) -> Result<StructureSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let records = structure_from_csv(input)?;

        let artifact_name = format!("structured_quotes_{}.csv", started_at.timestamp());
        let stored = self
            .artifacts
            .store_bytes(&artifact_name, &structured_csv_bytes(&records)?)
            .await?;

        Ok(StructureSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            records: records.len(),
            artifact: stored.path.display().to_string(),
        })
    }

    /// Sanitize the structured table, assign identifiers, build the batch
    /// payload, submit the job, and store tracking info.
    pub async fn run_prepare(&self, input: &Path) -> Result<PrepareSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let ts = started_at.timestamp().to_string();

        let records = read_structured_csv(input)?;
        let (clean, removed) = sanitize(records);
        info!(clean = clean.len(), removed = removed.len(), "sanitation partition");

        let cleaned_csv = format!("cleaned_data_{ts}.csv");
        let removed_csv = format!("removed_data_{ts}.csv");
        self.artifacts
            .store_bytes(&cleaned_csv, &structured_csv_bytes(&clean)?)
            .await?;
        self.artifacts
            .store_bytes(&removed_csv, &structured_csv_bytes(&removed)?)
            .await?;

        let identified = assign_identifiers(clean)?;
        let identified_csv = format!("structured-data-id_{ts}.csv");
        self.artifacts
            .store_bytes(&identified_csv, &identified_csv_bytes(&identified)?)
            .await?;

        let requests = build_batch_requests(&identified, &self.config.deployment_model);
        let batch_jsonl = format!("quotefancy_batch_{ts}.jsonl");
        let jsonl = qm_batch::to_jsonl(&requests).context("encoding batch requests")?;
        self.artifacts.store_bytes(&batch_jsonl, jsonl.as_bytes()).await?;

        let client = self.batch_client()?;
        let input_file = client.upload_input_file(&batch_jsonl, jsonl).await?;
        let job = client.create_batch(&input_file.id).await?;

        let tracking = TrackingInfo {
            ts: ts.clone(),
            batch_id: job.id.clone(),
            file_id: input_file.id.clone(),
            jsonl_file: batch_jsonl.clone(),
            csv_file: identified_csv.clone(),
        };
        let tracking_json = format!("batch_tracking_{ts}.json");
        let tracking_bytes =
            serde_json::to_vec_pretty(&tracking).context("serializing tracking info")?;
        self.artifacts
            .store_bytes(&tracking_json, &tracking_bytes)
            .await?;

        Ok(PrepareSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            clean_rows: identified.len(),
            removed_rows: removed.len(),
            requests: requests.len(),
            batch_id: job.id,
            input_file_id: input_file.id,
            cleaned_csv,
            removed_csv,
            identified_csv,
            batch_jsonl,
            tracking_json,
        })
    }

    /// Poll the batch job named by a tracking file; when completed, store
    /// the results, upload them to blob storage, and sign a read URL.
    ///
    /// Safe to re-invoke: the results artifact name is derived from the
    /// tracking timestamp and uploads overwrite the same blob.
    pub async fn run_fetch(&self, tracking_path: &Path) -> Result<FetchSummary> {
        let run_id = Uuid::new_v4();
        let tracking_text = std::fs::read_to_string(tracking_path)
            .with_context(|| format!("reading {}", tracking_path.display()))?;
        let tracking: TrackingInfo = serde_json::from_str(&tracking_text)
            .with_context(|| format!("parsing {}", tracking_path.display()))?;

        let client = self.batch_client()?;
        let job = client.retrieve_batch(&tracking.batch_id).await?;
        info!(batch_id = %job.id, status = %job.status, "batch status");

        if !job.is_completed() {
            return Ok(FetchSummary {
                run_id,
                batch_id: job.id,
                status: job.status,
                completed: false,
                results_artifact: None,
                blob_url: None,
                signed_url: None,
            });
        }

        let file_id = job.result_file_id().with_context(|| {
            format!("batch {} completed without an output or error file", job.id)
        })?;
        let content = client.fetch_file_content(file_id).await?;
        let mut normalized = content.trim().replace("\r\n", "\n");
        normalized.push('\n');

        let results_name = format!("batch_results_{}.jsonl", tracking.ts);
        let stored = self
            .artifacts
            .store_bytes(&results_name, normalized.as_bytes())
            .await?;

        let blob = self.blob_store()?;
        let blob_ref = blob
            .upload(&results_name, normalized.as_bytes(), "application/json")
            .await?;
        let signed = blob.signed_url(&results_name, Duration::from_secs(86_400))?;

        Ok(FetchSummary {
            run_id,
            batch_id: job.id,
            status: job.status,
            completed: true,
            results_artifact: Some(stored.path.display().to_string()),
            blob_url: Some(blob_ref.url),
            signed_url: Some(signed),
        })
    }

    /// Merge generated metadata back into the batch-ready table.
    pub async fn run_merge(&self, table: &Path, results: &Path) -> Result<MergeSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let records = read_identified_csv(table)?;
        let results_jsonl = std::fs::read_to_string(results)
            .with_context(|| format!("reading {}", results.display()))?;

        let metadata_by_key = collect_metadata(&results_jsonl);
        let matched_rows = records
            .iter()
            .filter(|r| metadata_by_key.contains_key(&normalize_custom_id(&r.custom_id)))
            .count();
        let merged = apply_metadata(records, &metadata_by_key);

        let artifact_name = format!("merged_quotes_{}.csv", started_at.timestamp());
        let stored = self
            .artifacts
            .store_bytes(&artifact_name, &merged_csv_bytes(&merged)?)
            .await?;

        Ok(MergeSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            rows: merged.len(),
            matched_rows,
            artifact: stored.path.display().to_string(),
        })
    }

    /// Sorted distinct author list for any table carrying an author column.
    pub async fn run_authors(&self, input: &Path) -> Result<String> {
        Ok(distinct_authors(input)?)
    }
}
