// End-to-end pass over the offline stages: structure a scrape table,
// sanitize and identify it, then merge fenced batch results back in.

use std::path::Path;

use qm_pipeline::{
    assign_identifiers, identified_csv_bytes, read_structured_csv, sanitize, PipelineConfig,
    QuotePipeline,
};

fn test_config(artifacts_dir: &Path) -> PipelineConfig {
    PipelineConfig {
        artifacts_dir: artifacts_dir.to_path_buf(),
        quote_site_base: "https://quotefancy.com".to_string(),
        user_agent: "qm-test/0.1".to_string(),
        http_timeout_secs: 5,
        max_pages: 1,
        page_delay_ms: 0,
        batch_api_base: "https://example.invalid".to_string(),
        batch_api_key: "test-key".to_string(),
        batch_api_version: "2025-03-01-preview".to_string(),
        deployment_model: "gpt-4o-global-batch".to_string(),
        blob_account: "quoteblob".to_string(),
        blob_container: "quotebatch".to_string(),
        blob_account_key: String::new(),
    }
}

fn scrape_csv_with_two_authors() -> String {
    let mut lines = vec!["Serial No,Quote,Link,Author".to_string()];
    for i in 1..=8 {
        lines.push(format!("{i},Ann quote number {i},/ann/{i},Ann Author"));
    }
    lines.push(format!("9,{},/ann/long,Ann Author", "L".repeat(200)));
    lines.push("10,Bob only has one,/bob/1,Bob Author".to_string());
    lines.join("\n")
}

#[tokio::test]
async fn structure_then_merge_produces_an_enriched_table() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipeline = QuotePipeline::new(test_config(&dir.path().join("artifacts"))).expect("pipeline");

    let scrape_csv = dir.path().join("scrape.csv");
    std::fs::write(&scrape_csv, scrape_csv_with_two_authors()).expect("write scrape csv");

    let structure = pipeline.run_structure(&scrape_csv).await.expect("structure");
    assert_eq!(structure.records, 2);

    let structured = read_structured_csv(Path::new(&structure.artifact)).expect("read back");
    let (clean, removed) = sanitize(structured);
    assert_eq!(clean.len(), 1, "only the eight-quote author is complete");
    assert_eq!(removed.len(), 1, "the one-quote author is surfaced, not dropped");
    assert_eq!(removed[0].author, "Bob Author");

    let identified = assign_identifiers(clean).expect("assign");
    assert_eq!(identified[0].custom_id, "1-Ann_Author-1");

    let identified_csv = dir.path().join("identified.csv");
    std::fs::write(
        &identified_csv,
        identified_csv_bytes(&identified).expect("identified csv"),
    )
    .expect("write identified csv");

    let results = dir.path().join("results.jsonl");
    let fenced = "```json\n{\"storytitle\":\"Ann's Wisdom\",\"metadescription\":\"Eight sayings\",\"metakeywords\":\"ann,quotes\"}\n```";
    let lines = [
        serde_json::json!({
            "custom_id": "01-ann_author-1",
            "response": {"body": {"choices": [{"message": {"content": fenced}}]}}
        })
        .to_string(),
        "{broken line".to_string(),
    ]
    .join("\n");
    std::fs::write(&results, lines).expect("write results");

    let merge = pipeline
        .run_merge(&identified_csv, &results)
        .await
        .expect("merge");
    assert_eq!(merge.rows, 1);
    assert_eq!(merge.matched_rows, 1);

    let merged_csv = std::fs::read_to_string(&merge.artifact).expect("read merged");
    assert!(merged_csv.contains("Ann's Wisdom"));
    assert!(merged_csv.contains("Eight sayings"));
    assert!(merged_csv.contains("1-Ann_Author-1"));
}
