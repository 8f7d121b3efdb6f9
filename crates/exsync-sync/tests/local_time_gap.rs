//! Runs in its own test binary: the local time zone is process-wide.

use std::path::Path;
use std::sync::Arc;

use chrono::{Local, TimeZone};
use exsync_adapters::FixtureRemoteSource;
use exsync_core::{parse_remote_timestamp, Mode};
use exsync_storage::FileTree;
use exsync_sync::{parse_schema_tree, EngineOptions, SyncEngine};
use serde_json::json;
use tempfile::tempdir;

const SCHEMA: &str = r#"
record_types:
  - record_type: ejscript
    query_fields: [id, name, folder, body, updated]
    naming:
      template: "ejscript/${folder}/${name}/${name}"
    json_file: true
    script_files: [body]
    updatable: [id]
    timestamp_pair: true
"#;

#[tokio::test]
async fn get_survives_a_remote_time_inside_a_dst_gap() {
    std::env::set_var("TZ", "Europe/Oslo");
    let in_gap = parse_remote_timestamp("2024-03-31 02:30:00").unwrap();
    if Local.from_local_datetime(&in_gap).earliest().is_some() {
        eprintln!("Europe/Oslo zone data unavailable, skipping");
        return;
    }

    let tree = parse_schema_tree(SCHEMA, Path::new("gap.yaml")).unwrap();
    let mut source = FixtureRemoteSource::default();
    source.set_rows(
        "ejscript",
        json!([
            {"id": 1, "name": "gap", "folder": "f", "body": "a();", "updated": "2024-03-31 02:30:00"},
            {"id": 2, "name": "after", "folder": "f", "body": "b();", "updated": "2024-03-31 04:00:00"}
        ])
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row.as_object().cloned().unwrap())
        .collect(),
    );

    let dir = tempdir().unwrap();
    let files = FileTree::new(dir.path());
    let mut engine = SyncEngine::new(
        Mode::Get,
        EngineOptions::default(),
        files.clone(),
        Box::new(Arc::new(source)),
    );
    let summary = engine.run(&tree.record_types).await.unwrap();

    assert_eq!(summary.pulled, vec!["ejscript/f/gap/gap", "ejscript/f/after/after"]);
    let stamped = files
        .modified(&dir.path().join("ejscript/f/gap/gap.body.script"))
        .await
        .unwrap();
    assert_eq!(stamped, parse_remote_timestamp("2024-03-31 03:30:00"));
    assert!(dir.path().join("ejscript/f/after/after.json").exists());
}
