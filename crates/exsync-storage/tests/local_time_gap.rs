//! Runs in its own test binary: the local time zone is process-wide.

use chrono::{Local, NaiveDateTime, TimeZone};
use exsync_storage::FileTree;
use tempfile::tempdir;

fn ts(text: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").expect("ts")
}

#[tokio::test]
async fn stamping_inside_a_dst_gap_lands_past_the_gap() {
    std::env::set_var("TZ", "Europe/Oslo");
    let in_gap = ts("2024-03-31 02:30:00");
    if Local.from_local_datetime(&in_gap).earliest().is_some() {
        eprintln!("Europe/Oslo zone data unavailable, skipping");
        return;
    }

    let dir = tempdir().expect("tempdir");
    let tree = FileTree::new(dir.path());
    let path = tree.absolute("ejscript/f/n/n.json");
    tree.write_atomic(&path, b"{}").await.unwrap();

    tree.stamp_mtime(&path, in_gap).unwrap();
    assert_eq!(
        tree.modified(&path).await.unwrap(),
        Some(ts("2024-03-31 03:30:00"))
    );

    tree.stamp_mtime(&path, ts("2024-03-31 04:00:00")).unwrap();
    assert_eq!(
        tree.modified(&path).await.unwrap(),
        Some(ts("2024-03-31 04:00:00"))
    );
}
