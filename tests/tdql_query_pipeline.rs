//! End-to-end TDQL: parse a statement, build an `AggregationContext`, and
//! run it against tsfile-format fixtures on disk through both source
//! kinds (C9-C11 wired together).

use skvoz_core::aggregate::{engine::run_query, AggregatorEngine, FileSource, TsFileSource};
use skvoz_core::tdql::Value;
use std::fs;
use tempfile::TempDir;

fn write_tsfile(dir: &std::path::Path, name: &str, lines: &[&str]) {
    let path = dir.join(name);
    fs::write(path, lines.join("\n") + "\n").unwrap();
}

#[test]
fn query_over_file_source_splits_and_filters() {
    let dir = TempDir::new().unwrap();
    write_tsfile(
        dir.path(),
        "cpu.tsv",
        &["100 us:0.5", "200 eu:0.9", "300 us:0.2"],
    );
    let pattern = dir.path().join("*.tsv").to_string_lossy().to_string();

    let mut engine = AggregatorEngine::default();
    engine.add_source("file", Box::new(FileSource));

    let query = format!(
        "FROM FILES '{pattern}' AS samples SPLIT region, value ON ':' WHERE value > 0.3 STORE avg(value) AS average"
    );
    let results = run_query(&engine, &query).unwrap();
    assert_eq!(results.len(), 1);
    let (group, rows) = &results[0];
    assert!(group.is_none());
    assert_eq!(rows.len(), 1);
    match rows[0].get("average").unwrap() {
        Value::Number(n) => assert!((*n - 0.7).abs() < 1e-9),
        other => panic!("expected a number, got {other:?}"),
    }
}

#[test]
fn query_over_tsfile_source_groups_by_key() {
    let dir = TempDir::new().unwrap();
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let handle = tokio::runtime::Handle::current();
        let mut host_a = skvoz_core::tsfile::Writer::open(dir.path(), "host_a/cpu", 1 << 20, 1 << 20, handle.clone()).unwrap();
        host_a.write(100, "0.4").unwrap();
        host_a.write(200, "0.6").unwrap();
        let mut host_b = skvoz_core::tsfile::Writer::open(dir.path(), "host_b/cpu", 1 << 20, 1 << 20, handle).unwrap();
        host_b.write(150, "0.1").unwrap();
    });

    let mut engine = AggregatorEngine::default();
    engine.add_source("tsfile", Box::new(TsFileSource::new(dir.path().to_path_buf())));

    let query =
        "FROM TSFILE '^host_a/cpu$' AS a, '^host_b/cpu$' AS b SPLIT data STORE sum(data) AS total GROUP BY key";
    let results = run_query(&engine, query).unwrap();
    assert_eq!(results.len(), 2);
}

#[test]
fn malformed_query_is_rejected_before_touching_disk() {
    let engine = AggregatorEngine::default();
    let err = run_query(&engine, "SPLIT a, b").unwrap_err();
    assert!(err.to_string().contains("FROM"));
}
