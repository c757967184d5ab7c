//! Runs the explain pipeline against a real SQLite index

use shirabe_core::{PartitionSettings, RequestPartitionId, ResourcePid};
use shirabe_explain::config::ExplainConfig;
use shirabe_explain::{explain, split_request};
use shirabe_store::{IndexWriter, LinkTarget};
use tempfile::TempDir;

fn config_in(dir: &TempDir) -> ExplainConfig {
    let mut config = ExplainConfig::default();
    config.storage.db_path = dir.path().join("index.sqlite");
    config
}

#[test]
fn test_explain_reports_sql_and_pids() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let writer = IndexWriter::open(&config.storage.db_path, PartitionSettings::default()).unwrap();
    let smith = writer.create_resource("Patient", "p1", None, 1_000).unwrap();
    writer.add_string(&smith, "family", "Smith").unwrap();
    let jones = writer.create_resource("Patient", "p2", None, 2_000).unwrap();
    writer.add_string(&jones, "family", "Jones").unwrap();

    let report = explain(&config, "Patient", "family=smi", RequestPartitionId::AllPartitions).unwrap();
    assert_eq!(report.pids, vec![smith.pid]);
    assert_eq!(report.statements.len(), 1);
    assert!(report.statements[0].sql.contains("hfj_spidx_string"));
    assert_eq!(report.executed.len(), 1);

    let rendered = report.to_string();
    assert!(rendered.starts_with("-- query 1 for Patient\nSELECT DISTINCT"));
    assert!(rendered.contains("--   ?1 = "));
    assert!(rendered.contains(&format!("-- 1 pid(s): [{}]", smith.pid.0)));
}

#[test]
fn test_explain_includes_follow_links() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let writer = IndexWriter::open(&config.storage.db_path, PartitionSettings::default()).unwrap();
    let patient = writer.create_resource("Patient", "p1", None, 1_000).unwrap();
    let observation = writer.create_resource("Observation", "o1", None, 1_000).unwrap();
    writer.add_token(&observation, "status", None, "final").unwrap();
    writer
        .add_link(&observation, "Observation.subject", &LinkTarget::Local(patient.clone()), 1_000)
        .unwrap();

    let report = explain(
        &config,
        "Observation",
        "status=final&_include=Observation:subject",
        RequestPartitionId::AllPartitions,
    )
    .unwrap();
    assert_eq!(report.pids, vec![observation.pid, patient.pid]);
    assert_eq!(report.executed.len(), 2);
}

#[test]
fn test_explain_rejects_unknown_parameter() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let err = explain(&config, "Patient", "shoe-size=42", RequestPartitionId::AllPartitions).unwrap_err();
    assert!(!err.is_internal());
}

#[test]
fn test_fresh_database_finds_nothing() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let report = explain(&config, "Patient", "", RequestPartitionId::Partition(3)).unwrap();
    assert_eq!(report.pids, Vec::<ResourcePid>::new());
}

#[test]
fn test_split_request() {
    assert_eq!(split_request("Patient?name=x", None), ("Patient", "name=x"));
    assert_eq!(split_request("/Patient", Some("?name=x")), ("Patient", "name=x"));
    assert_eq!(split_request("Patient", None), ("Patient", ""));
}
