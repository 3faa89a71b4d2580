use std::collections::BTreeMap;
use std::path::Path;

use chrono::{TimeZone, Utc};
use tagsync_core::Record;
use tagsync_rules::{RuleEngine, RuleError, YamlRuleEngine};

fn workspace_root() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/../.."))
}

#[test]
fn shipped_rule_table_loads_and_classifies() {
    let engine = YamlRuleEngine::from_workspace_root(workspace_root()).unwrap();

    let mut record = Record::new("opp-1", "contact-1", Utc.timestamp_opt(0, 0).single().unwrap());
    record.fields = BTreeMap::from([(
        "How did you hear about us?".to_string(),
        "I was directly contacted by a recruiter".to_string(),
    )]);

    let labels = engine.derive_labels(&record).unwrap();
    assert!(labels.contains("🤖 self-reported source: Sourced"));
    assert!(labels.is_subset(&engine.owned_labels()));
    assert!(engine.summarises_feedback());
}

#[test]
fn missing_rules_dir_reports_the_path() {
    let dir = tempfile::tempdir().unwrap();
    match YamlRuleEngine::from_workspace_root(dir.path()) {
        Err(RuleError::Io { path, .. }) => assert!(path.ends_with("rules/classification.yaml")),
        other => panic!("expected io error, got {other:?}"),
    }
}

#[test]
fn malformed_yaml_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("rules")).unwrap();
    std::fs::write(
        dir.path().join("rules/classification.yaml"),
        "version: [not a number",
    )
    .unwrap();

    assert!(matches!(
        YamlRuleEngine::from_workspace_root(dir.path()),
        Err(RuleError::Parse { .. })
    ));
}
