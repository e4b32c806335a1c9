//! Loading analysis configuration from disk.

use std::io::Write;

use isil::config::{CfgConfig, LoweringConfig};
use isil::{AnalysisConfig, IsilError};
use tempfile::NamedTempFile;

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn loads_partial_file_over_defaults() {
    let file = write_config(
        r#"{
            "parallel": false,
            "cfg": { "max_blocks": 64, "calls_end_blocks": true },
            "lowering": { "emit_nops": true }
        }"#,
    );
    let config = AnalysisConfig::from_path(file.path()).unwrap();
    assert!(!config.parallel);
    assert_eq!(config.cfg.max_blocks, 64);
    assert!(config.cfg.calls_end_blocks);
    assert_eq!(config.cfg.max_instructions, CfgConfig::default().max_instructions);
    assert!(config.lowering.emit_nops);
    assert_eq!(
        config.lowering.expand_tail_calls,
        LoweringConfig::default().expand_tail_calls
    );
    assert_eq!(config.extraction, AnalysisConfig::default().extraction);
}

#[test]
fn empty_object_is_the_default() {
    let file = write_config("{}");
    assert_eq!(
        AnalysisConfig::from_path(file.path()).unwrap(),
        AnalysisConfig::default()
    );
}

#[test]
fn saved_config_loads_back() {
    let mut config = AnalysisConfig::default();
    config.extraction.scan_limit = 4096;
    config.lowering.tag_key_function_calls = false;
    let file = write_config(&config.to_json_string().unwrap());
    assert_eq!(AnalysisConfig::from_path(file.path()).unwrap(), config);
}

#[test]
fn invalid_values_are_rejected_on_load() {
    let file = write_config(r#"{ "extraction": { "max_body_size": 0 } }"#);
    let err = AnalysisConfig::from_path(file.path()).unwrap_err();
    assert!(matches!(err, IsilError::InvalidConfig(_)));
}

#[test]
fn malformed_json_is_a_serialization_error() {
    let file = write_config("{ not json");
    let err = AnalysisConfig::from_path(file.path()).unwrap_err();
    assert!(matches!(err, IsilError::Serialization(_)));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = AnalysisConfig::from_path(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, IsilError::Io(_)));
}
