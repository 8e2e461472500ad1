//! Result artifact parsing.
//!
//! Every probe leaves a YAML document behind:
//!
//! ```yaml
//! tests:
//!   - name: read
//!     passed: true
//!     message: "read 4 GiB in 3s"
//!   - name: write
//!     passed: false
//!     message: "write stalled"
//! ```
//!
//! Each record carries exactly `name`, `passed` and `message`. JSON is a
//! subset of YAML and is accepted as well.

use serde::Deserialize;

use crate::error::ArtifactError;
use crate::result::TestResult;

#[derive(Debug, Deserialize)]
struct ArtifactDocument {
    tests: Vec<TestResult>,
}

/// Parse and validate an artifact, preserving record order.
pub fn parse_artifact(bytes: &[u8]) -> Result<Vec<TestResult>, ArtifactError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(ArtifactError::Malformed("document is empty".to_string()));
    }

    let doc: ArtifactDocument =
        serde_yaml::from_slice(bytes).map_err(|e| ArtifactError::Malformed(e.to_string()))?;

    if let Some(index) = doc.tests.iter().position(|t| t.test.trim().is_empty()) {
        return Err(ArtifactError::EmptyTestName { index });
    }
    if doc.tests.is_empty() {
        return Err(ArtifactError::NoTests);
    }

    Ok(doc.tests)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_parse_two_records_in_order() {
        let doc = br#"
tests:
  - name: read
    passed: true
    message: "ok"
  - name: write
    passed: false
    message: ""
"#;
        let tests = parse_artifact(doc).unwrap();
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].test, "read");
        assert!(tests[0].passed);
        assert_eq!(tests[1].test, "write");
        assert!(!tests[1].passed);
        assert_eq!(tests[1].message, "");
    }

    #[test]
    fn test_capitalised_booleans_from_python_probes() {
        let doc = b"tests:\n  - name: ping\n    passed: True\n    message: pong\n";
        let tests = parse_artifact(doc).unwrap();
        assert!(tests[0].passed);
    }

    #[test]
    fn test_json_artifact() {
        let doc = br#"{"tests": [{"test": "ping", "passed": true, "message": "pong"}]}"#;
        let tests = parse_artifact(doc).unwrap();
        assert_eq!(tests[0].test, "ping");
    }

    #[test]
    fn test_empty_sequence_is_not_success() {
        assert_eq!(parse_artifact(b"tests: []\n"), Err(ArtifactError::NoTests));
    }

    #[test]
    fn test_empty_name_rejected() {
        let doc = b"tests:\n  - name: ok\n    passed: true\n    message: ''\n  - name: ' '\n    passed: true\n    message: ''\n";
        assert_eq!(
            parse_artifact(doc),
            Err(ArtifactError::EmptyTestName { index: 1 })
        );
    }

    #[rstest]
    #[case::empty(b"".as_slice())]
    #[case::not_yaml(b"tests: [".as_slice())]
    #[case::wrong_key(b"results:\n  - name: a\n    passed: true\n    message: ''\n".as_slice())]
    #[case::missing_passed(b"tests:\n  - name: a\n    message: ''\n".as_slice())]
    #[case::missing_message(b"tests:\n  - name: a\n    passed: true\n".as_slice())]
    #[case::string_flag(b"tests:\n  - name: a\n    passed: 'yes'\n    message: ''\n".as_slice())]
    #[case::extra_field(b"tests:\n  - name: a\n    passed: true\n    message: ''\n    score: 3\n".as_slice())]
    fn test_malformed_documents(#[case] doc: &[u8]) {
        let err = parse_artifact(doc).unwrap_err();
        assert!(matches!(err, ArtifactError::Malformed(_)), "got {err:?}");
    }
}
