use crate::json::parse_json_with_context;
use anyhow::Context;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::{Duration, Instant};

/// Format a `Duration` as a human-readable string with automatic unit scaling.
///
/// Produces output like `1.94ms`, `2.34s`, `150.00µs` using Rust's Debug format.
pub fn fmt_duration(d: Duration) -> String {
    format!("{d:.2?}")
}

/// Log a warning if the elapsed time since `start` exceeds `threshold`.
pub fn log_if_slow(start: Instant, threshold: Duration, label: &str) {
    let elapsed = start.elapsed();
    if elapsed > threshold {
        tracing::warn!(duration = fmt_duration(elapsed), "slow operation: {label}");
    }
}

/// Read and decode a JSON input file. `what` names the file in errors
/// ("records file", "alias seed file").
pub fn read_json_file<T: DeserializeOwned>(path: &Path, what: &str) -> anyhow::Result<T> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {what} {}", path.display()))?;
    parse_json_with_context(&body).with_context(|| format!("Invalid {what} {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::models::LocalRecord;

    #[test]
    fn reads_records_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, r#"[{"id": "r1", "title": "Ally McBeal", "episode_count": 112}]"#).unwrap();

        let records: Vec<LocalRecord> = read_json_file(&path, "records file").unwrap();
        assert_eq!(records[0].id, "r1");
        assert_eq!(records[0].episode_count, Some(112));
    }

    #[test]
    fn errors_name_the_file_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, r#"[{"id": "r1", "title": 7}]"#).unwrap();

        let err = read_json_file::<Vec<LocalRecord>>(&path, "records file").unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("Invalid records file"), "{message}");
        assert!(message.contains("[0].title"), "{message}");
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = read_json_file::<Vec<LocalRecord>>(Path::new("/nonexistent/records.json"), "records file")
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read records file"));
    }
}
