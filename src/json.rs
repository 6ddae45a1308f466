//! JSON decoding with readable failure messages for catalog payloads and
//! input files.

use serde::de::DeserializeOwned;

/// A JSON document that did not match the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}{detail} (line {line} col {column})\n{snippet}", path_prefix(.path))]
pub struct JsonDecodeError {
    /// serde path to the offending value, e.g. `[2].network`.
    pub path: String,
    pub detail: String,
    pub line: usize,
    pub column: usize,
    /// The offending line around the error, with a caret under it.
    pub snippet: String,
}

fn path_prefix(path: &str) -> String {
    if path.is_empty() || path == "." {
        String::new()
    } else {
        format!("at path '{path}': ")
    }
}

/// Deserialize `body`, reporting the serde path, a cleaned-up type mismatch
/// and a snippet of the failing line on error.
pub fn parse_json_with_context<T: DeserializeOwned>(body: &str) -> Result<T, JsonDecodeError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(|err| {
        let inner = err.inner();
        let (line, column) = (inner.line(), inner.column());

        let msg = inner.to_string();
        let loc = format!(" at line {line} column {column}");
        let msg = msg.strip_suffix(&loc).unwrap_or(&msg);

        JsonDecodeError {
            path: err.path().to_string(),
            detail: describe_mismatch(msg),
            line,
            column,
            snippet: snippet(body, line, column, 20),
        }
    })
}

/// Rewrite "invalid type: null, expected a string" as
/// "expected a string, got null". Other messages pass through.
fn describe_mismatch(msg: &str) -> String {
    if let Some(rest) = msg.strip_prefix("invalid type: ")
        && let Some((actual, expected)) = rest.split_once(", expected ")
    {
        return format!("expected {expected}, got {actual}");
    }
    msg.to_string()
}

fn snippet(body: &str, line: usize, column: usize, width: usize) -> String {
    let target = body.lines().nth(line.saturating_sub(1)).unwrap_or("");
    if target.trim().is_empty() {
        return "(empty line)".to_string();
    }

    // serde_json columns are 1-based byte offsets.
    let mut at = column.saturating_sub(1).min(target.len());
    while !target.is_char_boundary(at) {
        at -= 1;
    }
    let mut start = at.saturating_sub(width / 2);
    while !target.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (at + width / 2).min(target.len());
    while !target.is_char_boundary(end) {
        end += 1;
    }

    let caret = " ".repeat(target[start..at].chars().count()) + "^";
    format!("...{}...\n   {caret}", &target[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::models::MatchCandidate;
    use serde::Deserialize;

    #[test]
    fn mismatch_is_reworded() {
        assert_eq!(
            describe_mismatch("invalid type: null, expected a string"),
            "expected a string, got null"
        );
        assert_eq!(describe_mismatch("expected value"), "expected value");
    }

    #[test]
    fn error_names_the_path() {
        #[derive(Debug, Deserialize)]
        struct Named {
            #[allow(dead_code)]
            name: String,
        }

        let err = parse_json_with_context::<Named>(r#"{"name": null}"#).unwrap_err();
        assert_eq!(err.path, "name");
        assert_eq!(err.detail, "expected a string, got null");
        assert!(err.to_string().starts_with("at path 'name': "));
    }

    #[test]
    fn nested_candidate_error() {
        let body = r#"[
            {"external_id": "a", "name": "Ally McBeal"},
            {"external_id": "b", "name": null}
        ]"#;

        let err = parse_json_with_context::<Vec<MatchCandidate>>(body).unwrap_err();
        assert_eq!(err.path, "[1].name");
        assert_eq!(err.line, 3);
        assert!(err.snippet.contains('^'));
    }

    #[test]
    fn snippet_respects_multibyte_text() {
        let body = r#"{"name": "Amélie", "episodes": "ten"}"#;

        #[derive(Debug, Deserialize)]
        struct Show {
            #[allow(dead_code)]
            name: String,
            #[allow(dead_code)]
            episodes: u32,
        }

        let err = parse_json_with_context::<Show>(body).unwrap_err();
        assert_eq!(err.path, "episodes");
        assert!(err.snippet.starts_with("..."));
    }

    #[test]
    fn valid_document_parses() {
        let parsed: Vec<u32> = parse_json_with_context("[1, 2, 3]").unwrap();
        assert_eq!(parsed, vec![1, 2, 3]);
    }
}
