//! Task payload validation and sanitisation.
//!
//! The submission path is the main untrusted-input boundary: free-text
//! objectives are length-bounded, screened against known injection
//! patterns, and HTML-escaped; structured input keys and values are
//! shape-checked.

use crate::{constants, models::TaskPayload, CoreError, Result};
use html_escape::encode_text;
use regex::Regex;

static BLOCKED_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "data:text/html",
    "union select",
    "drop table",
    "../",
    "..\\",
    "file://",
];

#[derive(Debug, Clone)]
pub struct PayloadValidator {
    input_key_regex: Regex,
}

impl PayloadValidator {
    pub fn new() -> Result<Self> {
        let input_key_regex = Regex::new(r"^[a-z0-9_.\-]{1,64}$")
            .map_err(|e| CoreError::Configuration(format!("invalid key pattern: {e}")))?;
        Ok(Self { input_key_regex })
    }

    /// Validate a payload and return a sanitised copy.
    pub fn validate(&self, payload: &TaskPayload) -> Result<TaskPayload> {
        let objective = payload.objective.trim();
        if objective.is_empty() {
            return Err(CoreError::validation("objective", "must not be empty"));
        }
        if objective.len() > constants::MAX_OBJECTIVE_LENGTH {
            return Err(CoreError::validation(
                "objective",
                format!(
                    "must be at most {} characters",
                    constants::MAX_OBJECTIVE_LENGTH
                ),
            ));
        }
        if objective.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
            return Err(CoreError::validation(
                "objective",
                "must not contain control characters",
            ));
        }
        let lowered = objective.to_lowercase();
        if BLOCKED_PATTERNS.iter().any(|p| lowered.contains(p)) {
            return Err(CoreError::validation(
                "objective",
                "contains a blocked pattern",
            ));
        }

        if payload.inputs.len() > constants::MAX_INPUT_FIELDS {
            return Err(CoreError::validation(
                "inputs",
                format!("at most {} fields", constants::MAX_INPUT_FIELDS),
            ));
        }
        for (key, value) in &payload.inputs {
            if key.len() > constants::MAX_INPUT_KEY_LENGTH || !self.input_key_regex.is_match(key) {
                return Err(CoreError::validation(
                    "inputs",
                    format!("invalid input key `{key}`"),
                ));
            }
            let encoded_len = value.to_string().len();
            if encoded_len > constants::MAX_INPUT_VALUE_BYTES {
                return Err(CoreError::validation(
                    "inputs",
                    format!("value for `{key}` exceeds {} bytes", constants::MAX_INPUT_VALUE_BYTES),
                ));
            }
        }

        Ok(TaskPayload {
            objective: encode_text(objective).to_string(),
            inputs: payload.inputs.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> PayloadValidator {
        PayloadValidator::new().unwrap()
    }

    #[test]
    fn plain_payload_passes_through() {
        let payload = TaskPayload::new("Qualify the Fenwick account")
            .with_input("company", json!("Fenwick Ltd"));
        let sanitised = validator().validate(&payload).unwrap();
        assert_eq!(sanitised.objective, "Qualify the Fenwick account");
    }

    #[test]
    fn empty_objective_is_rejected() {
        let err = validator().validate(&TaskPayload::new("  ")).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn script_patterns_are_rejected() {
        let err = validator()
            .validate(&TaskPayload::new("<script>alert(1)</script>"))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn html_is_escaped_not_stored_raw() {
        let sanitised = validator()
            .validate(&TaskPayload::new("compare a < b & b > c"))
            .unwrap();
        assert!(sanitised.objective.contains("&lt;"));
        assert!(!sanitised.objective.contains('<'));
    }

    #[test]
    fn shouty_input_keys_are_rejected() {
        let payload = TaskPayload::new("ok objective").with_input("BAD KEY", json!(1));
        let err = validator().validate(&payload).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }
}
