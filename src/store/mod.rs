//! Persistence port.
//!
//! A narrow record-store interface every other component goes through.
//! Single-record operations are atomic; multi-record operations are
//! best-effort and there are no cross-collection transactions. Queries
//! support equality and range clauses on the declared indexed fields of
//! each collection.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

/// Collection names for the persisted state layout.
pub mod collections {
    pub const TENANTS: &str = "tenants";
    pub const USERS: &str = "users";
    pub const SESSIONS: &str = "sessions";
    pub const TASKS: &str = "tasks";
    pub const COLLABORATIONS: &str = "collaborations";
    pub const AUDIT_EVENTS: &str = "audit_events";
    pub const METRIC_SAMPLES: &str = "metric_samples";
    pub const INSIGHT_REPORTS: &str = "insight_reports";
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    /// The record changed since it was last read; the caller's precondition
    /// no longer holds.
    #[error("update precondition failed")]
    Conflict,

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("fatal store failure: {0}")]
    Fatal(String),
}

impl From<StoreError> for crate::CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => crate::CoreError::not_found("record"),
            StoreError::Conflict => crate::CoreError::conflict("record changed concurrently"),
            StoreError::Transient(msg) => crate::CoreError::ServiceUnavailable(msg),
            StoreError::Fatal(msg) => crate::CoreError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

/// A stored record with its optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub value: Value,
    pub version: u64,
}

impl Record {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> StoreResult<T> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| StoreError::Fatal(format!("record decode failed: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    Eq(String, Value),
    Range {
        field: String,
        min: Option<Value>,
        max: Option<Value>,
    },
}

/// Conjunctive filter over record fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq(field.into(), value.into()));
        self
    }

    pub fn range(
        mut self,
        field: impl Into<String>,
        min: Option<Value>,
        max: Option<Value>,
    ) -> Self {
        self.clauses.push(Clause::Range {
            field: field.into(),
            min,
            max,
        });
        self
    }

    pub fn matches(&self, value: &Value) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Eq(field, expected) => value.get(field) == Some(expected),
            Clause::Range { field, min, max } => {
                let Some(actual) = value.get(field) else {
                    return false;
                };
                let above_min = min.as_ref().is_none_or(|m| cmp_values(actual, m) >= 0);
                let below_max = max.as_ref().is_none_or(|m| cmp_values(actual, m) <= 0);
                above_min && below_max
            }
        })
    }
}

/// Orders numbers numerically, RFC 3339 timestamps as instants (their
/// textual offsets vary), and everything else lexically on the JSON
/// string form.
fn cmp_values(a: &Value, b: &Value) -> i8 {
    let ord = match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => {
                match (
                    chrono::DateTime::parse_from_rfc3339(x),
                    chrono::DateTime::parse_from_rfc3339(y),
                ) {
                    (Ok(ta), Ok(tb)) => ta.cmp(&tb),
                    _ => x.cmp(y),
                }
            }
            _ => a.to_string().cmp(&b.to_string()),
        },
    };
    match ord {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Sort {
    #[default]
    Unsorted,
    Asc(String),
    Desc(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upsert a record, assigning or bumping its version.
    async fn put(&self, collection: &str, id: &str, value: Value) -> StoreResult<()>;

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Record>;

    async fn query(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Sort,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Record>>;

    /// Replace a record iff its version still equals `expected_version`.
    /// Fails with `Conflict` when the record changed since last read.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        value: Value,
    ) -> StoreResult<Record>;

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()>;

    /// Lazy sequence of matching records.
    async fn stream(&self, collection: &str, filter: Filter) -> BoxStream<'static, Record>;

    /// Startup reachability probe.
    async fn ping(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_matches_equality_and_range() {
        let record = json!({
            "tenant_id": "t-1",
            "state": "queued",
            "created_at": "2026-03-01T10:00:00Z",
            "attempts": 3,
        });

        assert!(Filter::new().eq("tenant_id", "t-1").matches(&record));
        assert!(!Filter::new().eq("tenant_id", "t-2").matches(&record));

        let in_window = Filter::new().range(
            "created_at",
            Some(json!("2026-03-01T00:00:00Z")),
            Some(json!("2026-03-02T00:00:00Z")),
        );
        assert!(in_window.matches(&record));

        let numeric = Filter::new().range("attempts", Some(json!(2)), None);
        assert!(numeric.matches(&record));
        let too_high = Filter::new().range("attempts", Some(json!(4)), None);
        assert!(!too_high.matches(&record));
    }

    #[test]
    fn filter_clauses_are_conjunctive() {
        let record = json!({"tenant_id": "t-1", "state": "queued"});
        let filter = Filter::new().eq("tenant_id", "t-1").eq("state", "running");
        assert!(!filter.matches(&record));
    }

    #[test]
    fn missing_range_field_never_matches() {
        let record = json!({"tenant_id": "t-1"});
        let filter = Filter::new().range("created_at", Some(json!("2026-01-01")), None);
        assert!(!filter.matches(&record));
    }
}
