use crate::{
    clock::{Clock, IdSource},
    store::{collections, Filter, RecordStore, Sort},
    Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
    Failure,
}

/// Immutable record of a privileged action. Append-only; nothing in the
/// crate mutates one after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub tenant_id: String,
    pub actor: String,
    pub action: String,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, ids: Arc<dyn IdSource>) -> Self {
        Self { store, clock, ids }
    }

    /// Record an event. Callers emit before returning success from the
    /// mutation they are auditing; a failed append is logged but does not
    /// roll the mutation back.
    pub async fn emit(
        &self,
        tenant_id: &str,
        actor: &str,
        action: &str,
        subject: &str,
        outcome: AuditOutcome,
        detail: Option<String>,
    ) {
        let event = AuditEvent {
            id: self.ids.next_id(),
            tenant_id: tenant_id.to_string(),
            actor: actor.to_string(),
            action: action.to_string(),
            subject: subject.to_string(),
            timestamp: self.clock.now(),
            outcome,
            detail,
        };

        match serde_json::to_value(&event) {
            Ok(value) => {
                if let Err(e) = self.store.put(collections::AUDIT_EVENTS, &event.id, value).await {
                    warn!(action = %event.action, "failed to append audit event: {e}");
                }
            }
            Err(e) => warn!("unencodable audit event: {e}"),
        }
    }

    pub async fn events_for_tenant(&self, tenant_id: &str) -> Result<Vec<AuditEvent>> {
        let records = self
            .store
            .query(
                collections::AUDIT_EVENTS,
                &Filter::new().eq("tenant_id", tenant_id),
                Sort::Asc("timestamp".into()),
                None,
            )
            .await?;
        records.iter().map(|r| Ok(r.decode()?)).collect()
    }
}
