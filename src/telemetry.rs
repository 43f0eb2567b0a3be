//! Metric samples and the append-only sink they flow through.
//!
//! The sink never blocks the hot path: it is a bounded channel and samples
//! that do not fit are dropped with a counter. A background recorder
//! drains the channel into the `metric_samples` collection.

use crate::{
    clock::{Clock, IdSource},
    models::AgentKind,
    store::{collections, RecordStore},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Well-known metric names.
pub mod metric {
    pub const QUEUE_WAIT_MS: &str = "task.queue_wait_ms";
    pub const EXECUTION_MS: &str = "task.execution_ms";
    pub const RETRY: &str = "task.retry";
    pub const OUTCOME: &str = "task.outcome";
    pub const PROVIDER_FALLBACK: &str = "provider.fallback";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub agent_kind: Option<AgentKind>,
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Cheap cloneable handle for emitting samples.
#[derive(Clone)]
pub struct MetricSink {
    tx: mpsc::Sender<MetricSample>,
    dropped: Arc<AtomicU64>,
}

impl MetricSink {
    pub fn record(&self, sample: MetricSample) {
        if self.tx.try_send(sample).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// A sink wired to nothing, for construction paths that do not care
    /// about telemetry.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Drains the sink into the record store until shutdown.
pub struct MetricRecorder {
    rx: mpsc::Receiver<MetricSample>,
    store: Arc<dyn RecordStore>,
    ids: Arc<dyn IdSource>,
}

pub fn metric_channel(
    capacity: usize,
    store: Arc<dyn RecordStore>,
    ids: Arc<dyn IdSource>,
) -> (MetricSink, MetricRecorder) {
    let (tx, rx) = mpsc::channel(capacity);
    let sink = MetricSink {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let recorder = MetricRecorder { rx, store, ids };
    (sink, recorder)
}

impl MetricRecorder {
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("metric recorder started");
        loop {
            tokio::select! {
                sample = self.rx.recv() => {
                    let Some(sample) = sample else { break };
                    self.persist(sample).await;
                }
                _ = cancel.cancelled() => {
                    // Flush whatever is already buffered before exiting.
                    while let Ok(sample) = self.rx.try_recv() {
                        self.persist(sample).await;
                    }
                    break;
                }
            }
        }
        info!("metric recorder stopped");
    }

    async fn persist(&self, sample: MetricSample) {
        let id = self.ids.next_id();
        match serde_json::to_value(&sample) {
            Ok(value) => {
                if let Err(e) = self.store.put(collections::METRIC_SAMPLES, &id, value).await {
                    warn!("failed to persist metric sample: {e}");
                }
            }
            Err(e) => debug!("unencodable metric sample dropped: {e}"),
        }
    }
}

/// Helper for building samples without repeating the timestamp plumbing.
pub fn sample(
    clock: &dyn Clock,
    tenant_id: &str,
    agent_kind: Option<AgentKind>,
    name: &str,
    value: f64,
) -> MetricSample {
    MetricSample {
        timestamp: clock.now(),
        tenant_id: tenant_id.to_string(),
        agent_kind,
        name: name.to_string(),
        value,
        labels: HashMap::new(),
    }
}
