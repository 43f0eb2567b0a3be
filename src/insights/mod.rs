//! Insights engine.
//!
//! Folds metric samples and task records into per-tenant performance
//! summaries, anomaly flags, and advisory recommendations. Everything
//! here is read-compute-store; the engine never acts on its own output.

use crate::{
    clock::{Clock, IdSource},
    models::{AgentKind, FailureClass, Task, TaskState},
    store::{collections, Filter, RecordStore, Sort},
    telemetry::{metric, MetricSample},
    Result,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

/// Execution-time threshold above which caching is suggested.
const HIGH_P95_MS: f64 = 5_000.0;
/// Transient-failure ratio above which capacity is suggested.
const TRANSIENT_FAILURE_RATIO: f64 = 0.2;
/// Fallback-per-task ratio above which a provider check is suggested.
const FALLBACK_RATIO: f64 = 0.3;
/// Deviations below this many sigmas are not anomalies.
const ANOMALY_SIGMA: f64 = 2.0;
/// Failure-rate ratio treated as anomalous on its own.
const FAILURE_RATE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub kind: AgentKind,
    pub task_count: usize,
    pub succeeded: usize,
    pub success_rate: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub tenant_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub agents: Vec<AgentPerformance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub metric: String,
    pub agent_kind: Option<AgentKind>,
    pub observed: f64,
    pub baseline_mean: f64,
    pub deviation_sigmas: f64,
    pub severity: Severity,
    /// In [0, 1]; grows with the number of samples behind the baseline.
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    EnableCaching,
    AddCapacity,
    CheckProvider,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub agent_kind: Option<AgentKind>,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightReport {
    pub id: String,
    pub tenant_id: String,
    pub generated_at: DateTime<Utc>,
    pub window_secs: i64,
    pub summary: PerformanceSummary,
    pub anomalies: Vec<Anomaly>,
    pub recommendations: Vec<Recommendation>,
}

pub struct InsightsEngine {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

fn mean_and_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

fn severity_for_sigmas(sigmas: f64) -> Severity {
    if sigmas >= 6.0 {
        Severity::Critical
    } else if sigmas >= 4.0 {
        Severity::High
    } else if sigmas >= 3.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

impl InsightsEngine {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, ids: Arc<dyn IdSource>) -> Self {
        Self { store, clock, ids }
    }

    async fn samples_in_window(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        let records = self
            .store
            .query(
                collections::METRIC_SAMPLES,
                &Filter::new().eq("tenant_id", tenant_id).range(
                    "timestamp",
                    Some(serde_json::json!(start.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))),
                    Some(serde_json::json!(end.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))),
                ),
                Sort::Asc("timestamp".into()),
                None,
            )
            .await?;
        Ok(records.iter().filter_map(|r| r.decode().ok()).collect())
    }

    async fn tasks_in_window(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let records = self
            .store
            .query(
                collections::TASKS,
                &Filter::new().eq("tenant_id", tenant_id).range(
                    "created_at",
                    Some(serde_json::json!(start.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))),
                    None,
                ),
                Sort::Asc("created_at".into()),
                None,
            )
            .await?;
        Ok(records.iter().filter_map(|r| r.decode().ok()).collect())
    }

    pub async fn summarize(
        &self,
        tenant_id: &str,
        window: Duration,
    ) -> Result<PerformanceSummary> {
        let end = self.clock.now();
        let start = end - window;
        let samples = self.samples_in_window(tenant_id, start, end).await?;
        let tasks = self.tasks_in_window(tenant_id, start).await?;

        let mut latencies: HashMap<AgentKind, Vec<f64>> = HashMap::new();
        for sample in &samples {
            if sample.name == metric::EXECUTION_MS {
                if let Some(kind) = sample.agent_kind {
                    latencies.entry(kind).or_default().push(sample.value);
                }
            }
        }

        let mut agents = Vec::new();
        for kind in AgentKind::ALL {
            let kind_tasks: Vec<&Task> =
                tasks.iter().filter(|t| t.agent_kind == kind).collect();
            let terminal: Vec<&&Task> = kind_tasks.iter().filter(|t| t.is_terminal()).collect();
            let succeeded = terminal
                .iter()
                .filter(|t| t.state == TaskState::Succeeded)
                .count();
            if kind_tasks.is_empty() && !latencies.contains_key(&kind) {
                continue;
            }

            let mut sorted = latencies.remove(&kind).unwrap_or_default();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            agents.push(AgentPerformance {
                kind,
                task_count: kind_tasks.len(),
                succeeded,
                success_rate: if terminal.is_empty() {
                    0.0
                } else {
                    succeeded as f64 / terminal.len() as f64
                },
                p50_latency_ms: percentile(&sorted, 0.50),
                p95_latency_ms: percentile(&sorted, 0.95),
            });
        }

        Ok(PerformanceSummary {
            tenant_id: tenant_id.to_string(),
            window_start: start,
            window_end: end,
            agents,
        })
    }

    /// Flag metrics deviating from their rolling mean and failure rates
    /// over the categorical threshold.
    pub async fn detect_anomalies(
        &self,
        tenant_id: &str,
        window: Duration,
    ) -> Result<Vec<Anomaly>> {
        let end = self.clock.now();
        let start = end - window;
        let samples = self.samples_in_window(tenant_id, start, end).await?;
        let tasks = self.tasks_in_window(tenant_id, start).await?;
        let mut anomalies = Vec::new();

        // Numeric deviation: compare the most recent quarter of each
        // (metric, agent) series against the rolling baseline before it.
        let mut series: HashMap<(String, Option<AgentKind>), Vec<f64>> = HashMap::new();
        for sample in &samples {
            if sample.name == metric::EXECUTION_MS || sample.name == metric::QUEUE_WAIT_MS {
                series
                    .entry((sample.name.clone(), sample.agent_kind))
                    .or_default()
                    .push(sample.value);
            }
        }
        for ((name, kind), values) in series {
            if values.len() < 8 {
                continue;
            }
            let split = values.len() * 3 / 4;
            let (baseline, recent) = values.split_at(split);
            let (mean, stddev) = mean_and_stddev(baseline);
            let (recent_mean, _) = mean_and_stddev(recent);
            if stddev <= f64::EPSILON {
                continue;
            }
            let sigmas = (recent_mean - mean).abs() / stddev;
            if sigmas >= ANOMALY_SIGMA {
                anomalies.push(Anomaly {
                    metric: name,
                    agent_kind: kind,
                    observed: recent_mean,
                    baseline_mean: mean,
                    deviation_sigmas: sigmas,
                    severity: severity_for_sigmas(sigmas),
                    confidence: (baseline.len() as f64 / 30.0).min(1.0),
                    detected_at: end,
                });
            }
        }

        // Categorical ratio: per-agent failure rate.
        for kind in AgentKind::ALL {
            let terminal: Vec<&Task> = tasks
                .iter()
                .filter(|t| t.agent_kind == kind && t.is_terminal())
                .collect();
            if terminal.len() < 4 {
                continue;
            }
            let failed = terminal
                .iter()
                .filter(|t| t.state == TaskState::Failed)
                .count();
            let rate = failed as f64 / terminal.len() as f64;
            if rate >= FAILURE_RATE_THRESHOLD {
                anomalies.push(Anomaly {
                    metric: "task.failure_rate".to_string(),
                    agent_kind: Some(kind),
                    observed: rate,
                    baseline_mean: 0.0,
                    deviation_sigmas: 0.0,
                    severity: if rate >= 0.9 {
                        Severity::Critical
                    } else if rate >= 0.75 {
                        Severity::High
                    } else {
                        Severity::Medium
                    },
                    confidence: (terminal.len() as f64 / 30.0).min(1.0),
                    detected_at: end,
                });
            }
        }

        anomalies.sort_by(|a, b| b.severity.cmp(&a.severity));
        Ok(anomalies)
    }

    /// Pattern-derived advisory recommendations. The engine never acts.
    fn recommend(
        summary: &PerformanceSummary,
        samples: &[MetricSample],
        tasks: &[Task],
    ) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();

        for agent in &summary.agents {
            if agent.p95_latency_ms > HIGH_P95_MS {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::EnableCaching,
                    agent_kind: Some(agent.kind),
                    rationale: format!(
                        "p95 latency {:.0}ms exceeds {HIGH_P95_MS:.0}ms; memoise repeated prompts",
                        agent.p95_latency_ms
                    ),
                });
            }
        }

        let terminal = tasks.iter().filter(|t| t.is_terminal()).count();
        let transient_failures = tasks
            .iter()
            .filter(|t| {
                t.state == TaskState::Failed
                    && t.error
                        .as_ref()
                        .map(|e| e.class == FailureClass::Transient)
                        .unwrap_or(false)
            })
            .count();
        if terminal > 0 && transient_failures as f64 / terminal as f64 > TRANSIENT_FAILURE_RATIO {
            recommendations.push(Recommendation {
                kind: RecommendationKind::AddCapacity,
                agent_kind: None,
                rationale: format!(
                    "{transient_failures} of {terminal} terminal tasks failed transiently; provider capacity looks short"
                ),
            });
        }

        let fallbacks = samples
            .iter()
            .filter(|s| s.name == metric::PROVIDER_FALLBACK)
            .count();
        if terminal > 0 && fallbacks as f64 / terminal as f64 > FALLBACK_RATIO {
            recommendations.push(Recommendation {
                kind: RecommendationKind::CheckProvider,
                agent_kind: None,
                rationale: format!(
                    "{fallbacks} provider fallbacks across {terminal} tasks; check primary provider health"
                ),
            });
        }

        recommendations
    }

    /// Full analysis pass; the report is stored and retrievable later.
    pub async fn analyze(&self, tenant_id: &str, window: Duration) -> Result<InsightReport> {
        let end = self.clock.now();
        let start = end - window;
        let summary = self.summarize(tenant_id, window).await?;
        let anomalies = self.detect_anomalies(tenant_id, window).await?;
        let samples = self.samples_in_window(tenant_id, start, end).await?;
        let tasks = self.tasks_in_window(tenant_id, start).await?;
        let recommendations = Self::recommend(&summary, &samples, &tasks);

        let report = InsightReport {
            id: self.ids.next_id(),
            tenant_id: tenant_id.to_string(),
            generated_at: end,
            window_secs: window.num_seconds(),
            summary,
            anomalies,
            recommendations,
        };
        self.store
            .put(
                collections::INSIGHT_REPORTS,
                &report.id,
                serde_json::to_value(&report)?,
            )
            .await?;
        debug!(tenant = %tenant_id, report = %report.id, "insight report stored");
        Ok(report)
    }

    pub async fn latest_report(&self, tenant_id: &str) -> Result<Option<InsightReport>> {
        let records = self
            .store
            .query(
                collections::INSIGHT_REPORTS,
                &Filter::new().eq("tenant_id", tenant_id),
                Sort::Desc("generated_at".into()),
                Some(1),
            )
            .await?;
        records.first().map(|r| Ok(r.decode()?)).transpose()
    }
}
