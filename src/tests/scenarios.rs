//! End-to-end scenarios over the assembled platform.

use super::helpers::*;
use crate::{
    access::Role,
    agents::ControlOp,
    models::{AgentKind, Priority, TaskPayload, TaskState},
    providers::{Capability, LocalTemplateProvider, ModelProvider, ModelRegistry},
    store::{collections, Filter, RecordStore, Sort},
    telemetry::metric,
    tenancy::SubscriptionTier,
    CoreError,
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tower::ServiceExt;

fn sales_payload() -> TaskPayload {
    TaskPayload::new("Qualify the Fenwick account").with_input("operation", json!("qualify_lead"))
}

async fn wait_for_terminal(
    platform: &Platform,
    tenant_id: &str,
    task_id: &str,
) -> crate::models::Task {
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let task = platform
            .orchestrator
            .get_task(tenant_id, task_id)
            .await
            .unwrap();
        if task.is_terminal() {
            return task;
        }
    }
    panic!("task {task_id} never reached a terminal state");
}

#[tokio::test]
async fn tenant_isolation_hides_foreign_tasks() {
    let platform = platform().await;
    let tenant_a = platform.seed_tenant("alpha.example", SubscriptionTier::Professional).await;
    let tenant_b = platform.seed_tenant("beta.example", SubscriptionTier::Professional).await;
    let admin_b = platform
        .seed_user(&tenant_b, "admin@beta.example", Role::TenantAdmin)
        .await;

    // Keep the task parked in the queue so its record is stable.
    platform
        .orchestrator
        .control(&tenant_a.id, AgentKind::Sales, ControlOp::Pause)
        .await
        .unwrap();
    let task = platform
        .orchestrator
        .submit_task(&tenant_a, "user-a", AgentKind::Sales, sales_payload(), Priority::Normal, None)
        .await
        .unwrap();

    // Tenant B's admin cannot observe it, even with task.view.any.
    let response = platform
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/tasks/{}", task.id))
                .header("authorization", format!("Bearer {admin_b}"))
                .header("x-tenant", &tenant_b.id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // The owner still sees it.
    let found = platform
        .orchestrator
        .get_task(&tenant_a.id, &task.id)
        .await
        .unwrap();
    assert_eq!(found.id, task.id);
}

#[tokio::test]
async fn provider_fallback_degrades_and_records_the_hop() {
    let registry = ModelRegistry::new(
        vec![
            model_entry(
                "primary",
                "down",
                &[Capability::Text, Capability::Reasoning],
            ),
            model_entry(
                "secondary",
                "local",
                &[Capability::Text, Capability::Reasoning],
            ),
        ],
        vec![
            Arc::new(DownProvider::new("down")) as Arc<dyn ModelProvider>,
            Arc::new(LocalTemplateProvider::new("local")),
        ],
        "secondary",
    )
    .unwrap();
    let platform = platform_with_registry(registry).await;
    let tenant = platform.seed_tenant("acme.example", SubscriptionTier::Professional).await;

    let task = platform
        .orchestrator
        .submit_task(&tenant, "u-1", AgentKind::Sales, sales_payload(), Priority::Normal, None)
        .await
        .unwrap();

    let done = wait_for_terminal(&platform, &tenant.id, &task.id).await;
    assert_eq!(done.state, TaskState::Succeeded);
    assert_eq!(done.result.unwrap().model_used, "secondary");

    // Exactly one fallback sample labelled with the hop.
    let mut samples = Vec::new();
    for _ in 0..100 {
        samples = platform
            .store
            .query(
                collections::METRIC_SAMPLES,
                &Filter::new()
                    .eq("tenant_id", tenant.id.clone())
                    .eq("name", metric::PROVIDER_FALLBACK),
                Sort::Unsorted,
                None,
            )
            .await
            .unwrap();
        if !samples.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value["labels"]["from"], "primary");
    assert_eq!(samples[0].value["labels"]["to"], "secondary");
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_with_backoff_then_succeed() {
    let flaky = Arc::new(FlakyProvider::new("flaky", 2));
    let registry = ModelRegistry::new(
        vec![model_entry(
            "flaky-model",
            "flaky",
            &[Capability::Text, Capability::Reasoning],
        )],
        vec![flaky.clone() as Arc<dyn ModelProvider>],
        "flaky-model",
    )
    .unwrap();
    let platform = platform_with_registry(registry).await;
    let tenant = platform.seed_tenant("acme.example", SubscriptionTier::Professional).await;

    let started = tokio::time::Instant::now();
    let task = platform
        .orchestrator
        .submit_task(&tenant, "u-1", AgentKind::Sales, sales_payload(), Priority::Normal, None)
        .await
        .unwrap();

    // Walk the retry chain until some descendant succeeds.
    let mut final_task = None;
    for _ in 0..400 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let tasks = platform
            .orchestrator
            .records()
            .list(&tenant.id, Some(AgentKind::Sales), Some(TaskState::Succeeded), None)
            .await
            .unwrap();
        if let Some(task) = tasks.into_iter().next() {
            final_task = Some(task);
            break;
        }
    }
    let final_task = final_task.expect("retry chain never succeeded");
    let elapsed = started.elapsed();

    assert_eq!(final_task.attempt_count, 3);
    assert_eq!(flaky.invocations.load(std::sync::atomic::Ordering::SeqCst), 3);

    // Two backoff waits (500ms, 1000ms) minus the 20% jitter allowance.
    assert!(
        elapsed >= Duration::from_millis(1200),
        "retries settled too fast: {elapsed:?}"
    );

    // The chain is linked through parent ids back to the original task.
    let middle_id = final_task.parent_id.expect("second attempt recorded");
    let middle = platform
        .orchestrator
        .get_task(&tenant.id, &middle_id)
        .await
        .unwrap();
    assert_eq!(middle.state, TaskState::Failed);
    assert_eq!(middle.parent_id.as_deref(), Some(task.id.as_str()));
}

#[tokio::test]
async fn collaboration_with_mixed_outcomes_reports_partial_over_http() {
    let platform = platform().await;
    let tenant = platform.seed_tenant("acme.example", SubscriptionTier::Professional).await;
    let admin = platform
        .seed_user(&tenant, "admin@acme.example", Role::TenantAdmin)
        .await;

    for kind in [AgentKind::Content, AgentKind::Analytics] {
        platform
            .orchestrator
            .control(&tenant.id, kind, ControlOp::Pause)
            .await
            .unwrap();
    }

    let collaboration = platform
        .coordinator
        .initiate(
            &tenant,
            "u-1",
            vec![AgentKind::Content, AgentKind::Analytics],
            "quarterly report".to_string(),
        )
        .await
        .unwrap();
    let ok_task = platform
        .coordinator
        .add_step(
            &tenant,
            &collaboration.id,
            AgentKind::Content,
            TaskPayload::new("draft summary").with_input("format", json!("email")),
            "u-1",
        )
        .await
        .unwrap();
    let bad_task = platform
        .coordinator
        .add_step(
            &tenant,
            &collaboration.id,
            AgentKind::Analytics,
            TaskPayload::new("crunch numbers"),
            "u-1",
        )
        .await
        .unwrap();

    let records = platform.orchestrator.records();
    records.transition(&ok_task.id, TaskState::Running, |_| {}).await.unwrap();
    records.transition(&ok_task.id, TaskState::Succeeded, |_| {}).await.unwrap();
    records.transition(&bad_task.id, TaskState::Running, |_| {}).await.unwrap();
    records
        .transition(&bad_task.id, TaskState::Failed, |t| {
            t.error = Some(crate::models::TaskFailure {
                class: crate::models::FailureClass::Permanent,
                message: "series missing".to_string(),
                failed_at: chrono::Utc::now(),
            });
        })
        .await
        .unwrap();

    let response = platform
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/collaborations/{}", collaboration.id))
                .header("authorization", format!("Bearer {admin}"))
                .header("x-tenant", &tenant.id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "partial");
}

#[tokio::test]
async fn daily_quota_boundary_is_exact() {
    let platform = platform().await;
    let tenant = platform.seed_tenant("acme.example", SubscriptionTier::Starter).await;
    platform
        .orchestrator
        .control(&tenant.id, AgentKind::Sales, ControlOp::Pause)
        .await
        .unwrap();

    let limit = SubscriptionTier::Starter.quotas().tasks_per_day;
    platform
        .orchestrator
        .set_daily_count(&tenant.id, limit - 1)
        .await;

    // Submission number `limit` succeeds.
    platform
        .orchestrator
        .submit_task(&tenant, "u-1", AgentKind::Sales, sales_payload(), Priority::Normal, None)
        .await
        .unwrap();

    // The next one in the same window is rejected with the dimension and
    // a retry-after hint.
    let err = platform
        .orchestrator
        .submit_task(&tenant, "u-1", AgentKind::Sales, sales_payload(), Priority::Normal, None)
        .await
        .unwrap_err();
    match err {
        CoreError::QuotaExceeded {
            dimension,
            retry_after_secs,
        } => {
            assert_eq!(dimension, "tasks_per_day");
            assert!(retry_after_secs > 0);
        }
        other => panic!("expected quota error, got {other:?}"),
    }
}

#[tokio::test]
async fn insights_reflect_executed_work() {
    let platform = platform().await;
    let tenant = platform.seed_tenant("acme.example", SubscriptionTier::Professional).await;

    let mut last = None;
    for i in 0..3 {
        let task = platform
            .orchestrator
            .submit_task(
                &tenant,
                "u-1",
                AgentKind::Sales,
                TaskPayload::new(format!("Qualify account {i}"))
                    .with_input("operation", json!("qualify_lead")),
                Priority::Normal,
                None,
            )
            .await
            .unwrap();
        last = Some(task.id);
    }
    wait_for_terminal(&platform, &tenant.id, &last.unwrap()).await;

    let report = platform
        .insights
        .analyze(&tenant.id, chrono::Duration::hours(1))
        .await
        .unwrap();
    let sales = report
        .summary
        .agents
        .iter()
        .find(|a| a.kind == AgentKind::Sales)
        .expect("sales summarised");
    assert_eq!(sales.task_count, 3);

    let stored = platform
        .insights
        .latest_report(&tenant.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.id, report.id);
}
