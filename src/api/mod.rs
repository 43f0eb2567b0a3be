//! HTTP surface.
//!
//! A thin decode/encode layer: bearer token to Access Control, tenant
//! resolution from the `X-Tenant` header, dispatch into the components,
//! and the final mapping from the error taxonomy to status codes. All
//! responses share the `{success, message, data}` envelope. No business
//! logic lives here.

#[cfg(test)]
mod tests;

use crate::{
    access::{AccessControl, AuditOutcome, AuthContext, Permission, Role, Subject},
    agents::{AgentOrchestrator, ControlOp},
    cache::ResponseCache,
    collab::CollaborationCoordinator,
    config::{ApiConfig, Config, Environment},
    insights::InsightsEngine,
    models::{AgentKind, Priority, TaskPayload},
    tenancy::{NewTenant, SubscriptionTier, Tenant, TenantStatus, TenantStore},
    validation::PayloadValidator,
    CoreError, Result,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{net::IpAddr, num::NonZeroU32, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use validator::Validate;

const SERVICE_NAME: &str = "meridian-core";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const TENANT_HEADER: &str = "x-tenant";

type IpLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Shared dependencies, wired once by the composition root.
#[derive(Clone)]
pub struct AppState {
    pub environment: Environment,
    pub default_tenant: Option<String>,
    pub access: Arc<AccessControl>,
    pub tenants: Arc<TenantStore>,
    pub orchestrator: AgentOrchestrator,
    pub coordinator: Arc<CollaborationCoordinator>,
    pub insights: Arc<InsightsEngine>,
    pub cache: Arc<ResponseCache>,
    pub validator: PayloadValidator,
    limiter: Arc<IpLimiter>,
}

/// The wire envelope every response uses.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    pub message: String,
    pub data: Value,
}

type Reply = (StatusCode, Json<Envelope>);
type HandlerResult = std::result::Result<Reply, Reply>;

fn ok(message: &str, data: Value) -> Reply {
    (
        StatusCode::OK,
        Json(Envelope {
            success: true,
            message: message.to_string(),
            data,
        }),
    )
}

fn created(message: &str, data: Value) -> Reply {
    (
        StatusCode::CREATED,
        Json(Envelope {
            success: true,
            message: message.to_string(),
            data,
        }),
    )
}

/// Map the error taxonomy onto status codes and the error envelope. Full
/// detail is attached only in development deployments.
fn failure(environment: Environment, err: &CoreError) -> Reply {
    let (status, message, mut data) = match err {
        CoreError::Validation { field, message } => (
            StatusCode::BAD_REQUEST,
            "validation failed".to_string(),
            json!({"field": field, "message": message}),
        ),
        CoreError::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            "unauthorized".to_string(),
            Value::Null,
        ),
        CoreError::Forbidden { permission } => (
            StatusCode::FORBIDDEN,
            "forbidden".to_string(),
            json!({"missing": permission}),
        ),
        CoreError::NotFound(subject) => (
            StatusCode::NOT_FOUND,
            format!("{subject} not found"),
            Value::Null,
        ),
        CoreError::Conflict(message) => (
            StatusCode::CONFLICT,
            message.clone(),
            Value::Null,
        ),
        CoreError::QuotaExceeded {
            dimension,
            retry_after_secs,
        } => (
            StatusCode::TOO_MANY_REQUESTS,
            "quota exceeded".to_string(),
            json!({"dimension": dimension, "retry_after_secs": retry_after_secs}),
        ),
        CoreError::RateLimited => (
            StatusCode::TOO_MANY_REQUESTS,
            "rate limited".to_string(),
            Value::Null,
        ),
        CoreError::ServiceUnavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "service unavailable".to_string(),
            Value::Null,
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
            Value::Null,
        ),
    };

    if environment == Environment::Development {
        if data == Value::Null {
            data = json!({});
        }
        data["detail"] = json!(err.to_string());
    }

    (
        status,
        Json(Envelope {
            success: false,
            message,
            data,
        }),
    )
}

pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        access: Arc<AccessControl>,
        tenants: Arc<TenantStore>,
        orchestrator: AgentOrchestrator,
        coordinator: Arc<CollaborationCoordinator>,
        insights: Arc<InsightsEngine>,
        cache: Arc<ResponseCache>,
    ) -> Result<Self> {
        let validator = PayloadValidator::new()?;
        let quota = Quota::per_minute(
            NonZeroU32::new(config.api.requests_per_minute.max(1))
                .unwrap_or(NonZeroU32::MIN),
        );
        let state = AppState {
            environment: config.api.environment,
            default_tenant: config.runtime.default_tenant.clone(),
            access,
            tenants,
            orchestrator,
            coordinator,
            insights,
            cache,
            validator,
            limiter: Arc::new(RateLimiter::keyed(quota)),
        };
        Ok(Self {
            config: config.api.clone(),
            state,
        })
    }

    pub fn build_router(&self) -> Router {
        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static(TENANT_HEADER),
            ]);

        Router::new()
            .route("/health", get(health))
            .route("/auth/login", post(login))
            .route("/users", post(create_user))
            .route("/tenants", post(create_tenant).get(list_tenants))
            .route("/tenants/reseller", post(create_reseller))
            .route("/agents/{kind}/tasks", post(submit_task))
            .route("/agents/status", get(agent_status))
            .route("/agents/{kind}/control", post(control_agent))
            .route("/tasks/{task_id}", get(get_task))
            .route("/collaborations", post(initiate_collaboration))
            .route("/collaborations/{id}/steps", post(add_collaboration_step))
            .route("/collaborations/{id}", get(collaboration_status))
            .route("/delegate", post(delegate_task))
            .route("/insights/summary", get(insights_summary))
            .route("/insights/analyze", post(insights_analyze))
            .route("/cache/stats", get(cache_stats))
            .route("/cache/clear", post(cache_clear))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(
                        self.state.clone(),
                        rate_limit_middleware,
                    ))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.state.clone())
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let app = self.build_router();
        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| CoreError::Internal(e.into()))?;
        info!(
            "API server listening on {}:{}",
            self.config.host, self.config.port
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| CoreError::Internal(e.into()))?;
        Ok(())
    }
}

/// Per-IP request limiter in front of everything else. Requests without
/// connection info (in-process tests) pass through.
async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip());

    if let Some(ip) = ip {
        if state.limiter.check_key(&ip).is_err() {
            warn!(%ip, "request rate limited");
            return failure(state.environment, &CoreError::RateLimited).into_response();
        }
    }
    next.run(request).await
}

fn bearer_token(headers: &HeaderMap) -> std::result::Result<&str, CoreError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .ok_or(CoreError::Unauthorized)
}

fn header_tenant(headers: &HeaderMap, state: &AppState) -> std::result::Result<String, CoreError> {
    match headers.get(TENANT_HEADER).and_then(|v| v.to_str().ok()) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        // Absent header means "default tenant" only in single-tenant
        // deployments.
        _ => state.default_tenant.clone().ok_or_else(|| {
            CoreError::validation(TENANT_HEADER, "tenant header is required")
        }),
    }
}

/// Authenticate the request and resolve its tenant. The tenant comes
/// from the explicit header, never inferred from the user alone; a
/// non-super-admin asking for a foreign tenant reads as absent.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> std::result::Result<(AuthContext, Tenant), CoreError> {
    let token = bearer_token(headers)?;
    let ctx = state.access.resolve(token).await?;
    let tenant_id = header_tenant(headers, state)?;

    if ctx.role != Role::SuperAdmin && ctx.tenant_id != tenant_id {
        return Err(CoreError::not_found(format!("tenant {tenant_id}")));
    }
    let tenant = state.tenants.get_tenant(&tenant_id).await?;
    Ok((ctx, tenant))
}

/// Permission gate for privileged routes; denials are audited before the
/// error propagates.
async fn require(
    state: &AppState,
    ctx: &AuthContext,
    tenant_id: &str,
    permission: Permission,
    action: &str,
    subject: &str,
) -> std::result::Result<(), CoreError> {
    match state.access.authorize(ctx, permission, Subject::None) {
        Ok(()) => Ok(()),
        Err(err) => {
            state
                .access
                .audit()
                .emit(
                    tenant_id,
                    &ctx.user_id,
                    action,
                    subject,
                    AuditOutcome::Denied,
                    Some(format!("missing {}", permission.tag())),
                )
                .await;
            Err(err)
        }
    }
}

fn active_or_conflict(tenant: &Tenant) -> std::result::Result<(), CoreError> {
    if tenant.status != TenantStatus::Active {
        return Err(CoreError::conflict("tenant is suspended"));
    }
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

#[derive(Debug, Deserialize, Validate)]
struct LoginRequest {
    tenant_id: Option<String>,
    #[validate(email)]
    email: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    request
        .validate()
        .map_err(|_| fail(CoreError::validation("email", "must be a valid address")))?;

    let tenant_id = match request.tenant_id {
        Some(id) => id,
        None => header_tenant(&headers, &state).map_err(fail)?,
    };
    let session = state
        .access
        .authenticate(&tenant_id, &request.email, &request.password)
        .await
        .map_err(fail)?;

    Ok(ok(
        "authenticated",
        json!({"token": session.token, "expires_at": session.expires_at}),
    ))
}

#[derive(Debug, Deserialize, Validate)]
struct CreateUserRequest {
    #[validate(email)]
    email: String,
    password: String,
    role: Role,
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateUserRequest>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let (ctx, tenant) = authenticate(&state, &headers).await.map_err(fail)?;
    require(&state, &ctx, &tenant.id, Permission::UserManage, "user.create", &request.email)
        .await
        .map_err(fail)?;
    request
        .validate()
        .map_err(|_| fail(CoreError::validation("email", "must be a valid address")))?;

    let user = state
        .access
        .create_user(&tenant, &ctx.user_id, &request.email, &request.password, request.role)
        .await
        .map_err(fail)?;

    Ok(created(
        "user created",
        json!({"id": user.id, "email": user.email, "role": user.role}),
    ))
}

async fn create_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<NewTenant>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let token = bearer_token(&headers).map_err(fail)?;
    let ctx = state.access.resolve(token).await.map_err(fail)?;
    if ctx.role != Role::SuperAdmin {
        state
            .access
            .audit()
            .emit(
                &ctx.tenant_id,
                &ctx.user_id,
                "tenant.create",
                &request.primary_domain,
                AuditOutcome::Denied,
                Some("super_admin required".to_string()),
            )
            .await;
        return Err(fail(CoreError::forbidden(Permission::TenantWrite.tag())));
    }

    let tenant = state.tenants.create_tenant(request).await.map_err(fail)?;
    state
        .access
        .audit()
        .emit(
            &tenant.id,
            &ctx.user_id,
            "tenant.create",
            &tenant.id,
            AuditOutcome::Success,
            None,
        )
        .await;

    Ok(created("tenant created", json!(tenant)))
}

#[derive(Debug, Deserialize, Default)]
struct ListTenantsQuery {
    status: Option<TenantStatus>,
}

async fn list_tenants(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListTenantsQuery>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let token = bearer_token(&headers).map_err(fail)?;
    let ctx = state.access.resolve(token).await.map_err(fail)?;
    state
        .access
        .authorize(&ctx, Permission::TenantRead, Subject::None)
        .map_err(fail)?;

    let tenants = if ctx.role == Role::SuperAdmin {
        state.tenants.list_tenants(query.status).await.map_err(fail)?
    } else {
        vec![state.tenants.get_tenant(&ctx.tenant_id).await.map_err(fail)?]
    };
    Ok(ok("tenants", json!(tenants)))
}

#[derive(Debug, Deserialize)]
struct ResellerRequest {
    display_name: String,
    primary_domain: String,
    #[serde(default = "default_reseller_tier")]
    subscription_tier: SubscriptionTier,
}

fn default_reseller_tier() -> SubscriptionTier {
    SubscriptionTier::Professional
}

async fn create_reseller(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ResellerRequest>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let token = bearer_token(&headers).map_err(fail)?;
    let ctx = state.access.resolve(token).await.map_err(fail)?;
    if ctx.role != Role::SuperAdmin {
        return Err(fail(CoreError::forbidden(Permission::TenantWrite.tag())));
    }

    let (tenant, credentials) = state
        .tenants
        .create_reseller_package(
            request.display_name,
            request.primary_domain,
            request.subscription_tier,
        )
        .await
        .map_err(fail)?;
    state
        .access
        .audit()
        .emit(
            &tenant.id,
            &ctx.user_id,
            "tenant.reseller_create",
            &tenant.id,
            AuditOutcome::Success,
            None,
        )
        .await;

    Ok(created(
        "reseller package created",
        json!({"tenant": tenant, "credentials": credentials}),
    ))
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    payload: TaskPayload,
    #[serde(default)]
    priority: Priority,
    deadline: Option<DateTime<Utc>>,
}

async fn submit_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(kind): Path<String>,
    Json(request): Json<SubmitTaskRequest>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let (ctx, tenant) = authenticate(&state, &headers).await.map_err(fail)?;
    let kind: AgentKind = kind
        .parse()
        .map_err(|_| fail(CoreError::not_found(format!("agent {kind}"))))?;
    require(
        &state,
        &ctx,
        &tenant.id,
        Permission::AgentSubmit,
        "task.submit",
        kind.as_str(),
    )
    .await
    .map_err(fail)?;
    active_or_conflict(&tenant).map_err(fail)?;

    let payload = state.validator.validate(&request.payload).map_err(fail)?;
    let task = state
        .orchestrator
        .submit_task(&tenant, &ctx.user_id, kind, payload, request.priority, request.deadline)
        .await
        .map_err(fail)?;

    Ok(created(
        "task submitted",
        json!({"task_id": task.id, "state": task.state, "agent_kind": task.agent_kind}),
    ))
}

async fn agent_status(State(state): State<AppState>, headers: HeaderMap) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let (_, tenant) = authenticate(&state, &headers).await.map_err(fail)?;
    let statuses = state.orchestrator.agent_statuses(&tenant.id).await;
    Ok(ok("agent status", json!(statuses)))
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    op: ControlOp,
}

async fn control_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(kind): Path<String>,
    Json(request): Json<ControlRequest>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let (ctx, tenant) = authenticate(&state, &headers).await.map_err(fail)?;
    let kind: AgentKind = kind
        .parse()
        .map_err(|_| fail(CoreError::not_found(format!("agent {kind}"))))?;
    require(
        &state,
        &ctx,
        &tenant.id,
        Permission::AgentControl,
        "agent.control",
        kind.as_str(),
    )
    .await
    .map_err(fail)?;

    state
        .orchestrator
        .control(&tenant.id, kind, request.op)
        .await
        .map_err(fail)?;
    state
        .access
        .audit()
        .emit(
            &tenant.id,
            &ctx.user_id,
            "agent.control",
            kind.as_str(),
            AuditOutcome::Success,
            Some(format!("op={:?}", request.op)),
        )
        .await;

    Ok(ok("control applied", json!({"agent_kind": kind, "op": request.op})))
}

async fn get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let (ctx, tenant) = authenticate(&state, &headers).await.map_err(fail)?;
    // Tenant scoping first: a foreign tenant's task reads as absent.
    let task = state
        .orchestrator
        .get_task(&tenant.id, &task_id)
        .await
        .map_err(fail)?;
    state
        .access
        .authorize(
            &ctx,
            Permission::TaskViewOwn,
            Subject::TaskOwner(task.submitter.clone()),
        )
        .map_err(fail)?;

    Ok(ok("task", json!(task)))
}

#[derive(Debug, Deserialize)]
struct InitiateCollaborationRequest {
    participants: Vec<AgentKind>,
    goal: String,
}

async fn initiate_collaboration(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InitiateCollaborationRequest>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let (ctx, tenant) = authenticate(&state, &headers).await.map_err(fail)?;
    require(
        &state,
        &ctx,
        &tenant.id,
        Permission::CollabInitiate,
        "collab.initiate",
        "collaboration",
    )
    .await
    .map_err(fail)?;
    active_or_conflict(&tenant).map_err(fail)?;

    let collaboration = state
        .coordinator
        .initiate(&tenant, &ctx.user_id, request.participants, request.goal)
        .await
        .map_err(fail)?;
    Ok(created("collaboration initiated", json!(collaboration)))
}

#[derive(Debug, Deserialize)]
struct AddStepRequest {
    agent_kind: AgentKind,
    payload: TaskPayload,
}

async fn add_collaboration_step(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(collab_id): Path<String>,
    Json(request): Json<AddStepRequest>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let (ctx, tenant) = authenticate(&state, &headers).await.map_err(fail)?;
    require(
        &state,
        &ctx,
        &tenant.id,
        Permission::CollabInitiate,
        "collab.add_step",
        &collab_id,
    )
    .await
    .map_err(fail)?;

    let payload = state.validator.validate(&request.payload).map_err(fail)?;
    let task = state
        .coordinator
        .add_step(&tenant, &collab_id, request.agent_kind, payload, &ctx.user_id)
        .await
        .map_err(fail)?;
    Ok(created(
        "step added",
        json!({"task_id": task.id, "agent_kind": task.agent_kind}),
    ))
}

async fn collaboration_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(collab_id): Path<String>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let (_, tenant) = authenticate(&state, &headers).await.map_err(fail)?;
    let (collaboration, status) = state
        .coordinator
        .status(&tenant.id, &collab_id)
        .await
        .map_err(fail)?;
    Ok(ok(
        "collaboration status",
        json!({"collaboration": collaboration, "status": status}),
    ))
}

#[derive(Debug, Deserialize)]
struct DelegateRequest {
    from_agent: AgentKind,
    to_agent: AgentKind,
    payload: TaskPayload,
    collaboration_id: Option<String>,
}

async fn delegate_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DelegateRequest>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let (ctx, tenant) = authenticate(&state, &headers).await.map_err(fail)?;
    // Delegation is open to collaboration orchestrators and plain
    // submitters alike.
    let allowed = state
        .access
        .authorize(&ctx, Permission::CollabInitiate, Subject::None)
        .or_else(|_| {
            state
                .access
                .authorize(&ctx, Permission::AgentSubmit, Subject::None)
        });
    if let Err(err) = allowed {
        state
            .access
            .audit()
            .emit(
                &tenant.id,
                &ctx.user_id,
                "task.delegate",
                request.to_agent.as_str(),
                AuditOutcome::Denied,
                None,
            )
            .await;
        return Err(fail(err));
    }
    active_or_conflict(&tenant).map_err(fail)?;

    let payload = state.validator.validate(&request.payload).map_err(fail)?;
    let task = state
        .coordinator
        .delegate(
            &tenant,
            request.from_agent,
            request.to_agent,
            payload,
            request.collaboration_id.as_deref(),
            &ctx.user_id,
        )
        .await
        .map_err(fail)?;
    Ok(created(
        "task delegated",
        json!({"task_id": task.id, "agent_kind": task.agent_kind}),
    ))
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    window_secs: Option<i64>,
}

async fn insights_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WindowQuery>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let (ctx, tenant) = authenticate(&state, &headers).await.map_err(fail)?;
    state
        .access
        .authorize(&ctx, Permission::InsightRead, Subject::None)
        .map_err(fail)?;

    let window = chrono::Duration::seconds(query.window_secs.unwrap_or(3600).clamp(60, 86_400));
    let summary = state
        .insights
        .summarize(&tenant.id, window)
        .await
        .map_err(fail)?;
    Ok(ok("performance summary", json!(summary)))
}

async fn insights_analyze(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WindowQuery>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let (ctx, tenant) = authenticate(&state, &headers).await.map_err(fail)?;
    state
        .access
        .authorize(&ctx, Permission::InsightRead, Subject::None)
        .map_err(fail)?;

    let window = chrono::Duration::seconds(query.window_secs.unwrap_or(3600).clamp(60, 86_400));
    let report = state
        .insights
        .analyze(&tenant.id, window)
        .await
        .map_err(fail)?;
    Ok(ok("analysis complete", json!(report)))
}

async fn cache_stats(State(state): State<AppState>, headers: HeaderMap) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let _ = authenticate(&state, &headers).await.map_err(fail)?;
    Ok(ok("cache statistics", json!(state.cache.stats())))
}

#[derive(Debug, Deserialize, Default)]
struct CacheClearRequest {
    #[serde(default)]
    prefix: String,
}

async fn cache_clear(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CacheClearRequest>,
) -> HandlerResult {
    let env = state.environment;
    let fail = |e: CoreError| failure(env, &e);

    let (ctx, tenant) = authenticate(&state, &headers).await.map_err(fail)?;
    require(
        &state,
        &ctx,
        &tenant.id,
        Permission::CacheClear,
        "cache.clear",
        &request.prefix,
    )
    .await
    .map_err(fail)?;

    // Invalidation is always confined to the caller's tenant segment.
    let prefix = format!("{}:{}", tenant.id, request.prefix);
    let removed = state.cache.invalidate(&prefix);
    state
        .access
        .audit()
        .emit(
            &tenant.id,
            &ctx.user_id,
            "cache.clear",
            &prefix,
            AuditOutcome::Success,
            Some(format!("removed={removed}")),
        )
        .await;

    Ok(ok("cache cleared", json!({"removed": removed})))
}
