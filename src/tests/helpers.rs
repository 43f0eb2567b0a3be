//! Full-stack fixtures for the end-to-end scenarios: an in-process
//! platform with a configurable model registry, plus misbehaving
//! providers to drive the failure paths.

use crate::{
    access::{AccessControl, AuditLog, Role},
    agents::AgentOrchestrator,
    api::ApiServer,
    cache::ResponseCache,
    clock::{Clock, IdSource, SystemClock, UuidSource},
    collab::CollaborationCoordinator,
    config::{ApiConfig, AuthConfig, Config, Environment, ProviderConfig, RuntimeConfig},
    constants,
    insights::InsightsEngine,
    providers::{
        Capability, InvokeOptions, LocalTemplateProvider, ModelEntry, ModelProvider,
        ModelRegistry, ProviderError, ProviderResponse, Usage,
    },
    store::{MemoryStore, RecordStore},
    telemetry::metric_channel,
    tenancy::{NewTenant, SubscriptionTier, Tenant, TenantStore},
};
use async_trait::async_trait;
use axum::Router;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;

pub const PASSWORD: &str = "T3st&Secret!pw";

/// Fails with `Unavailable` a fixed number of times, then succeeds.
pub struct FlakyProvider {
    id: String,
    remaining_failures: AtomicU32,
    pub invocations: AtomicU32,
}

impl FlakyProvider {
    pub fn new(id: impl Into<String>, failures: u32) -> Self {
        Self {
            id: id.into(),
            remaining_failures: AtomicU32::new(failures),
            invocations: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ModelProvider for FlakyProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        entry: &ModelEntry,
        _prompt: &str,
        _options: &InvokeOptions,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Unavailable("provider flapping".to_string()));
        }
        Ok(ProviderResponse {
            content: format!("recovered response from {}", entry.name),
            usage: Usage::default(),
        })
    }
}

/// Never answers.
pub struct DownProvider {
    id: String,
}

impl DownProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl ModelProvider for DownProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        _entry: &ModelEntry,
        _prompt: &str,
        _options: &InvokeOptions,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        Err(ProviderError::Unavailable("provider down".to_string()))
    }
}

pub fn model_entry(name: &str, provider: &str, caps: &[Capability]) -> ModelEntry {
    ModelEntry {
        name: name.to_string(),
        provider_id: provider.to_string(),
        capabilities: caps.iter().copied().collect(),
        context_window: 32_768,
        cost_weight: 1.0,
        available: true,
    }
}

pub fn local_registry() -> ModelRegistry {
    ModelRegistry::new(
        vec![
            model_entry(
                "atlas",
                "local",
                &[Capability::Text, Capability::Reasoning, Capability::LongContext],
            ),
            model_entry("safe-default", "local", &[Capability::Text]),
        ],
        vec![Arc::new(LocalTemplateProvider::new("local")) as Arc<dyn ModelProvider>],
        "safe-default",
    )
    .unwrap()
}

pub struct Platform {
    pub store: Arc<dyn RecordStore>,
    pub tenants: Arc<TenantStore>,
    pub access: Arc<AccessControl>,
    pub cache: Arc<ResponseCache>,
    pub orchestrator: AgentOrchestrator,
    pub coordinator: Arc<CollaborationCoordinator>,
    pub insights: Arc<InsightsEngine>,
    pub router: Router,
    pub cancel: CancellationToken,
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn platform_with_registry(registry: ModelRegistry) -> Platform {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdSource> = Arc::new(UuidSource);
    let cancel = CancellationToken::new();

    let (metrics, recorder) = metric_channel(constants::METRIC_BUFFER, store.clone(), ids.clone());
    tokio::spawn(recorder.run(cancel.child_token()));

    let tenants = Arc::new(TenantStore::new(store.clone(), clock.clone(), ids.clone()));
    let audit = AuditLog::new(store.clone(), clock.clone(), ids.clone());
    let access = Arc::new(AccessControl::new(
        store.clone(),
        clock.clone(),
        ids.clone(),
        audit,
        3600,
    ));
    let cache = Arc::new(ResponseCache::new(4096, 16 * 1024 * 1024));

    let orchestrator = AgentOrchestrator::new(
        store.clone(),
        tenants.clone(),
        cache.clone(),
        Arc::new(registry),
        metrics,
        clock.clone(),
        ids.clone(),
        cancel.child_token(),
    );
    let coordinator = Arc::new(CollaborationCoordinator::new(
        store.clone(),
        orchestrator.clone(),
        clock.clone(),
        ids.clone(),
    ));
    let insights = Arc::new(InsightsEngine::new(store.clone(), clock, ids));

    let config = Config {
        api: ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            environment: Environment::Production,
            allowed_origins: vec![],
            requests_per_minute: 10_000,
        },
        auth: AuthConfig {
            token_secret: "0123456789abcdef0123456789abcdef".to_string(),
            session_ttl_secs: 3600,
        },
        provider: ProviderConfig {
            api_key: None,
            base_url: "http://localhost".to_string(),
            request_timeout_secs: 5,
        },
        runtime: RuntimeConfig {
            cache_sweep_interval_secs: 60,
            cleanup_interval_secs: 300,
            default_tenant: None,
        },
        bootstrap: None,
    };
    let api = ApiServer::new(
        &config,
        access.clone(),
        tenants.clone(),
        orchestrator.clone(),
        coordinator.clone(),
        insights.clone(),
        cache.clone(),
    )
    .unwrap();

    Platform {
        store,
        tenants,
        access,
        cache,
        orchestrator,
        coordinator,
        insights,
        router: api.build_router(),
        cancel,
    }
}

pub async fn platform() -> Platform {
    platform_with_registry(local_registry()).await
}

impl Platform {
    pub async fn seed_tenant(&self, domain: &str, tier: SubscriptionTier) -> Tenant {
        self.tenants
            .create_tenant(NewTenant {
                display_name: domain.to_string(),
                primary_domain: domain.to_string(),
                branding: serde_json::Value::Null,
                subscription_tier: tier,
                feature_flags: vec![],
            })
            .await
            .unwrap()
    }

    /// Create a user and return a live session token.
    pub async fn seed_user(&self, tenant: &Tenant, email: &str, role: Role) -> String {
        self.access
            .create_user(tenant, "boot", email, PASSWORD, role)
            .await
            .unwrap();
        self.access
            .authenticate(&tenant.id, email, PASSWORD)
            .await
            .unwrap()
            .token
    }
}
