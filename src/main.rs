use meridian_core::{
    access::{AccessControl, AuditLog},
    agents::AgentOrchestrator,
    api::ApiServer,
    cache::ResponseCache,
    clock::{Clock, IdSource, SystemClock, UuidSource},
    collab::CollaborationCoordinator,
    config::Config,
    constants,
    insights::InsightsEngine,
    providers::{
        Capability, HttpModelProvider, LocalTemplateProvider, ModelEntry, ModelProvider,
        ModelRegistry,
    },
    store::{MemoryStore, RecordStore},
    telemetry::metric_channel,
    tenancy::TenantStore,
};
use std::{process::ExitCode, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 1;
const EXIT_PERSISTENCE: u8 = 2;

fn catalogue(remote_available: bool) -> Vec<ModelEntry> {
    let entry = |name: &str, provider: &str, caps: &[Capability], window: u32, cost: f32, up: bool| {
        ModelEntry {
            name: name.to_string(),
            provider_id: provider.to_string(),
            capabilities: caps.iter().copied().collect(),
            context_window: window,
            cost_weight: cost,
            available: up,
        }
    };
    vec![
        entry(
            "atlas-large",
            "modelgrid",
            &[
                Capability::Text,
                Capability::Reasoning,
                Capability::Code,
                Capability::LongContext,
            ],
            200_000,
            4.0,
            remote_available,
        ),
        entry(
            "atlas-small",
            "modelgrid",
            &[Capability::Text, Capability::Code],
            32_768,
            1.0,
            remote_available,
        ),
        entry(
            "atlas-vision",
            "modelgrid",
            &[Capability::Vision, Capability::Multimodal, Capability::Text],
            64_000,
            2.5,
            remote_available,
        ),
        entry(
            "local-template",
            "local",
            &[Capability::Text],
            8_192,
            0.1,
            true,
        ),
    ]
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting Meridian Core control plane");

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    if let Err(e) = store.ping().await {
        error!("persistence unreachable at startup: {e}");
        return ExitCode::from(EXIT_PERSISTENCE);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdSource> = Arc::new(UuidSource);
    let shutdown = CancellationToken::new();

    // Model providers: the remote backend when credentials are present,
    // always the local safe default.
    let mut providers: Vec<Arc<dyn ModelProvider>> =
        vec![Arc::new(LocalTemplateProvider::new("local"))];
    let remote_available = config.provider.api_key.is_some();
    if remote_available {
        match HttpModelProvider::new("modelgrid", &config.provider) {
            Ok(provider) => providers.push(Arc::new(provider)),
            Err(e) => {
                error!("provider configuration error: {e}");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    }
    let registry = match ModelRegistry::new(
        catalogue(remote_available)
            .into_iter()
            .filter(|entry| remote_available || entry.provider_id == "local")
            .collect(),
        providers,
        "local-template",
    ) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("model catalogue error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let (metrics, recorder) = metric_channel(constants::METRIC_BUFFER, store.clone(), ids.clone());
    tokio::spawn(recorder.run(shutdown.child_token()));

    let cache = Arc::new(ResponseCache::new(100_000, 256 * 1024 * 1024));
    tokio::spawn(cache.clone().run_sweeper(
        Duration::from_secs(config.runtime.cache_sweep_interval_secs),
        shutdown.child_token(),
    ));

    let tenants = Arc::new(TenantStore::new(store.clone(), clock.clone(), ids.clone()));
    let audit = AuditLog::new(store.clone(), clock.clone(), ids.clone());
    let access = Arc::new(AccessControl::new(
        store.clone(),
        clock.clone(),
        ids.clone(),
        audit,
        config.auth.session_ttl_secs,
    ));

    // First-run seeding: a platform tenant and super admin, only when the
    // store has no tenant at all.
    if let Some(bootstrap) = &config.bootstrap {
        match tenants.list_tenants(None).await {
            Ok(existing) if existing.is_empty() => {
                let seeded = async {
                    let tenant = tenants
                        .create_tenant(meridian_core::tenancy::NewTenant {
                            display_name: "Platform".to_string(),
                            primary_domain: bootstrap.tenant_domain.clone(),
                            branding: serde_json::Value::Null,
                            subscription_tier: meridian_core::tenancy::SubscriptionTier::Enterprise,
                            feature_flags: vec![],
                        })
                        .await?;
                    access
                        .create_user(
                            &tenant,
                            "bootstrap",
                            &bootstrap.admin_email,
                            &bootstrap.admin_password,
                            meridian_core::access::Role::SuperAdmin,
                        )
                        .await?;
                    Ok::<_, meridian_core::CoreError>(tenant)
                }
                .await;
                match seeded {
                    Ok(tenant) => info!(tenant = %tenant.id, "bootstrap tenant and admin created"),
                    Err(e) => {
                        error!("bootstrap failed: {e}");
                        return ExitCode::from(EXIT_CONFIG);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("persistence unreachable during bootstrap: {e}");
                return ExitCode::from(EXIT_PERSISTENCE);
            }
        }
    }

    let orchestrator = AgentOrchestrator::new(
        store.clone(),
        tenants.clone(),
        cache.clone(),
        registry,
        metrics,
        clock.clone(),
        ids.clone(),
        shutdown.child_token(),
    );
    let coordinator = Arc::new(CollaborationCoordinator::new(
        store.clone(),
        orchestrator.clone(),
        clock.clone(),
        ids.clone(),
    ));
    let insights = Arc::new(InsightsEngine::new(store.clone(), clock, ids));

    // Retention sweep for terminal tasks and expired sessions.
    {
        let orchestrator = orchestrator.clone();
        let access = access.clone();
        let cancel = shutdown.child_token();
        let interval = Duration::from_secs(config.runtime.cleanup_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Ok(removed) = orchestrator.prune_old_tasks().await {
                            if removed > 0 {
                                info!(removed, "pruned terminal tasks");
                            }
                        }
                        if let Ok(removed) = access.prune_expired_sessions().await {
                            if removed > 0 {
                                info!(removed, "pruned expired sessions");
                            }
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    let api = match ApiServer::new(
        &config,
        access,
        tenants,
        orchestrator.clone(),
        coordinator,
        insights,
        cache,
    ) {
        Ok(api) => api,
        Err(e) => {
            error!("API configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let serve = api.run(shutdown.child_token());
    tokio::pin!(serve);
    let exit = tokio::select! {
        result = &mut serve => {
            if let Err(e) = result {
                error!("API server failed: {e}");
            }
            ExitCode::SUCCESS
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            ExitCode::SUCCESS
        }
    };

    shutdown.cancel();
    orchestrator.shutdown().await;
    info!("Meridian Core stopped");
    exit
}
