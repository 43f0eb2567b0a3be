//! Tenant store.
//!
//! Tenant configuration, subscription tiers with their quota bundles, and
//! reseller package creation. Tenants are never deleted while referenced;
//! they are suspended instead.

use crate::{
    clock::{Clock, IdSource},
    store::{collections, Filter, RecordStore, Sort, StoreError},
    CoreError, Result,
};
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Starter,
    Professional,
    Enterprise,
}

/// Per-tier limits. `None` means unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaBundle {
    pub max_agents: Option<u32>,
    pub max_users: Option<u32>,
    pub tasks_per_day: u64,
    pub cache_entries: u64,
    pub concurrent_tasks_per_agent: u32,
}

impl SubscriptionTier {
    pub fn quotas(&self) -> QuotaBundle {
        match self {
            SubscriptionTier::Starter => QuotaBundle {
                max_agents: Some(3),
                max_users: Some(10),
                tasks_per_day: 5_000,
                cache_entries: 1_000,
                concurrent_tasks_per_agent: 2,
            },
            SubscriptionTier::Professional => QuotaBundle {
                max_agents: Some(10),
                max_users: Some(50),
                tasks_per_day: 25_000,
                cache_entries: 10_000,
                concurrent_tasks_per_agent: 8,
            },
            SubscriptionTier::Enterprise => QuotaBundle {
                max_agents: None,
                max_users: None,
                tasks_per_day: 100_000,
                cache_entries: 100_000,
                concurrent_tasks_per_agent: 32,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub display_name: String,
    pub primary_domain: String,
    /// Opaque to the core; stored and returned verbatim.
    #[serde(default)]
    pub branding: serde_json::Value,
    pub subscription_tier: SubscriptionTier,
    #[serde(default)]
    pub feature_flags: Vec<String>,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn quotas(&self) -> QuotaBundle {
        self.subscription_tier.quotas()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTenant {
    pub display_name: String,
    pub primary_domain: String,
    #[serde(default)]
    pub branding: serde_json::Value,
    pub subscription_tier: SubscriptionTier,
    #[serde(default)]
    pub feature_flags: Vec<String>,
}

/// Partial tenant mutation; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantUpdate {
    pub display_name: Option<String>,
    pub branding: Option<serde_json::Value>,
    pub subscription_tier: Option<SubscriptionTier>,
    pub feature_flags: Option<Vec<String>>,
    pub status: Option<TenantStatus>,
}

/// Generated credential material for a reseller package. The secret is
/// returned once at creation and not stored in clear anywhere else.
#[derive(Debug, Clone, Serialize)]
pub struct ResellerCredentials {
    pub api_key_id: String,
    pub api_secret: String,
}

const RESELLER_FEATURES: &[&str] = &["white_label", "sub_tenant_management", "bulk_task_submit"];

pub struct TenantStore {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl TenantStore {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, ids: Arc<dyn IdSource>) -> Self {
        Self { store, clock, ids }
    }

    fn validate_domain(domain: &str) -> Result<()> {
        if domain.is_empty() {
            return Err(CoreError::validation("primary_domain", "must not be empty"));
        }
        match url::Host::parse(domain) {
            Ok(url::Host::Domain(_)) => Ok(()),
            _ => Err(CoreError::validation(
                "primary_domain",
                "must be a valid DNS host name",
            )),
        }
    }

    /// Create a tenant. The primary domain must be unique among active
    /// tenants; if any follow-up step fails the partial record is deleted
    /// so no dangling tenant row survives.
    pub async fn create_tenant(&self, new: NewTenant) -> Result<Tenant> {
        Self::validate_domain(&new.primary_domain)?;
        if new.display_name.trim().is_empty() {
            return Err(CoreError::validation("display_name", "must not be empty"));
        }

        if self
            .find_active_by_domain(&new.primary_domain)
            .await?
            .is_some()
        {
            return Err(CoreError::conflict(format!(
                "primary_domain `{}` is already registered",
                new.primary_domain
            )));
        }

        let now = self.clock.now();
        let tenant = Tenant {
            id: self.ids.next_id(),
            display_name: new.display_name,
            primary_domain: new.primary_domain,
            branding: new.branding,
            subscription_tier: new.subscription_tier,
            feature_flags: new.feature_flags,
            status: TenantStatus::Active,
            created_at: now,
            updated_at: now,
        };

        self.store
            .put(
                collections::TENANTS,
                &tenant.id,
                serde_json::to_value(&tenant)?,
            )
            .await
            .map_err(store_err)?;

        // Creation is two steps (record, then uniqueness re-check to close
        // the write race). On failure of the second step, compensate by
        // deleting the partial record.
        let duplicates = self
            .store
            .query(
                collections::TENANTS,
                &Filter::new()
                    .eq("primary_domain", tenant.primary_domain.clone())
                    .eq("status", "active"),
                Sort::Asc("created_at".into()),
                None,
            )
            .await
            .map_err(store_err)?;
        if duplicates.len() > 1 && duplicates.first().map(|r| r.id.as_str()) != Some(&tenant.id) {
            warn!(tenant = %tenant.id, "rolling back tenant creation after domain collision");
            let _ = self.store.delete(collections::TENANTS, &tenant.id).await;
            return Err(CoreError::conflict(format!(
                "primary_domain `{}` is already registered",
                tenant.primary_domain
            )));
        }

        info!(tenant = %tenant.id, domain = %tenant.primary_domain, "tenant created");
        Ok(tenant)
    }

    pub async fn get_tenant(&self, id: &str) -> Result<Tenant> {
        let record = self
            .store
            .get(collections::TENANTS, id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => CoreError::not_found(format!("tenant {id}")),
                other => store_err(other),
            })?;
        record.decode().map_err(store_err)
    }

    pub async fn get_tenant_by_domain(&self, domain: &str) -> Result<Tenant> {
        self.find_active_by_domain(domain)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("tenant for domain {domain}")))
    }

    async fn find_active_by_domain(&self, domain: &str) -> Result<Option<Tenant>> {
        let records = self
            .store
            .query(
                collections::TENANTS,
                &Filter::new()
                    .eq("primary_domain", domain)
                    .eq("status", "active"),
                Sort::Asc("created_at".into()),
                Some(1),
            )
            .await
            .map_err(store_err)?;
        records
            .first()
            .map(|r| r.decode().map_err(store_err))
            .transpose()
    }

    pub async fn update_tenant(&self, id: &str, update: TenantUpdate) -> Result<Tenant> {
        // Re-read + versioned write; retry once on interleaved writers.
        for _ in 0..2 {
            let record = self
                .store
                .get(collections::TENANTS, id)
                .await
                .map_err(|e| match e {
                    StoreError::NotFound => CoreError::not_found(format!("tenant {id}")),
                    other => store_err(other),
                })?;
            let mut tenant: Tenant = record.decode().map_err(store_err)?;

            if let Some(name) = update.display_name.clone() {
                tenant.display_name = name;
            }
            if let Some(branding) = update.branding.clone() {
                tenant.branding = branding;
            }
            if let Some(tier) = update.subscription_tier {
                tenant.subscription_tier = tier;
            }
            if let Some(flags) = update.feature_flags.clone() {
                tenant.feature_flags = flags;
            }
            if let Some(status) = update.status {
                tenant.status = status;
            }
            tenant.updated_at = self.clock.now();

            match self
                .store
                .update(
                    collections::TENANTS,
                    id,
                    record.version,
                    serde_json::to_value(&tenant)?,
                )
                .await
            {
                Ok(_) => return Ok(tenant),
                Err(StoreError::Conflict) => continue,
                Err(other) => return Err(store_err(other)),
            }
        }
        Err(CoreError::conflict(format!(
            "tenant {id} changed concurrently"
        )))
    }

    pub async fn list_tenants(&self, status: Option<TenantStatus>) -> Result<Vec<Tenant>> {
        let filter = match status {
            Some(TenantStatus::Active) => Filter::new().eq("status", "active"),
            Some(TenantStatus::Suspended) => Filter::new().eq("status", "suspended"),
            None => Filter::new(),
        };
        let records = self
            .store
            .query(
                collections::TENANTS,
                &filter,
                Sort::Asc("created_at".into()),
                None,
            )
            .await
            .map_err(store_err)?;
        records
            .iter()
            .map(|r| r.decode().map_err(store_err))
            .collect()
    }

    /// Tenant creation with the reseller feature bundle plus generated API
    /// credential material.
    pub async fn create_reseller_package(
        &self,
        display_name: String,
        primary_domain: String,
        tier: SubscriptionTier,
    ) -> Result<(Tenant, ResellerCredentials)> {
        let tenant = self
            .create_tenant(NewTenant {
                display_name,
                primary_domain,
                branding: serde_json::Value::Null,
                subscription_tier: tier,
                feature_flags: RESELLER_FEATURES.iter().map(|s| s.to_string()).collect(),
            })
            .await?;

        let credentials = ResellerCredentials {
            api_key_id: format!("mk_{}", random_token(16)),
            api_secret: random_token(40),
        };
        Ok((tenant, credentials))
    }
}

pub(crate) fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn store_err(e: StoreError) -> CoreError {
    e.into()
}
