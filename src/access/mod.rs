//! Access control.
//!
//! Closed role and permission catalogues, user management with
//! memory-hard password hashing, TTL-bounded revocable sessions, and the
//! audit log every privileged mutation writes to before returning.

mod audit;

pub use audit::{AuditEvent, AuditLog, AuditOutcome};

use crate::{
    clock::{Clock, IdSource},
    constants,
    store::{collections, Filter, RecordStore, Sort, StoreError},
    tenancy::Tenant,
    CoreError, Result,
};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Closed role catalogue. User-defined roles are not supported.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    TenantAdmin,
    AgentManager,
    Analyst,
    Operator,
    Viewer,
    ApiUser,
}

/// Closed permission catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    TenantRead,
    TenantWrite,
    UserManage,
    AgentSubmit,
    AgentControl,
    TaskViewOwn,
    TaskViewAny,
    CollabInitiate,
    InsightRead,
    CacheClear,
    AuditRead,
}

impl Permission {
    pub fn tag(&self) -> &'static str {
        match self {
            Permission::TenantRead => "tenant.read",
            Permission::TenantWrite => "tenant.write",
            Permission::UserManage => "user.manage",
            Permission::AgentSubmit => "agent.submit",
            Permission::AgentControl => "agent.control",
            Permission::TaskViewOwn => "task.view.own",
            Permission::TaskViewAny => "task.view.any",
            Permission::CollabInitiate => "collab.initiate",
            Permission::InsightRead => "insight.read",
            Permission::CacheClear => "cache.clear",
            Permission::AuditRead => "audit.read",
        }
    }
}

impl Role {
    /// The fixed role → permission mapping. Part of the design, not data.
    pub fn permissions(&self) -> &'static [Permission] {
        use Permission::*;
        match self {
            Role::SuperAdmin => &[
                TenantRead,
                TenantWrite,
                UserManage,
                AgentSubmit,
                AgentControl,
                TaskViewOwn,
                TaskViewAny,
                CollabInitiate,
                InsightRead,
                CacheClear,
                AuditRead,
            ],
            Role::TenantAdmin => &[
                TenantRead,
                TenantWrite,
                UserManage,
                AgentSubmit,
                AgentControl,
                TaskViewOwn,
                TaskViewAny,
                CollabInitiate,
                InsightRead,
                CacheClear,
                AuditRead,
            ],
            Role::AgentManager => &[
                TenantRead,
                AgentSubmit,
                AgentControl,
                TaskViewOwn,
                TaskViewAny,
                CollabInitiate,
                InsightRead,
            ],
            Role::Analyst => &[TenantRead, TaskViewAny, InsightRead],
            Role::Operator => &[TenantRead, AgentSubmit, TaskViewOwn, CollabInitiate],
            Role::Viewer => &[TenantRead, TaskViewOwn],
            Role::ApiUser => &[AgentSubmit, TaskViewOwn],
        }
    }

    pub fn allows(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub tenant_id: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub status: UserStatus,
    /// Bumped on every password rotation; sessions minted against an
    /// older version are invalid.
    pub password_version: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub tenant_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub password_version: u32,
}

/// The authenticated identity handlers act on behalf of.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub tenant_id: String,
    pub role: Role,
}

/// Subject-specific authorisation input for `validate`.
#[derive(Debug, Clone)]
pub enum Subject {
    None,
    /// Checking visibility of a task submitted by this user id.
    TaskOwner(String),
}

/// Per (tenant, email) login failure window backing the `RateLimited`
/// behaviour of `authenticate`.
struct FailureThrottle {
    max_failures: u32,
    window: Duration,
    failures: Mutex<HashMap<String, (u32, DateTime<Utc>)>>,
}

impl FailureThrottle {
    fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            failures: Mutex::new(HashMap::new()),
        }
    }

    async fn check(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let mut failures = self.failures.lock().await;
        if let Some((count, since)) = failures.get(key) {
            if now - *since > self.window {
                failures.remove(key);
            } else if *count >= self.max_failures {
                return Err(CoreError::RateLimited);
            }
        }
        Ok(())
    }

    async fn record_failure(&self, key: &str, now: DateTime<Utc>) {
        let mut failures = self.failures.lock().await;
        let entry = failures.entry(key.to_string()).or_insert((0, now));
        if now - entry.1 > self.window {
            *entry = (0, now);
        }
        entry.0 += 1;
    }

    async fn clear(&self, key: &str) {
        self.failures.lock().await.remove(key);
    }
}

pub struct AccessControl {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
    audit: AuditLog,
    throttle: FailureThrottle,
    session_ttl: Duration,
}

impl AccessControl {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
        audit: AuditLog,
        session_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            audit,
            throttle: FailureThrottle::new(
                constants::LOGIN_FAILURE_LIMIT,
                Duration::seconds(constants::LOGIN_FAILURE_WINDOW_SECS),
            ),
            session_ttl: Duration::seconds(session_ttl_secs as i64),
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn check_password_policy(password: &str) -> Result<()> {
        let violation = if password.len() < 12 {
            Some("must be at least 12 characters")
        } else if !password.chars().any(|c| c.is_ascii_digit()) {
            Some("must contain a digit")
        } else if !password.chars().any(|c| c.is_ascii_uppercase()) {
            Some("must contain an upper-case letter")
        } else if !password.chars().any(|c| c.is_ascii_lowercase()) {
            Some("must contain a lower-case letter")
        } else if !password.chars().any(|c| !c.is_alphanumeric()) {
            Some("must contain a symbol")
        } else {
            None
        };
        match violation {
            Some(message) => Err(CoreError::validation("password", message)),
            None => Ok(()),
        }
    }

    fn hash_password(password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| CoreError::Internal(anyhow::anyhow!("password hashing failed: {e}")))
    }

    fn verify_password(password: &str, stored: &str) -> bool {
        PasswordHash::new(stored)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    }

    async fn find_user_by_email(&self, tenant_id: &str, email: &str) -> Result<Option<User>> {
        let records = self
            .store
            .query(
                collections::USERS,
                &Filter::new().eq("tenant_id", tenant_id).eq("email", email),
                Sort::Unsorted,
                Some(1),
            )
            .await?;
        records.first().map(|r| Ok(r.decode()?)).transpose()
    }

    /// Create a user inside a tenant. Emits an audit event before
    /// returning success.
    pub async fn create_user(
        &self,
        tenant: &Tenant,
        actor: &str,
        email: &str,
        password: &str,
        role: Role,
    ) -> Result<User> {
        if !validator::ValidateEmail::validate_email(&email) {
            return Err(CoreError::validation("email", "must be a valid address"));
        }
        Self::check_password_policy(password)?;

        if let Some(max_users) = tenant.quotas().max_users {
            let existing = self
                .store
                .query(
                    collections::USERS,
                    &Filter::new().eq("tenant_id", tenant.id.clone()),
                    Sort::Unsorted,
                    None,
                )
                .await?;
            if existing.len() as u32 >= max_users {
                return Err(CoreError::quota("max_users", 0));
            }
        }

        if self.find_user_by_email(&tenant.id, email).await?.is_some() {
            return Err(CoreError::conflict(format!(
                "email `{email}` already exists in tenant"
            )));
        }

        let user = User {
            id: self.ids.next_id(),
            tenant_id: tenant.id.clone(),
            email: email.to_string(),
            password_hash: Self::hash_password(password)?,
            role,
            status: UserStatus::Active,
            password_version: 1,
            created_at: self.clock.now(),
        };
        self.store
            .put(collections::USERS, &user.id, serde_json::to_value(&user)?)
            .await?;

        self.audit
            .emit(
                &tenant.id,
                actor,
                "user.create",
                &user.id,
                AuditOutcome::Success,
                Some(format!("role={:?}", role)),
            )
            .await;
        info!(tenant = %tenant.id, user = %user.id, "user created");
        Ok(user)
    }

    /// Verify credentials and mint a session. Repeated failures for the
    /// same (tenant, email) eventually answer `RateLimited`.
    pub async fn authenticate(
        &self,
        tenant_id: &str,
        email: &str,
        password: &str,
    ) -> Result<Session> {
        let now = self.clock.now();
        let throttle_key = format!("{tenant_id}:{email}");
        self.throttle.check(&throttle_key, now).await?;

        // Argon2 verification is the constant-time comparison here; run it
        // against a dummy hash even for unknown users so the timing of the
        // two failure paths matches.
        let user = self
            .find_user_by_email(tenant_id, email)
            .await?
            .filter(|user| user.status == UserStatus::Active);
        let Some(user) = user else {
            let _ = Self::verify_password(password, DUMMY_HASH);
            self.throttle.record_failure(&throttle_key, now).await;
            warn!(tenant = %tenant_id, "authentication failure");
            return Err(CoreError::Unauthorized);
        };
        if !Self::verify_password(password, &user.password_hash) {
            self.throttle.record_failure(&throttle_key, now).await;
            warn!(tenant = %tenant_id, "authentication failure");
            return Err(CoreError::Unauthorized);
        }
        self.throttle.clear(&throttle_key).await;

        let session = Session {
            token: random_token(constants::SESSION_TOKEN_LEN),
            user_id: user.id.clone(),
            tenant_id: user.tenant_id.clone(),
            issued_at: now,
            expires_at: now + self.session_ttl,
            revoked: false,
            password_version: user.password_version,
        };
        self.store
            .put(
                collections::SESSIONS,
                &session.token,
                serde_json::to_value(&session)?,
            )
            .await?;

        self.audit
            .emit(
                tenant_id,
                &user.id,
                "auth.login",
                &user.id,
                AuditOutcome::Success,
                None,
            )
            .await;
        Ok(session)
    }

    async fn load_live_session(&self, token: &str) -> Result<(Session, User)> {
        let record = self
            .store
            .get(collections::SESSIONS, token)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => CoreError::Unauthorized,
                other => other.into(),
            })?;
        let session: Session = record.decode()?;

        // The store lookup is keyed, but compare the stored token in
        // constant time before trusting the record.
        let token_matches: bool = session.token.as_bytes().ct_eq(token.as_bytes()).into();
        if !token_matches || session.revoked || session.expires_at <= self.clock.now() {
            return Err(CoreError::Unauthorized);
        }

        let user: User = self
            .store
            .get(collections::USERS, &session.user_id)
            .await
            .map_err(|_| CoreError::Unauthorized)?
            .decode()?;
        if user.status != UserStatus::Active || user.password_version != session.password_version {
            return Err(CoreError::Unauthorized);
        }
        Ok((session, user))
    }

    /// Resolve a bearer token without demanding any permission.
    pub async fn resolve(&self, token: &str) -> Result<AuthContext> {
        let (session, user) = self.load_live_session(token).await?;
        Ok(AuthContext {
            user_id: user.id,
            tenant_id: session.tenant_id,
            role: user.role,
        })
    }

    /// True iff the session is live, its role carries `permission`, and
    /// the subject check passes.
    pub async fn validate(
        &self,
        token: &str,
        permission: Permission,
        subject: Subject,
    ) -> Result<AuthContext> {
        let ctx = self.resolve(token).await?;
        self.authorize(&ctx, permission, subject)?;
        Ok(ctx)
    }

    /// Pure permission check against an already-resolved context.
    pub fn authorize(
        &self,
        ctx: &AuthContext,
        permission: Permission,
        subject: Subject,
    ) -> Result<()> {
        match (permission, &subject) {
            (Permission::TaskViewOwn, Subject::TaskOwner(owner)) => {
                // task.view.any subsumes the ownership check.
                if ctx.role.allows(Permission::TaskViewAny) {
                    return Ok(());
                }
                if !ctx.role.allows(Permission::TaskViewOwn) {
                    return Err(CoreError::forbidden(Permission::TaskViewOwn.tag()));
                }
                if owner != &ctx.user_id {
                    return Err(CoreError::forbidden(Permission::TaskViewAny.tag()));
                }
                Ok(())
            }
            _ => {
                if ctx.role.allows(permission) {
                    Ok(())
                } else {
                    Err(CoreError::forbidden(permission.tag()))
                }
            }
        }
    }

    /// Mark a session revoked; subsequent validations fail `Unauthorized`.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        let record = self
            .store
            .get(collections::SESSIONS, token)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => CoreError::Unauthorized,
                other => other.into(),
            })?;
        let mut session: Session = record.decode()?;
        session.revoked = true;
        self.store
            .put(
                collections::SESSIONS,
                token,
                serde_json::to_value(&session)?,
            )
            .await?;

        self.audit
            .emit(
                &session.tenant_id,
                &session.user_id,
                "auth.revoke",
                token,
                AuditOutcome::Success,
                None,
            )
            .await;
        Ok(())
    }

    /// Rotate a password. Bumps the version counter, invalidating every
    /// session minted before the rotation.
    pub async fn rotate_password(
        &self,
        tenant_id: &str,
        user_id: &str,
        new_password: &str,
    ) -> Result<()> {
        Self::check_password_policy(new_password)?;

        let record = self
            .store
            .get(collections::USERS, user_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => CoreError::not_found(format!("user {user_id}")),
                other => other.into(),
            })?;
        let mut user: User = record.decode()?;
        if user.tenant_id != tenant_id {
            // Anti-enumeration: cross-tenant subjects read as absent.
            return Err(CoreError::not_found(format!("user {user_id}")));
        }

        user.password_hash = Self::hash_password(new_password)?;
        user.password_version += 1;
        self.store
            .put(collections::USERS, user_id, serde_json::to_value(&user)?)
            .await?;

        self.audit
            .emit(
                tenant_id,
                user_id,
                "user.rotate_password",
                user_id,
                AuditOutcome::Success,
                None,
            )
            .await;
        Ok(())
    }

    /// Drop expired sessions; called from the retention sweep.
    pub async fn prune_expired_sessions(&self) -> Result<usize> {
        let now = self.clock.now().to_rfc3339();
        let expired = self
            .store
            .query(
                collections::SESSIONS,
                &Filter::new().range("expires_at", None, Some(serde_json::json!(now))),
                Sort::Unsorted,
                None,
            )
            .await?;
        let count = expired.len();
        for record in expired {
            let _ = self.store.delete(collections::SESSIONS, &record.id).await;
        }
        Ok(count)
    }
}

/// A valid Argon2 hash of an unguessable throwaway string, used to
/// equalise the timing of unknown-user and wrong-password failures.
const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$YmFzZWxpbmVzYWx0$m5Y1k0G8S1J0s3Yd0n9dKQ3pZ0p4p4n8M9c7S2kQxAo";

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SystemClock, UuidSource};
    use crate::store::MemoryStore;
    use crate::tenancy::{SubscriptionTier, TenantStatus};

    fn tenant() -> Tenant {
        let now = Utc::now();
        Tenant {
            id: "t-1".to_string(),
            display_name: "Acme".to_string(),
            primary_domain: "acme.example".to_string(),
            branding: serde_json::Value::Null,
            subscription_tier: SubscriptionTier::Starter,
            feature_flags: vec![],
            status: TenantStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn access() -> AccessControl {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids: Arc<dyn IdSource> = Arc::new(UuidSource);
        let audit = AuditLog::new(store.clone(), clock.clone(), ids.clone());
        AccessControl::new(store, clock, ids, audit, 3600)
    }

    const GOOD_PASSWORD: &str = "Str0ng&Secret!";

    #[tokio::test]
    async fn create_and_authenticate() {
        let access = access();
        let tenant = tenant();
        access
            .create_user(&tenant, "admin", "ada@acme.example", GOOD_PASSWORD, Role::Operator)
            .await
            .unwrap();

        let session = access
            .authenticate("t-1", "ada@acme.example", GOOD_PASSWORD)
            .await
            .unwrap();
        assert_eq!(session.tenant_id, "t-1");

        let ctx = access
            .validate(&session.token, Permission::AgentSubmit, Subject::None)
            .await
            .unwrap();
        assert_eq!(ctx.role, Role::Operator);
    }

    #[tokio::test]
    async fn weak_passwords_are_rejected() {
        let access = access();
        let tenant = tenant();
        for weak in ["short1!A", "nodigitshere!A", "NOLOWER123!!", "noupper123!!", "NoSymbol12345"] {
            let err = access
                .create_user(&tenant, "admin", "ada@acme.example", weak, Role::Viewer)
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::Validation { .. }), "{weak} should fail");
        }
    }

    #[tokio::test]
    async fn duplicate_email_in_tenant_conflicts() {
        let access = access();
        let tenant = tenant();
        access
            .create_user(&tenant, "admin", "ada@acme.example", GOOD_PASSWORD, Role::Viewer)
            .await
            .unwrap();
        let err = access
            .create_user(&tenant, "admin", "ada@acme.example", GOOD_PASSWORD, Role::Viewer)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn repeated_failures_rate_limit() {
        let access = access();
        let tenant = tenant();
        access
            .create_user(&tenant, "admin", "ada@acme.example", GOOD_PASSWORD, Role::Viewer)
            .await
            .unwrap();

        for _ in 0..constants::LOGIN_FAILURE_LIMIT {
            let err = access
                .authenticate("t-1", "ada@acme.example", "Wrong&Pass123")
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::Unauthorized));
        }
        let err = access
            .authenticate("t-1", "ada@acme.example", GOOD_PASSWORD)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RateLimited));
    }

    #[tokio::test]
    async fn revoked_sessions_fail_validation() {
        let access = access();
        let tenant = tenant();
        access
            .create_user(&tenant, "admin", "ada@acme.example", GOOD_PASSWORD, Role::Viewer)
            .await
            .unwrap();
        let session = access
            .authenticate("t-1", "ada@acme.example", GOOD_PASSWORD)
            .await
            .unwrap();

        access.revoke(&session.token).await.unwrap();
        let err = access
            .validate(&session.token, Permission::TaskViewOwn, Subject::None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized));
    }

    #[tokio::test]
    async fn password_rotation_invalidates_existing_sessions() {
        let access = access();
        let tenant = tenant();
        let user = access
            .create_user(&tenant, "admin", "ada@acme.example", GOOD_PASSWORD, Role::Viewer)
            .await
            .unwrap();
        let session = access
            .authenticate("t-1", "ada@acme.example", GOOD_PASSWORD)
            .await
            .unwrap();

        access
            .rotate_password("t-1", &user.id, "N3w&Longer!Secret")
            .await
            .unwrap();

        let err = access.resolve(&session.token).await.unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized));

        // New password works and mints a fresh, valid session.
        let fresh = access
            .authenticate("t-1", "ada@acme.example", "N3w&Longer!Secret")
            .await
            .unwrap();
        assert!(access.resolve(&fresh.token).await.is_ok());
    }

    #[tokio::test]
    async fn viewer_lacks_agent_submit() {
        let access = access();
        let tenant = tenant();
        access
            .create_user(&tenant, "admin", "eve@acme.example", GOOD_PASSWORD, Role::Viewer)
            .await
            .unwrap();
        let session = access
            .authenticate("t-1", "eve@acme.example", GOOD_PASSWORD)
            .await
            .unwrap();

        let err = access
            .validate(&session.token, Permission::AgentSubmit, Subject::None)
            .await
            .unwrap_err();
        match err {
            CoreError::Forbidden { permission } => assert_eq!(permission, "agent.submit"),
            other => panic!("expected Forbidden, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn task_view_own_checks_submitter() {
        let access = access();
        let tenant = tenant();
        let user = access
            .create_user(&tenant, "admin", "op@acme.example", GOOD_PASSWORD, Role::Operator)
            .await
            .unwrap();
        let session = access
            .authenticate("t-1", "op@acme.example", GOOD_PASSWORD)
            .await
            .unwrap();

        assert!(access
            .validate(
                &session.token,
                Permission::TaskViewOwn,
                Subject::TaskOwner(user.id.clone()),
            )
            .await
            .is_ok());

        let err = access
            .validate(
                &session.token,
                Permission::TaskViewOwn,
                Subject::TaskOwner("someone-else".to_string()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn privileged_mutations_leave_audit_events() {
        let access = access();
        let tenant = tenant();
        access
            .create_user(&tenant, "boot", "ada@acme.example", GOOD_PASSWORD, Role::Viewer)
            .await
            .unwrap();

        let events = access.audit().events_for_tenant("t-1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "user.create");
        assert_eq!(events[0].outcome, AuditOutcome::Success);
    }

    #[test]
    fn role_permission_mapping_is_closed_and_sane() {
        assert!(Role::SuperAdmin.allows(Permission::TenantWrite));
        assert!(!Role::Viewer.allows(Permission::AgentSubmit));
        assert!(!Role::Operator.allows(Permission::TaskViewAny));
        assert!(Role::Analyst.allows(Permission::InsightRead));
        assert!(Role::ApiUser.allows(Permission::AgentSubmit));
        assert!(!Role::ApiUser.allows(Permission::CacheClear));
    }
}
