//! 测试公共模块
//! 内存存储装配、快速密钥生成与故障注入

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use iam_core::{
    authz::{
        CoordinatorPorts, Enforcer, InProcessNotifier, PolicyCoordinator, PolicySyncHandler,
        RuleMatrix, VersionNotifier,
    },
    clock::{Clock, ManualClock},
    context::OpContext,
    crypto::{
        keygen::public_jwk, AesGcmVault, GeneratedKeyPair, KeyPairGenerator,
        MemoryPrivateKeyStore,
    },
    error::{AppError, Result},
    idp::{
        AccessTokenCache, MemoryTokenCache, RefreshLease, TokenCacheSettings, TokenCacher,
        UpstreamTokenProvider,
    },
    jwks::KeyManager,
    middleware::AppState,
    models::{
        app::AppAccessToken,
        key::{RotationPolicy, SigningAlgorithm},
        policy::{AddPolicyRequest, CasbinRule},
        resource::{CreateResourceRequest, Resource},
        role::{CreateRoleRequest, Role},
    },
    repository::{MemoryAppStore, MemoryPolicyStore, MemorySigningKeyStore, PolicyRuleStore},
    services::{
        AppCredentialService, AssignmentService, KeyService, PolicyService, ResourceService,
        RoleService,
    },
    token::{TokenService, TokenSettings},
};
use once_cell::sync::Lazy;
use rsa::RsaPrivateKey;
use secrecy::{ExposeSecret, Secret};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

// ==================== Key generation ====================

/// 所有测试共用一把 2048 位密钥，避免重复生成
static SHARED_KEY: Lazy<RsaPrivateKey> = Lazy::new(|| {
    RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).expect("generate shared test key")
});

pub struct FastKeyGenerator;

#[async_trait]
impl KeyPairGenerator for FastKeyGenerator {
    async fn generate(&self, algorithm: SigningAlgorithm, kid: &str) -> Result<GeneratedKeyPair> {
        Ok(GeneratedKeyPair {
            kid: kid.to_string(),
            algorithm,
            public_jwk: public_jwk(&SHARED_KEY, algorithm, kid),
            private_key: SHARED_KEY.clone(),
        })
    }
}

// ==================== Failure injection ====================

/// 规则写入可按需失败的存储
pub struct FlakyRuleStore {
    inner: Arc<MemoryPolicyStore>,
    fail_writes: AtomicBool,
}

impl FlakyRuleStore {
    pub fn new(inner: Arc<MemoryPolicyStore>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Internal("injected rule store failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PolicyRuleStore for FlakyRuleStore {
    async fn load_all(&self) -> Result<Vec<CasbinRule>> {
        self.inner.load_all().await
    }

    async fn add_rules(&self, rules: &[CasbinRule]) -> Result<()> {
        self.check()?;
        self.inner.add_rules(rules).await
    }

    async fn remove_rules(&self, rules: &[CasbinRule]) -> Result<()> {
        self.check()?;
        self.inner.remove_rules(rules).await
    }
}

/// 第一次抢刷新锁前停顿 `delay`
pub struct SlowFirstLockCache {
    pub inner: MemoryTokenCache,
    pub delay: std::time::Duration,
    delayed: AtomicBool,
}

impl SlowFirstLockCache {
    pub fn new(inner: MemoryTokenCache, delay: std::time::Duration) -> Self {
        Self {
            inner,
            delay,
            delayed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl AccessTokenCache for SlowFirstLockCache {
    async fn get(&self, app_id: &str) -> Result<Option<AppAccessToken>> {
        self.inner.get(app_id).await
    }

    async fn set(&self, app_id: &str, token: &AppAccessToken, ttl: Duration) -> Result<()> {
        self.inner.set(app_id, token, ttl).await
    }

    async fn try_lock_refresh(&self, app_id: &str, ttl: Duration) -> Result<Option<RefreshLease>> {
        if !self.delayed.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.try_lock_refresh(app_id, ttl).await
    }

    async fn release(&self, lease: &RefreshLease) -> Result<()> {
        self.inner.release(lease).await
    }
}

// ==================== Upstream ====================

/// 上游令牌提供方，依次返回 tok-A、tok-B …
pub struct CountingProvider {
    pub calls: AtomicUsize,
    pub clock: ManualClock,
    pub delay: std::time::Duration,
    pub last_secret: std::sync::Mutex<Option<String>>,
}

impl CountingProvider {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            clock,
            delay: std::time::Duration::ZERO,
            last_secret: std::sync::Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn next_token(&self) -> Result<AppAccessToken> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let letter = (b'A' + (n % 26) as u8) as char;
        Ok(AppAccessToken {
            token: format!("tok-{}", letter),
            expires_at: self.clock.now() + Duration::seconds(7200),
        })
    }
}

#[async_trait]
impl UpstreamTokenProvider for CountingProvider {
    async fn fetch(&self, _app_id: &str, app_secret: &Secret<String>) -> Result<AppAccessToken> {
        *self.last_secret.lock().unwrap() = Some(app_secret.expose_secret().clone());
        self.next_token().await
    }
}

// ==================== Wiring ====================

pub fn test_policy() -> RotationPolicy {
    RotationPolicy {
        rotation_interval: Duration::days(30),
        grace_period: Duration::days(7),
        max_keys_in_jwks: 3,
    }
}

/// 完整的内存装配
pub struct TestStack {
    pub clock: ManualClock,
    pub store: Arc<MemoryPolicyStore>,
    pub rules: Arc<FlakyRuleStore>,
    pub matrix: Arc<RuleMatrix>,
    pub notifier: Arc<InProcessNotifier>,
    pub sync: Arc<PolicySyncHandler>,
    pub coordinator: Arc<PolicyCoordinator>,
    pub private_keys: MemoryPrivateKeyStore,
    pub key_manager: Arc<KeyManager>,
    pub tokens: Arc<TokenService>,
    pub cacher: Arc<TokenCacher>,
    pub provider: Arc<CountingProvider>,
    pub roles: Arc<RoleService>,
    pub resources: Arc<ResourceService>,
    pub assignments: Arc<AssignmentService>,
    pub policies: Arc<PolicyService>,
    pub keys: Arc<KeyService>,
    pub apps: Arc<AppCredentialService>,
}

impl TestStack {
    pub async fn new() -> Self {
        Self::with_policy(test_policy()).await
    }

    pub async fn with_policy(policy: RotationPolicy) -> Self {
        let clock = ManualClock::new(Utc::now());
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());

        let store = Arc::new(MemoryPolicyStore::with_clock(clock_arc.clone()));
        let rules = Arc::new(FlakyRuleStore::new(store.clone()));
        let matrix = Arc::new(RuleMatrix::load(rules.clone()).await.unwrap());
        let notifier = Arc::new(InProcessNotifier::default());
        let sync = Arc::new(PolicySyncHandler::new(matrix.clone()));
        notifier.subscribe(sync.clone()).await.unwrap();

        let coordinator = Arc::new(
            PolicyCoordinator::new(CoordinatorPorts {
                roles: store.clone(),
                resources: store.clone(),
                assignments: store.clone(),
                versions: store.clone(),
                enforcer: matrix.clone(),
                notifier: notifier.clone(),
            })
            .with_sync_handler(sync.clone()),
        );

        let private_keys = MemoryPrivateKeyStore::new();
        let key_manager = Arc::new(
            KeyManager::new(
                Arc::new(MemorySigningKeyStore::new()),
                Arc::new(private_keys.clone()),
                Arc::new(FastKeyGenerator),
                clock_arc.clone(),
                policy,
                SigningAlgorithm::RS256,
            )
            .unwrap(),
        );
        let tokens = Arc::new(TokenService::new(
            key_manager.clone(),
            clock_arc.clone(),
            TokenSettings {
                issuer: "iam-core-test".to_string(),
                access_ttl: Duration::minutes(15),
                refresh_ttl: Duration::days(7),
                leeway: Duration::seconds(30),
            },
        ));

        let cacher = Arc::new(TokenCacher::new(
            Arc::new(MemoryTokenCache::new(clock_arc.clone())),
            clock_arc.clone(),
            TokenCacheSettings::default(),
        ));
        let provider = Arc::new(CountingProvider::new(clock.clone()));
        let apps = Arc::new(
            AppCredentialService::new(
                Arc::new(MemoryAppStore::new()),
                Arc::new(AesGcmVault::new(&[9u8; 32]).unwrap()),
                cacher.clone(),
                clock_arc.clone(),
            )
            .with_provider(provider.clone()),
        );

        Self {
            roles: Arc::new(RoleService::new(store.clone(), coordinator.clone())),
            resources: Arc::new(ResourceService::new(store.clone(), coordinator.clone())),
            assignments: Arc::new(AssignmentService::new(store.clone(), coordinator.clone())),
            policies: Arc::new(PolicyService::new(store.clone(), coordinator.clone())),
            keys: Arc::new(KeyService::new(key_manager.clone(), tokens.clone())),
            clock,
            store,
            rules,
            matrix,
            notifier,
            sync,
            coordinator,
            private_keys,
            key_manager,
            tokens,
            cacher,
            provider,
            apps,
        }
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            db: None,
            roles: self.roles.clone(),
            resources: self.resources.clone(),
            assignments: self.assignments.clone(),
            policies: self.policies.clone(),
            keys: self.keys.clone(),
            apps: self.apps.clone(),
            notifier: self.notifier.clone(),
            request_timeout: std::time::Duration::from_secs(5),
            started_at: Instant::now(),
        })
    }

    pub fn enforcer(&self) -> Arc<dyn Enforcer> {
        self.matrix.clone()
    }

    // ==================== Fixtures ====================

    pub async fn create_role(&self, name: &str, tenant: &str) -> Role {
        self.roles
            .create_role(&OpContext::background(), role_request(name, tenant))
            .await
            .unwrap()
    }

    pub async fn create_resource(&self, key: &str, actions: &[&str]) -> Resource {
        self.resources
            .create_resource(
                &OpContext::background(),
                CreateResourceRequest {
                    key: key.to_string(),
                    display_name: key.to_string(),
                    app_name: "scale".to_string(),
                    domain: "form".to_string(),
                    resource_type: "api".to_string(),
                    actions: actions.iter().map(|a| a.to_string()).collect(),
                    description: None,
                    created_by: "tester".to_string(),
                },
            )
            .await
            .unwrap()
    }

    pub async fn version(&self, tenant: &str) -> i64 {
        self.policies
            .current_version(&OpContext::background(), tenant)
            .await
            .unwrap()
    }
}

pub fn role_request(name: &str, tenant: &str) -> CreateRoleRequest {
    CreateRoleRequest {
        name: name.to_string(),
        display_name: name.to_string(),
        tenant_id: tenant.to_string(),
        description: None,
        created_by: "tester".to_string(),
    }
}

pub fn policy_request(role_id: Uuid, resource: &str, action: &str, tenant: &str) -> AddPolicyRequest {
    AddPolicyRequest {
        role_id,
        resource_key: resource.to_string(),
        action: action.to_string(),
        tenant_id: tenant.to_string(),
        changed_by: "tester".to_string(),
        reason: None,
    }
}
