//! Upstream access-token cache
//!
//! 同一个 appId 同时最多只有一个上游拉取；锁是带 TTL 的租约，
//! 持有者崩溃后租约到期自动释放。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::AccessTokenConfig,
    error::{AppError, Result},
    models::app::AppAccessToken,
};

pub fn token_key(app_id: &str) -> String {
    format!("authz:access_token:{}", app_id)
}

pub fn lock_key(app_id: &str) -> String {
    format!("authz:access_token:{}:lock", app_id)
}

/// 刷新锁租约
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshLease {
    pub key: String,
    pub holder: Uuid,
}

/// 共享令牌缓存
#[async_trait]
pub trait AccessTokenCache: Send + Sync {
    async fn get(&self, app_id: &str) -> Result<Option<AppAccessToken>>;
    async fn set(&self, app_id: &str, token: &AppAccessToken, ttl: Duration) -> Result<()>;
    /// 已被他人持有时返回 `None`
    async fn try_lock_refresh(&self, app_id: &str, ttl: Duration) -> Result<Option<RefreshLease>>;
    /// 只释放自己持有的租约
    async fn release(&self, lease: &RefreshLease) -> Result<()>;
}

/// 上游身份提供方
#[async_trait]
pub trait UpstreamTokenProvider: Send + Sync {
    async fn fetch(&self, app_id: &str, app_secret: &secrecy::Secret<String>)
        -> Result<AppAccessToken>;
}

// ==================== In-memory cache ====================

#[derive(Debug, Clone)]
struct Cached {
    token: AppAccessToken,
    evict_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Lease {
    holder: Uuid,
    expires_at: DateTime<Utc>,
}

/// 进程内实现，过期条目在读取时删除
#[derive(Clone)]
pub struct MemoryTokenCache {
    entries: Arc<DashMap<String, Cached>>,
    leases: Arc<DashMap<String, Lease>>,
    clock: Arc<dyn Clock>,
}

impl MemoryTokenCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            leases: Arc::new(DashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AccessTokenCache for MemoryTokenCache {
    async fn get(&self, app_id: &str) -> Result<Option<AppAccessToken>> {
        let key = token_key(app_id);
        let now = self.clock.now();

        if let Some(entry) = self.entries.get(&key) {
            if entry.evict_at > now {
                return Ok(Some(entry.token.clone()));
            }
        }
        self.entries.remove_if(&key, |_, e| e.evict_at <= now);
        Ok(None)
    }

    async fn set(&self, app_id: &str, token: &AppAccessToken, ttl: Duration) -> Result<()> {
        if ttl <= Duration::zero() {
            return Err(AppError::InvalidArgument("cache ttl must be positive".to_string()));
        }
        self.entries.insert(
            token_key(app_id),
            Cached {
                token: token.clone(),
                evict_at: self.clock.now() + ttl,
            },
        );
        Ok(())
    }

    async fn try_lock_refresh(&self, app_id: &str, ttl: Duration) -> Result<Option<RefreshLease>> {
        let key = lock_key(app_id);
        let now = self.clock.now();
        let holder = Uuid::new_v4();

        let lease = Lease {
            holder,
            expires_at: now + ttl,
        };
        let acquired = match self.leases.entry(key.clone()) {
            Entry::Occupied(mut held) if held.get().expires_at <= now => {
                held.insert(lease);
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(lease);
                true
            }
        };

        Ok(acquired.then_some(RefreshLease { key, holder }))
    }

    async fn release(&self, lease: &RefreshLease) -> Result<()> {
        self.leases.remove_if(&lease.key, |_, l| l.holder == lease.holder);
        Ok(())
    }
}

// ==================== Single-flight ====================

#[derive(Debug, Clone, Copy)]
pub struct TokenCacheSettings {
    pub refresh_skew: Duration,
    /// 缓存 TTL 下限
    pub cache_ttl_min: Duration,
    pub lock_ttl: Duration,
}

impl TokenCacheSettings {
    pub fn from_config(config: &AccessTokenConfig) -> Self {
        Self {
            refresh_skew: Duration::seconds(config.refresh_skew_secs as i64),
            cache_ttl_min: Duration::seconds(config.cache_ttl_min_secs as i64),
            lock_ttl: Duration::seconds(config.lock_ttl_secs as i64),
        }
    }
}

impl Default for TokenCacheSettings {
    fn default() -> Self {
        Self {
            refresh_skew: Duration::seconds(120),
            cache_ttl_min: Duration::seconds(60),
            lock_ttl: Duration::seconds(10),
        }
    }
}

pub struct TokenCacher {
    cache: Arc<dyn AccessTokenCache>,
    clock: Arc<dyn Clock>,
    settings: TokenCacheSettings,
}

impl TokenCacher {
    pub fn new(
        cache: Arc<dyn AccessTokenCache>,
        clock: Arc<dyn Clock>,
        settings: TokenCacheSettings,
    ) -> Self {
        Self {
            cache,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &TokenCacheSettings {
        &self.settings
    }

    /// 返回距过期还有超过 `skew` 的缓存令牌，否则在刷新锁内拉取
    ///
    /// 没抢到锁且缓存仍为空时返回 `RefreshInProgress`。
    #[instrument(skip(self, fetch))]
    pub async fn ensure_token<F, Fut>(
        &self,
        app_id: &str,
        skew: Option<Duration>,
        fetch: F,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<AppAccessToken>> + Send,
    {
        let skew = skew.unwrap_or(self.settings.refresh_skew);

        if let Some(token) = self.fresh_cached(app_id, skew).await? {
            metrics::counter!("idp.token_cache.hits").increment(1);
            return Ok(token);
        }

        match self.cache.try_lock_refresh(app_id, self.settings.lock_ttl).await? {
            Some(lease) => {
                self.refresh_under_lease(app_id, skew, &lease, true, fetch)
                    .await
            }
            None => {
                debug!(app_id = %app_id, "Refresh lock held elsewhere, re-reading cache");
                match self.cache.get(app_id).await? {
                    Some(cached) if cached.expires_at > self.clock.now() => Ok(cached.token),
                    _ => Err(AppError::RefreshInProgress(format!(
                        "access token for {} is being refreshed",
                        app_id
                    ))),
                }
            }
        }
    }

    /// 忽略缓存强制刷新，仍受刷新锁约束
    #[instrument(skip(self, fetch))]
    pub async fn refresh<F, Fut>(&self, app_id: &str, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<AppAccessToken>> + Send,
    {
        match self.cache.try_lock_refresh(app_id, self.settings.lock_ttl).await? {
            Some(lease) => {
                self.refresh_under_lease(app_id, self.settings.refresh_skew, &lease, false, fetch)
                    .await
            }
            None => Err(AppError::RefreshInProgress(format!(
                "access token for {} is being refreshed",
                app_id
            ))),
        }
    }

    async fn fresh_cached(&self, app_id: &str, skew: Duration) -> Result<Option<String>> {
        Ok(self
            .cache
            .get(app_id)
            .await?
            .filter(|cached| cached.expires_at > self.clock.now() + skew)
            .map(|cached| cached.token))
    }

    /// `reuse_fresh` 为真时，拿到锁后先复查缓存：排队等锁期间上一个持有者可能已写入新令牌
    async fn refresh_under_lease<F, Fut>(
        &self,
        app_id: &str,
        skew: Duration,
        lease: &RefreshLease,
        reuse_fresh: bool,
        fetch: F,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<AppAccessToken>> + Send,
    {
        let cached = if reuse_fresh {
            self.fresh_cached(app_id, skew).await
        } else {
            Ok(None)
        };
        let result = match cached {
            Ok(Some(token)) => {
                debug!(app_id = %app_id, "Token refreshed by previous lock holder");
                Ok(token)
            }
            Ok(None) => self.fetch_and_store(app_id, skew, fetch).await,
            Err(e) => Err(e),
        };

        if let Err(e) = self.cache.release(lease).await {
            tracing::warn!(app_id = %app_id, error = %e, "Failed to release refresh lock");
        }
        result
    }

    async fn fetch_and_store<F, Fut>(&self, app_id: &str, skew: Duration, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<AppAccessToken>> + Send,
    {
        let fresh = fetch().await?;
        metrics::counter!("idp.token_cache.refreshes").increment(1);

        let ttl = ((fresh.expires_at - self.clock.now()) - skew).max(self.settings.cache_ttl_min);
        self.cache.set(app_id, &fresh, ttl).await?;

        info!(app_id = %app_id, ttl_secs = ttl.num_seconds(), "Access token refreshed");
        Ok(fresh.token)
    }
}
