//! JWKS key lifecycle manager
//!
//! 负责签名密钥的创建、轮换、宽限、退役与清理，并构建对外发布的 JWK Set。

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    clock::Clock,
    crypto::{KeyPairGenerator, PrivateKeyStore},
    error::{AppError, Result},
    models::{
        key::{
            CacheTag, Jwks, JwksSnapshot, KeyStats, KeyStatus, PublishedJwks, RotationPolicy,
            RotationStatus, SigningAlgorithm, SigningKey,
        },
        Page, Pagination,
    },
    repository::SigningKeyStore,
};

/// 轮换结果
#[derive(Debug, Clone, serde::Serialize)]
pub struct RotationOutcome {
    pub new_kid: String,
    /// 转入 Grace 的旧 Active 密钥
    pub demoted: Vec<String>,
    /// 宽限期结束或超出发布上限而退役的密钥
    pub retired: Vec<String>,
    /// 已过期并删除的密钥
    pub deleted: Vec<String>,
}

/// 清理结果
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CleanupOutcome {
    pub deleted: Vec<String>,
    pub force_retired: Vec<String>,
}

pub struct KeyManager {
    keys: Arc<dyn SigningKeyStore>,
    private_keys: Arc<dyn PrivateKeyStore>,
    generator: Arc<dyn KeyPairGenerator>,
    clock: Arc<dyn Clock>,
    policy: RotationPolicy,
    algorithm: SigningAlgorithm,
    /// 单个密钥的状态迁移锁
    kid_locks: DashMap<String, Arc<Mutex<()>>>,
    /// 轮换串行执行
    rotation: Mutex<()>,
    /// 上一次生成的 kid 时间戳，保证单调
    last_kid: std::sync::Mutex<i64>,
}

impl KeyManager {
    pub fn new(
        keys: Arc<dyn SigningKeyStore>,
        private_keys: Arc<dyn PrivateKeyStore>,
        generator: Arc<dyn KeyPairGenerator>,
        clock: Arc<dyn Clock>,
        policy: RotationPolicy,
        algorithm: SigningAlgorithm,
    ) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            keys,
            private_keys,
            generator,
            clock,
            policy,
            algorithm,
            kid_locks: DashMap::new(),
            rotation: Mutex::new(()),
            last_kid: std::sync::Mutex::new(0),
        })
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    pub fn private_keys(&self) -> &Arc<dyn PrivateKeyStore> {
        &self.private_keys
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// `key-{unix seconds}`，同一秒内多次生成时顺延
    fn next_kid(&self, now: DateTime<Utc>) -> String {
        let mut last = self.last_kid.lock().unwrap_or_else(|e| e.into_inner());
        let ts = now.timestamp().max(*last + 1);
        *last = ts;
        format!("key-{}", ts)
    }

    fn lock_for(&self, kid: &str) -> Arc<Mutex<()>> {
        self.kid_locks
            .entry(kid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn require(&self, kid: &str) -> Result<SigningKey> {
        self.keys
            .find_by_kid(kid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("key {}", kid)))
    }

    // ==================== Creation ====================

    /// 创建新的 Active 密钥
    ///
    /// 默认有效期为 `[now, now + 轮换周期 + 宽限期]`。
    pub async fn create_key(
        &self,
        algorithm: Option<SigningAlgorithm>,
        not_before: Option<DateTime<Utc>>,
        not_after: Option<DateTime<Utc>>,
    ) -> Result<SigningKey> {
        let algorithm = algorithm.unwrap_or(self.algorithm);
        let now = self.clock.now();
        let not_before = not_before.unwrap_or(now);
        let not_after = not_after
            .unwrap_or(not_before + self.policy.rotation_interval + self.policy.grace_period);

        if not_after <= not_before {
            return Err(AppError::InvalidArgument(
                "not_after must be after not_before".to_string(),
            ));
        }

        let kid = self.next_kid(now);
        let pair = self.generator.generate(algorithm, &kid).await?;

        let key = SigningKey::new(kid.clone(), pair.public_jwk, not_before, not_after, now);
        key.validate()?;

        // 先落私钥：公钥一旦可见，私钥必须可解析
        self.private_keys.save(&kid, &pair.private_key).await?;
        if let Err(e) = self.keys.save(&key).await {
            if let Err(cleanup) = self.private_keys.delete(&kid).await {
                warn!(kid = %kid, error = %cleanup, "Failed to remove orphaned private key");
            }
            return Err(e);
        }

        info!(kid = %kid, alg = %algorithm, not_after = %not_after, "Created signing key");
        Ok(key)
    }

    /// 没有可用的 Active 密钥时创建一个
    pub async fn ensure_active_key(&self) -> Result<SigningKey> {
        match self.get_active_key().await {
            Ok(key) => Ok(key),
            Err(AppError::NotFound(_)) => self.create_key(None, None, None).await,
            Err(e) => Err(e),
        }
    }

    // ==================== Queries ====================

    /// 当前可签名的密钥；多个时取最新
    pub async fn get_active_key(&self) -> Result<SigningKey> {
        let now = self.clock.now();
        self.keys
            .find_by_status(KeyStatus::Active)
            .await?
            .into_iter()
            .filter(|k| k.can_sign(now))
            .max_by(|a, b| a.not_before.cmp(&b.not_before).then(a.kid.cmp(&b.kid)))
            .ok_or_else(|| AppError::NotFound("no active signing key".to_string()))
    }

    pub async fn get_key(&self, kid: &str) -> Result<Option<SigningKey>> {
        self.keys.find_by_kid(kid).await
    }

    pub async fn list_keys(
        &self,
        status: Option<KeyStatus>,
        page: Pagination,
    ) -> Result<Page<SigningKey>> {
        self.keys.list(status, page).await
    }

    /// Active ∪ Grace 且在有效期内，按 kid 升序
    pub async fn publishable_keys(&self) -> Result<Vec<SigningKey>> {
        let now = self.clock.now();
        let mut keys = self.keys.find_publishable(now).await?;
        keys.retain(|k| k.should_publish(now));
        keys.sort_by(|a, b| a.kid.cmp(&b.kid));
        Ok(keys)
    }

    /// 在发布集合中按 kid 查找
    pub async fn find_published(&self, kid: &str) -> Result<Option<SigningKey>> {
        let now = self.clock.now();
        Ok(self
            .keys
            .find_by_kid(kid)
            .await?
            .filter(|k| k.should_publish(now)))
    }

    // ==================== Transitions ====================

    pub async fn enter_grace_period(&self, kid: &str) -> Result<SigningKey> {
        let lock = self.lock_for(kid);
        let _guard = lock.lock().await;

        let mut key = self.require(kid).await?;
        key.enter_grace(self.clock.now())?;
        self.keys.update(&key).await?;
        info!(kid = %kid, "Key entered grace period");
        Ok(key)
    }

    pub async fn retire_key(&self, kid: &str) -> Result<SigningKey> {
        let lock = self.lock_for(kid);
        let _guard = lock.lock().await;

        let mut key = self.require(kid).await?;
        key.retire(self.clock.now())?;
        self.keys.update(&key).await?;
        info!(kid = %kid, "Key retired");
        Ok(key)
    }

    /// 紧急退役（怀疑泄露）
    pub async fn force_retire_key(&self, kid: &str) -> Result<SigningKey> {
        let lock = self.lock_for(kid);
        let _guard = lock.lock().await;

        let mut key = self.require(kid).await?;
        let previous = key.status;
        key.force_retire(self.clock.now());
        self.keys.update(&key).await?;
        warn!(kid = %kid, from = %previous, "Key force-retired");
        Ok(key)
    }

    // ==================== Rotation ====================

    /// 没有 Active 密钥，或最早的 Active 密钥已满一个轮换周期
    pub async fn should_rotate(&self) -> Result<(bool, String)> {
        let now = self.clock.now();
        let active = self.keys.find_by_status(KeyStatus::Active).await?;

        let oldest = active.iter().min_by_key(|k| k.not_before);
        Ok(match oldest {
            None => (true, "no active key".to_string()),
            Some(key) if key.age(now) >= self.policy.rotation_interval => (
                true,
                format!(
                    "key {} is {} days old, rotation interval is {} days",
                    key.kid,
                    key.age(now).num_days(),
                    self.policy.rotation_interval.num_days()
                ),
            ),
            Some(key) => (
                false,
                format!(
                    "key {} is due for rotation at {}",
                    key.kid,
                    key.not_before + self.policy.rotation_interval
                ),
            ),
        })
    }

    /// 执行一次轮换
    ///
    /// 1. 现有 Active 转入 Grace
    /// 2. 生成新的 Active 密钥
    /// 3. 宽限期已满的 Grace 退役，发布数量超限时从最旧的 Grace 开始退役
    /// 4. 删除已过期的 Retired 密钥及其私钥
    pub async fn rotate_key(&self) -> Result<RotationOutcome> {
        let _rotation = self.rotation.lock().await;

        let mut demoted = Vec::new();
        for key in self.keys.find_by_status(KeyStatus::Active).await? {
            match self.enter_grace_period(&key.kid).await {
                Ok(_) => demoted.push(key.kid),
                // 并发迁移已经处理了这个密钥
                Err(AppError::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let new_key = self.create_key(None, None, None).await?;
        let retired = self.retire_excess_grace_keys().await?;
        let cleanup = self.cleanup_expired_keys().await?;

        metrics::counter!("jwks.rotations").increment(1);
        info!(
            new_kid = %new_key.kid,
            demoted = ?demoted,
            retired = ?retired,
            deleted = ?cleanup.deleted,
            "Rotated signing key"
        );

        Ok(RotationOutcome {
            new_kid: new_key.kid,
            demoted,
            retired,
            deleted: cleanup.deleted,
        })
    }

    async fn retire_excess_grace_keys(&self) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut retired = Vec::new();

        let mut grace = self.keys.find_by_status(KeyStatus::Grace).await?;
        grace.sort_by(|a, b| {
            a.grace_since
                .cmp(&b.grace_since)
                .then(a.not_before.cmp(&b.not_before))
                .then(a.kid.cmp(&b.kid))
        });

        // 宽限期已满
        let mut remaining = Vec::with_capacity(grace.len());
        for key in grace {
            if key.grace_elapsed(self.policy.grace_period, now) {
                self.retire_key(&key.kid).await?;
                retired.push(key.kid);
            } else {
                remaining.push(key);
            }
        }

        // 超出发布上限，从最旧的开始退役
        let mut published = self.publishable_keys().await?.len();
        for key in remaining {
            if published <= self.policy.max_keys_in_jwks {
                break;
            }
            if key.should_publish(now) {
                self.retire_key(&key.kid).await?;
                retired.push(key.kid);
                published -= 1;
            }
        }

        Ok(retired)
    }

    /// 删除已过 not_after 的 Retired 密钥与私钥；过期但未退役的先强制退役
    pub async fn cleanup_expired_keys(&self) -> Result<CleanupOutcome> {
        let now = self.clock.now();
        let mut outcome = CleanupOutcome::default();

        for key in self.keys.find_all().await? {
            if !key.is_expired(now) {
                continue;
            }
            if key.status != KeyStatus::Retired {
                self.force_retire_key(&key.kid).await?;
                outcome.force_retired.push(key.kid.clone());
            }

            self.private_keys.delete(&key.kid).await?;
            self.keys.delete(&key.kid).await?;
            self.kid_locks.remove(&key.kid);
            info!(kid = %key.kid, "Deleted expired key");
            outcome.deleted.push(key.kid);
        }

        Ok(outcome)
    }

    // ==================== Publication ====================

    /// 构建 JWKS；`known` 与当前标记相同时只返回标记
    pub async fn build_jwks(&self, known: Option<&str>) -> Result<JwksSnapshot> {
        let keys = self.publishable_keys().await?;

        let last_modified = keys
            .iter()
            .map(|k| k.updated_at)
            .max()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let jwks = Jwks {
            keys: keys.iter().map(|k| k.jwk().clone()).collect(),
        };
        let body = serde_json::to_vec(&jwks)
            .map_err(|e| AppError::Internal(format!("failed to serialize JWKS: {}", e)))?;
        let tag = CacheTag::for_body(&body, last_modified);

        if known.is_some_and(|etag| tag.matches(etag)) {
            return Ok(JwksSnapshot::Unchanged(tag));
        }
        Ok(JwksSnapshot::Changed(PublishedJwks { body, tag }))
    }

    // ==================== Stats ====================

    pub async fn key_stats(&self) -> Result<KeyStats> {
        let now = self.clock.now();
        let all = self.keys.find_all().await?;

        let mut stats = KeyStats {
            total: all.len(),
            ..KeyStats::default()
        };
        for key in &all {
            match key.status {
                KeyStatus::Active => stats.active += 1,
                KeyStatus::Grace => stats.grace += 1,
                KeyStatus::Retired => stats.retired += 1,
            }
            if key.should_publish(now) {
                stats.published += 1;
            }
        }
        Ok(stats)
    }

    pub async fn rotation_status(&self) -> Result<RotationStatus> {
        let (should_rotate, reason) = self.should_rotate().await?;
        let active = self.get_active_key().await.ok();
        let last_rotation_at = active.as_ref().map(|k| k.created_at);
        let next_rotation_at = active
            .as_ref()
            .map(|k| k.not_before + self.policy.rotation_interval);

        Ok(RotationStatus {
            active_kid: active.map(|k| k.kid),
            last_rotation_at,
            next_rotation_at,
            should_rotate,
            reason,
        })
    }

    pub fn grace_period(&self) -> Duration {
        self.policy.grace_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        crypto::{keygen::testing::ReusedKeyGenerator, MemoryPrivateKeyStore},
        repository::MemorySigningKeyStore,
    };

    fn manager(clock: ManualClock) -> (KeyManager, MemoryPrivateKeyStore) {
        let private_keys = MemoryPrivateKeyStore::new();
        let manager = KeyManager::new(
            Arc::new(MemorySigningKeyStore::new()),
            Arc::new(private_keys.clone()),
            Arc::new(ReusedKeyGenerator),
            Arc::new(clock),
            RotationPolicy::default(),
            SigningAlgorithm::RS256,
        )
        .unwrap();
        (manager, private_keys)
    }

    #[tokio::test]
    async fn test_should_rotate_without_keys() {
        let (m, _) = manager(ManualClock::new(Utc::now()));
        let (rotate, reason) = m.should_rotate().await.unwrap();
        assert!(rotate);
        assert_eq!(reason, "no active key");
    }

    #[tokio::test]
    async fn test_should_rotate_after_interval() {
        let clock = ManualClock::new(Utc::now());
        let (m, _) = manager(clock.clone());
        m.create_key(None, None, None).await.unwrap();
        assert!(!m.should_rotate().await.unwrap().0);

        clock.advance(Duration::days(30));
        assert!(m.should_rotate().await.unwrap().0);
    }

    #[tokio::test]
    async fn test_rotate_twice_keeps_previous_key_published() {
        let clock = ManualClock::new(Utc::now());
        let (m, private_keys) = manager(clock.clone());

        let k1 = m.create_key(None, None, None).await.unwrap();
        let first = m.rotate_key().await.unwrap();
        let second = m.rotate_key().await.unwrap();

        assert_eq!(first.demoted, vec![k1.kid.clone()]);
        assert_eq!(second.demoted, vec![first.new_kid.clone()]);
        assert_ne!(first.new_kid, second.new_kid);

        let published: Vec<String> = m
            .publishable_keys()
            .await
            .unwrap()
            .into_iter()
            .map(|k| k.kid)
            .collect();
        assert_eq!(published, vec![k1.kid, first.new_kid.clone(), second.new_kid.clone()]);
        assert_eq!(m.get_active_key().await.unwrap().kid, second.new_kid);
        assert_eq!(private_keys.len(), 3);
    }

    #[tokio::test]
    async fn test_eviction_respects_max_keys() {
        let clock = ManualClock::new(Utc::now());
        let (m, _) = manager(clock);

        let k1 = m.create_key(None, None, None).await.unwrap();
        for _ in 0..3 {
            m.rotate_key().await.unwrap();
        }

        let stats = m.key_stats().await.unwrap();
        assert_eq!(stats.published, 3);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.retired, 1);
        assert_eq!(
            m.get_key(&k1.kid).await.unwrap().unwrap().status,
            KeyStatus::Retired
        );
    }

    #[tokio::test]
    async fn test_grace_expiry_retires_on_next_rotation() {
        let clock = ManualClock::new(Utc::now());
        let (m, _) = manager(clock.clone());

        let k1 = m.create_key(None, None, None).await.unwrap();
        m.rotate_key().await.unwrap();
        assert!(m.find_published(&k1.kid).await.unwrap().is_some());

        clock.advance(Duration::days(7));
        let outcome = m.rotate_key().await.unwrap();
        assert!(outcome.retired.contains(&k1.kid));
        assert!(m.find_published(&k1.kid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_keys_are_deleted_with_private_half() {
        let clock = ManualClock::new(Utc::now());
        let (m, private_keys) = manager(clock.clone());

        let k1 = m.create_key(None, None, None).await.unwrap();
        m.rotate_key().await.unwrap();
        clock.advance(Duration::days(38));
        m.rotate_key().await.unwrap();

        assert!(m.get_key(&k1.kid).await.unwrap().is_none());
        assert!(!private_keys.exists(&k1.kid).await.unwrap());
    }

    #[tokio::test]
    async fn test_transition_guards() {
        let (m, _) = manager(ManualClock::new(Utc::now()));
        let key = m.create_key(None, None, None).await.unwrap();

        assert!(matches!(
            m.retire_key(&key.kid).await,
            Err(AppError::InvalidState(_))
        ));
        m.enter_grace_period(&key.kid).await.unwrap();
        assert!(matches!(
            m.enter_grace_period(&key.kid).await,
            Err(AppError::InvalidState(_))
        ));
        m.retire_key(&key.kid).await.unwrap();
        m.force_retire_key(&key.kid).await.unwrap();
        assert!(matches!(
            m.force_retire_key("missing").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_build_jwks_cache_tag() {
        let (m, _) = manager(ManualClock::new(Utc::now()));
        m.create_key(None, None, None).await.unwrap();
        m.rotate_key().await.unwrap();

        let published = match m.build_jwks(None).await.unwrap() {
            JwksSnapshot::Changed(p) => p,
            JwksSnapshot::Unchanged(_) => panic!("expected body"),
        };
        let jwks: Jwks = serde_json::from_slice(&published.body).unwrap();
        assert_eq!(jwks.keys.len(), 2);
        assert!(jwks.keys[0].kid < jwks.keys[1].kid);

        // 相同标记
        match m.build_jwks(Some(&published.tag.etag)).await.unwrap() {
            JwksSnapshot::Unchanged(tag) => assert_eq!(tag, published.tag),
            JwksSnapshot::Changed(_) => panic!("expected unchanged"),
        }

        // 序列化结果确定
        match m.build_jwks(Some("\"stale\"")).await.unwrap() {
            JwksSnapshot::Changed(again) => assert_eq!(again.body, published.body),
            JwksSnapshot::Unchanged(_) => panic!("expected body"),
        }
    }

    #[tokio::test]
    async fn test_kids_are_unique_within_a_second() {
        let (m, _) = manager(ManualClock::new(Utc::now()));
        let a = m.create_key(None, None, None).await.unwrap();
        let b = m.create_key(None, None, None).await.unwrap();
        assert_ne!(a.kid, b.kid);
        assert!(a.kid < b.kid);
    }
}
