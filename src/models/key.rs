//! JWKS signing key models
//!
//! 状态机：`Active → Grace → Retired`，另有从任意状态到 `Retired` 的紧急退役。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// 密钥状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "key_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// 可签名、可验签
    Active,
    /// 仅用于验签
    Grace,
    /// 不再发布
    Retired,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::Active => write!(f, "active"),
            KeyStatus::Grace => write!(f, "grace"),
            KeyStatus::Retired => write!(f, "retired"),
        }
    }
}

impl FromStr for KeyStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(KeyStatus::Active),
            "grace" => Ok(KeyStatus::Grace),
            "retired" => Ok(KeyStatus::Retired),
            other => Err(AppError::InvalidArgument(format!("unknown key status: {}", other))),
        }
    }
}

/// 签名算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    RS256,
    RS384,
    RS512,
}

impl SigningAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::RS256 => "RS256",
            SigningAlgorithm::RS384 => "RS384",
            SigningAlgorithm::RS512 => "RS512",
        }
    }

    /// RSA 模长
    pub fn modulus_bits(&self) -> usize {
        match self {
            SigningAlgorithm::RS256 => 2048,
            SigningAlgorithm::RS384 => 3072,
            SigningAlgorithm::RS512 => 4096,
        }
    }

    pub fn jwt_algorithm(&self) -> jsonwebtoken::Algorithm {
        match self {
            SigningAlgorithm::RS256 => jsonwebtoken::Algorithm::RS256,
            SigningAlgorithm::RS384 => jsonwebtoken::Algorithm::RS384,
            SigningAlgorithm::RS512 => jsonwebtoken::Algorithm::RS512,
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SigningAlgorithm {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RS256" => Ok(SigningAlgorithm::RS256),
            "RS384" => Ok(SigningAlgorithm::RS384),
            "RS512" => Ok(SigningAlgorithm::RS512),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported signing algorithm: {}",
                other
            ))),
        }
    }
}

/// RFC 7517 公钥
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_field: String,
    pub alg: String,
    pub kid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

/// JWK Set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// 签名密钥（公钥部分 + 生命周期）
///
/// 私钥单独存放，按 `kid` 寻址。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SigningKey {
    pub kid: String,
    pub status: KeyStatus,
    pub public_jwk: Json<Jwk>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// 进入宽限期的时间
    pub grace_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SigningKey {
    pub fn new(
        kid: impl Into<String>,
        jwk: Jwk,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kid: kid.into(),
            status: KeyStatus::Active,
            public_jwk: Json(jwk),
            not_before,
            not_after,
            grace_since: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn jwk(&self) -> &Jwk {
        &self.public_jwk.0
    }

    pub fn algorithm(&self) -> Result<SigningAlgorithm, AppError> {
        self.jwk().alg.parse()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.not_after
    }

    /// `not_before <= now <= not_after`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// 只有在有效期内的 Active 密钥可签名
    pub fn can_sign(&self, now: DateTime<Utc>) -> bool {
        self.status == KeyStatus::Active && self.is_valid_at(now)
    }

    /// Active 或 Grace，且在有效期内
    pub fn should_publish(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, KeyStatus::Active | KeyStatus::Grace) && self.is_valid_at(now)
    }

    /// 宽限期是否已结束
    pub fn grace_elapsed(&self, grace_period: Duration, now: DateTime<Utc>) -> bool {
        match (self.status, self.grace_since) {
            (KeyStatus::Grace, Some(since)) => since + grace_period <= now,
            _ => false,
        }
    }

    /// 密钥年龄，从 not_before 起算
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.not_before
    }

    pub fn enter_grace(&mut self, now: DateTime<Utc>) -> Result<(), AppError> {
        if self.status != KeyStatus::Active {
            return Err(AppError::InvalidState(format!(
                "key {} cannot enter grace from {}",
                self.kid, self.status
            )));
        }
        self.status = KeyStatus::Grace;
        self.grace_since = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn retire(&mut self, now: DateTime<Utc>) -> Result<(), AppError> {
        if self.status != KeyStatus::Grace {
            return Err(AppError::InvalidState(format!(
                "key {} cannot be retired from {}",
                self.kid, self.status
            )));
        }
        self.status = KeyStatus::Retired;
        self.updated_at = now;
        Ok(())
    }

    /// 紧急退役，任意状态均可
    pub fn force_retire(&mut self, now: DateTime<Utc>) {
        self.status = KeyStatus::Retired;
        self.updated_at = now;
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let jwk = self.jwk();
        if self.kid.is_empty() {
            return Err(AppError::InvalidArgument("kid must not be empty".to_string()));
        }
        if jwk.use_field != "sig" {
            return Err(AppError::InvalidArgument(format!(
                "key {} must have use=sig",
                self.kid
            )));
        }
        if jwk.alg.is_empty() {
            return Err(AppError::InvalidArgument(format!("key {} has no alg", self.kid)));
        }
        if jwk.kid != self.kid {
            return Err(AppError::InvalidArgument(format!(
                "jwk kid {} does not match key {}",
                jwk.kid, self.kid
            )));
        }
        if jwk.kty == "RSA" && (jwk.n.is_none() || jwk.e.is_none()) {
            return Err(AppError::InvalidArgument(format!(
                "RSA key {} is missing n or e",
                self.kid
            )));
        }
        if self.not_after < self.not_before {
            return Err(AppError::InvalidArgument(format!(
                "key {} not_after precedes not_before",
                self.kid
            )));
        }
        Ok(())
    }
}

/// HTTP 缓存标记
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheTag {
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

impl CacheTag {
    /// `ETag = "hex(sha256(body))"`
    pub fn for_body(body: &[u8], last_modified: DateTime<Utc>) -> Self {
        let digest = Sha256::digest(body);
        Self {
            etag: format!("\"{}\"", hex::encode(digest)),
            last_modified,
        }
    }

    pub fn matches(&self, etag: &str) -> bool {
        self.etag == etag
    }
}

/// 序列化后的 JWKS 及其缓存标记
#[derive(Debug, Clone)]
pub struct PublishedJwks {
    pub body: Vec<u8>,
    pub tag: CacheTag,
}

/// `build_jwks` 的结果
#[derive(Debug, Clone)]
pub enum JwksSnapshot {
    Changed(PublishedJwks),
    /// 调用方持有的缓存标记仍然有效
    Unchanged(CacheTag),
}

/// 轮换策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub rotation_interval: Duration,
    pub grace_period: Duration,
    pub max_keys_in_jwks: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            rotation_interval: Duration::days(30),
            grace_period: Duration::days(7),
            max_keys_in_jwks: 3,
        }
    }
}

impl RotationPolicy {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.rotation_interval <= Duration::zero() {
            return Err(AppError::InvalidArgument(
                "rotation interval must be positive".to_string(),
            ));
        }
        if self.grace_period <= Duration::zero() {
            return Err(AppError::InvalidArgument(
                "grace period must be positive".to_string(),
            ));
        }
        if self.max_keys_in_jwks < 2 {
            return Err(AppError::InvalidArgument(
                "max keys in JWKS must be at least 2".to_string(),
            ));
        }
        if self.grace_period >= self.rotation_interval {
            return Err(AppError::InvalidArgument(
                "grace period must be shorter than rotation interval".to_string(),
            ));
        }
        Ok(())
    }
}

/// 密钥统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyStats {
    pub total: usize,
    pub active: usize,
    pub grace: usize,
    pub retired: usize,
    pub published: usize,
}

/// 轮换状态
#[derive(Debug, Clone, Serialize)]
pub struct RotationStatus {
    pub active_kid: Option<String>,
    pub last_rotation_at: Option<DateTime<Utc>>,
    pub next_rotation_at: Option<DateTime<Utc>>,
    pub should_rotate: bool,
    pub reason: String,
}
