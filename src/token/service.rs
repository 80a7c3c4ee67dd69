//! Token service
//!
//! 用当前 Active 密钥签发 RS* 令牌；验签只认发布集合中的公钥，
//! 因此 Grace 密钥签发的令牌在宽限期内依旧有效。

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use jsonwebtoken::{
    decode, decode_header, encode, errors::ErrorKind, DecodingKey, Header, Validation,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::JwtConfig,
    crypto::resolve_signing_key,
    error::{AppError, Result},
    jwks::KeyManager,
    models::key::SigningKey,
};

use super::claims::{Claims, TokenSubject, TokenType};

#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub issuer: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub leeway: Duration,
}

impl TokenSettings {
    pub fn from_config(config: &JwtConfig) -> Self {
        Self {
            issuer: config.issuer.clone(),
            access_ttl: Duration::seconds(config.access_token_ttl_secs as i64),
            refresh_ttl: Duration::seconds(config.refresh_token_ttl_secs as i64),
            leeway: Duration::seconds(config.leeway_secs as i64),
        }
    }
}

/// 签发结果
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub kid: String,
    pub token_type: TokenType,
    pub expires_at: DateTime<Utc>,
}

/// Token pair response
#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// 访问令牌剩余秒数
    pub expires_in: i64,
}

pub struct TokenService {
    keys: Arc<KeyManager>,
    clock: Arc<dyn Clock>,
    settings: TokenSettings,
    /// 已使用的刷新令牌 jti → exp
    consumed: DashMap<String, i64>,
}

impl TokenService {
    pub fn new(keys: Arc<KeyManager>, clock: Arc<dyn Clock>, settings: TokenSettings) -> Self {
        Self {
            keys,
            clock,
            settings,
            consumed: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &TokenSettings {
        &self.settings
    }

    // ==================== Issue ====================

    pub async fn issue_access(
        &self,
        subject: &TokenSubject,
        ttl: Option<Duration>,
    ) -> Result<IssuedToken> {
        self.issue(subject, TokenType::Access, ttl.unwrap_or(self.settings.access_ttl))
            .await
    }

    pub async fn issue_refresh(
        &self,
        subject: &TokenSubject,
        ttl: Option<Duration>,
    ) -> Result<IssuedToken> {
        self.issue(subject, TokenType::Refresh, ttl.unwrap_or(self.settings.refresh_ttl))
            .await
    }

    pub async fn issue_pair(&self, subject: &TokenSubject) -> Result<TokenPair> {
        let access = self.issue_access(subject, None).await?;
        let refresh = self.issue_refresh(subject, None).await?;

        Ok(TokenPair {
            access_token: access.token,
            refresh_token: refresh.token,
            token_type: "Bearer",
            expires_in: self.settings.access_ttl.num_seconds(),
        })
    }

    async fn issue(
        &self,
        subject: &TokenSubject,
        token_type: TokenType,
        ttl: Duration,
    ) -> Result<IssuedToken> {
        if subject.user_id.is_empty() {
            return Err(AppError::InvalidArgument("user_id is required".to_string()));
        }
        if ttl <= Duration::zero() {
            return Err(AppError::InvalidArgument("token ttl must be positive".to_string()));
        }

        let key = self.keys.get_active_key().await?;
        let algorithm = key.algorithm()?;
        let encoding_key =
            resolve_signing_key(self.keys.private_keys().as_ref(), &key.kid, algorithm).await?;

        let now = self.clock.now();
        let expires_at = now + ttl;
        let claims = Claims {
            iss: self.settings.issuer.clone(),
            sub: subject.user_id.clone(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
            user_id: subject.user_id.clone(),
            account_id: subject.account_id.clone(),
            tenant_id: subject.tenant_id.clone(),
            token_type,
        };

        let mut header = Header::new(algorithm.jwt_algorithm());
        header.kid = Some(key.kid.clone());

        let token = encode(&header, &claims, &encoding_key).map_err(|e| {
            tracing::error!(kid = %key.kid, error = ?e, "Failed to encode token");
            AppError::Internal(format!("failed to encode {} token: {}", token_type, e))
        })?;

        metrics::counter!("token.issued", "type" => token_type.to_string()).increment(1);
        Ok(IssuedToken {
            token,
            jti: claims.jti,
            kid: key.kid,
            token_type,
            expires_at,
        })
    }

    // ==================== Verify ====================

    /// 校验签名与时间声明，不区分令牌类型
    pub async fn verify(&self, token: &str) -> Result<Claims> {
        let header = decode_header(token)
            .map_err(|e| AppError::MalformedClaims(format!("invalid token header: {}", e)))?;
        let kid = header
            .kid
            .ok_or_else(|| AppError::UnknownKid("token header has no kid".to_string()))?;

        let key = self
            .keys
            .find_published(&kid)
            .await?
            .ok_or_else(|| AppError::UnknownKid(kid.clone()))?;

        let algorithm = key.algorithm()?;
        if header.alg != algorithm.jwt_algorithm() {
            tracing::debug!(kid = %kid, alg = ?header.alg, "Token alg does not match key");
            return Err(AppError::SignatureInvalid);
        }

        let claims = decode::<Claims>(token, &decoding_key(&key)?, &self.validation(&key)?)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidRsaKey(_) => AppError::SignatureInvalid,
                ErrorKind::ExpiredSignature => AppError::Expired,
                ErrorKind::ImmatureSignature => AppError::NotYetValid,
                _ => AppError::MalformedClaims(e.to_string()),
            })?
            .claims;

        self.check_time_claims(&claims)?;
        Ok(claims)
    }

    pub async fn verify_access(&self, token: &str) -> Result<Claims> {
        let claims = self.verify(token).await?;
        if claims.token_type != TokenType::Access {
            return Err(AppError::MalformedClaims(
                "expected an access token".to_string(),
            ));
        }
        Ok(claims)
    }

    pub async fn verify_refresh(&self, token: &str) -> Result<Claims> {
        let claims = self.verify(token).await?;
        if claims.token_type != TokenType::Refresh {
            return Err(AppError::MalformedClaims(
                "expected a refresh token".to_string(),
            ));
        }
        Ok(claims)
    }

    /// 用刷新令牌换新的令牌对；每个刷新令牌只能用一次
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.verify_refresh(refresh_token).await?;

        let now = self.clock.now().timestamp();
        self.consumed.retain(|_, exp| *exp > now);

        if self.consumed.insert(claims.jti.clone(), claims.exp).is_some() {
            tracing::warn!(jti = %claims.jti, user_id = %claims.user_id, "Refresh token replayed");
            return Err(AppError::MalformedClaims(
                "refresh token already used".to_string(),
            ));
        }

        self.issue_pair(&claims.subject()).await
    }

    /// 签名与 iss 交给 jsonwebtoken，时间声明按注入时钟判断
    fn validation(&self, key: &SigningKey) -> Result<Validation> {
        let mut validation = Validation::new(key.algorithm()?.jwt_algorithm());
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();
        validation.set_issuer(&[self.settings.issuer.as_str()]);
        Ok(validation)
    }

    fn check_time_claims(&self, claims: &Claims) -> Result<()> {
        let now = self.clock.now().timestamp();
        let leeway = self.settings.leeway.num_seconds();

        // 容忍度只放宽 nbf，过期时刻不延后
        if now >= claims.exp {
            return Err(AppError::Expired);
        }
        if now + leeway < claims.nbf {
            return Err(AppError::NotYetValid);
        }
        if claims.exp <= claims.iat {
            return Err(AppError::MalformedClaims("exp must be after iat".to_string()));
        }
        Ok(())
    }
}

fn decoding_key(key: &SigningKey) -> Result<DecodingKey> {
    let jwk = key.jwk();
    match (jwk.n.as_deref(), jwk.e.as_deref()) {
        (Some(n), Some(e)) => DecodingKey::from_rsa_components(n, e)
            .map_err(|err| AppError::InvalidKey(format!("key {}: {}", key.kid, err))),
        _ => Err(AppError::InvalidKey(format!(
            "key {} has no RSA components",
            key.kid
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        crypto::{keygen::testing::ReusedKeyGenerator, MemoryPrivateKeyStore},
        models::key::{RotationPolicy, SigningAlgorithm},
        repository::MemorySigningKeyStore,
    };

    async fn service(leeway: i64) -> (TokenService, Arc<KeyManager>, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let keys = Arc::new(
            KeyManager::new(
                Arc::new(MemorySigningKeyStore::new()),
                Arc::new(MemoryPrivateKeyStore::new()),
                Arc::new(ReusedKeyGenerator),
                Arc::new(clock.clone()),
                RotationPolicy::default(),
                SigningAlgorithm::RS256,
            )
            .unwrap(),
        );
        keys.create_key(None, None, None).await.unwrap();

        let settings = TokenSettings {
            issuer: "iam-test".to_string(),
            access_ttl: Duration::seconds(900),
            refresh_ttl: Duration::days(7),
            leeway: Duration::seconds(leeway),
        };
        let svc = TokenService::new(keys.clone(), Arc::new(clock.clone()), settings);
        (svc, keys, clock)
    }

    fn subject() -> TokenSubject {
        TokenSubject::new("u1", "acc-1").with_tenant("t1")
    }

    #[tokio::test]
    async fn test_issue_and_verify_access() {
        let (svc, keys, _) = service(0).await;
        let issued = svc.issue_access(&subject(), None).await.unwrap();

        let header = decode_header(&issued.token).unwrap();
        assert_eq!(header.kid.as_deref(), Some(issued.kid.as_str()));
        assert_eq!(header.typ.as_deref(), Some("JWT"));
        assert_eq!(issued.kid, keys.get_active_key().await.unwrap().kid);

        let claims = svc.verify_access(&issued.token).await.unwrap();
        assert_eq!(claims.iss, "iam-test");
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.account_id, "acc-1");
        assert_eq!(claims.tenant_id.as_deref(), Some("t1"));
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let (svc, _, clock) = service(0).await;
        let issued = svc.issue_access(&subject(), None).await.unwrap();

        clock.advance(Duration::seconds(899));
        assert!(svc.verify(&issued.token).await.is_ok());

        clock.advance(Duration::seconds(1));
        assert!(matches!(svc.verify(&issued.token).await, Err(AppError::Expired)));
    }

    #[tokio::test]
    async fn test_leeway_does_not_extend_exp() {
        let (svc, _, clock) = service(30).await;
        let issued = svc
            .issue_access(&subject(), Some(Duration::seconds(60)))
            .await
            .unwrap();

        clock.advance(Duration::seconds(60));
        assert!(matches!(svc.verify(&issued.token).await, Err(AppError::Expired)));
    }

    #[tokio::test]
    async fn test_leeway_applies_to_nbf() {
        let (svc, _, clock) = service(30).await;
        let issued = svc.issue_access(&subject(), None).await.unwrap();

        clock.advance(Duration::seconds(-30));
        assert!(svc.verify(&issued.token).await.is_ok());

        clock.advance(Duration::seconds(-1));
        assert!(matches!(
            svc.verify(&issued.token).await,
            Err(AppError::NotYetValid)
        ));
    }

    #[tokio::test]
    async fn test_not_yet_valid() {
        let (svc, _, clock) = service(0).await;
        let issued = svc.issue_access(&subject(), None).await.unwrap();

        clock.advance(Duration::seconds(-60));
        assert!(matches!(
            svc.verify(&issued.token).await,
            Err(AppError::NotYetValid)
        ));
    }

    #[tokio::test]
    async fn test_tampered_signature() {
        let (svc, _, _) = service(0).await;
        let issued = svc.issue_access(&subject(), None).await.unwrap();

        let mut parts: Vec<String> = issued.token.split('.').map(str::to_string).collect();
        let sig = parts[2].clone();
        let flipped = if sig.starts_with('A') { "B" } else { "A" };
        parts[2] = format!("{}{}", flipped, &sig[1..]);
        let forged = parts.join(".");

        assert!(matches!(
            svc.verify(&forged).await,
            Err(AppError::SignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn test_garbage_and_unknown_kid() {
        let (svc, keys, _) = service(0).await;
        assert!(matches!(
            svc.verify("not-a-token").await,
            Err(AppError::MalformedClaims(_))
        ));

        let issued = svc.issue_access(&subject(), None).await.unwrap();
        keys.force_retire_key(&issued.kid).await.unwrap();
        assert!(matches!(
            svc.verify(&issued.token).await,
            Err(AppError::UnknownKid(_))
        ));
    }

    #[tokio::test]
    async fn test_grace_key_still_verifies() {
        let (svc, keys, _) = service(0).await;
        let issued = svc.issue_access(&subject(), None).await.unwrap();

        keys.rotate_key().await.unwrap();
        assert_ne!(keys.get_active_key().await.unwrap().kid, issued.kid);
        assert!(svc.verify_access(&issued.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_token_type_markers() {
        let (svc, _, _) = service(0).await;
        let pair = svc.issue_pair(&subject()).await.unwrap();
        assert_eq!(pair.expires_in, 900);

        assert!(matches!(
            svc.verify_access(&pair.refresh_token).await,
            Err(AppError::MalformedClaims(_))
        ));
        assert!(matches!(
            svc.verify_refresh(&pair.access_token).await,
            Err(AppError::MalformedClaims(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_is_single_use() {
        let (svc, _, _) = service(0).await;
        let pair = svc.issue_pair(&subject()).await.unwrap();

        let renewed = svc.refresh(&pair.refresh_token).await.unwrap();
        let claims = svc.verify_access(&renewed.access_token).await.unwrap();
        assert_eq!(claims.subject(), subject());

        assert!(matches!(
            svc.refresh(&pair.refresh_token).await,
            Err(AppError::MalformedClaims(_))
        ));
    }

    #[tokio::test]
    async fn test_issue_requires_active_key() {
        let (svc, keys, _) = service(0).await;
        let active = keys.get_active_key().await.unwrap();
        keys.enter_grace_period(&active.kid).await.unwrap();

        assert!(matches!(
            svc.issue_access(&subject(), None).await,
            Err(AppError::NotFound(_))
        ));
    }
}
