//! RSA key pair generation

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rsa::{traits::PublicKeyParts, RsaPrivateKey};

use crate::{
    error::{AppError, Result},
    models::key::{Jwk, SigningAlgorithm},
};

/// 新生成的密钥对
pub struct GeneratedKeyPair {
    pub kid: String,
    pub algorithm: SigningAlgorithm,
    pub private_key: RsaPrivateKey,
    pub public_jwk: Jwk,
}

impl std::fmt::Debug for GeneratedKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedKeyPair")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait KeyPairGenerator: Send + Sync {
    async fn generate(&self, algorithm: SigningAlgorithm, kid: &str) -> Result<GeneratedKeyPair>;
}

/// 从 RSA 私钥导出公钥 JWK
pub fn public_jwk(key: &RsaPrivateKey, algorithm: SigningAlgorithm, kid: &str) -> Jwk {
    Jwk {
        kty: "RSA".to_string(),
        use_field: "sig".to_string(),
        alg: algorithm.as_str().to_string(),
        kid: kid.to_string(),
        n: Some(URL_SAFE_NO_PAD.encode(key.n().to_bytes_be())),
        e: Some(URL_SAFE_NO_PAD.encode(key.e().to_bytes_be())),
    }
}

/// RSA 密钥生成器，模长由算法决定
#[derive(Debug, Default, Clone, Copy)]
pub struct RsaKeyGenerator;

impl RsaKeyGenerator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl KeyPairGenerator for RsaKeyGenerator {
    async fn generate(&self, algorithm: SigningAlgorithm, kid: &str) -> Result<GeneratedKeyPair> {
        let bits = algorithm.modulus_bits();

        // 大模长生成耗时秒级，放到阻塞线程池
        let private_key = tokio::task::spawn_blocking(move || {
            let mut rng = OsRng;
            RsaPrivateKey::new(&mut rng, bits)
        })
        .await
        .map_err(|e| AppError::Internal(format!("key generation task failed: {}", e)))?
        .map_err(|e| AppError::Internal(format!("RSA key generation failed: {}", e)))?;

        tracing::debug!(kid = %kid, alg = %algorithm, bits, "Generated RSA key pair");

        Ok(GeneratedKeyPair {
            kid: kid.to_string(),
            algorithm,
            public_jwk: public_jwk(&private_key, algorithm, kid),
            private_key,
        })
    }
}
