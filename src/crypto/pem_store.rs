//! Private key store
//!
//! 每个 `kid` 一个 `{kid}.pem` 文件。写入 PKCS#1，读取时接受 PKCS#1 与 PKCS#8。

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::EncodingKey;
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding},
    pkcs8::DecodePrivateKey,
    traits::PublicKeyParts,
    RsaPrivateKey,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::{
    error::{AppError, Result},
    models::key::SigningAlgorithm,
};

#[async_trait]
pub trait PrivateKeyStore: Send + Sync {
    async fn save(&self, kid: &str, key: &RsaPrivateKey) -> Result<()>;
    /// 不存在时返回 `NotFound`
    async fn load(&self, kid: &str) -> Result<RsaPrivateKey>;
    /// 不存在时视为成功
    async fn delete(&self, kid: &str) -> Result<()>;
    async fn exists(&self, kid: &str) -> Result<bool>;
}

/// 读取私钥并构造签名用的 `EncodingKey`
///
/// 私钥模长小于算法要求时返回 `InvalidKey`。
pub async fn resolve_signing_key(
    store: &dyn PrivateKeyStore,
    kid: &str,
    algorithm: SigningAlgorithm,
) -> Result<EncodingKey> {
    let key = store.load(kid).await?;

    let bits = key.size() * 8;
    if bits < algorithm.modulus_bits() {
        return Err(AppError::InvalidKey(format!(
            "key {} has {} bits, {} requires {}",
            kid,
            bits,
            algorithm,
            algorithm.modulus_bits()
        )));
    }

    let pem = encode_pem(kid, &key)?;
    EncodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|e| AppError::InvalidKey(format!("key {}: {}", kid, e)))
}

fn encode_pem(kid: &str, key: &RsaPrivateKey) -> Result<Zeroizing<String>> {
    key.to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(format!("failed to encode key {}: {}", kid, e)))
}

fn decode_pem(kid: &str, pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| AppError::InvalidKey(format!("key {} is not a valid RSA private key: {}", kid, e)))
}

/// kid 直接作为文件名，只允许安全字符
fn validate_kid(kid: &str) -> Result<()> {
    let ok = !kid.is_empty()
        && kid.len() <= 128
        && kid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !kid.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(AppError::InvalidArgument(format!("invalid kid: {:?}", kid)))
    }
}

// ==================== Filesystem ====================

/// 文件系统私钥存储
#[derive(Debug, Clone)]
pub struct PemFileKeyStore {
    dir: PathBuf,
}

impl PemFileKeyStore {
    /// 目录不存在时创建
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            AppError::Internal(format!("failed to create key dir {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, kid: &str) -> Result<PathBuf> {
        validate_kid(kid)?;
        Ok(self.dir.join(format!("{}.pem", kid)))
    }
}

#[async_trait]
impl PrivateKeyStore for PemFileKeyStore {
    async fn save(&self, kid: &str, key: &RsaPrivateKey) -> Result<()> {
        let path = self.path_for(kid)?;
        let pem = encode_pem(kid, key)?;

        // 先写临时文件再改名，读者不会看到半个文件
        let tmp = self.dir.join(format!(".{}.pem.tmp", kid));
        tokio::fs::write(&tmp, pem.as_bytes())
            .await
            .map_err(|e| AppError::Internal(format!("failed to write key {}: {}", kid, e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| AppError::Internal(format!("failed to chmod key {}: {}", kid, e)))?;
        }

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AppError::Internal(format!("failed to persist key {}: {}", kid, e)))?;

        tracing::debug!(kid = %kid, path = %path.display(), "Saved private key");
        Ok(())
    }

    async fn load(&self, kid: &str) -> Result<RsaPrivateKey> {
        let path = self.path_for(kid)?;
        let pem = match tokio::fs::read_to_string(&path).await {
            Ok(pem) => Zeroizing::new(pem),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(format!("private key {}", kid)));
            }
            Err(e) => {
                return Err(AppError::Internal(format!("failed to read key {}: {}", kid, e)));
            }
        };
        decode_pem(kid, &pem)
    }

    async fn delete(&self, kid: &str) -> Result<()> {
        let path = self.path_for(kid)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(kid = %kid, "Deleted private key");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Internal(format!("failed to delete key {}: {}", kid, e))),
        }
    }

    async fn exists(&self, kid: &str) -> Result<bool> {
        let path = self.path_for(kid)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| AppError::Internal(format!("failed to stat key {}: {}", kid, e)))
    }
}

// ==================== In-memory ====================

/// 进程内私钥存储
#[derive(Debug, Clone, Default)]
pub struct MemoryPrivateKeyStore {
    keys: Arc<DashMap<String, RsaPrivateKey>>,
}

impl MemoryPrivateKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl PrivateKeyStore for MemoryPrivateKeyStore {
    async fn save(&self, kid: &str, key: &RsaPrivateKey) -> Result<()> {
        validate_kid(kid)?;
        self.keys.insert(kid.to_string(), key.clone());
        Ok(())
    }

    async fn load(&self, kid: &str) -> Result<RsaPrivateKey> {
        self.keys
            .get(kid)
            .map(|k| k.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("private key {}", kid)))
    }

    async fn delete(&self, kid: &str) -> Result<()> {
        self.keys.remove(kid);
        Ok(())
    }

    async fn exists(&self, kid: &str) -> Result<bool> {
        Ok(self.keys.contains_key(kid))
    }
}
