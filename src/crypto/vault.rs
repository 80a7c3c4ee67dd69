//! Secret vault
//!
//! AES-256-GCM，密文格式为 `nonce(12) || ciphertext || tag(16)`。
//! 指纹基于明文计算，用于判断轮换是否为空操作。

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{AppError, Result};

/// AES-256 密钥长度
pub const KEY_SIZE: usize = 32;

/// GCM nonce 长度
pub const NONCE_SIZE: usize = 12;

const TAG_SIZE: usize = 16;

/// 对称加密保险库
pub trait SecretVault: Send + Sync {
    /// 每次调用生成新的 nonce，输出自带 nonce
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// 认证失败返回 `Tampered`
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// 明文的稳定单向摘要
    fn fingerprint(&self, plaintext: &[u8]) -> String {
        fingerprint(plaintext)
    }
}

/// `hex(sha256(plaintext))`
pub fn fingerprint(plaintext: &[u8]) -> String {
    hex::encode(Sha256::digest(plaintext))
}

pub struct AesGcmVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmVault").finish_non_exhaustive()
    }
}

impl AesGcmVault {
    /// 密钥必须恰好 32 字节，否则返回 `InvalidKey`
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(AppError::InvalidKey(format!(
                "vault key must be {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn from_secret(key: &Secret<Vec<u8>>) -> Result<Self> {
        Self::new(key.expose_secret())
    }

    /// 随机生成一个主密钥
    pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(key.as_mut());
        key
    }
}

impl SecretVault for AesGcmVault {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| AppError::Internal(format!("encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(AppError::Tampered);
        }
        let (nonce_bytes, body) = ciphertext.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, body)
            .map_err(|_| AppError::Tampered)?;

        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vault() -> AesGcmVault {
        AesGcmVault::new(AesGcmVault::generate_key().as_slice()).unwrap()
    }

    #[test]
    fn test_rejects_wrong_key_length() {
        for len in [0usize, 16, 31, 33, 64] {
            let key = vec![7u8; len];
            assert!(matches!(AesGcmVault::new(&key), Err(AppError::InvalidKey(_))));
        }
    }

    #[test]
    fn test_encrypt_uses_fresh_nonce() {
        let vault = vault();
        let a = vault.encrypt(b"same input").unwrap();
        let b = vault.encrypt(b"same input").unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let vault = vault();
        let mut ct = vault.encrypt(b"secret").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(vault.decrypt(&ct), Err(AppError::Tampered)));

        assert!(matches!(vault.decrypt(b"short"), Err(AppError::Tampered)));
    }

    #[test]
    fn test_wrong_key_is_tampered() {
        let ct = vault().encrypt(b"secret").unwrap();
        assert!(matches!(vault().decrypt(&ct), Err(AppError::Tampered)));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let vault = vault();
        assert_eq!(vault.fingerprint(b"abc"), fingerprint(b"abc"));
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    proptest! {
        #[test]
        fn prop_decrypt_inverts_encrypt(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let vault = vault();
            let ct = vault.encrypt(&data).unwrap();
            let pt = vault.decrypt(&ct).unwrap();
            prop_assert_eq!(pt.as_slice(), data.as_slice());
        }

        #[test]
        fn prop_fingerprint_matches_only_same_plaintext(
            a in proptest::collection::vec(any::<u8>(), 1..64),
            b in proptest::collection::vec(any::<u8>(), 1..64),
        ) {
            prop_assert_eq!(fingerprint(&a) == fingerprint(&b), a == b);
        }
    }
}
