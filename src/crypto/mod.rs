//! 加密组件：对称加密保险库、RSA 密钥生成与私钥存储

pub mod keygen;
pub mod pem_store;
pub mod vault;

pub use keygen::{GeneratedKeyPair, KeyPairGenerator, RsaKeyGenerator};
pub use pem_store::{resolve_signing_key, MemoryPrivateKeyStore, PemFileKeyStore, PrivateKeyStore};
pub use vault::{AesGcmVault, SecretVault};
