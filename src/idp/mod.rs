//! 第三方身份提供方：访问令牌缓存与凭证轮换

pub mod rotator;
pub mod token_cache;

pub use rotator::{CredentialRotator, MIN_AUTH_SECRET_LEN, MSG_AES_KEY_LEN};
pub use token_cache::{
    AccessTokenCache, MemoryTokenCache, RefreshLease, TokenCacheSettings, TokenCacher,
    UpstreamTokenProvider,
};
