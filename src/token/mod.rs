//! 令牌签发与校验

pub mod claims;
pub mod service;

pub use claims::{Claims, TokenSubject, TokenType};
pub use service::{IssuedToken, TokenPair, TokenService, TokenSettings};
