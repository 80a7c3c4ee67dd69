//! 多租户身份与访问管理核心库
//! 授权策略、JWKS 签名密钥生命周期、令牌签发与第三方应用凭证

pub mod authz;
pub mod clock;
pub mod config;
pub mod context;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod idp;
pub mod jwks;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod routes;
pub mod services;
pub mod telemetry;
pub mod token;
