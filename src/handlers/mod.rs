//! HTTP 处理器模块

pub mod authz;
pub mod health;
pub mod jwks;
pub mod keys;
