//! 数据模型模块
//! 授权（角色、资源、赋权、策略）、JWKS 密钥与第三方应用凭证

pub mod app;
pub mod assignment;
pub mod key;
pub mod policy;
pub mod resource;
pub mod role;

use serde::{Deserialize, Serialize};

/// 分页参数
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: default_limit(),
        }
    }
}

impl Pagination {
    pub fn new(offset: i64, limit: i64) -> Self {
        Self { offset, limit }
    }

    /// 规整到合法范围：offset >= 0，1 <= limit <= 500
    pub fn normalized(self) -> Self {
        Self {
            offset: self.offset.max(0),
            limit: self.limit.clamp(1, 500),
        }
    }
}

/// 分页结果
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}
