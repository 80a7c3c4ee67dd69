//! JWT claims

use serde::{Deserialize, Serialize};

/// 令牌类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenType::Access => write!(f, "access"),
            TokenType::Refresh => write!(f, "refresh"),
        }
    }
}

/// 令牌主体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSubject {
    pub user_id: String,
    pub account_id: String,
    pub tenant_id: Option<String>,
}

impl TokenSubject {
    pub fn new(user_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            account_id: account_id.into(),
            tenant_id: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "accountId")]
    pub account_id: String,
    #[serde(rename = "tenantId", default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// 刷新令牌标记
    pub token_type: TokenType,
}

impl Claims {
    pub fn subject(&self) -> TokenSubject {
        TokenSubject {
            user_id: self.user_id.clone(),
            account_id: self.account_id.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }
}
