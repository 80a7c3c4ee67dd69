//! Assignment and subject models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

use crate::error::AppError;

/// 主体类型（闭集）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "subject_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    User,
    Group,
    Service,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::User => "user",
            SubjectType::Group => "group",
            SubjectType::Service => "service",
        }
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(SubjectType::User),
            "group" => Ok(SubjectType::Group),
            "service" => Ok(SubjectType::Service),
            other => Err(AppError::InvalidArgument(format!(
                "unknown subject type: {}",
                other
            ))),
        }
    }
}

/// 主体 `{subject_type}:{subject_id}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub subject_type: SubjectType,
    pub subject_id: String,
}

impl Subject {
    pub fn new(subject_type: SubjectType, subject_id: impl Into<String>) -> Self {
        Self {
            subject_type,
            subject_id: subject_id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(SubjectType::User, id)
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new(SubjectType::Group, id)
    }

    pub fn service(id: impl Into<String>) -> Self {
        Self::new(SubjectType::Service, id)
    }

    /// 矩阵中的主体标识
    pub fn key(&self) -> String {
        format!("{}:{}", self.subject_type, self.subject_id)
    }

    /// 从矩阵标识解析
    pub fn parse_key(key: &str) -> Result<Self, AppError> {
        let (ty, id) = key
            .split_once(':')
            .ok_or_else(|| AppError::InvalidArgument(format!("malformed subject key: {}", key)))?;
        if id.is_empty() {
            return Err(AppError::InvalidArgument(format!(
                "malformed subject key: {}",
                key
            )));
        }
        Ok(Self::new(ty.parse()?, id))
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.subject_id)
    }
}

/// 赋权：某主体在某租户中持有某角色
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Assignment {
    pub id: Uuid,
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub role_id: Uuid,
    pub tenant_id: String,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub updated_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
    pub version: i64,
}

impl Assignment {
    pub fn subject(&self) -> Subject {
        Subject::new(self.subject_type, self.subject_id.clone())
    }
}

/// 新建赋权所需字段
#[derive(Debug, Clone)]
pub struct NewAssignment {
    pub subject: Subject,
    pub role_id: Uuid,
    pub tenant_id: String,
    pub granted_by: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct GrantRequest {
    pub subject_type: SubjectType,
    #[validate(length(min = 1, message = "subject id must not be empty"))]
    pub subject_id: String,
    pub role_id: Uuid,
    #[validate(length(min = 1, message = "tenant id must not be empty"))]
    pub tenant_id: String,
    #[validate(length(min = 1, message = "granted_by must not be empty"))]
    pub granted_by: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RevokeRequest {
    pub subject_type: SubjectType,
    #[validate(length(min = 1, message = "subject id must not be empty"))]
    pub subject_id: String,
    pub role_id: Uuid,
    #[validate(length(min = 1, message = "tenant id must not be empty"))]
    pub tenant_id: String,
    #[serde(default = "super::role::default_actor")]
    pub revoked_by: String,
}
