//! Policy rule and tenant policy version models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// 策略规则 p：角色在租户内可对资源执行动作
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyRule {
    pub role_key: String,
    pub tenant_id: String,
    pub resource_key: String,
    pub action: String,
}

impl PolicyRule {
    pub fn new(
        role_key: impl Into<String>,
        tenant_id: impl Into<String>,
        resource_key: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            role_key: role_key.into(),
            tenant_id: tenant_id.into(),
            resource_key: resource_key.into(),
            action: action.into(),
        }
    }
}

/// 分组规则 g：主体在租户内属于角色
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupingRule {
    pub subject_key: String,
    pub role_key: String,
    pub tenant_id: String,
}

impl GroupingRule {
    pub fn new(
        subject_key: impl Into<String>,
        role_key: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            subject_key: subject_key.into(),
            role_key: role_key.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

/// 矩阵持久化表中的一行
///
/// p 行：`v0 = role, v1 = tenant, v2 = resource, v3 = action`
/// g 行：`v0 = subject, v1 = role, v2 = tenant`
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CasbinRule {
    pub ptype: String,
    pub v0: String,
    pub v1: String,
    pub v2: String,
    pub v3: String,
}

impl From<&PolicyRule> for CasbinRule {
    fn from(rule: &PolicyRule) -> Self {
        Self {
            ptype: "p".to_string(),
            v0: rule.role_key.clone(),
            v1: rule.tenant_id.clone(),
            v2: rule.resource_key.clone(),
            v3: rule.action.clone(),
        }
    }
}

impl From<&GroupingRule> for CasbinRule {
    fn from(rule: &GroupingRule) -> Self {
        Self {
            ptype: "g".to_string(),
            v0: rule.subject_key.clone(),
            v1: rule.role_key.clone(),
            v2: rule.tenant_id.clone(),
            v3: String::new(),
        }
    }
}

/// 已解析的规则行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleLine {
    Policy(PolicyRule),
    Grouping(GroupingRule),
}

impl CasbinRule {
    /// 由 casbin 规则行构造，缺失的字段补空串
    pub fn from_line(ptype: &str, line: &[String]) -> Self {
        let field = |i: usize| line.get(i).cloned().unwrap_or_default();
        Self {
            ptype: ptype.to_string(),
            v0: field(0),
            v1: field(1),
            v2: field(2),
            v3: field(3),
        }
    }

    /// casbin 规则行，g 行只有三个字段
    pub fn to_line(&self) -> Vec<String> {
        let mut line = vec![self.v0.clone(), self.v1.clone(), self.v2.clone()];
        if self.ptype.starts_with('p') {
            line.push(self.v3.clone());
        }
        line
    }

    pub fn parse(&self) -> Option<RuleLine> {
        match self.ptype.as_str() {
            "p" => Some(RuleLine::Policy(PolicyRule::new(
                &self.v0, &self.v1, &self.v2, &self.v3,
            ))),
            "g" => Some(RuleLine::Grouping(GroupingRule::new(
                &self.v0, &self.v1, &self.v2,
            ))),
            _ => None,
        }
    }
}

/// 租户策略版本
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PolicyVersion {
    pub id: Uuid,
    pub tenant_id: String,
    pub version: i64,
    pub changed_by: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AddPolicyRequest {
    pub role_id: Uuid,
    #[validate(length(min = 1, message = "resource key must not be empty"))]
    pub resource_key: String,
    #[validate(length(min = 1, message = "action must not be empty"))]
    pub action: String,
    #[validate(length(min = 1, message = "tenant id must not be empty"))]
    pub tenant_id: String,
    #[validate(length(min = 1, message = "changed_by must not be empty"))]
    pub changed_by: String,
    #[serde(default)]
    pub reason: Option<String>,
}

pub type RemovePolicyRequest = AddPolicyRequest;
