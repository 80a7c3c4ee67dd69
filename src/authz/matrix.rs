//! Enforcement matrix
//!
//! casbin 域内 RBAC：主体在租户内（可传递地）属于某角色，且该角色在同一租户对资源拥有该动作。
//! 默认拒绝。规则经 [`RuleTableAdapter`] 先落持久化表，再进入内存模型。

use async_trait::async_trait;
use casbin::{
    error::AdapterError, CoreApi, DefaultModel, Enforcer as CasbinEnforcer, MgmtApi,
};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::adapter::RuleTableAdapter;
use crate::{
    error::{AppError, Result},
    models::policy::{CasbinRule, GroupingRule, PolicyRule, RuleLine},
    repository::PolicyRuleStore,
};

/// 请求 `(sub, dom, obj, act)`；g 规则带域
pub const MODEL_CONF: &str = r#"
[request_definition]
r = sub, dom, obj, act

[policy_definition]
p = sub, dom, obj, act

[role_definition]
g = _, _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub, r.dom) && r.dom == p.dom && r.obj == p.obj && r.act == p.act
"#;

/// 授权判定与规则维护
#[async_trait]
pub trait Enforcer: Send + Sync {
    async fn enforce(&self, subject: &str, action: &str, resource: &str, tenant: &str)
        -> Result<bool>;

    async fn add_policies(&self, rules: &[PolicyRule]) -> Result<()>;
    async fn remove_policies(&self, rules: &[PolicyRule]) -> Result<()>;
    async fn add_groupings(&self, rules: &[GroupingRule]) -> Result<()>;
    async fn remove_groupings(&self, rules: &[GroupingRule]) -> Result<()>;

    /// 从持久化表重建全部内存状态，并清空判定缓存
    async fn load_policy(&self) -> Result<()>;

    async fn policies_by_role(&self, role_key: &str, tenant: &str) -> Vec<PolicyRule>;
    async fn policies_by_resource(&self, resource_key: &str) -> Vec<PolicyRule>;
    async fn groupings_by_subject(&self, subject_key: &str, tenant: &str) -> Vec<GroupingRule>;
    async fn groupings_by_role(&self, role_key: &str, tenant: &str) -> Vec<GroupingRule>;

    fn invalidate_cache(&self);
}

/// 适配器错误拆回原始 [`AppError`]
fn matrix_error(e: casbin::Error) -> AppError {
    match e {
        casbin::Error::AdapterError(AdapterError(inner)) => match inner.downcast::<AppError>() {
            Ok(app) => *app,
            Err(other) => AppError::Unavailable(format!("policy adapter: {}", other)),
        },
        other => AppError::Internal(format!("authorization matrix: {}", other)),
    }
}

fn policy_lines(rules: &[PolicyRule]) -> Vec<Vec<String>> {
    rules.iter().map(|r| CasbinRule::from(r).to_line()).collect()
}

fn grouping_lines(rules: &[GroupingRule]) -> Vec<Vec<String>> {
    rules.iter().map(|r| CasbinRule::from(r).to_line()).collect()
}

fn to_policies(lines: Vec<Vec<String>>) -> Vec<PolicyRule> {
    lines
        .iter()
        .filter_map(|line| match CasbinRule::from_line("p", line).parse() {
            Some(RuleLine::Policy(rule)) => Some(rule),
            _ => None,
        })
        .collect()
}

fn to_groupings(lines: Vec<Vec<String>>) -> Vec<GroupingRule> {
    lines
        .iter()
        .filter_map(|line| match CasbinRule::from_line("g", line).parse() {
            Some(RuleLine::Grouping(rule)) => Some(rule),
            _ => None,
        })
        .collect()
}

type DecisionKey = (String, String, String, String);

/// 基于读写锁的规则矩阵
///
/// 判定并发执行；写操作串行，且在写锁内清空判定缓存。
pub struct RuleMatrix {
    inner: RwLock<CasbinEnforcer>,
    cache: DashMap<DecisionKey, bool>,
}

impl RuleMatrix {
    pub async fn load(store: Arc<dyn PolicyRuleStore>) -> Result<Self> {
        let model = DefaultModel::from_str(MODEL_CONF)
            .await
            .map_err(matrix_error)?;
        let enforcer = CasbinEnforcer::new(model, RuleTableAdapter::new(store))
            .await
            .map_err(matrix_error)?;

        let matrix = Self {
            inner: RwLock::new(enforcer),
            cache: DashMap::new(),
        };
        matrix.load_policy().await?;
        Ok(matrix)
    }

    /// (p 规则数, g 规则数)
    pub async fn size(&self) -> (usize, usize) {
        let e = self.inner.read().await;
        (e.get_policy().len(), e.get_grouping_policy().len())
    }

    pub fn cached_decisions(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl Enforcer for RuleMatrix {
    async fn enforce(
        &self,
        subject: &str,
        action: &str,
        resource: &str,
        tenant: &str,
    ) -> Result<bool> {
        let key = (
            subject.to_string(),
            action.to_string(),
            resource.to_string(),
            tenant.to_string(),
        );

        // 缓存读写都在读锁内，写者清空缓存前必须等待
        let e = self.inner.read().await;
        let allowed = match self.cache.get(&key) {
            Some(hit) => *hit,
            None => {
                let allowed = e
                    .enforce((subject, tenant, resource, action))
                    .map_err(matrix_error)?;
                self.cache.insert(key, allowed);
                allowed
            }
        };
        drop(e);

        metrics::counter!(
            "authz.enforce.total",
            "decision" => if allowed { "allow" } else { "deny" }
        )
        .increment(1);

        Ok(allowed)
    }

    async fn add_policies(&self, rules: &[PolicyRule]) -> Result<()> {
        let mut e = self.inner.write().await;
        // casbin 批量写入遇到已存在的规则会整体放弃
        let fresh: Vec<Vec<String>> = policy_lines(rules)
            .into_iter()
            .filter(|line| !e.has_policy(line.clone()))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        e.add_policies(fresh).await.map_err(matrix_error)?;
        self.cache.clear();
        Ok(())
    }

    async fn remove_policies(&self, rules: &[PolicyRule]) -> Result<()> {
        let mut e = self.inner.write().await;
        let present: Vec<Vec<String>> = policy_lines(rules)
            .into_iter()
            .filter(|line| e.has_policy(line.clone()))
            .collect();
        if present.is_empty() {
            return Ok(());
        }

        e.remove_policies(present).await.map_err(matrix_error)?;
        self.cache.clear();
        Ok(())
    }

    async fn add_groupings(&self, rules: &[GroupingRule]) -> Result<()> {
        let mut e = self.inner.write().await;
        let fresh: Vec<Vec<String>> = grouping_lines(rules)
            .into_iter()
            .filter(|line| !e.has_grouping_policy(line.clone()))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        e.add_grouping_policies(fresh).await.map_err(matrix_error)?;
        self.cache.clear();
        Ok(())
    }

    async fn remove_groupings(&self, rules: &[GroupingRule]) -> Result<()> {
        let mut e = self.inner.write().await;
        let present: Vec<Vec<String>> = grouping_lines(rules)
            .into_iter()
            .filter(|line| e.has_grouping_policy(line.clone()))
            .collect();
        if present.is_empty() {
            return Ok(());
        }

        e.remove_grouping_policies(present)
            .await
            .map_err(matrix_error)?;
        self.cache.clear();
        Ok(())
    }

    async fn load_policy(&self) -> Result<()> {
        let mut e = self.inner.write().await;
        e.load_policy().await.map_err(matrix_error)?;
        self.cache.clear();

        tracing::info!(
            policies = e.get_policy().len(),
            groupings = e.get_grouping_policy().len(),
            "Loaded authorization matrix"
        );
        Ok(())
    }

    async fn policies_by_role(&self, role_key: &str, tenant: &str) -> Vec<PolicyRule> {
        let e = self.inner.read().await;
        to_policies(e.get_filtered_policy(0, vec![role_key.to_string(), tenant.to_string()]))
    }

    async fn policies_by_resource(&self, resource_key: &str) -> Vec<PolicyRule> {
        let e = self.inner.read().await;
        to_policies(e.get_filtered_policy(2, vec![resource_key.to_string()]))
    }

    async fn groupings_by_subject(&self, subject_key: &str, tenant: &str) -> Vec<GroupingRule> {
        let e = self.inner.read().await;
        to_groupings(e.get_filtered_grouping_policy(
            0,
            vec![subject_key.to_string(), String::new(), tenant.to_string()],
        ))
    }

    async fn groupings_by_role(&self, role_key: &str, tenant: &str) -> Vec<GroupingRule> {
        let e = self.inner.read().await;
        to_groupings(e.get_filtered_grouping_policy(1, vec![role_key.to_string(), tenant.to_string()]))
    }

    fn invalidate_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryPolicyStore;
    use proptest::prelude::*;

    async fn matrix() -> (RuleMatrix, Arc<MemoryPolicyStore>) {
        let store = Arc::new(MemoryPolicyStore::new());
        let matrix = RuleMatrix::load(store.clone()).await.unwrap();
        (matrix, store)
    }

    #[tokio::test]
    async fn test_default_deny() {
        let (m, _) = matrix().await;
        assert!(!m.enforce("user:u1", "read", "doc", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_grouping_plus_policy_allows() {
        let (m, _) = matrix().await;
        m.add_policies(&[PolicyRule::new("role:admin", "t1", "scale:form:*", "read")])
            .await
            .unwrap();
        m.add_groupings(&[GroupingRule::new("user:u1", "role:admin", "t1")])
            .await
            .unwrap();

        assert!(m.enforce("user:u1", "read", "scale:form:*", "t1").await.unwrap());
        assert!(!m.enforce("user:u1", "delete", "scale:form:*", "t1").await.unwrap());
        // 租户隔离
        assert!(!m.enforce("user:u1", "read", "scale:form:*", "t2").await.unwrap());
        assert!(!m.enforce("user:u2", "read", "scale:form:*", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_transitive_roles_within_tenant() {
        let (m, _) = matrix().await;
        m.add_policies(&[PolicyRule::new("role:viewer", "t1", "doc", "read")])
            .await
            .unwrap();
        m.add_groupings(&[
            GroupingRule::new("user:u1", "role:editor", "t1"),
            GroupingRule::new("role:editor", "role:viewer", "t1"),
        ])
        .await
        .unwrap();

        assert!(m.enforce("user:u1", "read", "doc", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_mutation_invalidates_cache() {
        let (m, _) = matrix().await;
        let g = GroupingRule::new("user:u1", "role:admin", "t1");
        m.add_policies(&[PolicyRule::new("role:admin", "t1", "doc", "read")])
            .await
            .unwrap();
        m.add_groupings(&[g.clone()]).await.unwrap();
        assert!(m.enforce("user:u1", "read", "doc", "t1").await.unwrap());
        assert_eq!(m.cached_decisions(), 1);

        m.remove_groupings(&[g]).await.unwrap();
        assert_eq!(m.cached_decisions(), 0);
        assert!(!m.enforce("user:u1", "read", "doc", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_load_policy_rebuilds_from_adapter() {
        let (m, store) = matrix().await;
        m.add_policies(&[PolicyRule::new("role:admin", "t1", "doc", "read")])
            .await
            .unwrap();
        m.add_groupings(&[GroupingRule::new("user:u1", "role:admin", "t1")])
            .await
            .unwrap();

        // 另一个进程的矩阵共享同一张表
        let other = RuleMatrix::load(store.clone()).await.unwrap();
        assert!(other.enforce("user:u1", "read", "doc", "t1").await.unwrap());

        m.remove_policies(&[PolicyRule::new("role:admin", "t1", "doc", "read")])
            .await
            .unwrap();
        assert!(other.enforce("user:u1", "read", "doc", "t1").await.unwrap());
        other.load_policy().await.unwrap();
        assert!(!other.enforce("user:u1", "read", "doc", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_mutations_write_through_to_rule_table() {
        let (m, store) = matrix().await;
        let p = PolicyRule::new("role:admin", "t1", "doc", "read");
        m.add_policies(&[p.clone()]).await.unwrap();
        // 重复写入不报错，表里也不会多一行
        m.add_policies(&[p.clone()]).await.unwrap();
        m.add_groupings(&[GroupingRule::new("user:u1", "role:admin", "t1")])
            .await
            .unwrap();
        assert_eq!(store.rule_count().await, 2);

        m.remove_policies(&[p.clone()]).await.unwrap();
        m.remove_policies(&[p]).await.unwrap();
        let left = store.load_all().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].ptype, "g");
        assert_eq!(m.size().await, (0, 1));
    }

    #[tokio::test]
    async fn test_read_queries() {
        let (m, _) = matrix().await;
        m.add_policies(&[
            PolicyRule::new("role:admin", "t1", "doc", "read"),
            PolicyRule::new("role:admin", "t1", "doc", "write"),
            PolicyRule::new("role:admin", "t2", "doc", "read"),
        ])
        .await
        .unwrap();
        m.add_groupings(&[
            GroupingRule::new("user:u1", "role:admin", "t1"),
            GroupingRule::new("user:u2", "role:admin", "t1"),
        ])
        .await
        .unwrap();

        assert_eq!(m.policies_by_role("role:admin", "t1").await.len(), 2);
        assert_eq!(m.policies_by_resource("doc").await.len(), 3);
        assert_eq!(m.groupings_by_subject("user:u1", "t1").await.len(), 1);
        assert_eq!(m.groupings_by_role("role:admin", "t1").await.len(), 2);
        assert_eq!(m.size().await, (3, 2));
    }

    proptest! {
        #[test]
        fn prop_no_grouping_means_deny(
            subject in "[a-z]{1,8}",
            action in "[a-z]{1,8}",
            resource in "[a-z]{1,8}",
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let allowed = rt.block_on(async {
                let (m, _) = matrix().await;
                m.add_policies(&[PolicyRule::new("role:any", "t1", &resource, &action)])
                    .await
                    .unwrap();
                m.enforce(&format!("user:{}", subject), &action, &resource, "t1")
                    .await
                    .unwrap()
            });
            prop_assert!(!allowed);
        }
    }
}
