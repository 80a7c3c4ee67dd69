//! casbin 适配器
//!
//! 把 `casbin_rule` 表（经 [`PolicyRuleStore`]）接到 casbin 的自动保存与 `load_policy` 上。

use async_trait::async_trait;
use casbin::{error::AdapterError, Adapter, Filter, Model};
use std::sync::Arc;

use crate::{error::AppError, models::policy::CasbinRule, repository::PolicyRuleStore};

pub struct RuleTableAdapter {
    store: Arc<dyn PolicyRuleStore>,
    filtered: bool,
}

impl RuleTableAdapter {
    pub fn new(store: Arc<dyn PolicyRuleStore>) -> Self {
        Self {
            store,
            filtered: false,
        }
    }
}

/// 适配器内的错误原样装箱，矩阵侧再拆回 [`AppError`]
fn boxed(e: AppError) -> casbin::Error {
    casbin::Error::AdapterError(AdapterError(Box::new(e)))
}

fn rows(ptype: &str, lines: Vec<Vec<String>>) -> Vec<CasbinRule> {
    lines
        .iter()
        .map(|line| CasbinRule::from_line(ptype, line))
        .collect()
}

/// 空值表示通配
fn matches_fields(rule: &CasbinRule, field_index: usize, values: &[String]) -> bool {
    let line = rule.to_line();
    values.iter().enumerate().all(|(i, value)| {
        value.is_empty() || line.get(field_index + i).is_some_and(|v| v == value)
    })
}

fn load_into(m: &mut dyn Model, rule: &CasbinRule) {
    let sec = if rule.ptype.starts_with('g') { "g" } else { "p" };
    m.add_policy(sec, &rule.ptype, rule.to_line());
}

#[async_trait]
impl Adapter for RuleTableAdapter {
    async fn load_policy(&mut self, m: &mut dyn Model) -> casbin::Result<()> {
        for rule in self.store.load_all().await.map_err(boxed)? {
            load_into(m, &rule);
        }
        self.filtered = false;
        Ok(())
    }

    async fn load_filtered_policy<'a>(
        &mut self,
        m: &mut dyn Model,
        f: Filter<'a>,
    ) -> casbin::Result<()> {
        let wanted = |rule: &CasbinRule, filter: &[&str]| {
            let values: Vec<String> = filter.iter().map(|v| v.to_string()).collect();
            matches_fields(rule, 0, &values)
        };

        for rule in self.store.load_all().await.map_err(boxed)? {
            let keep = if rule.ptype.starts_with('g') {
                wanted(&rule, &f.g)
            } else {
                wanted(&rule, &f.p)
            };
            if keep {
                load_into(m, &rule);
            }
        }
        self.filtered = true;
        Ok(())
    }

    /// 以矩阵为准同步整张表
    async fn save_policy(&mut self, m: &mut dyn Model) -> casbin::Result<()> {
        let mut wanted = rows("p", m.get_policy("p", "p"));
        wanted.extend(rows("g", m.get_policy("g", "g")));

        let existing = self.store.load_all().await.map_err(boxed)?;
        let stale: Vec<CasbinRule> = existing
            .iter()
            .filter(|r| !wanted.contains(r))
            .cloned()
            .collect();
        let missing: Vec<CasbinRule> = wanted
            .into_iter()
            .filter(|r| !existing.contains(r))
            .collect();

        self.store.remove_rules(&stale).await.map_err(boxed)?;
        self.store.add_rules(&missing).await.map_err(boxed)?;
        Ok(())
    }

    async fn clear_policy(&mut self) -> casbin::Result<()> {
        let existing = self.store.load_all().await.map_err(boxed)?;
        self.store.remove_rules(&existing).await.map_err(boxed)
    }

    fn is_filtered(&self) -> bool {
        self.filtered
    }

    async fn add_policy(
        &mut self,
        sec: &str,
        ptype: &str,
        rule: Vec<String>,
    ) -> casbin::Result<bool> {
        self.add_policies(sec, ptype, vec![rule]).await
    }

    async fn add_policies(
        &mut self,
        _sec: &str,
        ptype: &str,
        rules: Vec<Vec<String>>,
    ) -> casbin::Result<bool> {
        self.store
            .add_rules(&rows(ptype, rules))
            .await
            .map_err(boxed)?;
        Ok(true)
    }

    async fn remove_policy(
        &mut self,
        sec: &str,
        ptype: &str,
        rule: Vec<String>,
    ) -> casbin::Result<bool> {
        self.remove_policies(sec, ptype, vec![rule]).await
    }

    async fn remove_policies(
        &mut self,
        _sec: &str,
        ptype: &str,
        rules: Vec<Vec<String>>,
    ) -> casbin::Result<bool> {
        self.store
            .remove_rules(&rows(ptype, rules))
            .await
            .map_err(boxed)?;
        Ok(true)
    }

    async fn remove_filtered_policy(
        &mut self,
        _sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: Vec<String>,
    ) -> casbin::Result<bool> {
        let doomed: Vec<CasbinRule> = self
            .store
            .load_all()
            .await
            .map_err(boxed)?
            .into_iter()
            .filter(|r| r.ptype == ptype && matches_fields(r, field_index, &field_values))
            .collect();
        if doomed.is_empty() {
            return Ok(false);
        }
        self.store.remove_rules(&doomed).await.map_err(boxed)?;
        Ok(true)
    }
}
