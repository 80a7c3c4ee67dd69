//! 进程内存储实现
//!
//! 与 PostgreSQL 实现遵守相同的约束：唯一性冲突返回 `AlreadyExists`，
//! 软删除的行保留但不参与查询，行版本用于乐观锁。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AppCredentialStore, AssignmentStore, PolicyRuleStore, PolicyVersionStore, ResourceStore,
    RoleStore, SigningKeyStore,
};
use crate::{
    clock::{system_clock, Clock},
    error::{AppError, Result},
    models::{
        app::AppCredentials,
        assignment::{Assignment, NewAssignment, Subject},
        key::{KeyStatus, SigningKey},
        policy::{CasbinRule, PolicyVersion},
        resource::{normalize_actions, CreateResourceRequest, Resource, UpdateResourceRequest},
        role::{CreateRoleRequest, Role, UpdateRoleRequest},
        Page, Pagination,
    },
};

fn paginate<T: Clone>(items: Vec<T>, page: Pagination) -> Page<T> {
    let page = page.normalized();
    let total = items.len() as i64;
    let items = items
        .into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect();
    Page { items, total }
}

// ==================== Policy Store ====================

#[derive(Default)]
struct PolicyState {
    roles: HashMap<Uuid, Role>,
    resources: HashMap<Uuid, Resource>,
    assignments: HashMap<Uuid, Assignment>,
    versions: HashMap<String, Vec<PolicyVersion>>,
    rules: Vec<CasbinRule>,
}

/// 策略存储的进程内实现
///
/// 同时实现角色、资源、赋权、版本与矩阵规则五个存储接口，
/// 所有状态位于同一把锁之下。时间戳取自注入的时钟。
pub struct MemoryPolicyStore {
    state: Mutex<PolicyState>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryPolicyStore {
    fn default() -> Self {
        Self::with_clock(system_clock())
    }
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(PolicyState::default()),
            clock,
        }
    }

    /// 当前持久化的规则行数
    pub async fn rule_count(&self) -> usize {
        self.state.lock().await.rules.len()
    }

    /// 包括软删除行在内的赋权数
    pub async fn assignment_rows(&self) -> usize {
        self.state.lock().await.assignments.len()
    }
}

#[async_trait]
impl RoleStore for MemoryPolicyStore {
    async fn create(&self, req: &CreateRoleRequest) -> Result<Role> {
        let mut state = self.state.lock().await;

        let taken = state.roles.values().any(|r| {
            r.deleted_at.is_none() && r.tenant_id == req.tenant_id && r.name == req.name
        });
        if taken {
            return Err(AppError::AlreadyExists(format!(
                "role {} in tenant {}",
                req.name, req.tenant_id
            )));
        }

        let now = self.clock.now();
        let role = Role {
            id: Uuid::new_v4(),
            name: req.name.clone(),
            display_name: req.display_name.clone(),
            tenant_id: req.tenant_id.clone(),
            description: req.description.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            created_by: req.created_by.clone(),
            updated_by: req.created_by.clone(),
            deleted_by: None,
            version: 1,
        };
        state.roles.insert(role.id, role.clone());
        Ok(role)
    }

    async fn update(&self, id: Uuid, req: &UpdateRoleRequest) -> Result<Role> {
        let mut state = self.state.lock().await;
        let role = state
            .roles
            .get_mut(&id)
            .filter(|r| r.deleted_at.is_none())
            .ok_or_else(|| AppError::NotFound(format!("role {}", id)))?;

        if role.version != req.expected_version {
            return Err(AppError::Conflict(format!("role {} was modified concurrently", id)));
        }

        if let Some(display_name) = &req.display_name {
            role.display_name = display_name.clone();
        }
        if let Some(description) = &req.description {
            role.description = Some(description.clone());
        }
        role.updated_by = req.updated_by.clone();
        role.updated_at = self.clock.now();
        role.version += 1;
        Ok(role.clone())
    }

    async fn soft_delete(&self, id: Uuid, deleted_by: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let role = state
            .roles
            .get_mut(&id)
            .filter(|r| r.deleted_at.is_none())
            .ok_or_else(|| AppError::NotFound(format!("role {}", id)))?;

        let now = self.clock.now();
        role.deleted_at = Some(now);
        role.deleted_by = Some(deleted_by.to_string());
        role.updated_at = now;
        role.version += 1;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Role>> {
        let state = self.state.lock().await;
        Ok(state
            .roles
            .get(&id)
            .filter(|r| r.deleted_at.is_none())
            .cloned())
    }

    async fn find_by_name(&self, tenant_id: &str, name: &str) -> Result<Option<Role>> {
        let state = self.state.lock().await;
        Ok(state
            .roles
            .values()
            .find(|r| r.deleted_at.is_none() && r.tenant_id == tenant_id && r.name == name)
            .cloned())
    }

    async fn list(&self, tenant_id: &str, page: Pagination) -> Result<Page<Role>> {
        let roles = RoleStore::list_by_tenant(self, tenant_id).await?;
        Ok(paginate(roles, page))
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Role>> {
        let state = self.state.lock().await;
        let mut roles: Vec<Role> = state
            .roles
            .values()
            .filter(|r| r.deleted_at.is_none() && r.tenant_id == tenant_id)
            .cloned()
            .collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }
}

#[async_trait]
impl ResourceStore for MemoryPolicyStore {
    async fn create(&self, req: &CreateResourceRequest) -> Result<Resource> {
        let mut state = self.state.lock().await;

        if state
            .resources
            .values()
            .any(|r| r.deleted_at.is_none() && r.key == req.key)
        {
            return Err(AppError::AlreadyExists(format!("resource {}", req.key)));
        }

        let now = self.clock.now();
        let resource = Resource {
            id: Uuid::new_v4(),
            key: req.key.clone(),
            display_name: req.display_name.clone(),
            app_name: req.app_name.clone(),
            domain: req.domain.clone(),
            resource_type: req.resource_type.clone(),
            actions: normalize_actions(&req.actions),
            description: req.description.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            created_by: req.created_by.clone(),
            updated_by: req.created_by.clone(),
            deleted_by: None,
            version: 1,
        };
        state.resources.insert(resource.id, resource.clone());
        Ok(resource)
    }

    async fn update(&self, id: Uuid, req: &UpdateResourceRequest) -> Result<Resource> {
        let mut state = self.state.lock().await;
        let resource = state
            .resources
            .get_mut(&id)
            .filter(|r| r.deleted_at.is_none())
            .ok_or_else(|| AppError::NotFound(format!("resource {}", id)))?;

        if let Some(display_name) = &req.display_name {
            resource.display_name = display_name.clone();
        }
        if let Some(actions) = &req.actions {
            resource.actions = normalize_actions(actions);
        }
        if let Some(description) = &req.description {
            resource.description = Some(description.clone());
        }
        resource.updated_by = req.updated_by.clone();
        resource.updated_at = self.clock.now();
        resource.version += 1;
        Ok(resource.clone())
    }

    async fn soft_delete(&self, id: Uuid, deleted_by: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let resource = state
            .resources
            .get_mut(&id)
            .filter(|r| r.deleted_at.is_none())
            .ok_or_else(|| AppError::NotFound(format!("resource {}", id)))?;

        let now = self.clock.now();
        resource.deleted_at = Some(now);
        resource.deleted_by = Some(deleted_by.to_string());
        resource.updated_at = now;
        resource.version += 1;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Resource>> {
        let state = self.state.lock().await;
        Ok(state
            .resources
            .get(&id)
            .filter(|r| r.deleted_at.is_none())
            .cloned())
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Resource>> {
        let state = self.state.lock().await;
        Ok(state
            .resources
            .values()
            .find(|r| r.deleted_at.is_none() && r.key == key)
            .cloned())
    }

    async fn list(&self, page: Pagination) -> Result<Page<Resource>> {
        let state = self.state.lock().await;
        let mut resources: Vec<Resource> = state
            .resources
            .values()
            .filter(|r| r.deleted_at.is_none())
            .cloned()
            .collect();
        resources.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(paginate(resources, page))
    }
}

#[async_trait]
impl AssignmentStore for MemoryPolicyStore {
    async fn create(&self, new: &NewAssignment) -> Result<Assignment> {
        let mut state = self.state.lock().await;

        let duplicate = state.assignments.values().any(|a| {
            a.deleted_at.is_none()
                && a.subject_type == new.subject.subject_type
                && a.subject_id == new.subject.subject_id
                && a.role_id == new.role_id
                && a.tenant_id == new.tenant_id
        });
        if duplicate {
            return Err(AppError::AlreadyExists(format!(
                "assignment {} -> {} in tenant {}",
                new.subject, new.role_id, new.tenant_id
            )));
        }

        let now = self.clock.now();
        let assignment = Assignment {
            id: Uuid::new_v4(),
            subject_type: new.subject.subject_type,
            subject_id: new.subject.subject_id.clone(),
            role_id: new.role_id,
            tenant_id: new.tenant_id.clone(),
            granted_by: new.granted_by.clone(),
            granted_at: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            created_by: new.granted_by.clone(),
            updated_by: new.granted_by.clone(),
            deleted_by: None,
            version: 1,
        };
        state.assignments.insert(assignment.id, assignment.clone());
        Ok(assignment)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Assignment>> {
        let state = self.state.lock().await;
        Ok(state
            .assignments
            .get(&id)
            .filter(|a| a.deleted_at.is_none())
            .cloned())
    }

    async fn find(
        &self,
        subject: &Subject,
        role_id: Uuid,
        tenant_id: &str,
    ) -> Result<Option<Assignment>> {
        let state = self.state.lock().await;
        Ok(state
            .assignments
            .values()
            .find(|a| {
                a.deleted_at.is_none()
                    && a.subject_type == subject.subject_type
                    && a.subject_id == subject.subject_id
                    && a.role_id == role_id
                    && a.tenant_id == tenant_id
            })
            .cloned())
    }

    async fn delete(&self, id: Uuid, deleted_by: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let assignment = state
            .assignments
            .get_mut(&id)
            .filter(|a| a.deleted_at.is_none())
            .ok_or_else(|| AppError::NotFound(format!("assignment {}", id)))?;

        let now = self.clock.now();
        assignment.deleted_at = Some(now);
        assignment.deleted_by = Some(deleted_by.to_string());
        assignment.updated_at = now;
        assignment.version += 1;
        Ok(())
    }

    async fn list_by_subject(&self, subject: &Subject, tenant_id: &str) -> Result<Vec<Assignment>> {
        let state = self.state.lock().await;
        let mut items: Vec<Assignment> = state
            .assignments
            .values()
            .filter(|a| {
                a.deleted_at.is_none()
                    && a.subject_type == subject.subject_type
                    && a.subject_id == subject.subject_id
                    && a.tenant_id == tenant_id
            })
            .cloned()
            .collect();
        items.sort_by_key(|a| a.granted_at);
        Ok(items)
    }

    async fn list_by_role(&self, role_id: Uuid, tenant_id: &str) -> Result<Vec<Assignment>> {
        let state = self.state.lock().await;
        let mut items: Vec<Assignment> = state
            .assignments
            .values()
            .filter(|a| a.deleted_at.is_none() && a.role_id == role_id && a.tenant_id == tenant_id)
            .cloned()
            .collect();
        items.sort_by_key(|a| a.granted_at);
        Ok(items)
    }

    async fn count_by_role(&self, role_id: Uuid) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .assignments
            .values()
            .filter(|a| a.deleted_at.is_none() && a.role_id == role_id)
            .count() as i64)
    }
}

#[async_trait]
impl PolicyVersionStore for MemoryPolicyStore {
    async fn get_current(&self, tenant_id: &str) -> Result<Option<PolicyVersion>> {
        let state = self.state.lock().await;
        Ok(state
            .versions
            .get(tenant_id)
            .and_then(|versions| versions.last())
            .cloned())
    }

    async fn get_or_create(&self, tenant_id: &str) -> Result<PolicyVersion> {
        let mut state = self.state.lock().await;
        let versions = state.versions.entry(tenant_id.to_string()).or_default();
        if let Some(current) = versions.last() {
            return Ok(current.clone());
        }

        let initial = PolicyVersion {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            version: 1,
            changed_by: "system".to_string(),
            reason: "initial version".to_string(),
            created_at: self.clock.now(),
        };
        versions.push(initial.clone());
        Ok(initial)
    }

    async fn increment(
        &self,
        tenant_id: &str,
        changed_by: &str,
        reason: &str,
    ) -> Result<PolicyVersion> {
        let mut state = self.state.lock().await;
        let versions = state.versions.entry(tenant_id.to_string()).or_default();
        let next = versions.last().map(|v| v.version).unwrap_or(0) + 1;

        let version = PolicyVersion {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            version: next,
            changed_by: changed_by.to_string(),
            reason: reason.to_string(),
            created_at: self.clock.now(),
        };
        versions.push(version.clone());
        Ok(version)
    }

    async fn list(&self, tenant_id: &str, page: Pagination) -> Result<Page<PolicyVersion>> {
        let state = self.state.lock().await;
        let mut versions = state.versions.get(tenant_id).cloned().unwrap_or_default();
        versions.reverse();
        Ok(paginate(versions, page))
    }
}

#[async_trait]
impl PolicyRuleStore for MemoryPolicyStore {
    async fn load_all(&self) -> Result<Vec<CasbinRule>> {
        Ok(self.state.lock().await.rules.clone())
    }

    async fn add_rules(&self, rules: &[CasbinRule]) -> Result<()> {
        let mut state = self.state.lock().await;
        for rule in rules {
            if !state.rules.contains(rule) {
                state.rules.push(rule.clone());
            }
        }
        Ok(())
    }

    async fn remove_rules(&self, rules: &[CasbinRule]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.rules.retain(|existing| !rules.contains(existing));
        Ok(())
    }
}

// ==================== Signing Keys ====================

/// JWKS 密钥元数据的进程内实现
#[derive(Default)]
pub struct MemorySigningKeyStore {
    keys: Mutex<HashMap<String, SigningKey>>,
}

impl MemorySigningKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sorted(&self, filter: impl Fn(&SigningKey) -> bool) -> Vec<SigningKey> {
        let keys = self.keys.lock().await;
        let mut out: Vec<SigningKey> = keys.values().filter(|k| filter(k)).cloned().collect();
        out.sort_by(|a, b| a.kid.cmp(&b.kid));
        out
    }
}

#[async_trait]
impl SigningKeyStore for MemorySigningKeyStore {
    async fn save(&self, key: &SigningKey) -> Result<()> {
        let mut keys = self.keys.lock().await;
        if keys.contains_key(&key.kid) {
            return Err(AppError::AlreadyExists(format!("key {}", key.kid)));
        }
        keys.insert(key.kid.clone(), key.clone());
        Ok(())
    }

    async fn update(&self, key: &SigningKey) -> Result<()> {
        let mut keys = self.keys.lock().await;
        match keys.get_mut(&key.kid) {
            Some(existing) => {
                *existing = key.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(format!("key {}", key.kid))),
        }
    }

    async fn delete(&self, kid: &str) -> Result<()> {
        self.keys.lock().await.remove(kid);
        Ok(())
    }

    async fn find_by_kid(&self, kid: &str) -> Result<Option<SigningKey>> {
        Ok(self.keys.lock().await.get(kid).cloned())
    }

    async fn find_by_status(&self, status: KeyStatus) -> Result<Vec<SigningKey>> {
        Ok(self.sorted(|k| k.status == status).await)
    }

    async fn find_all(&self) -> Result<Vec<SigningKey>> {
        Ok(self.sorted(|_| true).await)
    }

    async fn find_publishable(&self, now: DateTime<Utc>) -> Result<Vec<SigningKey>> {
        Ok(self.sorted(|k| k.should_publish(now)).await)
    }

    async fn list(&self, status: Option<KeyStatus>, page: Pagination) -> Result<Page<SigningKey>> {
        let keys = self
            .sorted(|k| status.map(|s| k.status == s).unwrap_or(true))
            .await;
        Ok(paginate(keys, page))
    }
}

// ==================== App Credentials ====================

/// 第三方应用凭证的进程内实现
#[derive(Default)]
pub struct MemoryAppStore {
    apps: Mutex<HashMap<String, AppCredentials>>,
}

impl MemoryAppStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppCredentialStore for MemoryAppStore {
    async fn create(&self, app: &AppCredentials) -> Result<()> {
        let mut apps = self.apps.lock().await;
        if apps.contains_key(&app.app_id) {
            return Err(AppError::AlreadyExists(format!("app {}", app.app_id)));
        }
        apps.insert(app.app_id.clone(), app.clone());
        Ok(())
    }

    async fn find_by_app_id(&self, app_id: &str) -> Result<Option<AppCredentials>> {
        Ok(self.apps.lock().await.get(app_id).cloned())
    }

    async fn update(&self, app: &AppCredentials) -> Result<AppCredentials> {
        let mut apps = self.apps.lock().await;
        let existing = apps
            .get_mut(&app.app_id)
            .ok_or_else(|| AppError::NotFound(format!("app {}", app.app_id)))?;

        if existing.version != app.version {
            return Err(AppError::Conflict(format!(
                "app {} was modified concurrently",
                app.app_id
            )));
        }

        let mut updated = app.clone();
        updated.version += 1;
        *existing = updated.clone();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, models::policy::PolicyRule};

    fn role_req(name: &str, tenant: &str) -> CreateRoleRequest {
        CreateRoleRequest {
            name: name.to_string(),
            display_name: name.to_uppercase(),
            tenant_id: tenant.to_string(),
            description: None,
            created_by: "tester".to_string(),
        }
    }

    #[tokio::test]
    async fn test_role_uniqueness_is_per_tenant() {
        let store = MemoryPolicyStore::new();
        RoleStore::create(&store, &role_req("admin", "t1")).await.unwrap();
        RoleStore::create(&store, &role_req("admin", "t2")).await.unwrap();

        let err = RoleStore::create(&store, &role_req("admin", "t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_soft_deleted_role_frees_name() {
        let store = MemoryPolicyStore::new();
        let role = RoleStore::create(&store, &role_req("admin", "t1")).await.unwrap();
        RoleStore::soft_delete(&store, role.id, "tester").await.unwrap();

        assert!(RoleStore::find_by_id(&store, role.id).await.unwrap().is_none());
        RoleStore::create(&store, &role_req("admin", "t1")).await.unwrap();

        let err = RoleStore::soft_delete(&store, role.id, "tester").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_role_update_optimistic_lock() {
        let store = MemoryPolicyStore::new();
        let role = RoleStore::create(&store, &role_req("admin", "t1")).await.unwrap();

        let req = UpdateRoleRequest {
            display_name: Some("Administrators".to_string()),
            description: None,
            expected_version: role.version,
            updated_by: "tester".to_string(),
        };
        let updated = RoleStore::update(&store, role.id, &req).await.unwrap();
        assert_eq!(updated.version, role.version + 1);

        // 旧版本号再次更新
        let err = RoleStore::update(&store, role.id, &req).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_increment_is_strictly_monotonic() {
        let store = MemoryPolicyStore::new();
        assert!(store.get_current("t1").await.unwrap().is_none());

        let first = store.get_or_create("t1").await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.changed_by, "system");

        let v2 = store.increment("t1", "ops", "grant").await.unwrap();
        let v3 = store.increment("t1", "ops", "revoke").await.unwrap();
        assert_eq!((v2.version, v3.version), (2, 3));

        let history = PolicyVersionStore::list(&store, "t1", Pagination::default())
            .await
            .unwrap();
        assert_eq!(history.total, 3);
        assert_eq!(history.items[0].version, 3);
    }

    #[tokio::test]
    async fn test_versions_stamped_by_injected_clock() {
        let start = DateTime::parse_from_rfc3339("2025-03-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = ManualClock::new(start);
        let store = MemoryPolicyStore::with_clock(Arc::new(clock.clone()));

        let first = store.get_or_create("t1").await.unwrap();
        assert_eq!(first.created_at, start);

        clock.advance(chrono::Duration::minutes(5));
        let v2 = store.increment("t1", "ops", "grant").await.unwrap();
        assert_eq!(v2.created_at, start + chrono::Duration::minutes(5));

        let role = RoleStore::create(&store, &role_req("admin", "t1")).await.unwrap();
        assert_eq!(role.created_at, clock.now());
    }

    #[tokio::test]
    async fn test_rules_are_deduplicated() {
        let store = MemoryPolicyStore::new();
        let rule = CasbinRule::from(&PolicyRule::new("role:admin", "t1", "doc", "read"));
        store.add_rules(&[rule.clone(), rule.clone()]).await.unwrap();
        assert_eq!(store.rule_count().await, 1);

        store.remove_rules(&[rule]).await.unwrap();
        assert_eq!(store.rule_count().await, 0);
    }

    #[tokio::test]
    async fn test_app_update_bumps_version() {
        let store = MemoryAppStore::new();
        let app = AppCredentials::new("app-1", "Mini", "mini_program", Utc::now());
        store.create(&app).await.unwrap();

        let updated = store.update(&app).await.unwrap();
        assert_eq!(updated.version, app.version + 1);

        let err = store.update(&app).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }
}
