//! Application services
//!
//! 命令先校验输入，再交给双写协调器或对应组件；查询直接读存储或矩阵，不产生版本变化。

pub mod app_service;
pub mod assignment_service;
pub mod key_service;
pub mod policy_service;
pub mod resource_service;
pub mod role_service;

pub use app_service::AppCredentialService;
pub use assignment_service::AssignmentService;
pub use key_service::KeyService;
pub use policy_service::{CheckRequest, CheckResponse, PolicyService};
pub use resource_service::ResourceService;
pub use role_service::RoleService;
