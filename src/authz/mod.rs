//! 授权策略引擎：规则矩阵、双写协调与版本通知

pub mod adapter;
pub mod coordinator;
pub mod matrix;
pub mod notifier;

pub use adapter::RuleTableAdapter;
pub use coordinator::{CoordinatorPorts, PolicyCoordinator};
pub use matrix::{Enforcer, RuleMatrix};
pub use notifier::{
    InProcessNotifier, PolicySyncHandler, RabbitMqNotifier, VersionChange, VersionHandler,
    VersionNotifier,
};
