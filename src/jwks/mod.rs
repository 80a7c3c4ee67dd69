//! JWKS 密钥生命周期

pub mod manager;
pub mod scheduler;

pub use manager::{CleanupOutcome, KeyManager, RotationOutcome};
pub use scheduler::{parse_cron, RotationSchedule, RotationScheduler};
