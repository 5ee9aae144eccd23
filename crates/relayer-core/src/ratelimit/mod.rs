pub mod config;
pub mod controller;
pub mod snapshot;

pub use config::RateLimitConfig;
pub use controller::{FloodWaitDecision, OpClass, RateLimitController};
pub use snapshot::RateLimitSnapshot;
