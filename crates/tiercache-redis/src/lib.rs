//! Redis-backed shared tier (L2) for tiercache.
//!
//! ```text
//! TieredCache → ResilienceGuard → RedisTier → deadpool-redis pool → Redis
//! ```
//!
//! The tier itself never retries and never swallows errors; failure handling
//! belongs to the guard in front of it.

pub mod config;
pub mod tier;

pub use config::RedisConfig;
pub use tier::{RedisTier, create_redis_tier};
