//! # Storage Layer
//!
//! Backing stores for cached results and rate-limit counters (Redis,
//! in-memory). Both implement the `gen_core` store traits.

pub mod memory;
pub mod redis;

pub use memory::InMemoryStore;
pub use redis::RedisStore;
