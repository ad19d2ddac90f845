//! # Configuration System
//!
//! Centralized configuration management for the generation broker.
//!
//! This crate provides:
//! - Configuration structures for all components
//! - Environment variable loading (`LF_*`, 12-factor app principles)
//! - Configuration file loading (TOML/YAML)
//! - The model catalog used for context-window checks
//!
//! # Best Practices
//!
//! - Uses `validator` crate for input validation
//! - No global settings: construct once, pass by reference

pub mod config;
pub mod file_loader;
pub mod loader;
pub mod models;

pub use config::{
    CacheConfig, Config, GenerationDefaults, ModelsConfig, ObservabilityConfig, ProviderConfig,
    RateLimitAlgorithm, RateLimitConfig, RedisConfig, ScopeLimit
};
pub use file_loader::{ConfigFileError, load_from_file, load_from_toml, load_from_yaml};
pub use loader::load_from_env;
pub use models::{ModelCatalog, ModelSpec};
pub use validator::Validate;
