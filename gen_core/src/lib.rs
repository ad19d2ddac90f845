//! # Loreforge Core
//!
//! Shared types and seam traits for the generation broker.
//!
//! This crate provides:
//! - Request and result types (`ThemeContext`, `GenerationConfig`, `GenerationResult`)
//! - Rate-limit and cache records (`RateLimitInfo`, `CacheItem`)
//! - Capability traits composed by the pipeline (`KeyValueStore`, `CounterStore`,
//!   `TextGenerationProvider`, `PromptBuilder`)

pub mod traits;
pub mod types;

pub use traits::{CompletionStream, CounterStore, KeyValueStore, PromptBuilder, TextGenerationProvider};
pub use types::{
    CacheItem, ChatMessage, Completion, ContentType, GenerationConfig, GenerationMetadata,
    GenerationResult, MessageRole, Prompt, ProviderRequest, RateLimitInfo, SlidingWindowOutcome,
    StreamDelta, ThemeCompatibility, ThemeContext, ThemeElements, TokenUsage, ValidationResult,
    ValidationSeverity, now_millis
};
