//! # Generation Pipeline
//!
//! Theme-aware brokering of text-generation calls:
//! - `RequestValidator`: content type, theme and config checks before any call
//! - `CacheStore`: TTL cache with lazy expiry over a shared store
//! - `RateLimiter`: fixed and sliding window counters across independent scopes
//! - `ProviderClient`: timeout, retry and one-level model fallback
//! - `GenerationPipeline`: orchestration, streaming and structured output

pub mod cache;
pub mod parser;
pub mod pipeline;
pub mod prompt;
pub mod provider;
pub mod rate_limiter;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::CacheStore;
pub use parser::{ParseError, ParseQuality, Parsed, parse_structured};
pub use pipeline::{
    GenerateRequest, GenerationChunk, GenerationPipeline, GenerationStream, PipelineOptions,
    PipelineStage, StructuredGeneration
};
pub use prompt::{DefaultPromptBuilder, PromptTemplate};
pub use provider::{
    FallbackPolicy, HttpChatProvider, MockOutcome, MockProvider, ProviderClient, RetryConfig
};
pub use rate_limiter::{RateLimitScope, RateLimiter};
pub use validator::RequestValidator;
