//! Provider access: the retrying/fallback client and concrete adapters.

pub mod client;
pub mod http;
pub mod mock;

pub use client::{FallbackPolicy, ProviderClient, ProviderStream, RetryConfig};
pub use http::HttpChatProvider;
pub use mock::{MockCall, MockOutcome, MockProvider};

/// Text, usage and answering model of a finished provider call.
pub type ProviderResponse = gen_core::types::Completion;

/// One streamed increment from a provider.
pub type ProviderChunk = gen_core::types::StreamDelta;
