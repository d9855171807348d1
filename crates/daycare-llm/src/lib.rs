//! # daycare-llm
//!
//! Abstraction layer over model providers: a registry of provider implementations
//! and a router that walks the configured priority list until one can serve the call.

pub mod mock;
pub mod provider;
pub mod registry;
pub mod router;

pub use mock::MockProvider;
pub use provider::{
    CompletionOptions, InferenceClient, InferenceContext, InferenceProvider, InferenceResponse,
    StopReason, Usage,
};
pub use registry::ProviderRegistry;
pub use router::{InferenceResult, InferenceRouter, RouteOptions};
