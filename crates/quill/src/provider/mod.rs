//! Completion service client.
//!
//! [`CompletionBackend`] is the seam the turn pipeline talks through;
//! [`ProviderClient`] is the reqwest-backed production implementation.
//! The configured handle is created once at startup and shared read-only
//! across requests; an unconfigured process simply has no handle.

mod client;
mod error;
mod types;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

pub use client::{ProviderClient, ProviderConfig};
pub use error::{ProviderError, ProviderResult};
pub use types::{Completion, CompletionRequest, ContentBlock, ImageSource, Message};

/// Lazy sequence of response text fragments.
///
/// Ends after the provider signals completion, or after yielding a single
/// `Err` item for a mid-stream failure.
pub type FragmentStream = Pin<Box<dyn Stream<Item = ProviderResult<String>> + Send>>;

/// Completion service abstraction.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Request a complete answer in one round trip.
    async fn complete(&self, request: CompletionRequest) -> ProviderResult<Completion>;

    /// Request an incrementally streamed answer.
    ///
    /// Consumption paces upstream reads: an unread stream does not buffer
    /// unboundedly.
    async fn stream(&self, request: CompletionRequest) -> ProviderResult<FragmentStream>;
}
