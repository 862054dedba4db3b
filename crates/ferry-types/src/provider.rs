//! Provider trait for LLM API providers.

use crate::{ApiError, CreateMessageRequest, CreateMessageResponse};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`Provider::create_message`].
pub type ProviderFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CreateMessageResponse, ApiError>> + Send + 'a>>;

/// The LLM collaborator: takes the full history plus tool catalog and
/// answers with either final text or one or more tool-use requests.
///
/// Dyn-compatible so the conversation loop works with `Arc<dyn Provider>`.
pub trait Provider: Send + Sync {
    /// Send one Messages API request and wait for the complete response.
    fn create_message<'a>(&'a self, request: &'a CreateMessageRequest) -> ProviderFuture<'a>;

    /// Provider name for logging/display (e.g., "anthropic").
    fn name(&self) -> &str;
}
