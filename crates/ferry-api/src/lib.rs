//! Anthropic Messages API client for Ferry.

mod client;
mod provider;
mod retry;

pub use client::{ApiClient, DEFAULT_BASE_URL};
pub use provider::AnthropicProvider;
pub use retry::RetryConfig;
