//! Anthropic Messages API provider implementation.

use crate::client::ApiClient;
use crate::retry::RetryConfig;
use ferry_types::provider::{Provider, ProviderFuture};
use ferry_types::{ApiError, CreateMessageRequest};

/// Anthropic Messages API provider.
///
/// Wraps `ApiClient` and implements the `Provider` trait. Retry logic stays
/// in `ApiClient`.
#[derive(Clone)]
pub struct AnthropicProvider {
    client: ApiClient,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            client: ApiClient::new(api_key, base_url)?,
        })
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.client = self.client.with_retry_config(config);
        self
    }
}

impl Provider for AnthropicProvider {
    fn create_message<'a>(&'a self, request: &'a CreateMessageRequest) -> ProviderFuture<'a> {
        Box::pin(self.client.create_message(request))
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_name() {
        let provider = AnthropicProvider::new("test-key", "https://api.example.com")
            .unwrap()
            .with_retry_config(RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            });
        assert_eq!(provider.name(), "anthropic");
    }
}
