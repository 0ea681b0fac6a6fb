//! LLM provider implementations.

use crate::client::{Client, ClientError};
use crate::options::{EnvConfig, ModelOptions, TransportOptions};

/// Trait for LLM providers that can create configured clients.
pub trait Provider {
    /// The client type produced by this provider.
    type Client: Client;

    /// Provider-specific model options, flattened into [`ModelOptions`].
    type Model: Default;

    /// Prefix of the environment variables read by [`from_env`](Self::from_env).
    const ENV_PREFIX: &'static str;

    const DEFAULT_BASE_URL: &'static str;

    /// Create a client against an explicit endpoint.
    fn create_at(
        base_url: String,
        api_key: String,
        model_options: ModelOptions<Self::Model>,
        transport_options: TransportOptions,
    ) -> Self::Client;

    /// Create a new client for `model` with default options.
    fn create(api_key: String, model: String) -> Self::Client {
        Self::create_with_options(api_key, ModelOptions::new(model), TransportOptions::default())
    }

    /// Create a new client with custom options.
    fn create_with_options(
        api_key: String,
        model_options: ModelOptions<Self::Model>,
        transport_options: TransportOptions,
    ) -> Self::Client {
        Self::create_at(
            Self::DEFAULT_BASE_URL.to_string(),
            api_key,
            model_options,
            transport_options,
        )
    }

    /// Create a client from `{ENV_PREFIX}_API_KEY`, `{ENV_PREFIX}_BASE_URL` and
    /// `{ENV_PREFIX}_MODEL`.
    fn from_env() -> Result<Self::Client, ClientError> {
        let config = EnvConfig::from_env(Self::ENV_PREFIX)?;
        Ok(Self::from_config(config))
    }

    fn from_config(config: EnvConfig) -> Self::Client {
        Self::create_at(
            config
                .base_url
                .unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string()),
            config.api_key,
            ModelOptions::new(config.model.unwrap_or_default()),
            TransportOptions::default(),
        )
    }
}

pub mod assistants;
pub mod groq;
pub mod ollama;
pub mod openai;

// Re-export for convenience
pub use assistants::{Assistants, AssistantsClient, AssistantsModel};
pub use groq::{Groq, GroqClient, GroqModel};
pub use ollama::{Ollama, OllamaClient, OllamaModel};
pub use openai::{OpenAi, OpenAiClient, OpenAiModel};
