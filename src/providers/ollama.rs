//! Ollama API client implementation.
//!
//! Ollama needs no key; [`Provider::create`] takes the base URL in its place.

use serde::{Deserialize, Serialize};

use crate::api::openai::{OpenAiCompatibleClient, OpenAiCompatibleModel};
use crate::client::ClientError;
use crate::options::{EnvConfig, ModelOptions, TransportOptions};
use crate::providers::Provider;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OllamaModel;

impl OpenAiCompatibleModel for OllamaModel {}

pub type OllamaClient = OpenAiCompatibleClient<OllamaModel>;

pub struct Ollama;

impl Provider for Ollama {
    type Client = OllamaClient;
    type Model = OllamaModel;

    const ENV_PREFIX: &'static str = "OLLAMA";
    const DEFAULT_BASE_URL: &'static str = "http://localhost:11434/v1";

    fn create_at(
        base_url: String,
        _api_key: String,
        model_options: ModelOptions<OllamaModel>,
        transport_options: TransportOptions,
    ) -> Self::Client {
        OllamaClient::new(
            "ollama".to_string(),
            base_url,
            model_options,
            transport_options,
        )
    }

    fn create(base_url: String, model: String) -> Self::Client {
        Self::create_at(
            base_url,
            String::new(),
            ModelOptions::new(model),
            TransportOptions::default(),
        )
    }

    /// Reads `OLLAMA_BASE_URL` and `OLLAMA_MODEL`; no key is needed.
    fn from_env() -> Result<Self::Client, ClientError> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Ok(Self::from_config(EnvConfig {
            api_key: String::new(),
            base_url: var("OLLAMA_BASE_URL"),
            model: var("OLLAMA_MODEL"),
        }))
    }
}
