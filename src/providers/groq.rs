//! Groq API client implementation.

use crate::api::openai::{OpenAiCompatibleClient, OpenAiCompatibleModel};
use crate::options::{ModelOptions, TransportOptions};
use crate::providers::Provider;
use serde::{Deserialize, Serialize};

/// Groq-specific request fields.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroqModel {
    /// `"low"`, `"medium"` or `"high"` on reasoning models.
    pub reasoning_effort: Option<String>,
}

impl OpenAiCompatibleModel for GroqModel {}

pub type GroqClient = OpenAiCompatibleClient<GroqModel>;

pub struct Groq;

impl Provider for Groq {
    type Client = GroqClient;
    type Model = GroqModel;

    const ENV_PREFIX: &'static str = "GROQ";
    const DEFAULT_BASE_URL: &'static str = "https://api.groq.com/openai/v1";

    fn create_at(
        base_url: String,
        api_key: String,
        model_options: ModelOptions<GroqModel>,
        transport_options: TransportOptions,
    ) -> Self::Client {
        GroqClient::new(api_key, base_url, model_options, transport_options)
    }
}
