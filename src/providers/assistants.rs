//! OpenAI Assistants, served through a polled [`RunClient`].

use serde::{Deserialize, Serialize};

use crate::api::assistants::{self, AssistantsBackend};
use crate::client::ClientError;
use crate::options::{EnvConfig, ModelOptions, TransportOptions};
use crate::poller::RunClient;
use crate::providers::Provider;

/// Which assistant runs the conversation. An empty `model` keeps the assistant's own.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AssistantsModel {
    pub assistant_id: String,
}

pub type AssistantsClient = RunClient<AssistantsBackend>;

pub struct Assistants;

impl Provider for Assistants {
    type Client = AssistantsClient;
    type Model = AssistantsModel;

    const ENV_PREFIX: &'static str = "OPENAI";
    const DEFAULT_BASE_URL: &'static str = assistants::DEFAULT_BASE_URL;

    fn create_at(
        base_url: String,
        api_key: String,
        model_options: ModelOptions<AssistantsModel>,
        transport_options: TransportOptions,
    ) -> Self::Client {
        let backend = AssistantsBackend::new(api_key, model_options.provider.assistant_id)
            .with_base_url(base_url)
            .with_model(model_options.model)
            .with_transport(transport_options);
        RunClient::new(backend)
    }

    /// Like the default, plus the required `OPENAI_ASSISTANT_ID`.
    fn from_env() -> Result<Self::Client, ClientError> {
        let config = EnvConfig::from_env(Self::ENV_PREFIX)?;
        let assistant_id = std::env::var("OPENAI_ASSISTANT_ID")
            .ok()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ClientError::Config("OPENAI_ASSISTANT_ID is not set".to_string()))?;

        let mut model_options = ModelOptions::<AssistantsModel>::new(config.model.unwrap_or_default());
        model_options.provider.assistant_id = assistant_id;
        Ok(Self::create_at(
            config
                .base_url
                .unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string()),
            config.api_key,
            model_options,
            TransportOptions::default(),
        ))
    }
}
