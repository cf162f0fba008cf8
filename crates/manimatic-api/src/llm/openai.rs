//! OpenAI provider registration.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ChatClient, GenerationOutcome, LlmError, LlmService, Provider, SYSTEM_PROMPT};

const BASE_URL: &str = "https://api.openai.com/v1";

const MODELS: [&str; 2] = ["gpt-4o", "gpt-4o-mini"];

struct OpenAiProvider {
    client: Arc<ChatClient>,
    model_id: &'static str,
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn generate(&self, prompt: &str) -> Result<GenerationOutcome, LlmError> {
        self.client
            .chat_completion(self.model_id, SYSTEM_PROMPT, prompt)
            .await
    }

    fn model_id(&self) -> &str {
        self.model_id
    }
}

/// Registers the OpenAI models with `service`.
///
/// Returns the shared client so the moderation gate can reuse it (only
/// OpenAI exposes a moderation endpoint).
pub fn register_with(service: &mut LlmService, api_key: &str) -> Arc<ChatClient> {
    let client = Arc::new(ChatClient::new(BASE_URL, api_key));
    for model_id in MODELS {
        service.register(Arc::new(OpenAiProvider {
            client: Arc::clone(&client),
            model_id,
        }));
    }
    client
}
