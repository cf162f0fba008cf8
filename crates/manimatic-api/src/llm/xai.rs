//! xAI provider registration.
//!
//! The xAI API is OpenAI-compatible, so the shared [`ChatClient`] works
//! against a different base URL.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ChatClient, GenerationOutcome, LlmError, LlmService, Provider, SYSTEM_PROMPT};

const BASE_URL: &str = "https://api.x.ai/v1";

const MODELS: [&str; 1] = ["grok-2-latest"];

struct XaiProvider {
    client: Arc<ChatClient>,
    model_id: &'static str,
}

#[async_trait]
impl Provider for XaiProvider {
    async fn generate(&self, prompt: &str) -> Result<GenerationOutcome, LlmError> {
        self.client
            .chat_completion(self.model_id, SYSTEM_PROMPT, prompt)
            .await
    }

    fn model_id(&self) -> &str {
        self.model_id
    }
}

/// Registers the xAI models with `service`.
pub fn register_with(service: &mut LlmService, api_key: &str) {
    let client = Arc::new(ChatClient::new(BASE_URL, api_key));
    for model_id in MODELS {
        service.register(Arc::new(XaiProvider {
            client: Arc::clone(&client),
            model_id,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_grok() {
        let mut service = LlmService::new("grok-2-latest");
        register_with(&mut service, "test-key");
        assert_eq!(service.available_models(), vec!["grok-2-latest"]);
    }
}
