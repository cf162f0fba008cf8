//! HTTP client for OpenAI-compatible chat-completion APIs.
//!
//! Both registered providers (OpenAI, xAI) speak the same wire protocol;
//! only the base URL and credentials differ. Generation requests a strict
//! JSON schema so the response content parses directly into
//! [`GenerationOutcome`].

use serde::Deserialize;
use serde_json::json;

use super::{GenerationOutcome, LlmError};

/// Client for one OpenAI-compatible API endpoint.
#[derive(Debug)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

#[derive(Debug, Deserialize)]
struct ModerationResult {
    flagged: bool,
}

impl ChatClient {
    /// Creates a client for `base_url` (e.g. `https://api.openai.com/v1`).
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Runs one structured chat completion.
    ///
    /// # Errors
    ///
    /// Returns an [`LlmError`] for transport failures, non-success statuses,
    /// empty completions, or unparsable structured output.
    pub async fn chat_completion(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<GenerationOutcome, LlmError> {
        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "response_format": response_format(),
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }

        let completion: ChatCompletion = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .ok_or(LlmError::EmptyResponse)?
            .message
            .content;

        serde_json::from_str(&content).map_err(|e| LlmError::Parse(e.to_string()))
    }

    /// Returns whether the moderation endpoint flags `input`.
    ///
    /// # Errors
    ///
    /// Returns an [`LlmError`] for transport failures or non-success
    /// statuses.
    pub async fn is_flagged(&self, input: &str) -> Result<bool, LlmError> {
        let response = self
            .http
            .post(format!("{}/moderations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "input": input }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }

        let moderation: ModerationResponse = response.json().await?;
        Ok(moderation.results.first().is_some_and(|r| r.flagged))
    }
}

/// Strict JSON schema for [`GenerationOutcome`] structured output.
fn response_format() -> serde_json::Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "manim_script_response",
            "description": "A response containing code, description, warnings, scene_name, and valid_input fields.",
            "strict": true,
            "schema": {
                "type": "object",
                "additionalProperties": false,
                "required": ["code", "description", "warnings", "scene_name", "valid_input"],
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "The complete Manim script, empty if the input is unrelated."
                    },
                    "description": {
                        "type": "string",
                        "description": "A brief explanation of the script's functionality."
                    },
                    "warnings": {
                        "type": "string",
                        "description": "Any warnings or assumptions made."
                    },
                    "scene_name": {
                        "type": "string",
                        "description": "The name of the primary scene class."
                    },
                    "valid_input": {
                        "type": "boolean",
                        "description": "Indicates if the input is valid for creating Manim scripts."
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = ChatClient::new("https://api.openai.com/v1/", "key");
        assert_eq!(client.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn response_format_is_a_strict_schema() {
        let format = response_format();
        assert_eq!(format["type"], "json_schema");
        assert_eq!(format["json_schema"]["strict"], true);
        let required = format["json_schema"]["schema"]["required"]
            .as_array()
            .expect("required array");
        assert_eq!(required.len(), 5);
    }

    #[test]
    fn generation_outcome_parses_from_model_content() {
        let content = r#"{
            "code": "from manim import *",
            "description": "draws",
            "warnings": "",
            "scene_name": "S",
            "valid_input": true
        }"#;
        let outcome: GenerationOutcome = serde_json::from_str(content).expect("parses");
        assert!(outcome.valid_input);
        assert_eq!(outcome.scene_name, "S");
    }
}
