//! Language-model provider registry for script generation.
//!
//! This module provides:
//!
//! - [`Provider`]: capability trait — `generate(prompt) → GenerationOutcome`
//! - [`LlmService`]: model-id → provider registry with a default model and
//!   an optional moderation gate
//! - [`ChatClient`]: shared HTTP client for OpenAI-compatible APIs
//!
//! Providers request structured output (a strict JSON schema), so a
//! generation either parses into [`GenerationOutcome`] or fails loudly.

pub mod client;
pub mod openai;
pub mod xai;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use client::ChatClient;

/// System prompt steering providers toward a compilable animation script.
pub const SYSTEM_PROMPT: &str = "\
You are an assistant that generates Manim code based on a user prompt.
You MUST return exactly one JSON object that conforms to the given JSON schema:
- code: The full Python Manim script if valid_input is true; empty string if not valid.
- description: A brief explanation of what the script does (or why it's invalid).
- warnings: Any warnings, assumptions, or reasons for invalidity.
- scene_name: The primary scene class name if valid; otherwise empty if invalid.
- valid_input: True if the user's prompt can be turned into a Manim animation; false if unrelated or disallowed.

No additional text outside the JSON. No markdown formatting.
If the user's request is unrelated to Manim or not actionable, set valid_input to false, provide a helpful description and possibly warnings, and leave code empty.
If valid_input is true, the code should have:
- A docstring at the top.
- Necessary imports from manim.
- A Scene class with a construct method implementing the animation.
- Comments explaining key steps in the code.
";

/// Errors from language-model providers.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The requested model has no registered provider.
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    /// The HTTP request to the provider failed.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider returned a non-success status.
    #[error("provider api error (status {status}): {message}")]
    Api {
        /// HTTP status code returned by the provider.
        status: u16,
        /// Response body, for diagnostics.
        message: String,
    },

    /// The provider returned no completion choices.
    #[error("no response choices returned")]
    EmptyResponse,

    /// The structured output did not parse into [`GenerationOutcome`].
    #[error("failed to parse model response: {0}")]
    Parse(String),
}

/// The structured result of one generation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOutcome {
    /// The complete animation script; empty when the input is invalid.
    pub code: String,
    /// A brief explanation of the script's functionality.
    pub description: String,
    /// Any warnings or assumptions made.
    pub warnings: String,
    /// The name of the primary scene class.
    pub scene_name: String,
    /// Whether the prompt could be turned into an animation.
    pub valid_input: bool,
}

/// A language-model provider bound to one model id.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generates an animation script for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<GenerationOutcome, LlmError>;

    /// The model id this provider serves (e.g. `gpt-4o`).
    fn model_id(&self) -> &str;
}

/// Response body of `GET /models`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    /// Available model ids, sorted.
    pub models: Vec<String>,
    /// The model used when a request names none.
    pub default_model: String,
}

/// Registry of providers keyed by model id.
pub struct LlmService {
    providers: HashMap<String, Arc<dyn Provider>>,
    models: Vec<String>,
    default_model: String,
    moderator: Option<Arc<ChatClient>>,
}

impl LlmService {
    /// Creates an empty registry with the given default model.
    #[must_use]
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            models: Vec::new(),
            default_model: default_model.into(),
            moderator: None,
        }
    }

    /// Registers a provider under its model id.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers
            .insert(provider.model_id().to_string(), provider);
        self.models = self.providers.keys().cloned().collect();
        self.models.sort();
    }

    /// Enables the moderation gate using the given client.
    pub fn set_moderator(&mut self, moderator: Arc<ChatClient>) {
        self.moderator = Some(moderator);
    }

    /// Returns true when no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Returns the sorted list of available model ids.
    #[must_use]
    pub fn available_models(&self) -> Vec<String> {
        self.models.clone()
    }

    /// Returns the default model id.
    #[must_use]
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Generates a script, dispatching on the requested model.
    ///
    /// When the moderation gate is enabled and flags the prompt, an invalid
    /// outcome is returned without calling any provider.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::UnsupportedModel`] for unregistered models and
    /// provider errors otherwise.
    pub async fn generate(
        &self,
        prompt: &str,
        model: Option<&str>,
    ) -> Result<GenerationOutcome, LlmError> {
        if let Some(moderator) = &self.moderator {
            if moderator.is_flagged(prompt).await? {
                tracing::info!("prompt rejected by moderation");
                return Ok(GenerationOutcome {
                    description: "The request cannot be fulfilled due to disallowed content."
                        .to_string(),
                    warnings: "Content flagged by moderation.".to_string(),
                    ..GenerationOutcome::default()
                });
            }
        }

        let model = match model {
            Some(model) if !model.is_empty() => model,
            _ => &self.default_model,
        };

        let provider = self
            .providers
            .get(model)
            .ok_or_else(|| LlmError::UnsupportedModel(model.to_string()))?;
        provider.generate(prompt).await
    }
}
