//! Generation API client implementation
//!
//! Asks an OpenAI-compatible chat completion endpoint for suggestions. The
//! model must answer with a JSON object of the form
//! `{"suggestions": [{"text": .., "confidence": .., "reasoning": ..}]}`;
//! anything else is an invalid response.

mod models;
pub use models::*;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::{ProviderEndpointConfig, DEFAULT_PROVIDER};
use crate::core::{
    ClientBuilder, GenerationProvider, GenerationRequest, GenerationResponse, ModelMeta,
    ProviderKind,
};
use crate::error::{Result, ServiceError};
use crate::services::common::post_json;

const SYSTEM_PROMPT: &str = "You write short conversation suggestions. \
Reply with a JSON object {\"suggestions\": [{\"text\": string, \"confidence\": number between 0 and 1, \"reasoning\": string}]} and nothing else.";

/// Generation API client
#[derive(Debug, Clone)]
pub struct GenerationClient {
    http_client: Client,
    config: ProviderEndpointConfig,
}

impl GenerationClient {
    /// Create a client from the default environment configuration
    pub fn from_env() -> Result<Self> {
        let config =
            ProviderEndpointConfig::from_provider(ProviderKind::Generation, &**DEFAULT_PROVIDER)?;
        Self::new_with_config(config)
    }

    /// Create a client with an explicit configuration
    pub fn new_with_config(config: ProviderEndpointConfig) -> Result<Self> {
        let http_client = ClientBuilder::for_endpoint(&config).build_http_client()?;
        Ok(Self {
            http_client,
            config,
        })
    }

    /// Send a raw chat completion request
    pub async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let url = self.config.endpoint("chat/completions");
        post_json(&self.http_client, "generation", &url, request).await
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<ChatCompletionRequest> {
        let details = serde_json::to_string(&request.extracted_details)?;
        let mut prompt = format!(
            "Write {} {} suggestions in a {} tone.\nDetails: {}",
            request.count, request.suggestion_type, request.tone, details
        );
        if !request.context.is_empty() {
            prompt.push_str("\nContext: ");
            prompt.push_str(&request.context);
        }

        Ok(ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)],
            temperature: Some(0.8),
            max_tokens: Some(600),
            response_format: Some(ResponseFormat::json_object()),
        })
    }
}

/// Pull the suggestion payload out of a completion
pub fn parse_suggestions(response: &ChatCompletionResponse) -> Result<SuggestionPayload> {
    let content = response
        .choices
        .first()
        .and_then(|choice| choice.message.content.as_deref())
        .ok_or_else(|| ServiceError::parsing("No completion choices returned"))?;

    // Some models wrap JSON in a markdown fence despite the response format
    let trimmed = content.trim();
    let json = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);

    let payload: SuggestionPayload = serde_json::from_str(json.trim())
        .map_err(|e| ServiceError::parsing(format!("Completion is not a suggestion payload: {}", e)))?;

    if payload.suggestions.is_empty() {
        return Err(ServiceError::parsing("Completion contained no suggestions"));
    }

    Ok(payload)
}

#[async_trait]
impl GenerationProvider for GenerationClient {
    fn name(&self) -> &str {
        "generation"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let completion = self.chat_completion(&self.build_request(request)?).await?;
        let payload = parse_suggestions(&completion)?;

        Ok(GenerationResponse {
            suggestions: payload.suggestions,
            model_meta: ModelMeta {
                model: if completion.model.is_empty() {
                    self.config.model.clone()
                } else {
                    completion.model.clone()
                },
                prompt_tokens: completion.usage.as_ref().map(|u| u.prompt_tokens),
                completion_tokens: completion.usage.as_ref().map(|u| u.completion_tokens),
            },
        })
    }
}
