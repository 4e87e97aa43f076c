//! Speech API client implementation

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::config::{ProviderEndpointConfig, DEFAULT_PROVIDER};
use crate::core::{
    builder::AuthScheme, ClientBuilder, ProviderKind, SpeechAudio, SpeechProvider, SpeechRequest,
    VoiceSettings,
};
use crate::error::{Result, ServiceError};
use crate::services::common::{parse_error_response, transport_error};

#[derive(Debug, Serialize)]
struct SynthesizeBody<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

/// Speech API client
#[derive(Debug, Clone)]
pub struct SpeechClient {
    http_client: Client,
    config: ProviderEndpointConfig,
}

impl SpeechClient {
    /// Create a client from the default environment configuration
    pub fn from_env() -> Result<Self> {
        let config = ProviderEndpointConfig::from_provider(ProviderKind::Speech, &**DEFAULT_PROVIDER)?;
        Self::new_with_config(config)
    }

    /// Create a client with an explicit configuration
    pub fn new_with_config(config: ProviderEndpointConfig) -> Result<Self> {
        let http_client = ClientBuilder::for_endpoint(&config)
            .auth_scheme(AuthScheme::Header("xi-api-key".to_string()))
            .header("Accept", "audio/mpeg")
            .build_http_client()?;
        Ok(Self {
            http_client,
            config,
        })
    }
}

#[async_trait]
impl SpeechProvider for SpeechClient {
    fn name(&self) -> &str {
        "speech"
    }

    async fn synthesize(&self, request: &SpeechRequest) -> Result<SpeechAudio> {
        request.validate()?;

        let voice_id = request
            .voice_id
            .as_deref()
            .or(self.config.voice_id.as_deref())
            .ok_or_else(|| ServiceError::validation("No voice id given or configured"))?;

        let url = self.config.endpoint(&format!("text-to-speech/{}", voice_id));
        let body = SynthesizeBody {
            text: request.text.trim(),
            model_id: &self.config.model,
            voice_settings: request.voice_settings,
        };

        log::debug!("Sending request to speech: POST {}", url);
        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), &url, e))?;

        if !response.status().is_success() {
            return Err(parse_error_response(self.name(), &url, response).await);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();

        let audio = response
            .bytes()
            .await
            .map_err(|e| transport_error(self.name(), &url, e))?
            .to_vec();

        if audio.is_empty() {
            return Err(ServiceError::parsing("Speech provider returned no audio"));
        }

        Ok(SpeechAudio {
            audio,
            content_type,
        })
    }
}
