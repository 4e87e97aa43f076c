//! Vision API client implementation
//!
//! Sends screenshots to the image analysis provider and returns the
//! extracted details, a quality score and, when the screenshot does not carry
//! enough information, guidance for the user.

mod models;
pub use models::*;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;

use crate::config::{ProviderEndpointConfig, DEFAULT_PROVIDER};
use crate::core::{ClientBuilder, ProviderKind, VisionAnalysis, VisionProvider, VisionRequest};
use crate::error::Result;
use crate::services::common::post_json;

/// Vision API client
#[derive(Debug, Clone)]
pub struct VisionClient {
    http_client: Client,
    config: ProviderEndpointConfig,
}

impl VisionClient {
    /// Create a client from the default environment configuration
    pub fn from_env() -> Result<Self> {
        let config = ProviderEndpointConfig::from_provider(ProviderKind::Vision, &**DEFAULT_PROVIDER)?;
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

    /// Configuration in use
    pub fn config(&self) -> &ProviderEndpointConfig {
        &self.config
    }
}

#[async_trait]
impl VisionProvider for VisionClient {
    fn name(&self) -> &str {
        "vision"
    }

    async fn analyze(&self, request: &VisionRequest) -> Result<VisionAnalysis> {
        let body = AnalyzeRequest {
            model: &self.config.model,
            image_id: &request.image_id,
            image_base64: (!request.image.is_empty()).then(|| STANDARD.encode(&request.image)),
            suggestion_type: &request.suggestion_type,
            context: &request.context,
        };

        let url = self.config.endpoint("vision/analyze");
        let analysis: VisionAnalysis = post_json(&self.http_client, self.name(), &url, &body).await?;
        analysis.validate()?;

        log::debug!(
            "Vision analysis for {}: quality {:.1}, needs more input: {}",
            request.image_id,
            analysis.quality_score,
            analysis.needs_more_input
        );

        Ok(analysis)
    }
}
