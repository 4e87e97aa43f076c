//! Vision API wire models

use serde::Serialize;

/// Body of `POST {base}/vision/analyze`
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeRequest<'a> {
    /// Model identifier
    pub model: &'a str,

    /// Caller supplied image identifier
    pub image_id: &'a str,

    /// Base64 encoded image, absent when only the id is known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,

    /// Suggestion type the analysis is for
    pub suggestion_type: &'a str,

    /// User supplied context, possibly empty
    pub context: &'a str,
}
