//! Provider-specific client implementations
//!
//! HTTP clients for the vision, generation and speech providers. Each one
//! implements the matching provider trait from [`crate::core`].

pub mod common;
pub mod generation;
pub mod speech;
pub mod vision;

pub use common::UserAgent;
pub use generation::GenerationClient;
pub use speech::SpeechClient;
pub use vision::VisionClient;
