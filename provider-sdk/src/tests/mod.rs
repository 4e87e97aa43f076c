//! Unit tests for the provider SDK
//!
//! This module contains tests for various components of the SDK.

pub mod error_tests;
pub mod resilience_tests;
