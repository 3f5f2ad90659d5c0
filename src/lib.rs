// ABOUTME: Root module for llm-relay - streaming response normalization.
// ABOUTME: Re-exports all public types from submodules.

pub mod error;
pub mod llm;
pub mod prelude;

pub use error::{LlmError, RelayError, TokenError};
