// ABOUTME: Async bearer-token providers injected into provider clients.
// ABOUTME: Acquisition and refresh live behind the trait, outside this crate.

use async_trait::async_trait;

use crate::error::TokenError;

/// Supplies the bearer token for each request.
///
/// Implementations are shared across concurrent requests and may refresh
/// credentials internally.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Get a token for the next request. An empty token sends no
    /// `Authorization` header.
    async fn token(&self) -> Result<String, TokenError>;
}

/// A fixed token, such as an API key.
#[derive(Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Read the token once from an environment variable.
    pub fn from_env(var: &str) -> Result<Self, TokenError> {
        std::env::var(var)
            .map(Self::new)
            .map_err(|_| TokenError::Unavailable(format!("{var} environment variable not set")))
    }

    /// A provider that sends no credentials, for proxies that add their own.
    pub fn none() -> Self {
        Self::new("")
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToken")
            .field("token", &if self.token.is_empty() { "" } else { "***" })
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, TokenError> {
        Ok(self.token.clone())
    }
}

/// Reads an environment variable on every request, so rotated credentials
/// are picked up without rebuilding the client.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenProvider for EnvToken {
    async fn token(&self) -> Result<String, TokenError> {
        std::env::var(&self.var)
            .map_err(|_| TokenError::Unavailable(format!("{} environment variable not set", self.var)))
    }
}
