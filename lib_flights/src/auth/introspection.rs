//! # Token Introspection
//!
//! Asks an OAuth2 introspection endpoint whether a bearer token is active and
//! which client it was issued to.
//!
//! The request is a form POST of `token=<value>`; the client is built on
//! `reqwest_middleware` with an exponential-backoff retry policy so a blip on
//! the identity provider does not turn straight into a rejected session.

use reqwest::{StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::live::ClientIdentity;

/// Why a credential was not accepted.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid introspection url: {0}")]
    InvalidUrl(String),
    #[error("missing bearer credential")]
    MissingCredential,
    #[error("introspection endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("introspection endpoint answered {0}")]
    Rejected(u16),
    #[error("malformed introspection response: {0}")]
    MalformedResponse(String),
    #[error("token is not active (expired or revoked)")]
    Inactive,
    #[error("token carries no client id")]
    MissingClientId,
}

/// # Introspection Response
///
/// The RFC 7662 fields the service reads. Missing fields default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Introspection {
    pub active: bool,
    pub client_id: String,
    #[serde(rename = "exp")]
    pub expiration: i64,
    pub iat: i64,
    #[serde(rename = "iss")]
    pub issuer: String,
    pub scope: String,
    pub sub: String,
    pub token_type: String,
}

/// Extracts the token from an `Authorization` header value.
///
/// `"Bearer abc"` and a bare `"abc"` both yield `abc`; blank values yield `None`.
pub fn bearer_token(header: &str) -> Option<&str> {
    let header = header.trim();
    let token = match header.strip_prefix("Bearer") {
        Some(rest) if rest.is_empty() || rest.starts_with(' ') => rest.trim(),
        _ => header,
    };
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// # Introspection Authorizer
///
/// Shared by every connection; the inner client pools HTTP connections.
pub struct IntrospectionAuthorizer {
    client: ClientWithMiddleware,
    url: Url,
}

impl IntrospectionAuthorizer {
    /// Creates an authorizer for the endpoint at `introspection_url`.
    ///
    /// # Arguments
    /// * `introspection_url` - Absolute URL of the introspection endpoint.
    /// * `max_retries` - Retries on transient failures (connect errors, 5xx).
    pub fn new(introspection_url: &str, max_retries: u32) -> Result<Self, AuthError> {
        let url = Url::parse(introspection_url).map_err(|e| AuthError::InvalidUrl(e.to_string()))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("nearbyflights/1.0")
            .build()
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        let client = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { client, url })
    }

    /// Validates the `Authorization` header of an incoming session.
    ///
    /// # Errors
    /// Any [`AuthError`]; every one of them means the session must not start.
    pub async fn authorize(&self, authorization: Option<&str>) -> Result<ClientIdentity, AuthError> {
        let token = authorization
            .and_then(bearer_token)
            .ok_or(AuthError::MissingCredential)?;

        let introspection = self.introspect(token).await?;

        if !introspection.active {
            log::error!("token is not active (expired or revoked)");
            return Err(AuthError::Inactive);
        }
        if introspection.client_id.is_empty() {
            return Err(AuthError::MissingClientId);
        }

        log::info!(
            "user {} authorized as client {}",
            introspection.sub,
            introspection.client_id
        );
        Ok(ClientIdentity::new(introspection.client_id))
    }

    async fn introspect(&self, token: &str) -> Result<Introspection, AuthError> {
        let response = self
            .client
            .post(self.url.clone())
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| {
                log::error!("error when getting introspection response: {}", e);
                AuthError::Unreachable(e.to_string())
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            log::error!("introspection endpoint answered {}", status);
            return Err(AuthError::Rejected(status.as_u16()));
        }

        response.json::<Introspection>().await.map_err(|e| {
            log::error!("error when decoding introspection response: {}", e);
            AuthError::MalformedResponse(e.to_string())
        })
    }
}
