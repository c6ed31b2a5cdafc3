//! Bearer credential issuance and verification for relay connections.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use meteorelay_core::Identity;
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AuthConfig;

const BEARER_PREFIX: &str = "Bearer ";
const GENERATED_SECRET_LEN: usize = 48;

/// Client-facing messages; verification detail never leaves the server.
pub const NO_TOKEN_MESSAGE: &str = "No auth token provided";
pub const INVALID_TOKEN_MESSAGE: &str = "Invalid token";
pub const MALFORMED_TOKEN_MESSAGE: &str = "Malformed token";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("{}", NO_TOKEN_MESSAGE)]
    MissingCredential,
    #[error("{}", INVALID_TOKEN_MESSAGE)]
    InvalidCredential,
    #[error("{}", MALFORMED_TOKEN_MESSAGE)]
    MalformedCredential,
    #[error("failed to sign credential: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub user: Identity,
    pub iat: i64,
    pub exp: i64,
}

/// The parts of a WebSocket handshake that may carry a credential.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    /// Handshake authentication field (`?token=` on the upgrade request).
    pub auth: Option<String>,
    pub headers: HeaderMap,
}

impl ConnectionRequest {
    pub fn new(auth: Option<String>, headers: HeaderMap) -> Self {
        Self { auth, headers }
    }
}

#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    ttl_secs: i64,
    generated_secret: bool,
}

impl TokenService {
    pub fn new(secret: &[u8], algorithm: Algorithm, ttl_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            algorithm,
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
            generated_secret: false,
        }
    }

    /// Uses the configured secret, or a random per-process one when none is set.
    pub fn from_config(config: &AuthConfig) -> Self {
        match config.jwt_secret.as_deref() {
            Some(secret) => Self::new(
                secret.as_bytes(),
                config.algorithm.jwt(),
                config.jwt_ttl_secs,
            ),
            None => {
                let secret: String = rand::rng()
                    .sample_iter(&Alphanumeric)
                    .take(GENERATED_SECRET_LEN)
                    .map(char::from)
                    .collect();
                let mut service =
                    Self::new(secret.as_bytes(), config.algorithm.jwt(), config.jwt_ttl_secs);
                service.generated_secret = true;
                service
            }
        }
    }

    pub fn uses_generated_secret(&self) -> bool {
        self.generated_secret
    }

    pub fn issue(&self, identity: &Identity) -> Result<String, TokenError> {
        let iat = Utc::now().timestamp();
        let claims = Claims {
            sub: identity.login.clone(),
            user: identity.clone(),
            iat,
            exp: iat.saturating_add(self.ttl_secs),
        };
        let token = jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &self.encoding_key)?;
        Ok(token)
    }

    /// Reads the embedded identity without checking the signature.
    /// Only call this after [`TokenService::verify`] accepted the same credential.
    pub fn decode(&self, credential: &str) -> Result<Identity, TokenError> {
        let mut validation = Validation::new(self.algorithm);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        jsonwebtoken::decode::<Claims>(credential, &DecodingKey::from_secret(&[]), &validation)
            .map(|data| data.claims.user)
            .map_err(|_| TokenError::MalformedCredential)
    }

    pub fn extract_from_connection_request(
        &self,
        request: &ConnectionRequest,
    ) -> Result<String, TokenError> {
        let from_auth = request.auth.as_deref().and_then(normalize_bearer);
        let from_header = || {
            request
                .headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(normalize_bearer)
        };

        from_auth
            .or_else(from_header)
            .ok_or(TokenError::MissingCredential)
    }

    pub fn verify(&self, credential: &str) -> Result<bool, TokenError> {
        let mut validation = Validation::new(self.algorithm);
        validation.algorithms = vec![self.algorithm];
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        jsonwebtoken::decode::<Claims>(credential, &self.decoding_key, &validation)
            .map(|_| true)
            .map_err(|err| {
                tracing::debug!(error = %err, "credential verification failed");
                TokenError::InvalidCredential
            })
    }
}

fn normalize_bearer(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let token = trimmed.strip_prefix(BEARER_PREFIX).unwrap_or(trimmed).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
