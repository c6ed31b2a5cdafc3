//! Password login that exchanges configured credentials for a relay token.

use std::{collections::HashMap, sync::Arc};

use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use meteorelay_core::Identity;
use pwhash::rand_core::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{config::UserEntry, token::TokenService, AppState};

const MAX_LOGIN_LEN: usize = 20;
const MAX_PASSWORD_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("stored password hash for '{login}' is unusable: {reason}")]
    CorruptHash { login: String, reason: String },
    #[error("hashing password failed: {0}")]
    Hashing(String),
}

#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub login: String,
    pub password: String,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn authenticate(&self, attempt: &LoginAttempt) -> Result<Identity, LoginError>;
}

#[derive(Default)]
pub struct InMemoryUserDirectory {
    accounts: HashMap<String, UserEntry>,
}

impl InMemoryUserDirectory {
    pub fn from_entries(entries: &[UserEntry]) -> Self {
        let accounts = entries
            .iter()
            .map(|entry| (entry.login.clone(), entry.clone()))
            .collect();
        Self { accounts }
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn authenticate(&self, attempt: &LoginAttempt) -> Result<Identity, LoginError> {
        let Some(entry) = self.accounts.get(&attempt.login) else {
            return Err(LoginError::InvalidCredentials);
        };

        let parsed = PasswordHash::new(&entry.password_hash).map_err(|err| LoginError::CorruptHash {
            login: entry.login.clone(),
            reason: err.to_string(),
        })?;
        Argon2::default()
            .verify_password(attempt.password.as_bytes(), &parsed)
            .map_err(|_| LoginError::InvalidCredentials)?;

        Ok(Identity::new(entry.login.clone(), entry.role))
    }
}

/// Produces the PHC string stored in `auth.users[].password_hash`.
pub fn hash_password(password: &str) -> Result<String, LoginError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| LoginError::Hashing(err.to_string()))
}

pub struct LoginService {
    directory: Arc<dyn UserDirectory>,
    tokens: Arc<TokenService>,
}

impl LoginService {
    pub fn new(directory: Arc<dyn UserDirectory>, tokens: Arc<TokenService>) -> Self {
        Self { directory, tokens }
    }

    pub async fn login(&self, attempt: LoginAttempt) -> anyhow::Result<Option<LoginResponse>> {
        let identity = match self.directory.authenticate(&attempt).await {
            Ok(identity) => identity,
            Err(LoginError::InvalidCredentials) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let access_token = self.tokens.issue(&identity)?;
        info!(login = %identity.login, role = %identity.role, "issued access token");
        Ok(Some(LoginResponse { access_token }))
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
}

impl LoginRequest {
    fn validate(self) -> Result<LoginAttempt, Vec<FieldError>> {
        let mut errors = Vec::new();
        let login = self.login.trim().to_string();
        if login.is_empty() {
            errors.push(FieldError::new("login", "must be provided"));
        } else if login.chars().count() > MAX_LOGIN_LEN {
            errors.push(FieldError::new("login", "must be at most 20 characters"));
        }

        if self.password.is_empty() {
            errors.push(FieldError::new("password", "must be provided"));
        } else if self.password.chars().count() > MAX_PASSWORD_LEN {
            errors.push(FieldError::new("password", "must be at most 64 characters"));
        }

        if errors.is_empty() {
            Ok(LoginAttempt {
                login,
                password: self.password,
            })
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
}

impl ErrorBody {
    fn validation(details: Vec<FieldError>) -> Self {
        Self {
            error: "validation_error",
            details: Some(details),
        }
    }

    fn unauthorized() -> Self {
        Self {
            error: "invalid_credentials",
            details: None,
        }
    }

    fn server_error() -> Self {
        Self {
            error: "server_error",
            details: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: &'static str,
    message: &'static str,
}

impl FieldError {
    const fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}

pub async fn login(State(state): State<AppState>, Json(payload): Json<LoginRequest>) -> Response {
    let attempt = match payload.validate() {
        Ok(attempt) => attempt,
        Err(errors) => {
            let status = StatusCode::BAD_REQUEST;
            state.record_http_request("auth.login", status.as_u16());
            return (status, Json(ErrorBody::validation(errors))).into_response();
        }
    };

    let login = attempt.login.clone();
    match state.login_service().login(attempt).await {
        Ok(Some(response)) => {
            let status = StatusCode::OK;
            state.record_http_request("auth.login", status.as_u16());
            (status, Json(response)).into_response()
        }
        Ok(None) => {
            let status = StatusCode::UNAUTHORIZED;
            state.record_http_request("auth.login", status.as_u16());
            warn!(%login, "rejected login attempt");
            (status, Json(ErrorBody::unauthorized())).into_response()
        }
        Err(err) => {
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            state.record_http_request("auth.login", status.as_u16());
            error!(?err, "failed to complete login attempt");
            (status, Json(ErrorBody::server_error())).into_response()
        }
    }
}
