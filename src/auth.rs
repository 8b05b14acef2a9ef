//! Bearer-token identity verification

use axum::http::{header, HeaderMap};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::types::Identity;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Authentication is not configured on this server")]
    Disabled,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// Turns an opaque bearer token into an identity
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HS256 secret (None = auth disabled, every token is rejected)
    pub jwt_secret: Option<String>,
}

impl AuthConfig {
    /// Load auth config from environment variables
    pub fn from_env() -> Self {
        let jwt_secret = std::env::var("JWT_SECRET")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        if jwt_secret.is_some() {
            tracing::info!("Token authentication enabled");
        } else {
            tracing::warn!("JWT_SECRET not set - all connections will stay anonymous");
        }

        Self { jwt_secret }
    }

    pub fn build_verifier(&self) -> JwtVerifier {
        JwtVerifier::new(self.jwt_secret.as_deref())
    }
}

/// HS256 JSON Web Token verifier
pub struct JwtVerifier {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            key: secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let key = self.key.as_ref().ok_or(AuthError::Disabled)?;
        jsonwebtoken::decode::<Identity>(token, key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

/// Sign an identity with an HS256 secret (used by tooling and tests)
pub fn issue_token(secret: &str, identity: &Identity) -> Result<String, AuthError> {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        identity,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::InvalidToken(e.to_string()))
}

/// Extract a bearer token from the `Authorization` header
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}
