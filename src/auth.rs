//! Bearer token issuance and verification
//!
//! Tokens are compact HS256 JWTs signed with the shared secret. A fresh
//! token is minted for every connection attempt.

use crate::config::ConnectionConfig;
use crate::error::{ConnectError, Result};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// JWT claim set presented to the platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
    /// Unique per token so two tokens minted in the same second differ
    pub jti: String,
}

/// A signed auth token and its decoded claims
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    pub subject: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub issuer: String,
    pub audience: String,
    /// Base64url HMAC signature (third token segment)
    pub signature: String,
    /// Compact encoded token (`header.claims.signature`)
    pub token: String,
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("subject", &self.subject)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

impl AuthToken {
    /// Whether the token has passed its expiry
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Mint a new signed token from the connection config
pub fn generate_auth_token(config: &ConnectionConfig) -> Result<AuthToken> {
    if config.secret.is_empty() {
        return Err(ConnectError::Authentication(
            "cannot sign token: shared secret is empty".to_string(),
        ));
    }
    if config.token_ttl_secs == 0 {
        return Err(ConnectError::Configuration(
            "token TTL must be positive".to_string(),
        ));
    }

    let issued_at = Utc::now().timestamp();
    let expires_at = issued_at + config.token_ttl_secs as i64;

    let claims = TokenClaims {
        sub: config.subject.clone(),
        iat: issued_at,
        exp: expires_at,
        iss: config.issuer.clone(),
        aud: config.audience.clone(),
        jti: uuid::Uuid::new_v4().to_string(),
    };

    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )
    .map_err(|e| ConnectError::Authentication(format!("failed to sign token: {}", e)))?;

    let signature = token.rsplit('.').next().unwrap_or_default().to_string();

    Ok(AuthToken {
        subject: claims.sub,
        issued_at: timestamp(issued_at),
        expires_at: timestamp(expires_at),
        issuer: claims.iss,
        audience: claims.aud,
        signature,
        token,
    })
}

/// Verify a compact token's signature, issuer, audience, and expiry
pub fn verify_token(token: &str, config: &ConnectionConfig) -> Result<TokenClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[config.issuer.as_str()]);
    validation.set_audience(&[config.audience.as_str()]);
    validation.leeway = 0;

    jsonwebtoken::decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(config.secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| ConnectError::Authentication(format!("token rejected: {}", e)))
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
