//! HS256 bearer tokens for live connections.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;

/// Claims carried by a connection token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id.
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Issued-at, epoch seconds.
    #[serde(default)]
    pub iat: i64,
    /// Expiry, epoch seconds.
    pub exp: i64,
}

/// The principal a token is issued to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

impl From<&Claims> for Identity {
    fn from(claims: &Claims) -> Self {
        Self {
            user_id: claims.sub.clone(),
            email: claims.email.clone(),
        }
    }
}

/// Reasons a token is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    Missing,

    #[error("token expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl AuthError {
    /// Close-frame reason sent to a rejected live client.
    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::Missing => "Missing token",
            Self::Expired => "Token expired",
            Self::Invalid(_) | Self::Signing(_) => "Invalid token",
        }
    }
}

/// Issues and validates connection tokens with a shared secret.
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: i64,
}

impl TokenAuthority {
    pub fn new(secret: &[u8], ttl_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
        }
    }

    /// Builds an authority from configuration. Without a configured secret
    /// a random one is generated for the life of the process.
    pub fn from_config(config: &AuthConfig) -> Self {
        match config.jwt_secret.as_deref() {
            Some(secret) if !secret.is_empty() => Self::new(secret.as_bytes(), config.token_ttl_secs),
            _ => {
                tracing::warn!(
                    "auth.jwt_secret is not set; using an ephemeral secret, tokens will not survive a restart"
                );
                let secret: [u8; 32] = rand::random();
                Self::new(&secret, config.token_ttl_secs)
            }
        }
    }

    /// Issues a token for `identity` valid for the configured lifetime.
    pub fn issue(&self, identity: &Identity) -> Result<(String, Claims), AuthError> {
        let now = chrono::Utc::now().timestamp();
        self.issue_with_expiry(identity, now.saturating_add(self.ttl_secs))
    }

    /// Issues a token expiring at `exp` (epoch seconds).
    pub fn issue_with_expiry(
        &self,
        identity: &Identity,
        exp: i64,
    ) -> Result<(String, Claims), AuthError> {
        let claims = Claims {
            sub: identity.user_id.clone(),
            email: identity.email.clone(),
            iat: chrono::Utc::now().timestamp(),
            exp,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        Ok((token, claims))
    }

    /// Validates a presented token. An absent or blank token is `Missing`.
    pub fn validate(&self, token: Option<&str>) -> Result<Claims, AuthError> {
        let token = match token.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(AuthError::Missing),
        };

        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject".to_string()));
        }
        Ok(data.claims)
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }
}
