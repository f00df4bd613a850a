//! HS256 bearer token validation

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
#[cfg(test)]
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::middleware::AuthError;

pub const ADMIN_ROLE: &str = "admin";

/// Claims carried by user tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Claims {
    /// `user_id` wins over `sub`; either must be a UUID
    pub fn user_uuid(&self) -> Option<Uuid> {
        self.user_id
            .as_deref()
            .or(self.sub.as_deref())
            .and_then(|id| Uuid::parse_str(id).ok())
    }

    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
    }
}

#[derive(Clone)]
pub struct JwtManager {
    #[cfg(test)]
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        // Tokens come from an external issuer with its own audience
        validation.validate_aud = false;

        Self {
            #[cfg(test)]
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "JWT validation failed");
                AuthError::InvalidToken
            })
    }

    /// Sign a token for `user_id` valid for `ttl_secs`. Production tokens
    /// come from the external issuer.
    #[cfg(test)]
    pub fn issue(&self, user_id: Uuid, role: Option<&str>, ttl_secs: i64) -> Result<String, AuthError> {
        let claims = Claims {
            user_id: Some(user_id.to_string()),
            sub: None,
            exp: time::OffsetDateTime::now_utc().unix_timestamp() + ttl_secs,
            role: role.map(String::from),
            email: None,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }
}
