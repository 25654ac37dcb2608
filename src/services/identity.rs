use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::models::Identity;

/// Issues the identity every engine call runs under
///
/// Credential verification belongs to the provider; the engine trusts
/// whatever identity it returns.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Identity, CoreError>;
}

/// Claims carried by session tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Expiry (seconds since epoch)
    pub exp: usize,
    /// Device the token was issued to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Validates HS256 session tokens minted by the identity backend
pub struct JwtIdentityProvider {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
    issuer: Option<String>,
}

impl JwtIdentityProvider {
    pub fn new(secret: &str, issuer: Option<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer,
        }
    }

    /// Mint a token for `user_id`, valid for `ttl_secs` (development and tests)
    pub fn issue(&self, user_id: &str, replica: Option<&str>, ttl_secs: i64) -> Result<String, CoreError> {
        let exp = (chrono::Utc::now().timestamp() + ttl_secs).max(0) as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            exp,
            replica: replica.map(str::to_string),
            iss: self.issuer.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CoreError::Unauthenticated(format!("cannot sign token: {}", e)))
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn authenticate(&self, token: &str) -> Result<Identity, CoreError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| CoreError::Unauthenticated(e.to_string()))?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(CoreError::Unauthenticated("token has an empty subject".to_string()));
        }
        let replica = claims.replica.unwrap_or_else(|| claims.sub.clone());
        Ok(Identity::with_replica(&claims.sub, &replica))
    }
}
