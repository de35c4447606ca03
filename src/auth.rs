//! Access tokens.
//!
//! Tokens are HMAC-SHA256-signed compact bearer strings (HS256 JWTs) minted
//! against the secret persisted in the server config. There is a single
//! subject; possession of a valid unexpired token grants full access.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config::Config;

/// Subject claim carried by every access token.
pub const TOKEN_SUBJECT: &str = "ccr-client";

/// Token lifetime: 24 hours.
pub const TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to sign token: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),
}

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Mint a fresh 32-byte signing secret, hex-encoded.
#[must_use]
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Sign a new access token against the config's secret.
pub fn create_access_token(config: &Config) -> Result<String, AuthError> {
    let now = now_secs();
    let claims = Claims {
        sub: TOKEN_SUBJECT.to_string(),
        iat: now,
        exp: now + TOKEN_TTL_SECS,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(AuthError::Sign)
}

/// Verify signature, subject, and expiry. Returns the claims when the token
/// is valid, `None` otherwise.
#[must_use]
pub fn verify_access_token(token: &str, config: &Config) -> Option<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.sub = Some(TOKEN_SUBJECT.to_string());

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::generate()
    }

    #[test]
    fn test_mint_and_verify() {
        let config = test_config();
        let token = create_access_token(&config).unwrap();
        let claims = verify_access_token(&token, &config).expect("token should verify");
        assert_eq!(claims.sub, TOKEN_SUBJECT);
        assert!(claims.exp > claims.iat);
        assert_eq!(claims.exp - claims.iat, TOKEN_TTL_SECS);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let config = test_config();
        let token = create_access_token(&config).unwrap();

        let other = test_config();
        assert!(verify_access_token(&token, &other).is_none());
    }

    #[test]
    fn test_garbage_rejected() {
        let config = test_config();
        assert!(verify_access_token("not-a-token", &config).is_none());
        assert!(verify_access_token("", &config).is_none());
        assert!(verify_access_token("a.b.c", &config).is_none());
    }

    #[test]
    fn test_expired_rejected() {
        let config = test_config();
        let past = now_secs() - 120;
        let claims = Claims {
            sub: TOKEN_SUBJECT.to_string(),
            iat: past - TOKEN_TTL_SECS,
            exp: past,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .unwrap();
        assert!(verify_access_token(&token, &config).is_none());
    }

    #[test]
    fn test_wrong_subject_rejected() {
        let config = test_config();
        let now = now_secs();
        let claims = Claims {
            sub: "someone-else".to_string(),
            iat: now,
            exp: now + 600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .unwrap();
        assert!(verify_access_token(&token, &config).is_none());
    }

    #[test]
    fn test_generate_secret_shape() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, generate_secret());
    }
}
