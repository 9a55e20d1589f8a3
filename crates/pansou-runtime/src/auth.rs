//! JWT issuance and validation (HS256).

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token issuer baked into every claim.
const ISSUER: &str = "pansou";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("username cannot be empty")]
    EmptyUsername,

    #[error("secret cannot be empty")]
    EmptySecret,

    #[error("token cannot be empty")]
    EmptyToken,

    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// The JWT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub username: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
}

/// Signs a token for `username`, valid for `expiry`.
pub fn generate_token(
    username: &str,
    secret: &str,
    expiry: std::time::Duration,
) -> Result<String, AuthError> {
    if username.is_empty() {
        return Err(AuthError::EmptyUsername);
    }
    if secret.is_empty() {
        return Err(AuthError::EmptySecret);
    }

    let now = Utc::now();
    let claims = Claims {
        username: username.to_string(),
        iat: now.timestamp(),
        exp: (now + chrono::Duration::from_std(expiry).unwrap_or(chrono::Duration::hours(24)))
            .timestamp(),
        iss: ISSUER.to_string(),
    };

    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Verifies signature, expiry and issuer; returns the claims.
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    if token.is_empty() {
        return Err(AuthError::EmptyToken);
    }
    if secret.is_empty() {
        return Err(AuthError::EmptySecret);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[ISSUER]);

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn round_trip() {
        let token = generate_token("admin", "secret", Duration::from_secs(3600)).unwrap();
        let claims = validate_token(&token, "secret").unwrap();
        assert_eq!(claims.username, "admin");
        assert_eq!(claims.iss, "pansou");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = generate_token("admin", "secret", Duration::from_secs(3600)).unwrap();
        assert!(matches!(
            validate_token(&token, "other"),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn empty_inputs_are_rejected() {
        assert!(matches!(
            generate_token("", "secret", Duration::from_secs(1)),
            Err(AuthError::EmptyUsername)
        ));
        assert!(matches!(
            generate_token("u", "", Duration::from_secs(1)),
            Err(AuthError::EmptySecret)
        ));
        assert!(matches!(
            validate_token("", "secret"),
            Err(AuthError::EmptyToken)
        ));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let token = generate_token("admin", "secret", Duration::from_secs(3600)).unwrap();
        let tampered = format!("{token}x");
        assert!(validate_token(&tampered, "secret").is_err());
    }
}
