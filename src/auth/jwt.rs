//! Bearer-token validation.
//!
//! Token issuance and refresh live in the external auth service; the engine
//! only verifies signatures and expiry.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Expiry, seconds since epoch.
    pub exp: usize,
}

pub fn validate_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn issue(sub: &str, exp: usize, secret: &str) -> String {
        encode(
            &Header::default(),
            &Claims { sub: sub.to_string(), exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let exp = (chrono::Utc::now().timestamp() + 3600) as usize;
        let token = issue("user-1", exp, "secret");
        let claims = validate_token(&token, "secret").unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let exp = (chrono::Utc::now().timestamp() + 3600) as usize;
        let token = issue("user-1", exp, "secret");
        assert!(validate_token(&token, "other").is_err());
    }

    #[test]
    fn test_expired_rejected() {
        let exp = (chrono::Utc::now().timestamp() - 3600) as usize;
        let token = issue("user-1", exp, "secret");
        assert!(validate_token(&token, "secret").is_err());
    }
}
