//! Bearer-token verification for gateway admission.
//!
//! Tokens are issued by the external auth service and verified here without
//! a network round trip.
//!
//! # Token format
//!
//! 1. Encode claims: Base64(JSON({"sub": user_id, "exp": unix_seconds?}))
//! 2. Calculate HMAC-SHA256 digest over the encoded part
//! 3. Format: `${encoded}--${digest_hex}`

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::model::UserId;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// The authenticated user id.
    pub sub: UserId,
    /// Optional expiry as unix seconds. Absent means non-expiring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Token verifier using HMAC-SHA256
pub struct TokenVerifier {
    key: Vec<u8>,
}

impl TokenVerifier {
    /// Create a new verifier with the given secret key
    pub fn new(key: &str) -> Self {
        Self {
            key: key.as_bytes().to_vec(),
        }
    }

    /// Verify a bearer token and return the authenticated user id
    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let parts: Vec<&str> = token.split("--").collect();
        if parts.len() != 2 {
            return Err(AuthError::InvalidFormat);
        }

        let encoded = parts[0];
        let signature = parts[1];

        if !self.verify_signature(encoded.as_bytes(), signature)? {
            return Err(AuthError::InvalidSignature);
        }

        let json_bytes = base64_decode(encoded)?;
        let claims: TokenClaims = serde_json::from_slice(&json_bytes)?;

        if let Some(exp) = claims.exp
            && exp <= Utc::now().timestamp()
        {
            return Err(AuthError::Expired);
        }

        Ok(claims.sub)
    }

    /// Verify the HMAC signature
    fn verify_signature(&self, data: &[u8], signature: &str) -> Result<bool, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| AuthError::InvalidKey)?;
        mac.update(data);
        let expected = mac.finalize().into_bytes();
        let expected_hex = hex::encode(expected);

        // Constant-time comparison
        Ok(expected_hex.as_bytes().ct_eq(signature.as_bytes()).into())
    }

    /// Generate a signed token (for testing and local tooling)
    pub fn sign(&self, claims: &TokenClaims) -> Result<String, AuthError> {
        let json = serde_json::to_string(claims)?;
        let encoded = base64_encode(json.as_bytes());

        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| AuthError::InvalidKey)?;
        mac.update(encoded.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{}--{}", encoded, signature))
    }
}

/// Errors during token verification
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token format")]
    InvalidFormat,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid key")]
    InvalidKey,
    #[error("token expired")]
    Expired,
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Standard base64 encode
fn base64_encode(data: &[u8]) -> String {
    use base64::{Engine, engine::general_purpose::STANDARD};
    STANDARD.encode(data)
}

/// Standard base64 decode
fn base64_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::{Engine, engine::general_purpose::STANDARD};
    STANDARD.decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(sub: &str, exp: Option<i64>) -> TokenClaims {
        TokenClaims {
            sub: sub.to_string(),
            exp,
        }
    }

    #[test]
    fn test_token_roundtrip() {
        let verifier = TokenVerifier::new("test-secret");
        let token = verifier.sign(&claims("user_42", None)).unwrap();
        let user_id = verifier.verify(&token).unwrap();
        assert_eq!(user_id, "user_42");
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = TokenVerifier::new("test-secret");
        let past = Utc::now().timestamp() - 60;
        let token = verifier.sign(&claims("user_42", Some(past))).unwrap();
        assert!(matches!(verifier.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn test_future_expiry_accepted() {
        let verifier = TokenVerifier::new("test-secret");
        let future = Utc::now().timestamp() + 3600;
        let token = verifier.sign(&claims("user_42", Some(future))).unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), "user_42");
    }

    #[test]
    fn test_invalid_signature() {
        let verifier = TokenVerifier::new("test-secret");
        let token = verifier.sign(&claims("user_42", None)).unwrap();
        let encoded = token.split("--").next().unwrap();
        let forged = format!("{}--{}", encoded, "00".repeat(32));
        assert!(matches!(
            verifier.verify(&forged),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = TokenVerifier::new("secret-a");
        let verifier = TokenVerifier::new("secret-b");
        let token = signer.sign(&claims("user_42", None)).unwrap();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn test_invalid_format() {
        let verifier = TokenVerifier::new("test-secret");
        assert!(matches!(
            verifier.verify("no-separator"),
            Err(AuthError::InvalidFormat)
        ));
        assert!(matches!(
            verifier.verify("too--many--parts"),
            Err(AuthError::InvalidFormat)
        ));
    }
}
