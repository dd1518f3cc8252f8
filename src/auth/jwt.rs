#![forbid(unsafe_code)]

// Bearer tokens for the upgrade request. Keys are derived once from the
// configured secret and shared by every handshake.

use crate::auth::types::{AuthError, Claims, Principal};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TOKEN_LIFETIME: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    /// Signs a token for the principal, valid for twelve hours.
    pub fn issue(&self, principal: &Principal) -> Result<String, AuthError> {
        self.issue_for(principal, TOKEN_LIFETIME)
    }

    pub fn issue_for(&self, principal: &Principal, lifetime: Duration) -> Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| AuthError::Signing("system clock before epoch".to_string()))?;

        self.sign(&Claims {
            sub: principal.email.clone(),
            name: principal.display_name.clone(),
            exp: (now + lifetime).as_secs() as usize,
        })
    }

    fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::default(), claims, &self.encoding).map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Checks signature and expiry and turns the claims into the connection's
    /// principal.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken,
        })?;

        Principal::from_claims(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-at-least-32-bytes-long!!";

    fn now() -> usize {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as usize
    }

    #[test]
    fn test_issue_and_verify() {
        let keys = TokenKeys::new(SECRET);
        let token = keys.issue(&Principal::new("ada@example.com", "Ada")).unwrap();
        assert_eq!(keys.verify(&token).unwrap(), Principal::new("ada@example.com", "Ada"));
    }

    #[test]
    fn test_other_secret_rejects() {
        let token = TokenKeys::new("secret-1").issue(&Principal::new("ada@example.com", "Ada")).unwrap();
        assert!(matches!(TokenKeys::new("secret-2").verify(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_expired_token() {
        let keys = TokenKeys::new(SECRET);
        let token = keys
            .sign(&Claims { sub: "ada@example.com".into(), name: "Ada".into(), exp: now() - 3600 })
            .unwrap();
        assert!(matches!(keys.verify(&token), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn test_subject_is_normalized_and_name_falls_back() {
        let keys = TokenKeys::new(SECRET);
        let token = keys
            .sign(&Claims { sub: "  Grace@Example.COM ".into(), name: "   ".into(), exp: now() + 60 })
            .unwrap();
        assert_eq!(keys.verify(&token).unwrap(), Principal::new("grace@example.com", "grace"));
    }

    #[test]
    fn test_missing_name_claim_is_accepted() {
        let keys = TokenKeys::new(SECRET);
        let claims = serde_json::json!({"sub": "lin@example.com", "exp": now() + 60});
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();
        assert_eq!(keys.verify(&token).unwrap().display_name, "lin");
    }

    #[test]
    fn test_empty_subject_rejects() {
        let keys = TokenKeys::new(SECRET);
        let token = keys.issue(&Principal::new(" ", "Nobody")).unwrap();
        assert!(matches!(keys.verify(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_garbage_token_rejects() {
        assert!(matches!(TokenKeys::new(SECRET).verify("not.a.jwt"), Err(AuthError::InvalidToken)));
    }
}
