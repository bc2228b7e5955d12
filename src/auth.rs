//! Password hashing and signed access tokens.
//!
//! Tokens have the shape `base64url(claims).base64url(hmac_sha256(claims_part))`
//! where claims are `{"sub": user_id, "iat": issued_at, "exp": expires_at}`.

use argon2::Argon2;
use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng,
};
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

use crate::api::AppState;
use crate::errors::{ApiError, ApiResult};

type HmacSha256 = Hmac<Sha256>;

/// Upper bound on `TOKEN_TTL_DAYS`.
pub const MAX_TOKEN_TTL_DAYS: i64 = 3650;

// Well-formed Argon2id hash with the default parameters. No password matches it.
const UNMATCHABLE_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$c29tZXNhbHR2YWx1ZQ$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

/// Hash a plaintext password into an Argon2id PHC string.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

/// Check a plaintext password against a stored PHC string.
/// Unparseable hashes never verify.
pub fn verify_password(password: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Login check. A missing account still pays for one Argon2 verification.
pub fn verify_credentials(password: &str, stored: Option<&str>) -> bool {
    match stored {
        Some(phc) => verify_password(password, phc),
        None => {
            verify_password(password, UNMATCHABLE_HASH);
            false
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: i64,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and verifies HMAC-signed access tokens.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Arc<Vec<u8>>,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, ttl_days: i64) -> anyhow::Result<Self> {
        if !(1..=MAX_TOKEN_TTL_DAYS).contains(&ttl_days) {
            anyhow::bail!(
                "token lifetime must be between 1 and {} days, got {}",
                MAX_TOKEN_TTL_DAYS,
                ttl_days
            );
        }
        let ttl = Duration::try_days(ttl_days)
            .ok_or_else(|| anyhow::anyhow!("token lifetime of {} days is out of range", ttl_days))?;

        Ok(Self {
            secret: Arc::new(secret.as_bytes().to_vec()),
            ttl,
        })
    }

    pub fn issue(&self, user_id: i64) -> ApiResult<String> {
        self.issue_at(user_id, Utc::now())
    }

    pub fn issue_at(&self, user_id: i64, issued_at: DateTime<Utc>) -> ApiResult<String> {
        let expires_at = issued_at.checked_add_signed(self.ttl).ok_or_else(|| {
            ApiError::DatabaseError(anyhow::anyhow!("token expiry is out of range"))
        })?;
        let claims = Claims {
            sub: user_id,
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };
        let payload = serde_json::to_vec(&claims)
            .map_err(|e| ApiError::DatabaseError(anyhow::anyhow!("failed to encode claims: {}", e)))?;
        let claims_part = URL_SAFE_NO_PAD.encode(payload);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(&claims_part)?.finalize().into_bytes());
        Ok(format!("{}.{}", claims_part, signature))
    }

    pub fn verify(&self, token: &str) -> ApiResult<Claims> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> ApiResult<Claims> {
        let invalid = || ApiError::Unauthorized("Invalid access token".to_string());

        let (claims_part, signature_part) = token.split_once('.').ok_or_else(invalid)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_part)
            .map_err(|_| invalid())?;

        // verify_slice compares in constant time
        self.mac(claims_part)?
            .verify_slice(&signature)
            .map_err(|_| invalid())?;

        let payload = URL_SAFE_NO_PAD.decode(claims_part).map_err(|_| invalid())?;
        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| invalid())?;

        if claims.exp <= now.timestamp() {
            return Err(ApiError::Unauthorized("Access token expired".to_string()));
        }
        Ok(claims)
    }

    fn mac(&self, claims_part: &str) -> ApiResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ApiError::DatabaseError(anyhow::anyhow!("invalid signing key: {}", e)))?;
        mac.update(claims_part.as_bytes());
        Ok(mac)
    }
}

/// Extractor for requests carrying a valid `Authorization: Bearer` token.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: i64,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("Authentication required".to_string()))?;

        let claims = state.tokens.verify(token)?;
        Ok(AuthUser {
            user_id: claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_round_trip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not-a-phc-string"));
    }

    #[test]
    fn test_unknown_user_never_verifies() {
        assert!(PasswordHash::new(UNMATCHABLE_HASH).is_ok());
        assert!(!verify_credentials("anything", None));
        assert!(!verify_credentials("", None));

        let hash = hash_password("correct horse").unwrap();
        assert!(verify_credentials("correct horse", Some(&hash)));
        assert!(!verify_credentials("wrong horse", Some(&hash)));
    }

    #[test]
    fn test_salts_differ() {
        assert_ne!(hash_password("same").unwrap(), hash_password("same").unwrap());
    }

    #[test]
    fn test_token_round_trip() {
        let signer = TokenSigner::new("secret", 15).unwrap();
        let token = signer.issue(42).unwrap();
        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.sub, 42);
        assert_eq!(claims.exp - claims.iat, 15 * 24 * 60 * 60);
    }

    #[test]
    fn test_token_lifetime_is_bounded() {
        assert!(TokenSigner::new("secret", 0).is_err());
        assert!(TokenSigner::new("secret", -3).is_err());
        assert!(TokenSigner::new("secret", MAX_TOKEN_TTL_DAYS + 1).is_err());
        assert!(TokenSigner::new("secret", i64::MAX).is_err());

        let signer = TokenSigner::new("secret", MAX_TOKEN_TTL_DAYS).unwrap();
        let token = signer.issue(3).unwrap();
        assert_eq!(signer.verify(&token).unwrap().sub, 3);

        // Expiry past chrono's range is an error, not a panic
        assert!(signer.issue_at(3, DateTime::<Utc>::MAX_UTC).is_err());
    }

    #[test]
    fn test_tampered_token_is_rejected() {
        let signer = TokenSigner::new("secret", 15).unwrap();
        let token = signer.issue(1).unwrap();
        let (_, signature) = token.split_once('.').unwrap();

        let forged_claims = URL_SAFE_NO_PAD.encode(br#"{"sub":2,"iat":0,"exp":99999999999}"#);
        let forged = format!("{}.{}", forged_claims, signature);
        assert!(matches!(signer.verify(&forged), Err(ApiError::Unauthorized(_))));

        let other_key = TokenSigner::new("other", 15).unwrap();
        assert!(other_key.verify(&token).is_err());
        assert!(signer.verify("garbage").is_err());
        assert!(signer.verify("a.b").is_err());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let signer = TokenSigner::new("secret", 15).unwrap();
        let issued = Utc::now() - Duration::days(16);
        let token = signer.issue_at(7, issued).unwrap();
        assert!(matches!(signer.verify(&token), Err(ApiError::Unauthorized(_))));
        assert!(signer.verify_at(&token, issued + Duration::days(14)).is_ok());
    }
}
