//! JWT credential verification.

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use roster_core::{AuthError, Authenticator, Claims, Identity, Principal, PrincipalKind};
use serde::{Deserialize, Serialize};

/// Claims carried by a roster access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Principal id.
    pub sub: String,
    #[serde(default = "default_kind")]
    pub kind: PrincipalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Authentication session id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub exp: u64,
}

fn default_kind() -> PrincipalKind {
    PrincipalKind::User
}

/// Verifies HS256 bearer tokens.
#[derive(Clone)]
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator")
            .field("validation", &self.validation)
            .finish()
    }
}

impl JwtAuthenticator {
    #[must_use]
    pub fn new(secret: &str, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = leeway_secs;

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn verify(&self, credential: &str) -> Result<Principal, AuthError> {
        let data = decode::<TokenClaims>(credential, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidToken => AuthError::Invalid("malformed token".into()),
                ErrorKind::InvalidSignature => AuthError::Invalid("bad signature".into()),
                _ => AuthError::Invalid(e.to_string()),
            })?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject".into()));
        }

        Ok(Principal {
            identity: Identity::new(claims.kind, claims.sub),
            claims: Claims {
                role: claims.role,
                session_id: claims.sid,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret";

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn token(claims: &TokenClaims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(sub: &str, kind: PrincipalKind, exp: u64) -> TokenClaims {
        TokenClaims {
            sub: sub.to_string(),
            kind,
            role: Some("vip".to_string()),
            sid: Some("s-1".to_string()),
            exp,
        }
    }

    #[tokio::test]
    async fn test_valid_token() {
        let auth = JwtAuthenticator::new(SECRET, 0);
        let jwt = token(&claims("42", PrincipalKind::Performer, now() + 60), SECRET);

        let principal = auth.verify(&jwt).await.unwrap();
        assert_eq!(principal.identity, Identity::performer("42"));
        assert_eq!(principal.claims.role.as_deref(), Some("vip"));
        assert_eq!(principal.claims.session_id.as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn test_kind_defaults_to_user() {
        let auth = JwtAuthenticator::new(SECRET, 0);
        let jwt = encode(
            &Header::default(),
            &serde_json::json!({ "sub": "7", "exp": now() + 60 }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let principal = auth.verify(&jwt).await.unwrap();
        assert_eq!(principal.identity, Identity::user("7"));
        assert_eq!(principal.claims, Claims::default());
    }

    #[tokio::test]
    async fn test_expired_token() {
        let auth = JwtAuthenticator::new(SECRET, 0);
        let jwt = token(&claims("42", PrincipalKind::User, now() - 120), SECRET);
        assert!(matches!(auth.verify(&jwt).await, Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn test_wrong_secret_and_garbage() {
        let auth = JwtAuthenticator::new(SECRET, 0);
        let jwt = token(&claims("42", PrincipalKind::User, now() + 60), "other");
        assert!(matches!(auth.verify(&jwt).await, Err(AuthError::Invalid(_))));
        assert!(matches!(
            auth.verify("not-a-jwt").await,
            Err(AuthError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_subject_rejected() {
        let auth = JwtAuthenticator::new(SECRET, 0);
        let jwt = token(&claims("", PrincipalKind::User, now() + 60), SECRET);
        assert!(matches!(auth.verify(&jwt).await, Err(AuthError::Invalid(_))));
    }
}
