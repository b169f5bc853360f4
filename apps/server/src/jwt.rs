use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use hubex_shared::ids::UserId;

use crate::config::JwtConfig;

/// Access tokens are HS256 with a process secret and a fixed issuer.
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    ttl: std::time::Duration,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub iss: String,
    pub iat: usize,
    pub exp: usize,
    pub jti: String,
    #[serde(default)]
    pub caps: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthTokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
}

impl AuthTokenError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthTokenError::Expired => "EXPIRED",
            AuthTokenError::Invalid => "INVALID",
        }
    }
}

fn now_epoch() -> usize {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_secs() as usize
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            ttl: std::time::Duration::from_secs(config.exp_minutes * 60),
        }
    }

    pub fn issue_access_token(
        &self,
        user_id: &UserId,
        caps: &[&str],
    ) -> Result<String, hubex_shared::error::ApiError> {
        let now = now_epoch();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            iss: self.issuer.clone(),
            iat: now,
            exp: now + self.ttl.as_secs() as usize,
            jti: uuid::Uuid::new_v4().to_string(),
            caps: caps.iter().map(|c| c.to_string()).collect(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| hubex_shared::error::ApiError::internal(format!("JWT encode error: {e}")))
    }

    pub fn validate_access_token(&self, token: &str) -> Result<AccessClaims, AuthTokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        let data = jsonwebtoken::decode::<AccessClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthTokenError::Expired,
                _ => AuthTokenError::Invalid,
            })?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_jwt_config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret".to_string(),
            issuer: "hubex-test".to_string(),
            exp_minutes: 60,
        }
    }

    fn test_jwt_service() -> JwtService {
        JwtService::new(&test_jwt_config())
    }

    #[test]
    fn issued_token_has_expected_claims() {
        let svc = test_jwt_service();
        let uid = UserId::new();
        let token = svc
            .issue_access_token(&uid, &["vars.read", "vars.write"])
            .unwrap();
        let claims = svc.validate_access_token(&token).unwrap();
        assert_eq!(claims.sub, uid.to_string());
        assert_eq!(claims.iss, "hubex-test");
        assert_eq!(claims.caps, vec!["vars.read", "vars.write"]);
        assert!(!claims.jti.is_empty());
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn validate_rejects_wrong_secret() {
        let svc = test_jwt_service();
        let other = JwtService::new(&JwtConfig {
            secret: "other-secret".to_string(),
            ..test_jwt_config()
        });
        let token = other
            .issue_access_token(&UserId::new(), &[])
            .unwrap();
        assert!(matches!(
            svc.validate_access_token(&token),
            Err(AuthTokenError::Invalid)
        ));
    }

    #[test]
    fn validate_rejects_wrong_issuer() {
        let svc = test_jwt_service();
        let other = JwtService::new(&JwtConfig {
            issuer: "someone-else".to_string(),
            ..test_jwt_config()
        });
        let token = other.issue_access_token(&UserId::new(), &[]).unwrap();
        assert!(svc.validate_access_token(&token).is_err());
    }

    #[test]
    fn validate_distinguishes_expired_from_invalid() {
        let svc = test_jwt_service();
        let claims = AccessClaims {
            sub: UserId::new().to_string(),
            iss: "hubex-test".to_string(),
            iat: 900,
            exp: 1000, // epoch + 1000s, long in the past
            jti: uuid::Uuid::new_v4().to_string(),
            caps: vec![],
        };
        let token =
            jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &svc.encoding_key)
                .unwrap();
        assert!(matches!(
            svc.validate_access_token(&token),
            Err(AuthTokenError::Expired)
        ));
        assert!(matches!(
            svc.validate_access_token("garbage"),
            Err(AuthTokenError::Invalid)
        ));
    }

    #[test]
    fn caps_claim_defaults_to_empty_when_absent() {
        // A token minted elsewhere without a caps claim still validates.
        let svc = test_jwt_service();
        let now = now_epoch();
        let claims = serde_json::json!({
            "sub": UserId::new().to_string(),
            "iss": "hubex-test",
            "iat": now,
            "exp": now + 600,
            "jti": "external",
        });
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &svc.encoding_key,
        )
        .unwrap();
        let decoded = svc.validate_access_token(&token).unwrap();
        assert!(decoded.caps.is_empty());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(AuthTokenError::Expired.code(), "EXPIRED");
        assert_eq!(AuthTokenError::Invalid.code(), "INVALID");
    }
}
