//! Shared-key authentication for the dashboard API.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{AuthError, AuthRequest, Authenticator, Principal};

/// Validates requests against the configured key.
///
/// The key is read from `Authorization: Bearer <key>` or `X-API-Key`.
/// Audit records name the caller by a short fingerprint of the key, never
/// the key itself.
pub struct ApiKeyAuthenticator {
    expected_key: String,
    fingerprint: String,
}

impl ApiKeyAuthenticator {
    pub fn new(api_key: String) -> Self {
        let fingerprint = key_fingerprint(&api_key);
        Self {
            expected_key: api_key,
            fingerprint,
        }
    }

    fn extract_key<'a>(&self, request: &'a AuthRequest) -> Option<&'a str> {
        request
            .bearer_token()
            .or_else(|| request.header("x-api-key"))
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> Result<Principal, AuthError> {
        let provided = self
            .extract_key(request)
            .ok_or(AuthError::NotAuthenticated)?;

        if constant_time_eq(provided.as_bytes(), self.expected_key.as_bytes()) {
            Ok(Principal {
                user_id: format!("api_key:{}", self.fingerprint),
                method: "api_key",
            })
        } else {
            Err(AuthError::InvalidCredentials("Invalid API key".to_string()))
        }
    }

    fn method_name(&self) -> &'static str {
        "api_key"
    }
}

/// First 8 hex digits of the key's SHA-256.
fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn make_request(headers: Vec<(&str, &str)>) -> AuthRequest {
        AuthRequest {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v.to_string()))
                .collect(),
            source_ip: "127.0.0.1".parse::<IpAddr>().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_bearer_token_valid() {
        let auth = ApiKeyAuthenticator::new("secret-key-123".to_string());
        let request = make_request(vec![("Authorization", "Bearer secret-key-123")]);

        let principal = auth.authenticate(&request).await.unwrap();

        assert!(principal.user_id.starts_with("api_key:"));
        assert_eq!(principal.user_id.len(), "api_key:".len() + 8);
        assert_eq!(principal.method, "api_key");
        assert!(!principal.user_id.contains("secret"));
    }

    #[tokio::test]
    async fn test_x_api_key_header_valid() {
        let auth = ApiKeyAuthenticator::new("secret-key-123".to_string());
        let bearer = auth
            .authenticate(&make_request(vec![("Authorization", "bearer secret-key-123")]))
            .await
            .unwrap();
        let header = auth
            .authenticate(&make_request(vec![("X-API-Key", "secret-key-123")]))
            .await
            .unwrap();

        assert_eq!(bearer.user_id, header.user_id);
    }

    #[tokio::test]
    async fn test_invalid_key() {
        let auth = ApiKeyAuthenticator::new("secret-key-123".to_string());
        let request = make_request(vec![("Authorization", "Bearer wrong-key")]);

        let result = auth.authenticate(&request).await;

        assert!(matches!(result, Err(AuthError::InvalidCredentials(_))));
    }

    #[tokio::test]
    async fn test_missing_header() {
        let auth = ApiKeyAuthenticator::new("secret-key-123".to_string());
        let result = auth.authenticate(&make_request(vec![])).await;
        assert!(matches!(result, Err(AuthError::NotAuthenticated)));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(key_fingerprint("abc"), key_fingerprint("abc"));
        assert_ne!(key_fingerprint("abc"), key_fingerprint("abd"));
        // sha256("abc") = ba7816bf...
        assert_eq!(key_fingerprint("abc"), "ba7816bf");
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
        assert!(constant_time_eq(b"", b""));
    }
}
