use async_trait::async_trait;

use super::{AuthError, AuthRequest, Authenticator, Principal};

/// `auth.method = "none"`: every caller is `anonymous`. Meant for a
/// dashboard bound to localhost or behind a proxy that already
/// authenticates.
#[derive(Debug, Default)]
pub struct NoneAuthenticator;

impl NoneAuthenticator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Authenticator for NoneAuthenticator {
    async fn authenticate(&self, _request: &AuthRequest) -> Result<Principal, AuthError> {
        Ok(Principal::anonymous())
    }

    fn method_name(&self) -> &'static str {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ignores_presented_credentials() {
        let auth = NoneAuthenticator::new();
        let request = AuthRequest {
            headers: [("authorization".to_string(), "Bearer whatever".to_string())]
                .into_iter()
                .collect(),
            source_ip: "192.168.1.20".parse().unwrap(),
        };

        let principal = auth.authenticate(&request).await.unwrap();

        assert_eq!(principal, Principal::anonymous());
    }
}
