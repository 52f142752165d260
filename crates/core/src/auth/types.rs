use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;

/// What the dashboard API hands an authenticator. Header names are
/// lowercased by the caller.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub headers: HashMap<String, String>,
    pub source_ip: IpAddr,
}

impl AuthRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Token from `Authorization: Bearer <token>`, scheme matched
    /// case-insensitively.
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.header("authorization")?;
        let (scheme, token) = value.split_once(' ')?;
        scheme
            .eq_ignore_ascii_case("bearer")
            .then(|| token.trim())
            .filter(|token| !token.is_empty())
    }
}

/// Actor recorded on manual overrides (job submission, cancellation,
/// identity provision/retire, scheduler toggles).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub user_id: String,
    pub method: &'static str,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            method: "none",
        }
    }
}
