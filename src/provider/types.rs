//! Typed provider payloads
//!
//! External payloads are narrowed into these records at the boundary;
//! malformed bodies surface as parse errors rather than leaking through.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Provider-side view of a runner
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRunner {
    pub id: i64,
    pub name: String,
    pub status: ProviderRunnerStatus,
    pub busy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRunnerStatus {
    Online,
    Offline,
}

/// One page of the provider's runner listing
#[derive(Debug, Deserialize)]
pub(crate) struct RunnerPage {
    pub total_count: u64,
    pub runners: Vec<ProviderRunner>,
}

/// One-shot registration credential
///
/// Treated as a secret: never serialized back out, never logged. The
/// `Debug` impl redacts the token so tracing a value cannot leak it.
#[derive(Clone, Deserialize)]
pub struct RegistrationToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl RegistrationToken {
    /// The raw token, for injection into a container environment only
    pub fn secret(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    #[cfg(test)]
    pub fn for_tests(token: &str) -> Self {
        Self {
            token: token.to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }
}

impl std::fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_deserialization() {
        let body = r#"{
            "total_count": 2,
            "runners": [
                {"id": 1, "name": "runner-1-aa", "status": "online", "busy": false},
                {"id": 2, "name": "runner-2-bb", "status": "offline", "busy": true}
            ]
        }"#;

        let page: RunnerPage = serde_json::from_str(body).unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.runners[0].status, ProviderRunnerStatus::Online);
        assert!(page.runners[1].busy);
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let body = r#"{"total_count": "three", "runners": []}"#;
        assert!(serde_json::from_str::<RunnerPage>(body).is_err());
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = RegistrationToken::for_tests("AABBCC-very-secret");
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains("AABBCC"));
        assert!(rendered.contains("<redacted>"));
    }
}
