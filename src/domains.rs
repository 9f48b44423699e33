//! Allow-listed upstream domains and auth-type detection.
//!
//! Every outbound request targets a domain present in the allow-list. Each
//! entry may pin the vendor dialect; otherwise the dialect is inferred from
//! the request path.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire dialect spoken by an upstream vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Google,
}

/// Per-domain allow-list entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<AuthType>,
    #[serde(default = "default_https")]
    pub https: bool,
}

fn default_https() -> bool {
    true
}

impl Default for DomainRule {
    fn default() -> Self {
        Self {
            auth_type: None,
            https: true,
        }
    }
}

/// The minimal default allow-list: Google Gemini and OpenAI, both HTTPS.
pub fn default_allowed_domains() -> HashMap<String, DomainRule> {
    let mut map = HashMap::new();
    map.insert(
        "generativelanguage.googleapis.com".to_string(),
        DomainRule {
            auth_type: Some(AuthType::Google),
            https: true,
        },
    );
    map.insert(
        "api.openai.com".to_string(),
        DomainRule {
            auth_type: Some(AuthType::OpenAi),
            https: true,
        },
    );
    map
}

/// Infer the vendor dialect from the request path when the allow-list entry
/// does not pin one.
pub fn detect_auth_type(path: &str) -> AuthType {
    let gemini_call = path.contains(":generateContent") || path.contains(":streamGenerateContent");
    if path.contains("/v1beta/models/") && gemini_call {
        AuthType::Google
    } else if path.contains("/anthropic/") || path.contains("/v1/messages") {
        AuthType::Anthropic
    } else {
        // chat/completions, embeddings, rerank and everything else speak OpenAI
        AuthType::OpenAi
    }
}

impl DomainRule {
    pub fn resolve_auth_type(&self, path: &str) -> AuthType {
        self.auth_type.unwrap_or_else(|| detect_auth_type(path))
    }

    /// Build the upstream URL for a proxied path (path includes the leading
    /// slash; query is appended by the caller when present).
    pub fn target_url(&self, domain: &str, path_and_query: &str) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{scheme}://{domain}{path_and_query}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allow_list() {
        let domains = default_allowed_domains();
        assert!(domains.contains_key("api.openai.com"));
        assert!(domains.contains_key("generativelanguage.googleapis.com"));
        assert!(domains.values().all(|r| r.https));
    }

    #[test]
    fn test_auth_type_inference() {
        assert_eq!(
            detect_auth_type("/v1beta/models/gemini-2.0-flash:generateContent"),
            AuthType::Google
        );
        assert_eq!(
            detect_auth_type("/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"),
            AuthType::Google
        );
        assert_eq!(detect_auth_type("/v1/messages"), AuthType::Anthropic);
        assert_eq!(detect_auth_type("/anthropic/v1/complete"), AuthType::Anthropic);
        assert_eq!(detect_auth_type("/v1/chat/completions"), AuthType::OpenAi);
        assert_eq!(detect_auth_type("/v1/embeddings"), AuthType::OpenAi);
        assert_eq!(detect_auth_type("/v1/rerank"), AuthType::OpenAi);
    }

    #[test]
    fn test_fixed_auth_type_wins_over_path() {
        let rule = DomainRule {
            auth_type: Some(AuthType::Anthropic),
            https: true,
        };
        assert_eq!(rule.resolve_auth_type("/v1/chat/completions"), AuthType::Anthropic);
    }

    #[test]
    fn test_target_url_scheme() {
        let https = DomainRule::default();
        assert_eq!(
            https.target_url("api.openai.com", "/v1/embeddings"),
            "https://api.openai.com/v1/embeddings"
        );

        let http = DomainRule {
            auth_type: None,
            https: false,
        };
        assert_eq!(
            http.target_url("10.0.0.7:9081", "/v1/chat/completions"),
            "http://10.0.0.7:9081/v1/chat/completions"
        );
    }
}
