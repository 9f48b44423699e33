use crate::domains::{default_allowed_domains, DomainRule};
use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration, loaded from an optional JSON file.
///
/// Every key has a working default, so running with no config file yields a
/// proxy that forwards to the built-in allow-list with stock limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: HashMap<String, DomainRule>,
    /// Upstream domain used by the fixed OpenAI-style entry points.
    /// Must be a key of `allowed_domains`.
    #[serde(default = "default_upstream")]
    pub default_upstream: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub probe_request: ProbeRequestConfig,
    #[serde(default)]
    pub probe_filter: ProbeFilterConfig,
}

fn default_upstream() -> String {
    "generativelanguage.googleapis.com".to_string()
}

fn default_database_path() -> String {
    "interactions.db".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config object deserializes")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub enforce_host: bool,
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default = "default_enforce_json")]
    pub enforce_json: bool,
    /// Maximum request body size in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,
    /// Token-bucket refill rate per IP, tokens per second.
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// Token-bucket capacity per IP.
    #[serde(default = "default_burst")]
    pub burst: f64,
    /// Regex block-list applied to request paths.
    #[serde(default = "default_suspicious_patterns")]
    pub suspicious_patterns: Vec<String>,
}

fn default_allowed_methods() -> Vec<String> {
    vec!["GET".to_string(), "POST".to_string(), "OPTIONS".to_string()]
}

fn default_enforce_json() -> bool {
    true
}

fn default_max_body_size() -> u64 {
    1024 * 1024
}

fn default_rate() -> f64 {
    5.0
}

fn default_burst() -> f64 {
    20.0
}

fn default_suspicious_patterns() -> Vec<String> {
    vec![
        r"\.env".to_string(),
        r"\.git".to_string(),
        r"wp-admin".to_string(),
        r"wp-login".to_string(),
        r"phpmyadmin".to_string(),
        r"(?i)/admin(/|$)".to_string(),
        r"(?i)/login(/|$)".to_string(),
        r"cgi-bin".to_string(),
    ]
}

impl Default for SecurityConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config object deserializes")
    }
}

/// Request-shape probe rejection (silent 404s).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequestConfig {
    #[serde(default = "default_probe_paths")]
    pub path_blocklist: Vec<String>,
    #[serde(default = "default_probe_path_prefixes")]
    pub path_prefix_blocklist: Vec<String>,
    #[serde(default = "default_probe_user_agents")]
    pub user_agent_substrings: Vec<String>,
    #[serde(default = "default_probe_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub ip_blocklist: Vec<String>,
}

fn default_probe_paths() -> Vec<String> {
    vec!["/".to_string(), "/favicon.ico".to_string()]
}

fn default_probe_path_prefixes() -> Vec<String> {
    vec!["/.well-known/".to_string(), "/locales/".to_string()]
}

fn default_probe_user_agents() -> Vec<String> {
    vec!["CensysInspect".to_string(), "Go-http-client".to_string()]
}

fn default_probe_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
        .iter()
        .map(|m| (*m).to_string())
        .collect()
}

impl Default for ProbeRequestConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config object deserializes")
    }
}

/// Log-line suppression for scanner noise (applied inside the logger).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeFilterConfig {
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub ip_patterns: Vec<String>,
    #[serde(default)]
    pub custom_patterns: Vec<String>,
    #[serde(default)]
    pub custom_ip_patterns: Vec<String>,
    #[serde(default)]
    pub disable_default_patterns: bool,
    #[serde(default)]
    pub disable_default_ip_patterns: bool,
}

impl ProxyConfig {
    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ProxyError::config(format!("Invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, or fall back to built-in defaults.
    pub fn load_or_default(explicit_path: Option<&Path>) -> Result<Self> {
        match explicit_path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.allowed_domains.contains_key(&self.default_upstream) {
            return Err(ProxyError::config(format!(
                "default_upstream '{}' is not in allowed_domains",
                self.default_upstream
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::AuthType;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.default_upstream, "generativelanguage.googleapis.com");
        assert_eq!(config.security.rate, 5.0);
        assert_eq!(config.security.burst, 20.0);
        assert_eq!(config.security.max_body_size, 1024 * 1024);
        assert!(config.security.enforce_json);
        assert!(!config.security.enforce_host);
        assert_eq!(
            config.security.allowed_methods,
            vec!["GET", "POST", "OPTIONS"]
        );
    }

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{
                "allowed_domains": {{
                    "api.deepseek.com": {{"auth_type": "openai", "https": true}},
                    "10.0.0.7:9081": {{"auth_type": "openai", "https": false}},
                    "generativelanguage.googleapis.com": {{"auth_type": "google", "https": true}}
                }},
                "security": {{"rate": 2.5, "burst": 10}}
            }}"#
        )
        .unwrap();

        let config = ProxyConfig::load(f.path()).unwrap();
        assert_eq!(config.allowed_domains.len(), 3);
        let internal = &config.allowed_domains["10.0.0.7:9081"];
        assert!(!internal.https);
        assert_eq!(internal.auth_type, Some(AuthType::OpenAi));
        assert_eq!(config.security.rate, 2.5);
        assert_eq!(config.security.burst, 10.0);
        // Unspecified sections fall back to defaults
        assert!(config.security.enforce_json);
        assert_eq!(config.database_path, "interactions.db");
    }

    #[test]
    fn test_default_upstream_must_be_allow_listed() {
        let mut f = NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{
                "allowed_domains": {{"api.openai.com": {{"auth_type": "openai", "https": true}}}},
                "default_upstream": "example.com"
            }}"#
        )
        .unwrap();

        assert!(ProxyConfig::load(f.path()).is_err());
    }
}
