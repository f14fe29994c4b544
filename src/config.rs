/// Configuration management for the Polaris ID engine
use crate::storage::StoreConfig;
use serde::{Deserialize, Serialize};
use std::env;

/// Current client library version, reported to the resolution server
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default completion budget for a resolution call, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Engine-level configuration, shared by every resolution call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the identity-resolution server
    pub endpoint: String,
    /// Timeout applied when a partner config does not supply one (ms)
    pub default_timeout_ms: u64,
    /// User-Agent header for HTTP requests
    pub user_agent: String,
    /// Persistence backends
    pub storage: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://sync.polaris-id.net/engine".to_string(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            user_agent: format!("Polaris-ID/{}", CLIENT_VERSION),
            storage: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: env::var("POLARIS_ENDPOINT").unwrap_or(defaults.endpoint),
            default_timeout_ms: env::var("POLARIS_TIMEOUT_MS")
                .unwrap_or_else(|_| DEFAULT_TIMEOUT_MS.to_string())
                .parse()
                .unwrap_or(DEFAULT_TIMEOUT_MS),
            user_agent: env::var("POLARIS_USER_AGENT").unwrap_or(defaults.user_agent),
            storage: StoreConfig::from_env(),
        }
    }
}

/// Per-call partner configuration
///
/// `partner_id` is the only required field; its absence is a configuration
/// error reported through the callback, never an Err to the caller.
#[derive(Debug, Clone, Default)]
pub struct PartnerConfig {
    /// Numeric partner identifier assigned by the resolution service
    pub partner_id: Option<i64>,
    /// Overrides the engine's default completion budget (ms)
    pub timeout_ms: Option<u64>,
    /// Ordered backend preference list ("durable", "cookie"); unrecognized
    /// entries are dropped, an empty result defaults to durable only
    pub enabled_backends: Vec<String>,
    /// Substrings matched against `user_agent`; a hit short-circuits
    /// resolution with the blacklisted marker
    pub browser_blacklist: Vec<String>,
    /// Browser user agent of the current visitor, as detected by the host
    pub user_agent: Option<String>,
    /// Prior-known server id hint, used until the server assigns one
    pub prior_id: Option<String>,
    /// Type tag accompanying `prior_id`
    pub prior_id_type: Option<i64>,
    /// Extension parameters appended verbatim to the sync request
    pub extra_params: Vec<(String, String)>,
}

impl PartnerConfig {
    /// Convenience constructor for the common single-field case
    pub fn new(partner_id: i64) -> Self {
        Self {
            partner_id: Some(partner_id),
            ..Self::default()
        }
    }

    /// Validate the partner id; `Err` means resolution must short-circuit
    pub(crate) fn valid_partner_id(&self) -> Result<i64, String> {
        match self.partner_id {
            Some(id) if id > 0 => Ok(id),
            Some(id) => Err(format!("partner id must be positive, got {}", id)),
            None => Err("partner id is missing".to_string()),
        }
    }

    /// True when the configured blacklist matches the visitor's user agent
    pub(crate) fn browser_blacklisted(&self) -> bool {
        let Some(ua) = self.user_agent.as_deref() else {
            return false;
        };
        self.browser_blacklist
            .iter()
            .any(|needle| !needle.is_empty() && ua.contains(needle.as_str()))
    }
}
