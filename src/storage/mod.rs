/// Dual-Backend Store
///
/// Uniform get/set/remove over two interchangeable persistence backends: a
/// durable per-origin key-value table (SQLite) and a cookie jar. The backend
/// set is selected per call by a caller-supplied allow-list. Persistence is
/// best-effort: every backend error is caught and logged, never propagated,
/// and absent state reads as "first visit".

pub mod cookie;
pub mod durable;

pub use cookie::CookieBackend;
pub use durable::DurableBackend;

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Persistence backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Durable per-origin key-value store
    Durable,
    /// Cookie jar (365-day expiry, SameSite=Lax)
    Cookie,
}

impl Backend {
    /// Parse a caller-supplied backend name; unrecognized names yield `None`
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "durable" => Some(Backend::Durable),
            "cookie" => Some(Backend::Cookie),
            _ => None,
        }
    }

    /// Map an allow-list of names to backends: unrecognized entries are
    /// dropped and an empty result defaults to durable only
    pub fn parse_list(names: &[String]) -> Vec<Backend> {
        let mut out: Vec<Backend> = Vec::new();
        for name in names {
            match Backend::parse(name) {
                Some(b) if !out.contains(&b) => out.push(b),
                Some(_) => {}
                None => debug!("Dropping unrecognized storage backend {:?}", name),
            }
        }
        if out.is_empty() {
            out.push(Backend::Durable);
        }
        out
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database URL for the durable backend
    pub durable_url: String,
    /// Path of the cookie jar file
    pub cookie_jar: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            durable_url: "sqlite://./data/polaris.db?mode=rwc".to_string(),
            cookie_jar: PathBuf::from("./data/polaris_cookies.json"),
        }
    }
}

impl StoreConfig {
    /// Load from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            durable_url: env::var("POLARIS_DURABLE_URL").unwrap_or(defaults.durable_url),
            cookie_jar: env::var("POLARIS_COOKIE_JAR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cookie_jar),
        }
    }
}

/// The dual-backend store
///
/// Writes are write-through: when both backends are permitted, the value goes
/// to both so that either alone is sufficient to recover state. Reads prefer
/// the durable backend when permitted.
#[derive(Clone)]
pub struct DualStore {
    durable: DurableBackend,
    cookie: CookieBackend,
}

impl DualStore {
    /// Open both backends from configuration
    pub async fn open(config: &StoreConfig) -> crate::error::EngineResult<Self> {
        Ok(Self {
            durable: DurableBackend::open(&config.durable_url).await?,
            cookie: CookieBackend::new(config.cookie_jar.clone()),
        })
    }

    /// Build a store from already-opened backends (tests)
    pub fn from_parts(durable: DurableBackend, cookie: CookieBackend) -> Self {
        Self { durable, cookie }
    }

    /// Read a value, trying the durable backend first when permitted
    pub async fn read(&self, key: &str, allowed: &[Backend]) -> Option<String> {
        if allowed.contains(&Backend::Durable) {
            match self.durable.get(key).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => warn!("Durable read failed for {}: {}", key, e),
            }
        }
        if allowed.contains(&Backend::Cookie) {
            match self.cookie.get(key).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => warn!("Cookie read failed for {}: {}", key, e),
            }
        }
        None
    }

    /// Write a value to every permitted backend
    pub async fn write(&self, key: &str, value: &str, allowed: &[Backend]) {
        if allowed.contains(&Backend::Durable) {
            if let Err(e) = self.durable.set(key, value).await {
                warn!("Durable write failed for {}: {}", key, e);
            }
        }
        if allowed.contains(&Backend::Cookie) {
            if let Err(e) = self.cookie.set(key, value).await {
                warn!("Cookie write failed for {}: {}", key, e);
            }
        }
    }

    /// Remove a key from every permitted backend
    pub async fn remove(&self, key: &str, allowed: &[Backend]) {
        if allowed.contains(&Backend::Durable) {
            if let Err(e) = self.durable.remove(key).await {
                warn!("Durable remove failed for {}: {}", key, e);
            }
        }
        if allowed.contains(&Backend::Cookie) {
            if let Err(e) = self.cookie.remove(key).await {
                warn!("Cookie remove failed for {}: {}", key, e);
            }
        }
    }
}
