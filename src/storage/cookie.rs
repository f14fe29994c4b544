/// Cookie jar backend
///
/// A file-backed cookie jar. Every write sets a 365-day expiry and a lax
/// same-site policy; expired cookies are pruned on load and never visible to
/// reads.
use crate::error::EngineResult;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

/// Cookie lifetime applied to every write
const COOKIE_TTL_DAYS: i64 = 365;

/// One cookie at rest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub value: String,
    pub expires: DateTime<Utc>,
    pub same_site: String,
}

/// File-backed cookie jar
#[derive(Clone)]
pub struct CookieBackend {
    path: PathBuf,
}

impl CookieBackend {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the jar, dropping expired cookies; a missing or corrupt jar file
    /// reads as an empty jar
    async fn load(&self) -> BTreeMap<String, Cookie> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return BTreeMap::new(),
        };
        let mut jar: BTreeMap<String, Cookie> = match serde_json::from_str(&raw) {
            Ok(jar) => jar,
            Err(e) => {
                warn!("Cookie jar {} is corrupt, resetting: {}", self.path.display(), e);
                return BTreeMap::new();
            }
        };
        let now = Utc::now();
        jar.retain(|_, cookie| cookie.expires > now);
        jar
    }

    async fn save(&self, jar: &BTreeMap<String, Cookie>) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string(jar)?;
        tokio::fs::write(&self.path, raw).await?;
        Ok(())
    }

    /// Get an unexpired cookie value by name
    pub async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        Ok(self.load().await.get(key).map(|c| c.value.clone()))
    }

    /// Set a cookie with the standard 365-day expiry and SameSite=Lax
    pub async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        let mut jar = self.load().await;
        jar.insert(
            key.to_string(),
            Cookie {
                value: value.to_string(),
                expires: Utc::now() + Duration::days(COOKIE_TTL_DAYS),
                same_site: "Lax".to_string(),
            },
        );
        self.save(&jar).await
    }

    /// Delete a cookie by name
    pub async fn remove(&self, key: &str) -> EngineResult<()> {
        let mut jar = self.load().await;
        if jar.remove(key).is_some() {
            self.save(&jar).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_jar() -> (CookieBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (CookieBackend::new(dir.path().join("jar.json")), dir)
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let (jar, _dir) = create_test_jar();

        assert_eq!(jar.get("sid").await.unwrap(), None);

        jar.set("sid", "abc").await.unwrap();
        assert_eq!(jar.get("sid").await.unwrap(), Some("abc".to_string()));

        jar.remove("sid").await.unwrap();
        assert_eq!(jar.get("sid").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_cookie_is_invisible() {
        let (jar, _dir) = create_test_jar();

        jar.set("sid", "abc").await.unwrap();

        // Rewrite the jar with an expiry in the past
        let mut map = jar.load().await;
        map.get_mut("sid").unwrap().expires = Utc::now() - Duration::days(1);
        jar.save(&map).await.unwrap();

        assert_eq!(jar.get("sid").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cookie_attributes() {
        let (jar, _dir) = create_test_jar();

        jar.set("sid", "abc").await.unwrap();
        let map = jar.load().await;
        let cookie = map.get("sid").unwrap();

        assert_eq!(cookie.same_site, "Lax");
        assert!(cookie.expires > Utc::now() + Duration::days(364));
    }

    #[tokio::test]
    async fn test_corrupt_jar_reads_as_empty() {
        let (jar, dir) = create_test_jar();

        tokio::fs::write(dir.path().join("jar.json"), "{not json")
            .await
            .unwrap();

        assert_eq!(jar.get("sid").await.unwrap(), None);
    }
}
