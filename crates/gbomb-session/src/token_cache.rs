//! Credential persistence.
//!
//! A [`TokenCache`] stores [`TokenGrant`]s under string keys. Sessions read
//! it at construction, write it when a login succeeds, and clear it on close.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::{Result, SessionError};
use crate::types::TokenGrant;

/// Default token file name within the gbomb config directory.
pub const TOKEN_FILE: &str = "gbomb-tokens.json";

/// Default key for the app's primary grant.
pub const DEFAULT_TOKEN_KEY: &str = "GBAccessTokenInformationKey";

// ============================================================================
// TokenCache Trait
// ============================================================================

/// Key-value persistence for credential material.
#[async_trait]
pub trait TokenCache: Send + Sync + std::fmt::Debug {
    /// Read the grant stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<TokenGrant>>;

    /// Store `grant` under `key`, replacing any previous grant.
    async fn set(&self, key: &str, grant: &TokenGrant) -> Result<()>;

    /// Remove the grant stored under `key`.
    async fn clear(&self, key: &str) -> Result<()>;
}

/// Shared token cache for use across async contexts.
pub type SharedTokenCache = Arc<dyn TokenCache>;

// ============================================================================
// FileTokenCache
// ============================================================================

/// JSON-file token cache holding every key in one map.
///
/// Writes are serialized through a mutex so concurrent `set`/`clear` calls
/// never lose each other's updates.
#[derive(Debug)]
pub struct FileTokenCache {
    token_path: PathBuf,
    write_lock: Mutex<()>,
    cached: RwLock<Option<HashMap<String, TokenGrant>>>,
}

impl FileTokenCache {
    /// Create a cache storing its file inside `data_dir`.
    pub fn new(data_dir: &Path) -> Self {
        Self::with_path(data_dir.join(TOKEN_FILE))
    }

    /// Create with a custom token path.
    pub fn with_path(token_path: PathBuf) -> Self {
        Self {
            token_path,
            write_lock: Mutex::new(()),
            cached: RwLock::new(None),
        }
    }

    /// Get the token file path.
    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    async fn load_all(&self) -> Result<HashMap<String, TokenGrant>> {
        {
            let cache = self.cached.read().await;
            if let Some(map) = cache.as_ref() {
                return Ok(map.clone());
            }
        }

        let map = if self.token_path.exists() {
            let content = tokio::fs::read_to_string(&self.token_path)
                .await
                .map_err(|e| SessionError::TokenCache(format!("Failed to read token file: {}", e)))?;
            serde_json::from_str(&content).map_err(|e| {
                SessionError::TokenCache(format!("Failed to parse token file: {}", e))
            })?
        } else {
            HashMap::new()
        };

        *self.cached.write().await = Some(map.clone());
        Ok(map)
    }

    async fn store_all(&self, map: HashMap<String, TokenGrant>) -> Result<()> {
        if let Some(parent) = self.token_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SessionError::TokenCache(format!("Failed to create token directory: {}", e))
            })?;
        }

        let json = serde_json::to_string_pretty(&map).map_err(|e| {
            SessionError::TokenCache(format!("Failed to serialize tokens: {}", e))
        })?;

        tokio::fs::write(&self.token_path, json)
            .await
            .map_err(|e| SessionError::TokenCache(format!("Failed to write token file: {}", e)))?;

        *self.cached.write().await = Some(map);
        Ok(())
    }
}

#[async_trait]
impl TokenCache for FileTokenCache {
    async fn get(&self, key: &str) -> Result<Option<TokenGrant>> {
        Ok(self.load_all().await?.remove(key))
    }

    async fn set(&self, key: &str, grant: &TokenGrant) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load_all().await?;
        map.insert(key.to_string(), grant.clone());
        self.store_all(map).await?;
        tracing::debug!(key, path = %self.token_path.display(), "Token grant cached");
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load_all().await?;
        if map.remove(key).is_some() {
            self.store_all(map).await?;
            tracing::debug!(key, "Token grant cleared");
        }
        Ok(())
    }
}

// ============================================================================
// InMemoryTokenCache
// ============================================================================

/// In-memory token cache for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct InMemoryTokenCache {
    grants: RwLock<HashMap<String, TokenGrant>>,
    writes: std::sync::atomic::AtomicU32,
}

impl InMemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache with a grant under `key`.
    pub fn with_grant(key: &str, grant: TokenGrant) -> Self {
        let mut grants = HashMap::new();
        grants.insert(key.to_string(), grant);
        Self {
            grants: RwLock::new(grants),
            writes: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Number of `set`/`clear` calls that changed the cache.
    pub fn write_count(&self) -> u32 {
        self.writes.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenCache for InMemoryTokenCache {
    async fn get(&self, key: &str) -> Result<Option<TokenGrant>> {
        Ok(self.grants.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, grant: &TokenGrant) -> Result<()> {
        self.grants
            .write()
            .await
            .insert(key.to_string(), grant.clone());
        self.writes
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        if self.grants.write().await.remove(key).is_some() {
            self.writes
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Create a shared file-based token cache.
pub fn create_token_cache(data_dir: &Path) -> SharedTokenCache {
    Arc::new(FileTokenCache::new(data_dir))
}

/// Create a shared in-memory token cache.
pub fn create_memory_token_cache() -> SharedTokenCache {
    Arc::new(InMemoryTokenCache::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LoginType;
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    fn grant(token: &str) -> TokenGrant {
        TokenGrant::new(
            token,
            Some(Utc::now() + Duration::hours(2)),
            ["email", "public_profile"],
            LoginType::WebView,
        )
    }

    #[tokio::test]
    async fn test_file_set_and_get_is_exact() {
        let temp = tempdir().unwrap();
        let cache = FileTokenCache::new(temp.path());
        let original = grant("file-token");

        cache.set(DEFAULT_TOKEN_KEY, &original).await.unwrap();
        assert!(cache.token_path().exists());

        let loaded = cache.get(DEFAULT_TOKEN_KEY).await.unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_file_survives_new_instance() {
        let temp = tempdir().unwrap();
        let original = grant("persisted");
        FileTokenCache::new(temp.path())
            .set("k", &original)
            .await
            .unwrap();

        let reopened = FileTokenCache::new(temp.path());
        assert_eq!(reopened.get("k").await.unwrap(), Some(original));
    }

    #[tokio::test]
    async fn test_file_clear_only_removes_key() {
        let temp = tempdir().unwrap();
        let cache = FileTokenCache::new(temp.path());
        cache.set("a", &grant("a")).await.unwrap();
        cache.set("b", &grant("b")).await.unwrap();

        cache.clear("a").await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
        assert_eq!(cache.get("b").await.unwrap().unwrap().access_token, "b");
    }

    #[tokio::test]
    async fn test_file_concurrent_writes_are_not_lost() {
        let temp = tempdir().unwrap();
        let cache = Arc::new(FileTokenCache::new(temp.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.set(&format!("key-{i}"), &grant(&format!("t{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let reopened = FileTokenCache::new(temp.path());
        for i in 0..8 {
            assert!(reopened.get(&format!("key-{i}")).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_inmemory_cache() {
        let cache = InMemoryTokenCache::new();
        assert!(cache.get("k").await.unwrap().is_none());

        let original = grant("mem");
        cache.set("k", &original).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(original));

        cache.clear("k").await.unwrap();
        cache.clear("k").await.unwrap();
        assert_eq!(cache.write_count(), 2);
    }
}
