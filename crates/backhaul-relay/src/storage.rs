//! Token and route lookups consumed by the authenticator

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unknown token")]
    UnknownToken,

    #[error("no route for domain {0}")]
    UnknownRoute(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The subset of a persistence layer the relay needs
///
/// Both lookups are side-effect free from the relay's point of view; any
/// error fails the handshake.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Owner and scopes of a token
    async fn has_token(&self, token: &str) -> Result<(String, Vec<String>), StorageError>;

    /// Owner of a domain route
    async fn has_route(&self, domain: &str) -> Result<String, StorageError>;
}

#[derive(Debug, Clone)]
struct TokenRecord {
    user: String,
    scopes: Vec<String>,
}

/// In-memory [`Storage`]
///
/// Domains are matched case-insensitively.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tokens: RwLock<HashMap<String, TokenRecord>>,
    routes: RwLock<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct StorageFile {
    #[serde(default)]
    tokens: Vec<TokenEntry>,
    #[serde(default)]
    routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenEntry {
    token: String,
    user: String,
    #[serde(default)]
    scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RouteEntry {
    domain: String,
    user: String,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load tokens and routes from a JSON document:
    ///
    /// ```json
    /// {
    ///   "tokens": [{"token": "…", "user": "alice", "scopes": ["connect"]}],
    ///   "routes": [{"domain": "alice.example.com", "user": "alice"}]
    /// }
    /// ```
    pub fn from_json(json: &str) -> Result<Self, StorageError> {
        let file: StorageFile = serde_json::from_str(json)
            .map_err(|e| StorageError::Backend(format!("invalid storage file: {}", e)))?;

        let storage = Self::new();
        for entry in file.tokens {
            storage.add_token(entry.token, entry.user, entry.scopes);
        }
        for entry in file.routes {
            storage.add_route(entry.domain, entry.user);
        }
        Ok(storage)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, StorageError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            StorageError::Backend(format!("can't read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn add_token(
        &self,
        token: impl Into<String>,
        user: impl Into<String>,
        scopes: impl IntoIterator<Item = impl Into<String>>,
    ) {
        let record = TokenRecord {
            user: user.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
        };
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.into(), record);
    }

    pub fn remove_token(&self, token: &str) -> bool {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }

    pub fn add_route(&self, domain: impl AsRef<str>, user: impl Into<String>) {
        let domain = domain.as_ref().to_ascii_lowercase();
        debug!(domain = %domain, "Route added");
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(domain, user.into());
    }

    pub fn remove_route(&self, domain: &str) -> bool {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&domain.to_ascii_lowercase())
            .is_some()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn has_token(&self, token: &str) -> Result<(String, Vec<String>), StorageError> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        tokens
            .get(token)
            .map(|record| (record.user.clone(), record.scopes.clone()))
            .ok_or(StorageError::UnknownToken)
    }

    async fn has_route(&self, domain: &str) -> Result<String, StorageError> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .get(&domain.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| StorageError::UnknownRoute(domain.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_lookup() {
        let storage = MemoryStorage::new();
        storage.add_token("orcaz r kewl", "shachi", ["connect"]);

        let (user, scopes) = storage.has_token("orcaz r kewl").await.unwrap();
        assert_eq!(user, "shachi");
        assert_eq!(scopes, vec!["connect".to_string()]);

        assert!(matches!(
            storage.has_token("nope").await,
            Err(StorageError::UnknownToken)
        ));
    }

    #[tokio::test]
    async fn test_route_lookup_ignores_case() {
        let storage = MemoryStorage::new();
        storage.add_route("Cetacean.Club", "shachi");

        assert_eq!(storage.has_route("cetacean.club").await.unwrap(), "shachi");
        assert_eq!(storage.has_route("CETACEAN.CLUB").await.unwrap(), "shachi");

        assert!(storage.remove_route("cetacean.club"));
        assert!(matches!(
            storage.has_route("cetacean.club").await,
            Err(StorageError::UnknownRoute(_))
        ));
    }

    #[tokio::test]
    async fn test_from_json() {
        let storage = MemoryStorage::from_json(
            r#"{
                "tokens": [
                    {"token": "t1", "user": "shachi", "scopes": ["connect"]},
                    {"token": "t2", "user": "shachi"}
                ],
                "routes": [{"domain": "cetacean.club", "user": "shachi"}]
            }"#,
        )
        .unwrap();

        assert_eq!(storage.has_token("t2").await.unwrap().1, Vec::<String>::new());
        assert_eq!(storage.has_route("cetacean.club").await.unwrap(), "shachi");
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            MemoryStorage::from_json("tokens: []"),
            Err(StorageError::Backend(_))
        ));
    }
}
