//! Provider credentials.
//!
//! The database only ever sees a SHA-256 digest of a password, enough to tell
//! sources apart. The clear password needed to refresh a provider-API source
//! lives in a [`CredentialStore`].

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Digest stored alongside a source. Empty for sources without a password.
pub fn password_digest(password: Option<&str>) -> String {
    match password {
        Some(password) => hex::encode(Sha256::digest(password.as_bytes())),
        None => String::new(),
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, source_id: Uuid) -> Option<String>;
    async fn put(&self, source_id: Uuid, password: String);
    async fn remove(&self, source_id: Uuid) -> bool;
}

/// Process-local store; passwords are gone once the process exits
#[derive(Clone, Default)]
pub struct InMemoryCredentialStore {
    passwords: Arc<RwLock<HashMap<Uuid, String>>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(&self, source_id: Uuid) -> Option<String> {
        self.passwords.read().await.get(&source_id).cloned()
    }

    async fn put(&self, source_id: Uuid, password: String) {
        self.passwords.write().await.insert(source_id, password);
    }

    async fn remove(&self, source_id: Uuid) -> bool {
        self.passwords.write().await.remove(&source_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_and_hex() {
        let digest = password_digest(Some("secret"));
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, password_digest(Some("secret")));
        assert_ne!(digest, password_digest(Some("Secret")));
        assert_eq!(password_digest(None), "");
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryCredentialStore::new();
        let id = Uuid::new_v4();

        assert!(store.get(id).await.is_none());
        store.put(id, "secret".to_string()).await;
        assert_eq!(store.get(id).await.as_deref(), Some("secret"));
        assert!(store.remove(id).await);
        assert!(!store.remove(id).await);
    }
}
