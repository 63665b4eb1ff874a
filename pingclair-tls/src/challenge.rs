//! ACME HTTP-01 challenge token store.
//!
//! Tokens are persisted to disk so a restart mid-challenge does not need a
//! fresh ACME order; grounded on the teacher's
//! `persistent_challenge_handler.rs`, simplified to a single async surface
//! rather than a sync trait bridged over `futures::executor::block_on`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use pingclair_core::server::HttpChallengeLookup;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const TOKEN_TTL_SECS: u64 = 24 * 3600;

#[derive(Clone, Serialize, Deserialize)]
struct TokenEntry {
    key_authorization: String,
    created_at: u64,
}

#[derive(Serialize, Deserialize, Default)]
struct TokenStorage {
    tokens: HashMap<String, TokenEntry>,
}

/// Holds the key authorization for every in-flight ACME HTTP-01 challenge.
pub struct ChallengeStore {
    tokens: RwLock<HashMap<String, TokenEntry>>,
    storage_path: PathBuf,
}

impl ChallengeStore {
    pub async fn load(storage_path: PathBuf) -> std::io::Result<Self> {
        let mut tokens = HashMap::new();
        if storage_path.exists() {
            let content = tokio::fs::read_to_string(&storage_path).await?;
            if let Ok(stored) = serde_json::from_str::<TokenStorage>(&content) {
                tokens = stored.tokens;
                tracing::info!(count = tokens.len(), "loaded persisted challenge tokens");
            }
        } else if let Some(parent) = storage_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        Ok(Self {
            tokens: RwLock::new(tokens),
            storage_path,
        })
    }

    pub async fn deploy(&self, token: &str, key_authorization: &str) {
        let entry = TokenEntry {
            key_authorization: key_authorization.to_string(),
            created_at: now(),
        };
        self.tokens.write().await.insert(token.to_string(), entry);
        if let Err(err) = self.save().await {
            tracing::warn!(error = %err, "failed to persist challenge token");
        }
    }

    pub async fn cleanup(&self, token: &str) {
        self.tokens.write().await.remove(token);
        if let Err(err) = self.save().await {
            tracing::warn!(error = %err, "failed to persist challenge token removal");
        }
    }

    pub async fn cleanup_expired(&self) {
        let cutoff = now();
        let removed = {
            let mut tokens = self.tokens.write().await;
            let before = tokens.len();
            tokens.retain(|_, entry| cutoff.saturating_sub(entry.created_at) < TOKEN_TTL_SECS);
            before - tokens.len()
        };
        if removed > 0 {
            tracing::info!(removed, "cleaned up expired challenge tokens");
            let _ = self.save().await;
        }
    }

    async fn save(&self) -> std::io::Result<()> {
        let storage = TokenStorage {
            tokens: self.tokens.read().await.clone(),
        };
        let json = serde_json::to_string(&storage).unwrap_or_default();
        tokio::fs::write(&self.storage_path, json).await
    }
}

#[async_trait]
impl HttpChallengeLookup for ChallengeStore {
    async fn lookup(&self, token: &str) -> Option<String> {
        self.tokens
            .read()
            .await
            .get(token)
            .map(|entry| entry.key_authorization.clone())
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deploy_then_lookup_then_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChallengeStore::load(dir.path().join("tokens.json")).await.unwrap();

        store.deploy("tok1", "auth1").await;
        assert_eq!(store.lookup("tok1").await, Some("auth1".to_string()));

        store.cleanup("tok1").await;
        assert_eq!(store.lookup("tok1").await, None);
    }

    #[tokio::test]
    async fn tokens_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        {
            let store = ChallengeStore::load(path.clone()).await.unwrap();
            store.deploy("persist", "auth").await;
        }

        let store = ChallengeStore::load(path).await.unwrap();
        assert_eq!(store.lookup("persist").await, Some("auth".to_string()));
    }
}
