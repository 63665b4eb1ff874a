//! Manifest storage with a content-type sidecar (spec §4.4): a `PUT`
//! manifest followed by a `GET` for the same `(name, reference)` must
//! return the bytes and content type byte-for-byte identical.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum ManifestStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed tags.json: {0}")]
    MalformedTags(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, ManifestStoreError>;

const LEGACY_CONTENT_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Clone)]
pub struct StoredManifest {
    pub content_type: String,
    pub body: Vec<u8>,
    pub digest: String,
}

#[derive(Serialize, Deserialize)]
struct TagEntry {
    tag: String,
    digest: String,
}

/// Manifests live under `{dir}/{name}/{digest}` with a `.content-type`
/// sidecar; the tag index is an in-memory map, persisted to and reloaded
/// from a `tags.json` array of `{tag, digest}` entries per repository.
pub struct ManifestStore {
    dir: PathBuf,
    tags: RwLock<HashMap<String, HashMap<String, String>>>,
}

fn sanitize(name: &str) -> String {
    name.replace('/', "_")
}

fn tags_path(repo_dir: &Path) -> PathBuf {
    repo_dir.join("tags.json")
}

async fn load_tags(repo_dir: &Path) -> Result<HashMap<String, String>> {
    match tokio::fs::read(tags_path(repo_dir)).await {
        Ok(bytes) => {
            let entries: Vec<TagEntry> = serde_json::from_slice(&bytes)?;
            Ok(entries.into_iter().map(|e| (e.tag, e.digest)).collect())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(err) => Err(err.into()),
    }
}

async fn save_tags(repo_dir: &Path, tags: &HashMap<String, String>) -> Result<()> {
    let entries: Vec<TagEntry> = tags
        .iter()
        .map(|(tag, digest)| TagEntry { tag: tag.clone(), digest: digest.clone() })
        .collect();
    let json = serde_json::to_vec_pretty(&entries)?;
    let tmp_path = tags_path(repo_dir).with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &json).await?;
    tokio::fs::rename(&tmp_path, tags_path(repo_dir)).await?;
    Ok(())
}

impl ManifestStore {
    pub async fn init(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            tags: RwLock::new(HashMap::new()),
        })
    }

    fn repo_dir(&self, name: &str) -> PathBuf {
        self.dir.join(sanitize(name))
    }

    /// Loads `name`'s tag map from disk if it hasn't been read into the
    /// in-memory index yet this process.
    async fn ensure_tags_loaded(&self, name: &str) -> Result<()> {
        if self.tags.read().await.contains_key(name) {
            return Ok(());
        }
        let loaded = load_tags(&self.repo_dir(name)).await?;
        self.tags.write().await.entry(name.to_string()).or_insert(loaded);
        Ok(())
    }

    /// `PUT /v2/{name}/manifests/{reference}`. If `reference` is a tag (not
    /// digest syntax), the tag index is updated to point at the computed
    /// digest and persisted to `tags.json`; the manifest itself is always
    /// stored content-addressed.
    pub async fn put(&self, name: &str, reference: &str, content_type: &str, body: Vec<u8>) -> Result<String> {
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(&body);
            format!("sha256:{:x}", hasher.finalize())
        };

        let repo_dir = self.repo_dir(name);
        tokio::fs::create_dir_all(&repo_dir).await?;

        let body_path = repo_dir.join(sanitize(&digest));
        tokio::fs::write(&body_path, &body).await?;
        tokio::fs::write(body_path.with_extension("content-type"), content_type).await?;

        if !reference.starts_with("sha256:") {
            self.ensure_tags_loaded(name).await?;
            let mut tags = self.tags.write().await;
            tags.entry(name.to_string()).or_default().insert(reference.to_string(), digest.clone());
            let snapshot = tags.get(name).cloned().unwrap_or_default();
            drop(tags);
            save_tags(&repo_dir, &snapshot).await?;
        }

        Ok(digest)
    }

    /// `GET|HEAD /v2/{name}/manifests/{reference}`.
    pub async fn get(&self, name: &str, reference: &str) -> Result<Option<StoredManifest>> {
        let digest = if reference.starts_with("sha256:") {
            reference.to_string()
        } else {
            self.ensure_tags_loaded(name).await?;
            match self.tags.read().await.get(name).and_then(|tags| tags.get(reference)) {
                Some(digest) => digest.clone(),
                None => return Ok(None),
            }
        };

        let body_path = self.repo_dir(name).join(sanitize(&digest));
        let body = match tokio::fs::read(&body_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let content_type = tokio::fs::read_to_string(body_path.with_extension("content-type"))
            .await
            .unwrap_or_else(|_| LEGACY_CONTENT_TYPE.to_string());

        Ok(Some(StoredManifest { content_type, body, digest }))
    }

    /// `DELETE /v2/{name}/manifests/{reference}`. Removes the manifest body,
    /// its content-type sidecar, and any tag entries pointing at it. Returns
    /// `false` if nothing was stored at `reference`.
    pub async fn delete(&self, name: &str, reference: &str) -> Result<bool> {
        self.ensure_tags_loaded(name).await?;

        let digest = if reference.starts_with("sha256:") {
            reference.to_string()
        } else {
            match self.tags.read().await.get(name).and_then(|tags| tags.get(reference)) {
                Some(digest) => digest.clone(),
                None => return Ok(false),
            }
        };

        let repo_dir = self.repo_dir(name);
        let body_path = repo_dir.join(sanitize(&digest));
        match tokio::fs::remove_file(&body_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        let _ = tokio::fs::remove_file(body_path.with_extension("content-type")).await;

        let mut tags = self.tags.write().await;
        if let Some(repo_tags) = tags.get_mut(name) {
            repo_tags.retain(|_, d| d != &digest);
        }
        let snapshot = tags.get(name).cloned().unwrap_or_default();
        drop(tags);
        save_tags(&repo_dir, &snapshot).await?;

        Ok(true)
    }

    /// `GET /v2/{name}/tags/list`.
    pub async fn tags_list(&self, name: &str) -> Vec<String> {
        if self.ensure_tags_loaded(name).await.is_err() {
            return Vec::new();
        }
        let mut tags: Vec<String> = self
            .tags
            .read()
            .await
            .get(name)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_by_tag_round_trips_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::init(dir.path().to_path_buf()).await.unwrap();

        store
            .put("library/nginx", "latest", "application/vnd.oci.image.manifest.v1+json", b"{}".to_vec())
            .await
            .unwrap();

        let got = store.get("library/nginx", "latest").await.unwrap().unwrap();
        assert_eq!(got.content_type, "application/vnd.oci.image.manifest.v1+json");
        assert_eq!(got.body, b"{}");
    }

    #[tokio::test]
    async fn get_by_digest_works_without_a_tag() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::init(dir.path().to_path_buf()).await.unwrap();

        let digest = store
            .put("app", "v1", "application/vnd.oci.image.manifest.v1+json", b"payload".to_vec())
            .await
            .unwrap();

        let got = store.get("app", &digest).await.unwrap().unwrap();
        assert_eq!(got.body, b"payload");
    }

    #[tokio::test]
    async fn tags_list_is_empty_for_unknown_repo() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::init(dir.path().to_path_buf()).await.unwrap();
        assert!(store.tags_list("nothing/here").await.is_empty());
    }

    #[tokio::test]
    async fn missing_sidecar_falls_back_to_legacy_docker_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::init(dir.path().to_path_buf()).await.unwrap();

        let digest = store.put("app", "v1", "application/vnd.oci.image.manifest.v1+json", b"payload".to_vec()).await.unwrap();
        let sidecar = dir.path().join("app").join(digest.replace(':', "_")).with_extension("content-type");
        tokio::fs::remove_file(&sidecar).await.unwrap();

        let got = store.get("app", &digest).await.unwrap().unwrap();
        assert_eq!(got.content_type, LEGACY_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn tags_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ManifestStore::init(dir.path().to_path_buf()).await.unwrap();
            store.put("library/nginx", "latest", "application/vnd.oci.image.manifest.v1+json", b"{}".to_vec()).await.unwrap();
        }

        let reopened = ManifestStore::init(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(reopened.tags_list("library/nginx").await, vec!["latest".to_string()]);
        let got = reopened.get("library/nginx", "latest").await.unwrap().unwrap();
        assert_eq!(got.body, b"{}");
    }

    #[tokio::test]
    async fn delete_removes_manifest_and_tag_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::init(dir.path().to_path_buf()).await.unwrap();

        store.put("app", "v1", "application/vnd.oci.image.manifest.v1+json", b"payload".to_vec()).await.unwrap();
        assert!(store.delete("app", "v1").await.unwrap());

        assert!(store.get("app", "v1").await.unwrap().is_none());
        assert!(!store.tags_list("app").await.contains(&"v1".to_string()));
    }

    #[tokio::test]
    async fn delete_of_unknown_reference_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::init(dir.path().to_path_buf()).await.unwrap();
        assert!(!store.delete("app", "missing").await.unwrap());
    }
}
