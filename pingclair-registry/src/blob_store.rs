//! Content-addressed blob storage with resumable chunked uploads
//! (spec §4.4): blobs are identified by `{algorithm}:{hex}` and the
//! directory is write-once per path; finalization is atomic rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no such upload session: {0}")]
    NoSuchUpload(String),

    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },
}

type Result<T> = std::result::Result<T, BlobStoreError>;

struct UploadSession {
    tmp_path: PathBuf,
    hasher: Sha256,
    offset: u64,
}

/// Content-addressed blob store rooted at a single directory.
pub struct BlobStore {
    dir: PathBuf,
    uploads: RwLock<HashMap<String, Mutex<UploadSession>>>,
}

/// `blobs/{algorithm}/{hex[0:2]}/{hex}`; `blobs/{algorithm}/{hex}` when `hex`
/// is shorter than 2 characters; `blobs/{raw}` for anything not in
/// `algorithm:hex` form.
fn digest_path(dir: &Path, digest: &str) -> PathBuf {
    match digest.split_once(':') {
        Some((algo, hex)) if hex.len() >= 2 => dir.join(algo).join(&hex[..2]).join(hex),
        Some((algo, hex)) => dir.join(algo).join(hex),
        None => dir.join(digest),
    }
}

fn new_upload_id(name: &str) -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    format!("{nanos}-{}", name.replace('/', "_"))
}

impl BlobStore {
    pub async fn init(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::create_dir_all(dir.join("_uploads")).await?;
        Ok(Self {
            dir,
            uploads: RwLock::new(HashMap::new()),
        })
    }

    pub fn has_digest_syntax(candidate: &str) -> bool {
        candidate.split_once(':').is_some()
    }

    pub async fn exists(&self, digest: &str) -> bool {
        tokio::fs::metadata(digest_path(&self.dir, digest)).await.is_ok()
    }

    pub async fn path_for(&self, digest: &str) -> Result<Option<PathBuf>> {
        let path = digest_path(&self.dir, digest);
        if tokio::fs::metadata(&path).await.is_ok() {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    pub async fn read(&self, digest: &str) -> Result<Option<Vec<u8>>> {
        match self.path_for(digest).await? {
            Some(path) => Ok(Some(tokio::fs::read(path).await?)),
            None => Ok(None),
        }
    }

    /// `POST /v2/{name}/blobs/uploads/` — begins a resumable upload session.
    /// The id is `{unixNanos}-{name with slashes replaced by underscores}`.
    pub async fn start_upload(&self, name: &str) -> Result<String> {
        let id = new_upload_id(name);
        let tmp_path = self.dir.join("_uploads").join(&id);
        tokio::fs::File::create(&tmp_path).await?;

        self.uploads.write().await.insert(
            id.clone(),
            Mutex::new(UploadSession {
                tmp_path,
                hasher: Sha256::new(),
                offset: 0,
            }),
        );
        Ok(id)
    }

    /// `PATCH .../uploads/{id}` — appends a chunk, returns the new offset
    /// (exclusive end, for the `Range` response header).
    pub async fn append_chunk(&self, id: &str, chunk: &[u8]) -> Result<u64> {
        let uploads = self.uploads.read().await;
        let session_lock = uploads.get(id).ok_or_else(|| BlobStoreError::NoSuchUpload(id.to_string()))?;
        let mut session = session_lock.lock().await;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&session.tmp_path)
            .await?;
        file.write_all(chunk).await?;
        file.flush().await?;

        session.hasher.update(chunk);
        session.offset += chunk.len() as u64;
        Ok(session.offset)
    }

    /// `PUT .../uploads/{id}?digest=...` — appends a final chunk if present,
    /// verifies the digest, and atomically publishes the blob. On digest
    /// mismatch the upload is cancelled (spec §4.4).
    pub async fn finalize(&self, id: &str, final_chunk: Option<&[u8]>, expected_digest: &str) -> Result<String> {
        if let Some(chunk) = final_chunk {
            if !chunk.is_empty() {
                self.append_chunk(id, chunk).await?;
            }
        }

        let mut uploads = self.uploads.write().await;
        let session_lock = uploads.remove(id).ok_or_else(|| BlobStoreError::NoSuchUpload(id.to_string()))?;
        let session = session_lock.into_inner();

        let computed = format!("sha256:{:x}", session.hasher.clone().finalize());
        if computed != expected_digest {
            let _ = tokio::fs::remove_file(&session.tmp_path).await;
            return Err(BlobStoreError::DigestMismatch {
                expected: expected_digest.to_string(),
                computed,
            });
        }

        let dest = digest_path(&self.dir, expected_digest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&session.tmp_path, &dest).await?;
        Ok(computed)
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        if let Some(session_lock) = self.uploads.write().await.remove(id) {
            let session = session_lock.into_inner();
            let _ = tokio::fs::remove_file(&session.tmp_path).await;
        }
        Ok(())
    }

    pub async fn upload_offset(&self, id: &str) -> Result<u64> {
        let uploads = self.uploads.read().await;
        let session_lock = uploads.get(id).ok_or_else(|| BlobStoreError::NoSuchUpload(id.to_string()))?;
        Ok(session_lock.lock().await.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_append_finalize_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::init(dir.path().to_path_buf()).await.unwrap();

        let id = store.start_upload("library/nginx").await.unwrap();
        store.append_chunk(&id, b"hello ").await.unwrap();
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(b"hello world");
            format!("sha256:{:x}", hasher.finalize())
        };

        store.finalize(&id, Some(b"world"), &digest).await.unwrap();

        assert!(store.exists(&digest).await);
        assert_eq!(store.read(&digest).await.unwrap().unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn finalize_rejects_digest_mismatch_and_cancels_upload() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::init(dir.path().to_path_buf()).await.unwrap();

        let id = store.start_upload("app").await.unwrap();
        store.append_chunk(&id, b"hello").await.unwrap();

        let err = store.finalize(&id, None, "sha256:deadbeef").await.unwrap_err();
        assert!(matches!(err, BlobStoreError::DigestMismatch { .. }));

        assert!(store.upload_offset(&id).await.is_err());
    }

    #[tokio::test]
    async fn upload_id_embeds_sanitized_repository_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::init(dir.path().to_path_buf()).await.unwrap();

        let id = store.start_upload("library/nginx").await.unwrap();
        let (nanos, name) = id.split_once('-').unwrap();
        assert!(nanos.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(name, "library_nginx");
    }

    #[tokio::test]
    async fn finalize_writes_under_the_two_level_fanout() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::init(dir.path().to_path_buf()).await.unwrap();

        let id = store.start_upload("app").await.unwrap();
        store.append_chunk(&id, b"payload").await.unwrap();
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(b"payload");
            format!("sha256:{:x}", hasher.finalize())
        };

        store.finalize(&id, None, &digest).await.unwrap();

        let (_, hex) = digest.split_once(':').unwrap();
        let expected = dir.path().join("sha256").join(&hex[..2]).join(hex);
        assert!(tokio::fs::metadata(&expected).await.is_ok());
    }

    #[tokio::test]
    async fn digest_path_degenerates_for_short_hex_and_unexpected_format() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(digest_path(dir.path(), "sha256:a"), dir.path().join("sha256").join("a"));
        assert_eq!(digest_path(dir.path(), "not-a-digest"), dir.path().join("not-a-digest"));
    }
}
