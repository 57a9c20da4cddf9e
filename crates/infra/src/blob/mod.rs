//! Blob store interface and adapters for generated artifacts.

use async_trait::async_trait;

pub mod fs;
pub mod in_memory;

pub use fs::FsBlobStore;
pub use in_memory::InMemoryBlobStore;

/// Result of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: String,
    pub url: String,
    pub size: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("blob store io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobError {
    /// The store could not be reached or written; the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, BlobError::Io(_))
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<StoredBlob, BlobError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, BlobError>;
}

#[async_trait]
impl<T> BlobStore for std::sync::Arc<T>
where
    T: BlobStore + ?Sized,
{
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<StoredBlob, BlobError> {
        (**self).upload(key, bytes, content_type).await
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        (**self).download(key).await
    }
}

/// Keys are `/`-separated relative paths without `.`/`..` or empty segments.
pub(crate) fn validate_key(key: &str) -> Result<(), BlobError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != ".." && !segment.contains('\\'));

    if valid {
        Ok(())
    } else {
        Err(BlobError::InvalidKey(key.to_string()))
    }
}

pub(crate) fn join_url(base_url: &str, key: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(validate_key("generated/a/b/c.tar.gz").is_ok());
        for bad in ["", "/abs", "a//b", "a/../b", "./a", "a\\b", "a/"] {
            assert!(validate_key(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn only_io_errors_are_transient() {
        let io = BlobError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down"));
        assert!(io.is_transient());
        assert!(!BlobError::InvalidKey("/abs".to_string()).is_transient());
        assert!(!BlobError::NotFound("k".to_string()).is_transient());
    }

    #[test]
    fn url_join_handles_trailing_slash() {
        assert_eq!(join_url("https://cdn.example/", "k/x"), "https://cdn.example/k/x");
        assert_eq!(join_url("https://cdn.example", "k/x"), "https://cdn.example/k/x");
    }
}
