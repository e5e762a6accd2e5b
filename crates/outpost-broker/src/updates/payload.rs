//! Update payload store rooted at a configured directory.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid payload reference: {0}")]
    InvalidRef(String),

    #[error("payload {reference} not found")]
    Missing { reference: String },

    #[error("failed to read payload {reference}: {source}")]
    Io {
        reference: String,
        #[source]
        source: std::io::Error,
    },
}

/// Size and digest of a resolved payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadInfo {
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct PayloadStore {
    root: PathBuf,
}

impl PayloadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Accept only relative references made of plain path segments that name
    /// at least one entry below the root.
    pub fn validate_ref(reference: &str) -> Result<(), PayloadError> {
        if reference.is_empty() {
            return Err(PayloadError::InvalidRef("empty reference".into()));
        }
        let path = Path::new(reference);
        let mut names = 0;
        for component in path.components() {
            match component {
                Component::Normal(_) => names += 1,
                Component::CurDir => {}
                _ => return Err(PayloadError::InvalidRef(reference.to_string())),
            }
        }
        // Must name something below the root, not the root itself.
        if names == 0 {
            return Err(PayloadError::InvalidRef(reference.to_string()));
        }
        Ok(())
    }

    /// Read a payload and compute its size and SHA-256.
    pub async fn describe(&self, reference: &str) -> Result<PayloadInfo, PayloadError> {
        Self::validate_ref(reference)?;
        let path = self.root.join(reference);

        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PayloadError::Missing {
                    reference: reference.to_string(),
                }
            } else {
                PayloadError::Io {
                    reference: reference.to_string(),
                    source: e,
                }
            }
        })?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = file.read(&mut buf).await.map_err(|e| PayloadError::Io {
                reference: reference.to_string(),
                source: e,
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        Ok(PayloadInfo {
            size,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_references() {
        assert!(PayloadStore::validate_ref("agent/1.2.0.tar.gz").is_ok());
        assert!(PayloadStore::validate_ref("").is_err());
        assert!(PayloadStore::validate_ref("../etc/passwd").is_err());
        assert!(PayloadStore::validate_ref("a/../../b").is_err());
        assert!(PayloadStore::validate_ref("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_references_to_the_root() {
        assert!(PayloadStore::validate_ref(".").is_err());
        assert!(PayloadStore::validate_ref("./").is_err());
        assert!(PayloadStore::validate_ref("././").is_err());
        assert!(PayloadStore::validate_ref("./agent.bin").is_ok());
    }

    #[tokio::test]
    async fn describes_size_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent.bin"), b"abc").unwrap();
        let store = PayloadStore::new(dir.path());

        let info = store.describe("agent.bin").await.unwrap();
        assert_eq!(info.size, 3);
        assert_eq!(
            info.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn missing_payload_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = PayloadStore::new(dir.path());
        assert!(matches!(
            store.describe("nope.bin").await,
            Err(PayloadError::Missing { .. })
        ));
    }
}
