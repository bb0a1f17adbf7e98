//! Response audit trail
//!
//! Every resolved response body is persisted before it is returned to the
//! client; a write failure aborts delivery of that response.

use std::path::{Path, PathBuf};

use http::StatusCode;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CarouselError, Result};

/// Writes one artifact file per resolved response
#[derive(Debug, Clone)]
pub struct AuditStore {
    dir: PathBuf,
}

impl AuditStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the artifact directory if it does not exist yet
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            CarouselError::AuditWrite(format!(
                "failed to create audit directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }

    /// Persist a response body, returning the artifact path
    pub async fn persist(
        &self,
        status: StatusCode,
        domain: &str,
        body: &[u8],
    ) -> Result<PathBuf> {
        let name = format!("{}_{}_{}.txt", status.as_u16(), domain, Uuid::new_v4());
        let path = self.dir.join(name);
        tokio::fs::write(&path, body).await.map_err(|e| {
            CarouselError::AuditWrite(format!("failed to write {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), bytes = body.len(), "Persisted response artifact");
        Ok(path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_persist_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuditStore::new(dir.path());

        let path = store
            .persist(StatusCode::OK, "example.com", b"<html>ok</html>")
            .await
            .unwrap();

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("200_example.com_"));
        assert!(name.ends_with(".txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"<html>ok</html>");
    }

    #[tokio::test]
    async fn test_persist_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuditStore::new(dir.path());

        let first = store
            .persist(StatusCode::FORBIDDEN, "example.com", b"a")
            .await
            .unwrap();
        let second = store
            .persist(StatusCode::FORBIDDEN, "example.com", b"b")
            .await
            .unwrap();

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_persist_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuditStore::new(dir.path().join("absent"));

        let err = store
            .persist(StatusCode::OK, "example.com", b"body")
            .await
            .unwrap_err();
        assert!(matches!(err, CarouselError::AuditWrite(_)));
    }

    #[test]
    fn test_ensure_dir_creates_nested() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuditStore::new(dir.path().join("a").join("b"));
        store.ensure_dir().unwrap();
        assert!(store.dir().is_dir());
    }
}
