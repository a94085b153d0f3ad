use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

use crate::error::{ForecastError, Result};
use crate::types::ModelId;

/// Content-addressed store for trained model binaries
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `blob` and return its location key
    async fn put(&self, model_id: ModelId, version: &str, blob: &[u8]) -> Result<String>;

    async fn get(&self, location: &str) -> Result<Vec<u8>>;

    async fn delete(&self, location: &str) -> Result<()>;
}

/// Artifacts as files under `{root}/{model_id}/{version}/{sha256}.bin`
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location key for a blob
    pub fn location_for(model_id: ModelId, version: &str, blob: &[u8]) -> String {
        let digest = hex::encode(Sha256::digest(blob));
        format!("{}/{}/{}.bin", model_id, sanitize_version(version), digest)
    }

    fn resolve(&self, location: &str) -> Result<PathBuf> {
        let relative = Path::new(location);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || location.is_empty() {
            return Err(ForecastError::InvalidInput(format!("invalid artifact location: {}", location)));
        }
        Ok(self.root.join(relative))
    }
}

/// Versions are free text; keep them to a single safe path segment
fn sanitize_version(version: &str) -> String {
    let cleaned: String = version
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, model_id: ModelId, version: &str, blob: &[u8]) -> Result<String> {
        let location = Self::location_for(model_id, version, blob);
        let path = self.resolve(&location)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial file
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, blob).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!("Saved artifact for model {} v{} to {}", model_id, version, path.display());
        Ok(location)
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>> {
        let path = self.resolve(location)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ForecastError::ArtifactMissing(location.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let path = self.resolve(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted artifact {}", location);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Artifact {} already gone", location);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        let location = store.put(7, "1.0.0", b"weights").await.unwrap();
        assert!(location.starts_with("7/1.0.0/"));
        assert!(location.ends_with(".bin"));
        assert_eq!(store.get(&location).await.unwrap(), b"weights");

        store.delete(&location).await.unwrap();
        assert!(matches!(store.get(&location).await, Err(ForecastError::ArtifactMissing(_))));
        // Deleting twice is not an error
        store.delete(&location).await.unwrap();
    }

    #[tokio::test]
    async fn test_location_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        let a = store.put(1, "v1", b"same").await.unwrap();
        let b = store.put(1, "v1", b"same").await.unwrap();
        let c = store.put(1, "v1", b"different").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_rejects_escaping_locations() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        assert!(matches!(store.get("../etc/passwd").await, Err(ForecastError::InvalidInput(_))));
        assert!(matches!(store.get("/abs/path.bin").await, Err(ForecastError::InvalidInput(_))));
    }

    #[test]
    fn test_version_sanitized_to_one_segment() {
        let location = FsArtifactStore::location_for(3, "../v/2", b"x");
        assert!(location.starts_with("3/.._v_2/"));
        assert_eq!(Path::new(&location).components().count(), 3);
    }
}
