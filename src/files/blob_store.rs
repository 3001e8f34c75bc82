use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::files::converter::is_binary_export;

#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Local directories holding raw uploads and converter output
#[derive(Debug, Clone)]
pub struct BlobStore {
    upload_dir: PathBuf,
    converted_dir: PathBuf,
}

impl BlobStore {
    pub fn new(upload_dir: impl Into<PathBuf>, converted_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            converted_dir: converted_dir.into(),
        }
    }

    /// Create both directories if they are missing
    pub async fn ensure_dirs(&self) -> Result<(), BlobStoreError> {
        for dir in [&self.upload_dir, &self.converted_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| BlobStoreError::Io {
                    path: dir.clone(),
                    source,
                })?;
            debug!("Ensured directory {}", dir.display());
        }
        Ok(())
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn converted_dir(&self) -> &Path {
        &self.converted_dir
    }

    pub fn upload_path(&self, filename: &str) -> PathBuf {
        self.upload_dir.join(filename)
    }

    /// Where the converter is expected to write the text export for `filename`
    pub fn converted_path(&self, filename: &str) -> PathBuf {
        let stem = Path::new(filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());
        self.converted_dir.join(format!("{stem}.txt"))
    }

    /// Persist raw upload bytes, overwriting a previous upload of the same name
    #[instrument(skip(self, bytes), fields(filename = %filename, size = bytes.len()))]
    pub async fn save_upload(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, BlobStoreError> {
        self.ensure_dirs().await?;

        let path = self.upload_path(filename);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| BlobStoreError::Io {
                path: path.clone(),
                source,
            })?;

        debug!("Saved upload to {}", path.display());
        Ok(path)
    }

    /// Remove the upload and converted artifacts for a file
    ///
    /// Best effort: missing files are fine, other failures are logged and
    /// counted. Returns the number of artifacts that could not be removed.
    #[instrument(skip(self), fields(filename = %filename))]
    pub async fn remove_artifacts(&self, filename: &str) -> usize {
        let mut failures = 0;

        let mut candidates = vec![self.upload_path(filename)];
        if is_binary_export(filename) {
            candidates.push(self.converted_path(filename));
        }

        for path in candidates {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!("Removed {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("No artifact at {}", path.display());
                }
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    failures += 1;
                }
            }
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converted_path_swaps_extension() {
        let store = BlobStore::new("/data/uploads", "/data/converted");
        assert_eq!(
            store.converted_path("000110_2024-01-01.rld"),
            PathBuf::from("/data/converted/000110_2024-01-01.txt")
        );
        assert_eq!(
            store.converted_path("site.txt"),
            PathBuf::from("/data/converted/site.txt")
        );
    }

    #[tokio::test]
    async fn test_save_and_remove_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("uploads"), dir.path().join("converted"));

        let path = store.save_upload("site.rld", b"raw").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"raw");

        std::fs::write(store.converted_path("site.rld"), "text").unwrap();

        assert_eq!(store.remove_artifacts("site.rld").await, 0);
        assert!(!path.exists());
        assert!(!store.converted_path("site.rld").exists());

        // Second removal finds nothing and is still not a failure
        assert_eq!(store.remove_artifacts("site.rld").await, 0);
    }
}
