use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::Cache;
use crate::core::error::{RelayError, Result};

/// Directory-backed cache. Each key becomes a regular file beneath the
/// root; the duration argument is ignored because no pruning happens here.
pub struct FilesystemCache {
    root: PathBuf,
}

impl FilesystemCache {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        match std::fs::metadata(&root) {
            Ok(metadata) if !metadata.is_dir() => Err(RelayError::Config(format!(
                "path {} is not a directory",
                root.display()
            ))),
            Ok(_) => Ok(Self { root }),
            Err(_) => {
                std::fs::create_dir_all(&root).map_err(|err| {
                    RelayError::Io(format!(
                        "failed to create directory {}: {err}",
                        root.display()
                    ))
                })?;
                Ok(Self { root })
            }
        }
    }
}

#[async_trait]
impl Cache for FilesystemCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        fs::read(self.root.join(key)).await.ok()
    }

    async fn set(&self, key: &str, content: &[u8], _duration: i64) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|err| {
                RelayError::Io(format!(
                    "failed to create directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        fs::write(&path, content)
            .await
            .map_err(|err| RelayError::Io(format!("failed to write {}: {err}", path.display())))
    }

    async fn delete_with_prefix(&self, prefix: &str) -> Result<()> {
        let mut entries = fs::read_dir(&self.root).await.map_err(|err| {
            RelayError::Io(format!(
                "failed to read directory {}: {err}",
                self.root.display()
            ))
        })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| RelayError::Io(err.to_string()))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| RelayError::Io(err.to_string()))?;
            if !file_type.is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with(prefix) {
                fs::remove_file(entry.path()).await.map_err(|err| {
                    RelayError::Io(format!(
                        "failed to delete file {}: {err}",
                        entry.path().display()
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Filesystem"
    }
}
