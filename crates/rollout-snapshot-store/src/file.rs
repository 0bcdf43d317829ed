//! Local filesystem snapshot storage.
//!
//! Blob paths map onto files below a root directory. Writes go to a
//! temporary sibling first and are renamed into place, so readers never see
//! a partially written snapshot.

use crate::{SnapshotStorage, SnapshotStoreError, SnapshotStoreResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Snapshot blobs stored as files below `root`
#[derive(Debug, Clone)]
pub struct FileSnapshotStorage {
    root: PathBuf,
}

impl FileSnapshotStorage {
    /// Storage rooted at `root`; the directory is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> SnapshotStoreResult<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(SnapshotStoreError::ConfigurationError(format!("Invalid snapshot path: {}", path)));
        }
        Ok(self.root.join(relative))
    }

    async fn walk(&self, dir: PathBuf, out: &mut Vec<String>) -> SnapshotStoreResult<()> {
        let mut stack = vec![dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else { continue };
                let name = relative.to_string_lossy().replace('\\', "/");
                if !name.ends_with(".tmp") {
                    out.push(name);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStorage for FileSnapshotStorage {
    async fn put(&self, path: &str, bytes: &[u8]) -> SnapshotStoreResult<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = target.with_extension("tmp");
        fs::write(&temp, bytes).await?;
        fs::rename(&temp, &target).await?;
        debug!(path = %target.display(), bytes = bytes.len(), "Wrote snapshot blob");
        Ok(())
    }

    async fn get(&self, path: &str) -> SnapshotStoreResult<Vec<u8>> {
        match fs::read(self.resolve(path)?).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SnapshotStoreError::NotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> SnapshotStoreResult<bool> {
        Ok(fs::try_exists(self.resolve(path)?).await?)
    }

    async fn delete(&self, path: &str) -> SnapshotStoreResult<()> {
        match fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> SnapshotStoreResult<Vec<String>> {
        let mut paths = Vec::new();
        self.walk(self.root.clone(), &mut paths).await?;
        paths.retain(|path| path.starts_with(prefix));
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot_path;

    #[tokio::test]
    async fn test_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSnapshotStorage::new(dir.path());

        let path = snapshot_path("ws-1", 42);
        storage.put(&path, b"snapshot").await.unwrap();
        assert!(storage.exists(&path).await.unwrap());
        assert_eq!(storage.get(&path).await.unwrap(), b"snapshot".to_vec());

        storage.put(&snapshot_path("ws-2", 1), b"other").await.unwrap();
        assert_eq!(storage.list("ws-1/").await.unwrap(), vec![path.clone()]);
        assert_eq!(storage.list("").await.unwrap().len(), 2);

        storage.delete(&path).await.unwrap();
        assert!(!storage.exists(&path).await.unwrap());
        assert!(matches!(storage.get(&path).await, Err(SnapshotStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSnapshotStorage::new(dir.path());
        assert!(storage.put("../outside", b"x").await.is_err());
        assert!(storage.put("/abs", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_list_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSnapshotStorage::new(dir.path().join("never-created"));
        assert!(storage.list("").await.unwrap().is_empty());
    }
}
