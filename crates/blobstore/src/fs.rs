//! Filesystem-backed blob store
//!
//! Each container is a directory under the store root; blob paths map to
//! files beneath it. Blob properties live in sidecar JSON files under
//! `<root>/.meta/<container>/<path>.json` so listings never see them.

use crate::{BlobProperties, BlobStore, Error, Result, validate_path};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

const META_DIR: &str = ".meta";

/// Blob store rooted at a local directory
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        debug!(root = %root.display(), "opened filesystem blob store");
        Ok(Self { root })
    }

    /// Root directory of the store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> Result<PathBuf> {
        if container.is_empty() || container.contains(['/', '\\']) || container == ".." {
            return Err(Error::invalid_path(
                container,
                "container must be a single path segment",
            ));
        }
        if container == META_DIR {
            return Err(Error::invalid_path(container, "container name is reserved"));
        }
        Ok(self.root.join(container))
    }

    fn blob_path(&self, container: &str, path: &str) -> Result<PathBuf> {
        validate_path(path)?;
        Ok(self.container_dir(container)?.join(path))
    }

    fn meta_path(&self, container: &str, path: &str) -> Result<PathBuf> {
        validate_path(path)?;
        self.container_dir(container)?;
        Ok(self
            .root
            .join(META_DIR)
            .join(container)
            .join(format!("{path}.json")))
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(e, parent, "create_dir_all"))?;
    }
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn exists(&self, container: &str, path: &str) -> Result<bool> {
        let file = self.blob_path(container, path)?;
        match tokio::fs::metadata(&file).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(e, &file, "metadata")),
        }
    }

    async fn last_modified(&self, container: &str, path: &str) -> Result<DateTime<Utc>> {
        let file = self.blob_path(container, path)?;
        let meta = match tokio::fs::metadata(&file).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(container, path));
            }
            Err(e) => return Err(Error::io(e, &file, "metadata")),
        };
        let modified = meta
            .modified()
            .map_err(|e| Error::io(e, &file, "modified"))?;
        Ok(DateTime::<Utc>::from(modified))
    }

    async fn read_bytes(&self, container: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let file = self.blob_path(container, path)?;
        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, &file, "read")),
        }
    }

    async fn properties(&self, container: &str, path: &str) -> Result<Option<BlobProperties>> {
        if !self.exists(container, path).await? {
            return Ok(None);
        }
        let meta = self.meta_path(container, path)?;
        match tokio::fs::read(&meta).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::serialization(format!("Failed to parse blob metadata: {e}"))),
            // Blobs copied in by hand carry no sidecar
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Some(BlobProperties::for_path(path))),
            Err(e) => Err(Error::io(e, &meta, "read")),
        }
    }

    async fn write_bytes(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        properties: &BlobProperties,
    ) -> Result<()> {
        let file = self.blob_path(container, path)?;
        let meta = self.meta_path(container, path)?;

        ensure_parent(&file).await?;
        tokio::fs::write(&file, bytes)
            .await
            .map_err(|e| Error::io(e, &file, "write"))?;

        let json = serde_json::to_vec_pretty(properties)
            .map_err(|e| Error::serialization(format!("Failed to serialize blob metadata: {e}")))?;
        ensure_parent(&meta).await?;
        tokio::fs::write(&meta, json)
            .await
            .map_err(|e| Error::io(e, &meta, "write"))?;

        trace!(container, path, size = bytes.len(), "filesystem blob written");
        Ok(())
    }

    async fn delete(&self, container: &str, path: &str) -> Result<()> {
        let file = self.blob_path(container, path)?;
        let meta = self.meta_path(container, path)?;
        for target in [&file, &meta] {
            match tokio::fs::remove_file(target).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(e, target, "remove_file")),
            }
        }
        Ok(())
    }

    async fn list_by_prefix(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
        let dir = self.container_dir(container)?;
        let prefix = prefix.to_string();
        let walk_dir = dir.clone();
        let listed = tokio::task::spawn_blocking(move || {
            let mut paths: Vec<String> = walkdir::WalkDir::new(&walk_dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| {
                    e.path().strip_prefix(&walk_dir).ok().map(|rel| {
                        rel.components()
                            .map(|c| c.as_os_str().to_string_lossy().into_owned())
                            .collect::<Vec<_>>()
                            .join("/")
                    })
                })
                .filter(|rel| rel.starts_with(&prefix))
                .collect();
            paths.sort();
            paths
        })
        .await
        .map_err(|e| Error::io(std::io::Error::other(e), &dir, "list"))?;
        Ok(listed)
    }
}
