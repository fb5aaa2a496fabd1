use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;

/// Top-level namespaces of stored objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Folder {
    /// Files attached to messages.
    Uploads,
    /// Profile pictures.
    Avatars,
}

impl Folder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Folder::Uploads => "uploads",
            Folder::Avatars => "avatar",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Name within its folder, e.g. `3f2c...e1.png`.
    pub name: String,
    /// `<folder>/<name>`, the value persisted on records.
    pub key: String,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `data` under a fresh name that keeps the extension of
    /// `original_name`.
    async fn put(
        &self,
        folder: Folder,
        original_name: &str,
        data: &[u8],
    ) -> Result<StoredObject, ServerError>;

    /// Read an object back with its content type.
    async fn get(&self, folder: Folder, name: &str) -> Result<(Bytes, &'static str), ServerError>;

    async fn delete(&self, folder: Folder, name: &str) -> Result<(), ServerError>;
}

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(ServerError::BadInput("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadInput("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// Lowercased alphanumeric extension of `name`, if it has a sane one.
fn extension_of(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    let ok = !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    ok.then(|| ext.to_ascii_lowercase())
}

fn content_type_for(name: &str) -> &'static str {
    match extension_of(name).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain; charset=utf-8",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Filesystem object storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl BlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        for folder in [Folder::Uploads, Folder::Avatars] {
            let dir = base_path.join(folder.as_str());
            fs::create_dir_all(&dir).await.map_err(|e| {
                ServerError::Storage(format!(
                    "Failed to create storage directory '{}': {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        info!(path = %base_path.display(), "Object storage initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Resolve `folder/name`, rejecting anything that is not a plain file
    /// name.
    fn safe_path(&self, folder: Folder, name: &str) -> Result<PathBuf, ServerError> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
            || name.starts_with('.')
        {
            return Err(ServerError::BadInput("Invalid file name".to_string()));
        }
        let target = self.base_path.join(folder.as_str()).join(name);
        ensure_within(&self.base_path, &target)
    }
}

#[async_trait]
impl ObjectStorage for BlobStore {
    async fn put(
        &self,
        folder: Folder,
        original_name: &str,
        data: &[u8],
    ) -> Result<StoredObject, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadInput("Empty file".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::PayloadTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let name = match extension_of(original_name) {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };
        let path = self.safe_path(folder, &name)?;

        fs::write(&path, data)
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to write {}: {}", name, e)))?;

        debug!(folder = folder.as_str(), name = %name, size = data.len(), "Stored object");
        Ok(StoredObject {
            key: format!("{}/{}", folder.as_str(), name),
            name,
        })
    }

    async fn get(&self, folder: Folder, name: &str) -> Result<(Bytes, &'static str), ServerError> {
        let path = self.safe_path(folder, name)?;

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServerError::NotFound(format!("File {name}")));
            }
            Err(e) => {
                return Err(ServerError::Storage(format!("Failed to read {}: {}", name, e)));
            }
        };

        debug!(folder = folder.as_str(), name = %name, size = data.len(), "Read object");
        Ok((Bytes::from(data), content_type_for(name)))
    }

    async fn delete(&self, folder: Folder, name: &str) -> Result<(), ServerError> {
        let path = self.safe_path(folder, name)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(folder = folder.as_str(), name = %name, "Deleted object");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::NotFound(format!("File {name}")))
            }
            Err(e) => Err(ServerError::Storage(format!(
                "Failed to delete {}: {}",
                name, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (BlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf(), 1024).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _dir) = test_store().await;

        let stored = store
            .put(Folder::Uploads, "holiday.PNG", b"png-bytes")
            .await
            .unwrap();
        assert!(stored.name.ends_with(".png"));
        assert_eq!(stored.key, format!("uploads/{}", stored.name));

        let (data, content_type) = store.get(Folder::Uploads, &stored.name).await.unwrap();
        assert_eq!(&data[..], b"png-bytes");
        assert_eq!(content_type, "image/png");

        // Folders are separate namespaces.
        assert!(store.get(Folder::Avatars, &stored.name).await.is_err());
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _dir) = test_store().await;
        let stored = store.put(Folder::Avatars, "me.jpg", b"jpeg").await.unwrap();

        store.delete(Folder::Avatars, &stored.name).await.unwrap();
        assert!(matches!(
            store.get(Folder::Avatars, &stored.name).await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let (store, _dir) = test_store().await;
        for name in ["../secret", "a/b", "..", ".env", ""] {
            assert!(matches!(
                store.get(Folder::Uploads, name).await,
                Err(ServerError::BadInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_size_limits() {
        let (store, _dir) = test_store().await;
        assert!(matches!(
            store.put(Folder::Uploads, "e.txt", b"").await,
            Err(ServerError::BadInput(_))
        ));
        let big = vec![0u8; 2048];
        assert!(matches!(
            store.put(Folder::Uploads, "big.bin", &big).await,
            Err(ServerError::PayloadTooLarge { size: 2048, max: 1024 })
        ));
    }

    #[test]
    fn test_extension_sanitised() {
        assert_eq!(extension_of("a.tar.GZ").as_deref(), Some("gz"));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of("evil.p/hp"), None);
        assert_eq!(content_type_for("x.unknown"), "application/octet-stream");
    }
}
