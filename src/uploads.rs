use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_FILES: usize = 10;
pub const PUBLIC_PREFIX: &str = "/uploads/";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Invalid file type. Only JPEG, PNG, WebP, and GIF are allowed.")]
    UnsupportedType,
    #[error("File too large. Maximum size is 10MB.")]
    TooLarge,
    #[error("Too many files. Maximum is 10 images.")]
    TooMany,
    #[error("could not store upload: {0}")]
    Io(#[from] std::io::Error),
}

/// Extension for an accepted image content type.
pub fn extension_for(content_type: &str) -> Option<&'static str> {
    match content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "image/jpeg" | "image/jpg" => Some(".jpg"),
        "image/png" => Some(".png"),
        "image/webp" => Some(".webp"),
        "image/gif" => Some(".gif"),
        _ => None,
    }
}

/// Stores listing images on local disk and hands out their public URLs.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> Result<(), UploadError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Checks type and size before anything touches the disk.
    pub fn validate(content_type: &str, len: usize) -> Result<&'static str, UploadError> {
        let ext = extension_for(content_type).ok_or(UploadError::UnsupportedType)?;
        if len > MAX_FILE_BYTES {
            return Err(UploadError::TooLarge);
        }
        Ok(ext)
    }

    /// Writes the file as `<uuid><ext>` and returns its `/uploads/...` URL.
    pub async fn save(&self, content_type: &str, bytes: &[u8]) -> Result<String, UploadError> {
        let ext = Self::validate(content_type, bytes.len())?;
        self.ensure_dir().await?;
        let name = format!("{}{ext}", Uuid::new_v4());
        tokio::fs::write(self.dir.join(&name), bytes).await?;
        debug!(target = "syncsellr.api", file = %name, bytes = bytes.len(), "upload stored");
        Ok(format!("{PUBLIC_PREFIX}{name}"))
    }

    /// Removes files behind `/uploads/...` URLs. Missing files and foreign URLs are ignored.
    pub async fn remove_all(&self, urls: &[String]) {
        for url in urls {
            let Some(name) = url.strip_prefix(PUBLIC_PREFIX) else {
                continue;
            };
            if name.contains('/') || name.contains("..") {
                continue;
            }
            match tokio::fs::remove_file(self.dir.join(name)).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(target = "syncsellr.api", file = %name, error = %err, "upload cleanup failed"),
            }
        }
    }
}
