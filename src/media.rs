//! Photo storage for receipts and rescue pictures.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::MediaError;

/// Durable handle to an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub reference_id: String,
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn upload(&self, bytes: &[u8], content_type: &str) -> Result<MediaRef, MediaError>;
}

/// Stores files under a local directory.
pub struct LocalMediaStore {
    root: PathBuf,
}

impl LocalMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type.split(';').next().unwrap_or("").trim() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn upload(&self, bytes: &[u8], content_type: &str) -> Result<MediaRef, MediaError> {
        if bytes.is_empty() {
            return Err(MediaError::Upload("empty file".into()));
        }
        tokio::fs::create_dir_all(&self.root).await?;

        let reference_id = Uuid::new_v4().to_string();
        let path = self
            .root
            .join(format!("{reference_id}.{}", extension_for(content_type)));
        tokio::fs::write(&path, bytes).await?;

        let absolute = tokio::fs::canonicalize(&path).await?;
        debug!(path = %absolute.display(), size = bytes.len(), "Media stored");
        Ok(MediaRef {
            url: format!("file://{}", absolute.display()),
            reference_id,
        })
    }
}
