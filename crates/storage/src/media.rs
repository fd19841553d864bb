use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

/// Storage seam for produced media artifacts (translated audio).
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Stores the bytes under a collision-resistant generated name and
    /// returns the URL clients can fetch it from.
    async fn store_audio(&self, bytes: &[u8], content_type: &str) -> Result<String>;
}

/// Writes media into a local directory served under `public_base`.
pub struct LocalMediaStore {
    root: PathBuf,
    public_base: String,
}

impl LocalMediaStore {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create media directory '{}'", root.display()))?;
        Ok(Self {
            root,
            public_base: public_base.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn store_audio(&self, bytes: &[u8], content_type: &str) -> Result<String> {
        let extension = match content_type {
            "audio/wav" | "audio/x-wav" => "wav",
            "audio/mpeg" => "mp3",
            "audio/ogg" => "ogg",
            _ => "bin",
        };
        let name = format!("{}.{extension}", Uuid::new_v4());
        let path = self.root.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write media file '{}'", path.display()))?;
        Ok(format!("{}/{name}", self.public_base))
    }
}
