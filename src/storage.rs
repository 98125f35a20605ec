use axum::body::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use crate::models::AttachedFile;

/// Local filesystem blob store for post attachments. Names are random, so
/// delete is idempotent and uploads never collide.
#[derive(Clone)]
pub struct LocalFileStorage {
    pub upload_dir: PathBuf,
    pub base_url: String,
}

impl LocalFileStorage {
    pub fn new(upload_dir: String, base_url: String) -> Self {
        Self {
            upload_dir: PathBuf::from(upload_dir),
            base_url,
        }
    }

    pub async fn save_file(
        &self,
        file_bytes: Bytes,
        original_filename: Option<String>,
        content_type: Option<String>,
    ) -> Result<AttachedFile, std::io::Error> {
        let extension = original_filename
            .and_then(|name| {
                Path::new(&name)
                    .extension()
                    .and_then(|os_str| os_str.to_str())
                    .map(|s| s.to_owned())
            })
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default();

        let unique_filename = format!("{}{}", Uuid::new_v4(), extension);
        let file_path = self.upload_dir.join(&unique_filename);
        let size = file_bytes.len() as i64;

        fs::create_dir_all(&self.upload_dir).await?;
        fs::write(&file_path, file_bytes).await?;

        Ok(AttachedFile {
            url: format!("{}/{}", self.base_url, unique_filename),
            name: unique_filename,
            content_type,
            size,
        })
    }

    /// Remove a stored file. A missing file counts as already deleted.
    pub async fn delete_file(&self, name: &str) -> Result<bool, std::io::Error> {
        let file_path = self.upload_dir.join(name);
        match fs::remove_file(&file_path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
