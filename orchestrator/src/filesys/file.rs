//! File operations

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::DeployError;

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Check the file exists and has content
    pub async fn is_non_empty(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, DeployError> {
        Ok(fs::read_to_string(&self.path).await?)
    }

    /// Read file contents, or `None` when the file does not exist
    pub async fn read_optional(&self) -> Result<Option<String>, DeployError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Last `lines` lines of the file; empty when the file is unreadable
    pub async fn tail(&self, lines: usize) -> String {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => tail_lines(&contents, lines),
            Err(_) => String::new(),
        }
    }

    /// Write JSON to file atomically
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), DeployError> {
        let mut contents = serde_json::to_string_pretty(value)?;
        contents.push('\n');
        self.write_atomic(contents.as_bytes()).await
    }

    /// Delete the file
    pub async fn delete(&self) -> Result<(), DeployError> {
        if self.exists().await {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }

    /// Set file permissions to owner-read/write only (0o600) on Unix.
    ///
    /// A no-op on non-Unix platforms.
    pub async fn set_permissions_600(&self) -> Result<(), DeployError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = fs::metadata(&self.path).await?;
            let mut perms = meta.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms).await?;
        }
        Ok(())
    }

    /// Atomic write using a temporary file in the same directory.
    ///
    /// Readers see either the old contents or the new ones, never a mix.
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), DeployError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = self
            .path
            .with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Last `lines` lines of `text`
pub fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
