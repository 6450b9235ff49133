//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::DeployError;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), DeployError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// List entries (files and symlinks, dangling ones included)
    pub async fn list_entries(&self) -> Result<Vec<PathBuf>, DeployError> {
        let mut found = Vec::new();
        if !self.exists().await {
            return Ok(found);
        }
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_file() || file_type.is_symlink() {
                found.push(entry.path());
            }
        }

        found.sort();
        Ok(found)
    }
}

/// Point `link` at `target`, replacing whatever `link` was
pub async fn replace_symlink(target: &Path, link: &Path) -> Result<(), DeployError> {
    if let Ok(current) = fs::read_link(link).await {
        if current == target {
            return Ok(());
        }
    }
    remove_link(link).await?;
    #[cfg(unix)]
    fs::symlink(target, link).await?;
    #[cfg(not(unix))]
    fs::copy(target, link).await.map(|_| ())?;
    Ok(())
}

/// Remove a symlink or file if present
pub async fn remove_link(link: &Path) -> Result<(), DeployError> {
    match fs::remove_file(link).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Target of a symlink, `None` if `link` is not one
pub async fn read_link(link: &Path) -> Option<PathBuf> {
    fs::read_link(link).await.ok()
}

/// Whether `link` is a symlink resolving to `target`
pub async fn links_to(link: &Path, target: &Path) -> bool {
    matches!(fs::read_link(link).await, Ok(current) if current == target)
}
