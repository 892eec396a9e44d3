//! # IO Utilities
//!
//! File system operations for the `.stagehand` runtime directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Environment variable that overrides the runtime directory
pub const RUNTIME_PATH_ENV: &str = "STAGEHAND_RUNTIME_PATH";

/// Get the runtime directory path (.stagehand)
pub fn get_runtime_path() -> PathBuf {
    if let Ok(path) = std::env::var(RUNTIME_PATH_ENV) {
        return PathBuf::from(path);
    }

    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".stagehand")
}

/// Ensure a runtime directory exists
pub async fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create runtime directory: {:?}", path))
}

/// Write a file under `root`, creating parent directories as needed
pub async fn write_file(root: &Path, relative_path: impl AsRef<Path>, content: &str) -> Result<PathBuf> {
    let path = root.join(relative_path);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    fs::write(&path, content)
        .await
        .with_context(|| format!("Failed to write file: {:?}", path))?;
    Ok(path)
}

/// Read a file under `root`
pub async fn read_file(root: &Path, relative_path: impl AsRef<Path>) -> Result<String> {
    let path = root.join(relative_path.as_ref());
    fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read file: {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_runtime_path() {
        if std::env::var(RUNTIME_PATH_ENV).is_err() {
            assert!(get_runtime_path().ends_with(".stagehand"));
        }
    }

    #[tokio::test]
    async fn test_file_operations() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_file(dir.path(), "reports/run-1/stage-1.md", "# Layout")
            .await
            .unwrap();
        assert!(written.ends_with("reports/run-1/stage-1.md"));

        let content = read_file(dir.path(), "reports/run-1/stage-1.md").await.unwrap();
        assert_eq!(content, "# Layout");
    }
}
