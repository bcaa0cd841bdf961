use std::path::Path;

use anyhow::{Context, Result};
use log::debug;
use tokio::fs;

/// Creates `path` and its parents unless it is already a directory
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if fs::metadata(path).await.is_ok_and(|meta| meta.is_dir()) {
        return Ok(());
    }
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create directory {}", path.display()))?;
    debug!("Created directory {}", path.display());
    Ok(())
}
