//! Persisting the working file set

use evalkit_core::{validate_relative_path, FileSet, Result};
use std::path::Path;
use tracing::debug;

/// Write every file of `files` under `dir`, creating parent directories.
///
/// Paths must be relative and stay inside `dir`.
pub async fn write_response_files(dir: &Path, files: &FileSet) -> Result<()> {
    for file in files {
        let relative = validate_relative_path(&file.file_path)?;
        let target = dir.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &file.code).await?;
    }
    debug!("Wrote {} file(s) to {}", files.len(), dir.display());
    Ok(())
}
