//! Output directory handling

use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::fs;

use episodic_core::{MbrlError, Result};

/// Make `dir` ready for a run.
///
/// When resuming the directory is reused as is. Otherwise an existing
/// directory is moved aside to `<dir>_<YYYYmmdd-HHMMSS>` and a fresh one
/// created. Returns where the previous contents went, if anywhere.
pub async fn prepare_output_dir(dir: &Path, resume: bool) -> Result<Option<PathBuf>> {
    let exists = fs::try_exists(dir)
        .await
        .map_err(|e| MbrlError::Persistence(format!("checking {}: {e}", dir.display())))?;

    let moved = if exists && !resume {
        let target = backup_path(dir).await;
        fs::rename(dir, &target).await.map_err(|e| {
            MbrlError::Persistence(format!(
                "moving {} to {}: {e}",
                dir.display(),
                target.display()
            ))
        })?;
        tracing::info!(from = %dir.display(), to = %target.display(), "moved previous output aside");
        Some(target)
    } else {
        None
    };

    fs::create_dir_all(dir)
        .await
        .map_err(|e| MbrlError::Persistence(format!("creating {}: {e}", dir.display())))?;
    Ok(moved)
}

async fn backup_path(dir: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let base = format!("{}_{stamp}", dir.display());
    let mut candidate = PathBuf::from(&base);
    let mut n = 1;
    // two runs within the same second
    while fs::try_exists(&candidate).await.unwrap_or(false) {
        candidate = PathBuf::from(format!("{base}-{n}"));
        n += 1;
    }
    candidate
}
