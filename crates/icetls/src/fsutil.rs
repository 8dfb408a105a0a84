use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

// Write-then-rename so a crash mid-write never leaves a half-written file
// visible at `path`.
pub fn atomic_write(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::Write(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::Write(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::Write(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })?;
    Ok(())
}
