// ABOUTME: Crash-safe file replacement via temp file + fsync + rename in the target directory.
// ABOUTME: Readers only ever observe the previous file or the complete new one, never a partial write.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{Result, StoreError};

/// Writes whole files atomically. `sync` controls whether data and the
/// directory entry are fsynced before returning.
#[derive(Debug, Clone, Copy)]
pub struct AtomicWriter {
    sync: bool,
}

impl Default for AtomicWriter {
    fn default() -> Self {
        Self { sync: true }
    }
}

impl AtomicWriter {
    pub fn new(sync: bool) -> Self {
        Self { sync }
    }

    /// Replace `path` with `bytes`. The temp file lives next to the target so
    /// the final rename never crosses a filesystem. Any failure leaves the
    /// previous content of `path` in place and surfaces as `WriteFailed`.
    pub fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let failed = |source: std::io::Error| StoreError::WriteFailed {
            path: path.to_path_buf(),
            source,
        };

        let dir = parent_dir(path);
        fs::create_dir_all(dir).map_err(failed)?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(failed)?;
        tmp.write_all(bytes).map_err(failed)?;
        if self.sync {
            tmp.as_file().sync_all().map_err(failed)?;
        }
        tmp.persist(path).map_err(|e| failed(e.error))?;

        if self.sync {
            // The rename already succeeded; syncing the directory only makes
            // it durable, so a failure here is not reported.
            if let Ok(d) = File::open(dir) {
                let _ = d.sync_all();
            }
        }

        tracing::debug!("wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    /// Serialize `value` as pretty JSON and write it atomically.
    pub fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write(path, &bytes)
    }
}

/// Move an unreadable store document aside so a fresh one can be started
/// without destroying the original bytes. Returns the new location.
pub fn quarantine(path: &Path) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".corrupt-{}", stamp));
    let target = path.with_file_name(name);
    fs::rename(path, &target)?;
    tracing::warn!(
        "quarantined unreadable file {} -> {}",
        path.display(),
        target.display()
    );
    Ok(target)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}
