//! On-disk layout under `storedir`.
//!
//! ```text
//! <storedir>/
//!   builds/     finished artifacts and seeds
//!   snapshots/  repository snapshots
//!   tmp/        chroots and staging trees
//!   resume/     per-target resume markers
//!   locks/      per-target build locks
//! ```

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Directory layout rooted at the configured `storedir`.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    /// Open (and create if needed) the layout at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.builds_dir(),
            self.snapshots_dir(),
            self.tmp_dir(),
            self.resume_dir(),
            self.locks_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create store directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn builds_dir(&self) -> PathBuf {
        self.root.join("builds")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn resume_dir(&self) -> PathBuf {
        self.root.join("resume")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Take the exclusive build lock for `target_key`.
    ///
    /// Fails immediately if another process holds it.
    pub fn lock(&self, target_key: &str) -> Result<BuildLock> {
        let key = sanitize_key(target_key)?;
        let lock_path = self.locks_dir().join(format!("{key}.lock"));

        // A stale lock file is never unlinked before locking: removing a file
        // another process still holds would let two builds lock different inodes.
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;

        if lock_file.try_lock_exclusive().is_err() {
            drop(lock_file);
            bail!(crate::error::PipelineError::Locked(key));
        }

        Ok(BuildLock {
            _file: lock_file,
            path: lock_path,
        })
    }
}

/// RAII guard: closing the file releases the lock. The lock file stays so
/// every contender locks the same inode.
#[derive(Debug)]
pub struct BuildLock {
    _file: File,
    path: PathBuf,
}

impl BuildLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Collapse a target subpath like `default/stage1-amd64-2024` into one
/// filename segment.
pub fn sanitize_key(key: &str) -> Result<String> {
    let cleaned: String = key
        .trim_matches('/')
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned.contains("..") {
        bail!("invalid target key: '{key}'");
    }
    Ok(cleaned)
}

pub(crate) fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!(".{prefix}-{}-{n}", std::process::id())
}

/// Write `contents` to `dst` so that readers see either the old file or the
/// complete new one.
pub fn atomic_write(dst: &Path, contents: &[u8]) -> Result<()> {
    let parent = dst
        .parent()
        .with_context(|| format!("No parent directory for {}", dst.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(tmp_name(&name));
    {
        let mut f = File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        f.write_all(contents)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        f.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp.display()))?;
    }
    if let Err(e) = fs::rename(&tmp, dst) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| {
            format!("Failed to rename {} to {}", tmp.display(), dst.display())
        });
    }
    // Persist the rename itself.
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}
