//! Filesystem helpers for staging trees and chroots.

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

/// Create `path` and any missing parents.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Remove `path` recursively if it exists. Symlinks are removed, not followed.
pub fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to stat {}", path.display()));
        }
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove directory: {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))
    }
}

/// Remove `path` if present and recreate it empty.
pub fn clear_dir(path: &Path) -> Result<()> {
    remove_path(path)?;
    ensure_dir(path)
}

/// Purge a directory: remove it recursively and recreate it with the owner
/// and permission bits it had before. File flags that would block removal
/// are cleared first where the platform has them.
pub fn reset_dir(path: &Path) -> Result<()> {
    let previous = match fs::metadata(path) {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to stat {}", path.display()));
        }
    };

    if previous.is_some() {
        tracing::info!("Purging {}", path.display());
        clear_file_flags(path)?;
        fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove directory: {}", path.display()))?;
    }
    ensure_dir(path)?;

    if let Some(meta) = previous {
        std::os::unix::fs::chown(path, Some(meta.uid()), Some(meta.gid()))
            .with_context(|| format!("Failed to restore owner of {}", path.display()))?;
        fs::set_permissions(path, fs::Permissions::from_mode(meta.mode() & 0o7777))
            .with_context(|| format!("Failed to restore mode of {}", path.display()))?;
    }
    Ok(())
}

#[cfg(any(target_os = "freebsd", target_os = "macos"))]
fn clear_file_flags(root: &Path) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.path_is_symlink() {
            continue;
        }
        let c_path = CString::new(entry.path().as_os_str().as_bytes())
            .with_context(|| format!("Path contains NUL: {}", entry.path().display()))?;
        // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
        let rc = unsafe { libc::chflags(c_path.as_ptr(), 0) };
        if rc != 0 {
            tracing::warn!(
                "could not clear file flags on {}: {}",
                entry.path().display(),
                std::io::Error::last_os_error()
            );
        }
    }
    Ok(())
}

#[cfg(not(any(target_os = "freebsd", target_os = "macos")))]
fn clear_file_flags(_root: &Path) -> Result<()> {
    Ok(())
}

/// Most symlinks followed while resolving one in-chroot path.
const MAX_LINK_HOPS: usize = 40;

#[derive(Debug, Clone)]
enum Part {
    Parent,
    Name(OsString),
}

fn parts_of(path: &Path) -> Vec<Part> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(Part::Name(name.to_os_string())),
            Component::ParentDir => Some(Part::Parent),
            _ => None,
        })
        .collect()
}

/// Walk `parts` below `root` the way the chroot would see them. Symlinks
/// are read, never followed on the host: absolute targets restart at `root`
/// and `..` stops at `root`. The final component is resolved only with
/// `follow_last`.
fn resolve_below(root: &Path, parts: Vec<Part>, follow_last: bool) -> Result<PathBuf> {
    let mut pending: VecDeque<Part> = parts.into();
    let mut resolved: Vec<OsString> = Vec::new();
    let mut hops = 0;
    while let Some(part) = pending.pop_front() {
        let name = match part {
            Part::Parent => {
                resolved.pop();
                continue;
            }
            Part::Name(name) => name,
        };
        let candidate = under(root, &resolved).join(&name);
        if pending.is_empty() && !follow_last {
            resolved.push(name);
            break;
        }
        match fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_LINK_HOPS {
                    bail!("too many symlinks below {}", root.display());
                }
                let target = fs::read_link(&candidate)
                    .with_context(|| format!("Failed to read link {}", candidate.display()))?;
                if target.is_absolute() {
                    resolved.clear();
                }
                let mut expanded: VecDeque<Part> = parts_of(&target).into();
                expanded.extend(pending.drain(..));
                pending = expanded;
            }
            _ => resolved.push(name),
        }
    }
    Ok(under(root, &resolved))
}

fn under(root: &Path, parts: &[OsString]) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(parts);
    path
}

/// Resolve an absolute in-chroot path (`/etc/portage`) against the chroot root.
///
/// Parent-directory components are rejected. Symlinked directories on the
/// way are resolved inside `root`; the final component is left as is.
pub fn chroot_join(root: &Path, inner: &str) -> Result<PathBuf> {
    for component in Path::new(inner).components() {
        if matches!(component, Component::ParentDir | Component::Prefix(_)) {
            bail!("path '{inner}' escapes the chroot");
        }
    }
    resolve_below(root, parts_of(Path::new(inner)), false)
}

/// `path` lies under `root` once both are canonicalized.
fn stays_below(root: &Path, path: &Path) -> Result<bool> {
    let root = fs::canonicalize(root)
        .with_context(|| format!("Failed to canonicalize {}", root.display()))?;
    let parent = match path.parent() {
        Some(parent) => parent,
        None => return Ok(false),
    };
    match fs::canonicalize(parent) {
        Ok(parent) => Ok(parent.starts_with(&root)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to canonicalize {}", parent.display())),
    }
}

/// Match a single path segment against a pattern with `*` and `?`.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Expand an in-chroot pattern (`/usr/share/doc/*`) into existing paths.
///
/// Wildcards never cross `/`. Directories are entered only after their
/// symlinks are resolved inside `root`; matches themselves are returned
/// unresolved so removal acts on a link, not on what it points to.
pub fn expand_in_chroot(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let mut segments = Vec::new();
    for component in Path::new(pattern).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
            Component::ParentDir | Component::Prefix(_) => {
                bail!("path '{pattern}' escapes the chroot");
            }
        }
    }

    let mut current = vec![root.to_path_buf()];
    for (index, segment) in segments.iter().enumerate() {
        let last = index + 1 == segments.len();
        let mut next = Vec::new();
        for base in &current {
            let matched = if segment.contains(['*', '?']) {
                let entries = match fs::read_dir(base) {
                    Ok(entries) => entries,
                    Err(_) => continue,
                };
                let mut matched: Vec<PathBuf> = entries
                    .filter_map(|e| e.ok())
                    .filter(|e| wildcard_match(segment, &e.file_name().to_string_lossy()))
                    .map(|e| e.path())
                    .collect();
                matched.sort();
                matched
            } else {
                vec![base.join(segment)]
            };
            if last {
                next.extend(matched);
                continue;
            }
            for path in matched {
                let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                let dir = resolve_below(root, parts_of(&relative), true)?;
                if fs::symlink_metadata(&dir).is_ok_and(|m| m.is_dir()) {
                    next.push(dir);
                }
            }
        }
        current = next;
    }

    let mut found = Vec::new();
    for path in current {
        if path == root || fs::symlink_metadata(&path).is_err() {
            continue;
        }
        if !stays_below(root, &path)? {
            bail!("'{}' resolves outside {}", path.display(), root.display());
        }
        found.push(path);
    }
    Ok(found)
}

/// Remove every path matching the in-chroot patterns. Returns how many were removed.
pub fn remove_in_chroot(root: &Path, patterns: &[String]) -> Result<usize> {
    let mut removed = 0;
    for pattern in patterns {
        for path in expand_in_chroot(root, pattern)? {
            tracing::debug!("removing {}", path.display());
            remove_path(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Empty every directory matching the in-chroot patterns, keeping the
/// directory itself with its owner and mode.
pub fn empty_in_chroot(root: &Path, patterns: &[String]) -> Result<usize> {
    let mut emptied = 0;
    for pattern in patterns {
        for path in expand_in_chroot(root, pattern)? {
            let is_dir = fs::symlink_metadata(&path)
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if !is_dir {
                tracing::warn!("not a directory, skipping: {}", path.display());
                continue;
            }
            reset_dir(&path)?;
            emptied += 1;
        }
    }
    Ok(emptied)
}
