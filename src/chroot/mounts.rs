//! Reading the kernel mount table.

use std::fs;
use std::path::{Path, PathBuf};

pub const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Decode the octal escapes the kernel uses for spaces, tabs and newlines.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points listed in `table`. An unreadable table lists nothing.
pub fn mount_points(table: &Path) -> Vec<PathBuf> {
    let content = match fs::read_to_string(table) {
        Ok(content) => content,
        Err(e) => {
            tracing::debug!("cannot read mount table {}: {}", table.display(), e);
            return Vec::new();
        }
    };
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

/// Resolve symlinks in `path` when it exists, so it compares equal to the
/// kernel's view.
pub fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

pub fn is_mounted(table: &Path, path: &Path) -> bool {
    let path = canonical(path);
    mount_points(table).iter().any(|m| *m == path)
}

/// Mount points strictly beneath `root`, deepest first.
pub fn mounted_beneath(table: &Path, root: &Path) -> Vec<PathBuf> {
    let root = canonical(root);
    let mut out: Vec<PathBuf> = mount_points(table)
        .into_iter()
        .filter(|m| m != &root && m.starts_with(&root))
        .collect();
    out.sort_by_key(|m| std::cmp::Reverse(m.components().count()));
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parses_escaped_mount_points() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("mounts");
        fs::write(
            &table,
            "proc /proc proc rw 0 0\n\
             /dev/sda1 /mnt/with\\040space ext4 rw 0 0\n",
        )
        .unwrap();
        let points = mount_points(&table);
        assert_eq!(points, vec![PathBuf::from("/proc"), PathBuf::from("/mnt/with space")]);
    }

    #[test]
    fn test_mounted_beneath_is_component_wise() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("mounts");
        fs::write(
            &table,
            "proc /chroot/proc proc rw 0 0\n\
             devpts /chroot/dev/pts devpts rw 0 0\n\
             tmpfs /chroot-other tmpfs rw 0 0\n\
             tmpfs /chroot tmpfs rw 0 0\n",
        )
        .unwrap();
        let beneath = mounted_beneath(&table, Path::new("/chroot"));
        assert_eq!(
            beneath,
            vec![PathBuf::from("/chroot/dev/pts"), PathBuf::from("/chroot/proc")]
        );
    }

    #[test]
    fn test_missing_table_lists_nothing() {
        assert!(mount_points(Path::new("/nonexistent/mounts")).is_empty());
    }
}
