//! Host checks run before any chroot or mount work.
//!
//! Validates that the host has the external tools the chosen target and
//! compression modes call, and that the build runs with root privileges.

use anyhow::{bail, Result};

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools every chroot target calls. Each tuple is (command, package).
pub const CHROOT_TOOLS: &[(&str, &str)] = &[
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("rsync", "rsync"),
    ("tar", "tar"),
];

/// Tools the snapshot target calls.
pub const SNAPSHOT_TOOLS: &[(&str, &str)] = &[("rsync", "rsync"), ("tar", "tar")];

/// Package that provides a compression front end, for error messages.
pub fn package_for(tool: &str) -> &str {
    match tool {
        "mksquashfs" | "unsquashfs" => "squashfs-tools",
        "lbzip2" => "lbzip2",
        "pixz" => "pixz",
        "isoinfo" => "cdrtools",
        "bzip2" => "bzip2",
        "xz" => "xz-utils",
        "gzip" => "gzip",
        other => other,
    }
}

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool with its package.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check the base tools plus any extra command names (compressors, listers).
pub fn check_host_tools(base: &[(&str, &str)], extra: &[String]) -> Result<()> {
    let mut tools: Vec<(&str, &str)> = base.to_vec();
    for tool in extra {
        if !tools.iter().any(|(t, _)| *t == tool.as_str()) {
            tools.push((tool.as_str(), package_for(tool)));
        }
    }
    check_required_tools(&tools)
}

pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Mounting and chrooting need root.
pub fn check_root() -> Result<()> {
    if !is_root() {
        bail!("stage-builder must be run as root (bind mounts and chroot need it)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_lists_missing() {
        let err = check_host_tools(
            &[("ls", "coreutils")],
            &["nonexistent_command_xyz".to_string()],
        )
        .unwrap_err();
        assert!(err.to_string().contains("nonexistent_command_xyz"));
    }

    #[test]
    fn test_package_for() {
        assert_eq!(package_for("mksquashfs"), "squashfs-tools");
        assert_eq!(package_for("foo"), "foo");
    }
}
