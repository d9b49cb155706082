//! Bind-mount lifecycle around a chroot tree.
//!
//! A [`ChrootSession`] owns the only handle through which a chroot may be
//! mounted, unmounted, cleared or removed. Entries are bound in declaration
//! order and unbound in reverse. Removing or clearing the tree is refused
//! while anything is still mounted beneath it, so a purge can never descend
//! into a bound host directory.

mod mounts;

pub use mounts::{is_mounted, mounted_beneath, PROC_MOUNTS};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ChrootError;
use crate::fileops;
use crate::process::{run_checked, run_tool, Cmd, Runner};

/// One bind mount: `host` appears at `target` inside the chroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Absolute path as seen from inside the chroot (`/proc`).
    pub target: String,
    pub host: PathBuf,
}

/// Ordered bind-mount plan for a chroot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountMap {
    entries: Vec<MountEntry>,
}

impl MountMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. A later entry for the same target replaces the earlier one.
    pub fn push(&mut self, target: impl Into<String>, host: impl AsRef<Path>) {
        let target = target.into();
        let host = host.as_ref().to_path_buf();
        if let Some(existing) = self.entries.iter_mut().find(|e| e.target == target) {
            existing.host = host;
            return;
        }
        self.entries.push(MountEntry { target, host });
    }

    pub fn remove(&mut self, target: &str) {
        self.entries.retain(|e| e.target != target);
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Mount state for one chroot.
pub struct ChrootSession {
    root: PathBuf,
    map: MountMap,
    /// Host-side mount points currently bound, in bind order.
    bound: Vec<PathBuf>,
    runner: Arc<dyn Runner>,
    mount_table: PathBuf,
}

impl std::fmt::Debug for ChrootSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChrootSession")
            .field("root", &self.root)
            .field("map", &self.map)
            .field("bound", &self.bound)
            .finish()
    }
}

impl ChrootSession {
    pub fn new(root: &Path, map: MountMap, runner: Arc<dyn Runner>) -> Self {
        Self {
            root: root.to_path_buf(),
            map,
            bound: Vec::new(),
            runner,
            mount_table: PathBuf::from(PROC_MOUNTS),
        }
    }

    /// Read mount state from another table (tests).
    pub fn with_mount_table(mut self, table: &Path) -> Self {
        self.mount_table = table.to_path_buf();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn map(&self) -> &MountMap {
        &self.map
    }

    /// Replace the plan. Refused while bound.
    pub fn set_map(&mut self, map: MountMap) -> Result<(), ChrootError> {
        if self.is_bound() {
            return Err(ChrootError::StillBound(self.root.clone()));
        }
        self.map = map;
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        !self.bound.is_empty()
    }

    pub fn bound(&self) -> &[PathBuf] {
        &self.bound
    }

    /// Bind every entry in order. On failure the entries already bound are
    /// unbound before the error is returned. Binding twice is a no-op.
    pub fn bind(&mut self) -> Result<(), ChrootError> {
        if self.is_bound() {
            tracing::debug!("{} already bound", self.root.display());
            return Ok(());
        }
        let entries = self.map.entries.clone();
        for entry in &entries {
            if let Err(e) = self.bind_one(entry) {
                tracing::error!("{}", e);
                if let Err(unbind) = self.unbind() {
                    tracing::error!("while unwinding binds: {}", unbind);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn bind_one(&mut self, entry: &MountEntry) -> Result<(), ChrootError> {
        let mount_point = fileops::chroot_join(&self.root, &entry.target).map_err(|e| {
            ChrootError::Bind {
                host: entry.host.clone(),
                target: self.root.join(entry.target.trim_start_matches('/')),
                source: e.into(),
            }
        })?;
        let bind_err = |source: crate::error::BoxError| ChrootError::Bind {
            host: entry.host.clone(),
            target: mount_point.clone(),
            source,
        };

        if !entry.host.exists() {
            fs::create_dir_all(&entry.host).map_err(|e| bind_err(e.into()))?;
        }
        fs::create_dir_all(&mount_point).map_err(|e| bind_err(e.into()))?;

        tracing::info!("Binding {} at {}", entry.host.display(), mount_point.display());
        let cmd = Cmd::new("mount")
            .arg("--bind")
            .arg_path(&entry.host)
            .arg_path(&mount_point)
            .id("MOUNT");
        run_checked(self.runner.as_ref(), &cmd).map_err(|e| bind_err(e.into()))?;
        self.bound.push(mount_point);
        Ok(())
    }

    /// Unmount in reverse bind order. Safe to call repeatedly.
    ///
    /// A mount that fails to unmount but is no longer in the mount table
    /// counts as released. A busy mount is detached lazily. Whatever still
    /// fails is reported together and stays recorded as bound.
    pub fn unbind(&mut self) -> Result<(), ChrootError> {
        let mut failed = Vec::new();
        while let Some(mount_point) = self.bound.pop() {
            if !self.unmount_one(&mount_point) {
                failed.push(mount_point);
            }
        }
        if failed.is_empty() {
            return Ok(());
        }
        failed.reverse();
        self.bound = failed.clone();
        Err(ChrootError::Unbind(failed))
    }

    fn unmount_one(&self, mount_point: &Path) -> bool {
        tracing::info!("Unmounting {}", mount_point.display());
        let cmd = Cmd::new("umount").arg_path(mount_point).id("UMOUNT");
        if matches!(run_tool(self.runner.as_ref(), &cmd, false), Ok(true)) {
            return true;
        }
        if !is_mounted(&self.mount_table, mount_point) {
            tracing::debug!("{} is no longer mounted", mount_point.display());
            return true;
        }

        tracing::warn!("{} is busy, trying lazy unmount", mount_point.display());
        let lazy = Cmd::new("umount").arg("-l").arg_path(mount_point).id("UMOUNT");
        if matches!(run_tool(self.runner.as_ref(), &lazy, false), Ok(true)) {
            return true;
        }
        tracing::error!("All unmount attempts failed for {}", mount_point.display());
        false
    }

    /// Refuse while this session holds mounts or anything is mounted beneath the root.
    pub fn mount_safety_check(&self) -> Result<(), ChrootError> {
        if self.is_bound() {
            return Err(ChrootError::StillBound(self.root.clone()));
        }
        if let Some(mount) = mounted_beneath(&self.mount_table, &self.root).into_iter().next() {
            return Err(ChrootError::MountedBeneath {
                mount,
                root: self.root.clone(),
            });
        }
        Ok(())
    }

    /// Empty the chroot tree, keeping the directory.
    pub fn clear_root(&self) -> anyhow::Result<()> {
        self.mount_safety_check()?;
        fileops::clear_dir(&self.root)
    }

    /// Remove the chroot tree entirely.
    pub fn remove_root(&self) -> anyhow::Result<()> {
        self.mount_safety_check()?;
        fileops::remove_path(&self.root)
    }
}

impl Drop for ChrootSession {
    fn drop(&mut self) {
        if self.is_bound() {
            tracing::warn!("{} still bound at teardown, unbinding", self.root.display());
            if let Err(e) = self.unbind() {
                tracing::error!("{}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records argv; fails `mount` for hosts containing `fail_on`.
    #[derive(Default)]
    struct FakeMounts {
        calls: Mutex<Vec<Vec<String>>>,
        fail_on: Option<String>,
        umount_code: i32,
    }

    impl Runner for FakeMounts {
        fn status(&self, cmd: &Cmd) -> std::io::Result<i32> {
            let argv = cmd.argv();
            self.calls.lock().unwrap().push(argv.clone());
            if argv[0] == "mount" {
                if let Some(ref needle) = self.fail_on {
                    if argv.iter().any(|a| a.contains(needle.as_str())) {
                        return Ok(32);
                    }
                }
                return Ok(0);
            }
            Ok(self.umount_code)
        }

        fn capture(&self, cmd: &Cmd) -> std::io::Result<CommandOutput> {
            Ok(CommandOutput {
                code: self.status(cmd)?,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn setup(runner: Arc<FakeMounts>) -> (TempDir, ChrootSession) {
        let temp = TempDir::new().unwrap();
        let host = temp.path().join("host");
        for dir in ["proc", "dev", "distfiles"] {
            fs::create_dir_all(host.join(dir)).unwrap();
        }
        let mut map = MountMap::new();
        map.push("/proc", host.join("proc"));
        map.push("/dev", host.join("dev"));
        map.push("/var/cache/distfiles", host.join("distfiles"));
        let table = temp.path().join("mounts");
        fs::write(&table, "").unwrap();
        let session = ChrootSession::new(&temp.path().join("chroot"), map, runner)
            .with_mount_table(&table);
        (temp, session)
    }

    fn targets(calls: &[Vec<String>], program: &str) -> Vec<String> {
        calls
            .iter()
            .filter(|argv| argv[0] == program)
            .map(|argv| argv.last().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_bind_in_order_unbind_in_reverse() {
        let runner = Arc::new(FakeMounts::default());
        let (_temp, mut session) = setup(runner.clone());
        session.bind().unwrap();
        assert!(session.is_bound());
        assert!(session.root().join("var/cache/distfiles").is_dir());
        session.unbind().unwrap();
        assert!(!session.is_bound());

        let calls = runner.calls.lock().unwrap();
        let root = session.root().to_path_buf();
        let expect: Vec<String> = ["proc", "dev", "var/cache/distfiles"]
            .iter()
            .map(|p| root.join(p).display().to_string())
            .collect();
        assert_eq!(targets(&calls, "mount"), expect);
        let mut reversed = expect.clone();
        reversed.reverse();
        assert_eq!(targets(&calls, "umount"), reversed);
    }

    #[test]
    fn test_unbind_is_idempotent() {
        let runner = Arc::new(FakeMounts::default());
        let (_temp, mut session) = setup(runner.clone());
        session.bind().unwrap();
        session.unbind().unwrap();
        session.unbind().unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(targets(&calls, "umount").len(), 3);
    }

    #[test]
    fn test_failed_bind_unwinds() {
        let runner = Arc::new(FakeMounts {
            fail_on: Some("distfiles".to_string()),
            ..Default::default()
        });
        let (_temp, mut session) = setup(runner.clone());
        let err = session.bind().unwrap_err();
        assert!(matches!(err, ChrootError::Bind { .. }));
        assert!(!session.is_bound());

        let calls = runner.calls.lock().unwrap();
        let root = session.root().to_path_buf();
        assert_eq!(
            targets(&calls, "umount"),
            vec![
                root.join("dev").display().to_string(),
                root.join("proc").display().to_string()
            ]
        );
    }

    #[test]
    fn test_failed_umount_of_unmounted_path_counts_as_released() {
        let runner = Arc::new(FakeMounts {
            umount_code: 32,
            ..Default::default()
        });
        let (_temp, mut session) = setup(runner.clone());
        session.bind().unwrap();
        // The mount table is empty, so nothing is really mounted.
        session.unbind().unwrap();
        assert!(!session.is_bound());
    }

    #[test]
    fn test_stuck_mount_is_reported_and_kept() {
        let runner = Arc::new(FakeMounts {
            umount_code: 32,
            ..Default::default()
        });
        let (temp, mut session) = setup(runner.clone());
        session.bind().unwrap();
        let proc_point = mounts::canonical(&session.root().join("proc"));
        fs::write(
            temp.path().join("mounts"),
            format!("proc {} proc rw 0 0\n", proc_point.display()),
        )
        .unwrap();

        let err = session.unbind().unwrap_err();
        match err {
            ChrootError::Unbind(paths) => assert_eq!(paths.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
        assert!(session.is_bound());
        let calls = runner.calls.lock().unwrap();
        assert!(calls.iter().any(|argv| argv[..2] == ["umount", "-l"]));
        drop(calls);

        // Released once the table no longer lists it.
        fs::write(temp.path().join("mounts"), "").unwrap();
        session.unbind().unwrap();
    }

    #[test]
    fn test_clear_root_refuses_while_bound() {
        let runner = Arc::new(FakeMounts::default());
        let (_temp, mut session) = setup(runner);
        session.bind().unwrap();
        assert!(session.clear_root().is_err());
        assert!(session.root().join("proc").exists());
        session.unbind().unwrap();
        session.clear_root().unwrap();
        assert!(!session.root().join("proc").exists());
    }

    #[test]
    fn test_safety_check_sees_foreign_mounts() {
        let runner = Arc::new(FakeMounts::default());
        let (temp, session) = setup(runner);
        fs::create_dir_all(session.root().join("proc")).unwrap();
        let root = mounts::canonical(session.root());
        fs::write(
            temp.path().join("mounts"),
            format!("proc {}/proc proc rw 0 0\n", root.display()),
        )
        .unwrap();
        assert!(matches!(
            session.mount_safety_check(),
            Err(ChrootError::MountedBeneath { .. })
        ));
        assert!(session.remove_root().is_err());
    }

    #[test]
    fn test_drop_unbinds() {
        let runner = Arc::new(FakeMounts::default());
        let (_temp, mut session) = setup(runner.clone());
        session.bind().unwrap();
        drop(session);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(targets(&calls, "umount").len(), 3);
    }

    #[test]
    fn test_mount_map_replaces_duplicate_targets() {
        let mut map = MountMap::new();
        map.push("/var/cache/distfiles", "/a");
        map.push("/var/cache/distfiles", "/b");
        assert_eq!(map.len(), 1);
        assert_eq!(map.entries()[0].host, PathBuf::from("/b"));
    }
}
