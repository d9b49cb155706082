//! Repository snapshots. No chroot: the repository is mirrored into a
//! scratch directory and archived from there.

use anyhow::{bail, Context, Result};

use super::stage_base;
use super::{Target, TargetKind};
use crate::chroot::MountMap;
use crate::compress::CompressMap;
use crate::config::BuildConfig;
use crate::fileops;
use crate::pipeline::{BuildContext, HandlerTable, Step};
use crate::process::{run_checked, Cmd};
use crate::store::StoreLayout;

/// Excluded from the mirrored repository.
pub const RSYNC_EXCLUDES: &[&str] = &[
    "/packages/",
    "/distfiles/",
    "/local/",
    "CVS/",
    ".svn",
    ".git/",
    ".hg/",
];

pub struct Snapshot;

impl Target for Snapshot {
    fn kind(&self) -> TargetKind {
        TargetKind::Snapshot
    }

    fn required_keys(&self, _config: &BuildConfig) -> Vec<String> {
        vec!["version_stamp".to_string(), "target".to_string()]
    }

    fn valid_keys(&self) -> Vec<String> {
        [
            "compression_mode",
            "portdir",
            "repo_name",
            "snapshot_name",
            "digests",
            "contents",
        ]
        .map(String::from)
        .to_vec()
    }

    fn prepare(
        &self,
        config: &mut BuildConfig,
        store: &StoreLayout,
        _decompressor: &CompressMap,
    ) -> Result<()> {
        let repo_name = config.require_str("repo_name")?.to_string();
        let subpath = format!("{repo_name}-snapshot");
        let tmp_path = store.tmp_dir().join(&subpath);
        let snapshot_path = store.snapshots_dir().join(format!(
            "{}{}",
            config.get_str("snapshot_name").unwrap_or(""),
            config.require_str("version_stamp")?
        ));
        config.set_str("target_subpath", subpath);
        config.set_path("tmp_path", &tmp_path);
        config.set_path("chroot_path", &tmp_path);
        config.set_path("snapshot_path", &snapshot_path);
        Ok(())
    }

    fn action_sequence(&self, config: &BuildConfig) -> Vec<Step> {
        stage_base::with_purge(
            config,
            vec![
                Step::SyncRepository,
                Step::Capture,
                Step::GenerateDigests,
                Step::ClearResume,
            ],
        )
    }

    fn handlers(&self) -> HandlerTable {
        stage_base::base_handlers()
            .with(Step::Purge, purge_scratch)
            .with(Step::SyncRepository, sync_repository)
            .with(Step::Capture, capture_snapshot)
            .with(Step::GenerateDigests, digest_snapshot)
    }

    fn mounts(&self, _config: &BuildConfig) -> MountMap {
        MountMap::new()
    }
}

/// Empty the scratch directory, keeping its owner and mode.
pub fn purge_scratch(ctx: &mut BuildContext) -> Result<()> {
    let tmp = ctx.path("tmp_path")?;
    if tmp.is_dir() {
        tracing::info!("Emptying directory {}", tmp.display());
        fileops::reset_dir(&tmp)?;
    }
    ctx.resume.clear()
}

/// The rsync invocation mirroring `portdir` into the scratch tree.
pub fn sync_command(ctx: &BuildContext) -> Result<Cmd> {
    let portdir = ctx.path("portdir")?;
    let dest = ctx
        .path("tmp_path")?
        .join(ctx.config.require_str("repo_name")?);
    let mut cmd = Cmd::new("rsync").args(["-a", "--delete"]);
    for exclude in RSYNC_EXCLUDES {
        cmd = cmd.arg("--exclude").arg(exclude);
    }
    Ok(cmd
        .arg("--filter=H_**/files/digest-*")
        .arg_path(&stage_base::dir_arg(&portdir))
        .arg_path(&stage_base::dir_arg(&dest))
        .envs(ctx.config.env())
        .id("RSYNC"))
}

pub fn sync_repository(ctx: &mut BuildContext) -> Result<()> {
    let portdir = ctx.path("portdir")?;
    if !portdir.is_dir() {
        bail!("repository '{}' does not exist", portdir.display());
    }
    fileops::ensure_dir(&ctx.path("tmp_path")?)?;
    fileops::ensure_dir(&ctx.store.snapshots_dir())?;

    tracing::info!(
        "Creating {} snapshot {} from {}",
        ctx.config.require_str("repo_name")?,
        ctx.config.require_str("version_stamp")?,
        portdir.display()
    );
    let cmd = sync_command(ctx)?;
    run_checked(ctx.runner.as_ref(), &cmd).context("Snapshot failure")?;
    Ok(())
}

pub fn capture_snapshot(ctx: &mut BuildContext) -> Result<()> {
    let snapshot = ctx.path("snapshot_path")?;
    let repo = ctx.config.require_str("repo_name")?.to_string();
    let info = stage_base::capture_info(ctx, &ctx.path("tmp_path")?, &repo)
        .destination(stage_base::artifact_path(ctx, "snapshot_path")?)
        .filename(&snapshot)
        .mode(ctx.compressor.default_mode())
        .auto_extension(true);
    tracing::info!("Compressing snapshot into {}", snapshot.display());
    if !ctx.compressor.compress(Some(info), true)? {
        bail!("snapshot compression failed");
    }
    Ok(())
}

pub fn digest_snapshot(ctx: &mut BuildContext) -> Result<()> {
    let artifact = stage_base::artifact_path(ctx, "snapshot_path")?;
    stage_base::digest_artifact(ctx, &artifact, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::DefinitionTable;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_paths() {
        let temp = TempDir::new().unwrap();
        let store = StoreLayout::open(temp.path()).unwrap();
        let decompressor =
            CompressMap::new(DefinitionTable::decompression(), BTreeMap::new(), None);
        let mut config = BuildConfig::new();
        config.set_str("version_stamp", "20240101");
        config.set_str("repo_name", "gentoo");
        config.set_str("snapshot_name", "gentoo-");

        Snapshot.prepare(&mut config, &store, &decompressor).unwrap();
        assert_eq!(
            config.get_path("tmp_path").unwrap(),
            store.tmp_dir().join("gentoo-snapshot")
        );
        assert_eq!(
            config.get_path("snapshot_path").unwrap(),
            store.snapshots_dir().join("gentoo-20240101")
        );
        assert_eq!(Snapshot.target_key(&config).unwrap(), "gentoo-snapshot");
    }

    #[test]
    fn test_purge_sequences() {
        let mut config = BuildConfig::new();
        assert_eq!(
            Snapshot.action_sequence(&config),
            vec![
                Step::SyncRepository,
                Step::Capture,
                Step::GenerateDigests,
                Step::ClearResume
            ]
        );
        config.add_option("purgeonly");
        assert_eq!(
            Snapshot.action_sequence(&config),
            vec![Step::Purge, Step::ClearResume]
        );
    }

    #[test]
    fn test_no_mounts() {
        assert!(Snapshot.mounts(&BuildConfig::new()).is_empty());
    }
}
