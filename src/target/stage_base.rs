//! Behavior shared by every chroot-based target.
//!
//! Preparation derives the standard paths from `storedir` and the target
//! subpath. [`base_handlers`] registers a body for every [`Step`]; targets
//! start from it and replace the entries they specialize.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use crate::chroot::MountMap;
use crate::compress::{CompressMap, InfoDict};
use crate::config::BuildConfig;
use crate::digest::{self, HashKind};
use crate::fileops;
use crate::pipeline::{BuildContext, HandlerTable, Step};
use crate::store::StoreLayout;

/// Keys every chroot target needs.
pub const BASE_REQUIRED: &[&str] = &[
    "version_stamp",
    "target",
    "subarch",
    "rel_type",
    "profile",
    "snapshot",
    "source_subpath",
];

/// Keys every chroot target accepts.
pub const BASE_VALID: &[&str] = &[
    "target_subpath",
    "chroot_path",
    "portage_confdir",
    "portage_overlay",
    "local_overlay",
    "chost",
    "cbuild",
    "common_flags",
    "cflags",
    "cxxflags",
    "fcflags",
    "fflags",
    "ldflags",
    "makeopts",
    "hostuse",
    "use",
    "controller_file",
    "pkgcache_path",
    "compression_mode",
    "decompression_mode",
    "compressor_arch",
    "digests",
    "contents",
];

/// In-chroot paths removed by `clean`.
pub const CLEANABLES: &[&str] = &["/etc/resolv.conf", "/var/tmp/*", "/tmp/*", "/root/*"];

pub fn required(extra: &[&str]) -> Vec<String> {
    BASE_REQUIRED
        .iter()
        .chain(extra.iter())
        .map(|s| s.to_string())
        .collect()
}

/// Base valid keys plus `<prefix>/<key>` for each of `prefixed`.
pub fn valid(prefix: &str, prefixed: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = BASE_VALID.iter().map(|s| s.to_string()).collect();
    out.extend(prefixed.iter().map(|k| format!("{prefix}/{k}")));
    out
}

/// `base` itself when it is a directory seed, otherwise the first
/// `base.<ext>` that exists for any known extension. Falls back to `base`.
pub fn resolve_seed(base: &Path, decompressor: &CompressMap) -> PathBuf {
    if base.is_dir() {
        return base.to_path_buf();
    }
    for ext in decompressor.all_extensions() {
        let mut candidate = base.as_os_str().to_os_string();
        candidate.push(decompressor.separator());
        candidate.push(&ext);
        let candidate = PathBuf::from(candidate);
        if candidate.is_file() {
            return candidate;
        }
    }
    base.to_path_buf()
}

fn set_path_default(config: &mut BuildConfig, key: &str, value: &Path) {
    if !config.contains(key) {
        config.set_path(key, value);
    }
}

/// Derive the shared stage settings.
pub fn prepare(
    config: &mut BuildConfig,
    store: &StoreLayout,
    decompressor: &CompressMap,
    target_name: &str,
    prefix: &str,
) -> Result<()> {
    config.set_str("spec_prefix", prefix);

    if !config.contains("target_subpath") {
        let subpath = format!(
            "{}/{}-{}-{}",
            config.require_str("rel_type")?,
            target_name,
            config.require_str("subarch")?,
            config.require_str("version_stamp")?
        );
        config.set_str("target_subpath", subpath);
    }
    let subpath = config.require_str("target_subpath")?.to_string();

    set_path_default(config, "target_path", &store.builds_dir().join(&subpath));
    set_path_default(config, "chroot_path", &store.tmp_dir().join(&subpath));
    let chroot = config.require_path("chroot_path")?;
    set_path_default(config, "stage_path", &chroot);

    let source_base = store.builds_dir().join(config.require_str("source_subpath")?);
    config.set_path("source_path", &resolve_seed(&source_base, decompressor));

    let snapshot_base = store.snapshots_dir().join(format!(
        "{}{}",
        config.get_str("snapshot_name").unwrap_or(""),
        config.require_str("snapshot")?
    ));
    config.set_path("snapshot_path", &resolve_seed(&snapshot_base, decompressor));

    if !config.contains("controller_file") {
        let sharedir = config.require_path("sharedir")?;
        config.set_path(
            "controller_file",
            &sharedir.join("targets").join(target_name).join("controller.sh"),
        );
    }
    set_path_default(
        config,
        "pkgcache_path",
        &store.root().join("packages").join(&subpath),
    );
    config.set_default("local_overlay", "/var/db/repos/local");
    config.set_default("repo_basedir", "/var/db/repos");
    config.set_default("target_distdir", "/var/cache/distfiles");
    config.set_default("target_pkgdir", "/var/cache/binpkgs");

    let hostuse = config.list("hostuse").to_vec();
    config.append_list("use", hostuse);
    let prefixed_use = config.list(&format!("{prefix}/use")).to_vec();
    config.append_list("use", prefixed_use);

    config.append_list("cleanables", CLEANABLES.iter().copied());
    Ok(())
}

/// `/proc`, `/dev`, `/dev/pts`, `/sys`, distfiles and, with `pkgcache`, the
/// binary package cache.
pub fn default_mounts(config: &BuildConfig) -> MountMap {
    let mut map = MountMap::new();
    for fs in ["/proc", "/dev", "/dev/pts", "/sys"] {
        map.push(fs, fs);
    }
    if let Some(distdir) = config.get_str("distdir") {
        let inner = config
            .get_str("target_distdir")
            .unwrap_or("/var/cache/distfiles");
        map.push(inner, distdir);
    }
    if config.has_option("pkgcache") {
        if let Some(pkgcache) = config.get_str("pkgcache_path") {
            let inner = config.get_str("target_pkgdir").unwrap_or("/var/cache/binpkgs");
            map.push(inner, pkgcache);
        }
    }
    map
}

/// A body for every step. Steps a stage does nothing for are no-ops.
pub fn base_handlers() -> HandlerTable {
    HandlerTable::new()
        .with(Step::Purge, purge)
        .with(Step::SetupTargetPath, setup_target_path)
        .with(Step::Unpack, unpack)
        .with(Step::UnpackSnapshot, unpack_snapshot)
        .with(Step::LinkProfile, link_profile)
        .with(Step::SetupConfigDir, setup_config_dir)
        .with(Step::OverlayRepository, overlay_repository)
        .with(Step::Bind, bind)
        .with(Step::ChrootSetup, chroot_setup)
        .with(Step::SetupEnvironment, setup_environment)
        .with(Step::RunLocalPayload, run_local_payload)
        .with(Step::Unbind, unbind)
        .with(Step::BuildPackages, build_packages)
        .with(Step::BuildKernel, build_kernel)
        .with(Step::Bootloader, bootloader)
        .with(Step::Preclean, preclean)
        .with(Step::UpdateLiveImage, update_live_image)
        .with(Step::RootOverlay, root_overlay)
        .with(Step::RunFsScript, run_fs_script)
        .with(Step::UpdateInitScripts, update_init_scripts)
        .with(Step::UnmergePackages, unmerge_packages)
        .with(Step::RemovePaths, remove_paths)
        .with(Step::EmptyExcludedPaths, empty_excluded_paths)
        .with(Step::Clean, clean)
        .with(Step::TargetSetup, target_setup)
        .with(Step::SetupOverlay, setup_overlay)
        .with(Step::CreateIso, create_iso)
        .with(Step::SyncRepository, nothing_to_do)
        .with(Step::Capture, capture)
        .with(Step::GenerateDigests, generate_digests)
        .with(Step::ClearResume, clear_resume)
}

/// Base sequence prefix shared by the chroot targets, up to `setup-environment`.
pub const PREPARE_CHROOT: &[Step] = &[
    Step::SetupTargetPath,
    Step::Unpack,
    Step::UnpackSnapshot,
    Step::LinkProfile,
    Step::SetupConfigDir,
    Step::OverlayRepository,
    Step::Bind,
    Step::ChrootSetup,
    Step::SetupEnvironment,
];

/// `purgeonly` replaces the whole sequence; `purge` runs first.
pub fn with_purge(config: &BuildConfig, steps: Vec<Step>) -> Vec<Step> {
    if config.has_option("purgeonly") {
        return vec![Step::Purge, Step::ClearResume];
    }
    if config.has_option("purge") {
        let mut out = vec![Step::Purge];
        out.extend(steps);
        return out;
    }
    steps
}

fn prefixed(ctx: &BuildContext, key: &str) -> String {
    let prefix = ctx
        .config
        .get_str("spec_prefix")
        .or_else(|| ctx.config.get_str("target"))
        .unwrap_or("stage");
    format!("{prefix}/{key}")
}

fn prefixed_list(ctx: &BuildContext, key: &str) -> Vec<String> {
    ctx.config.list(&prefixed(ctx, key)).to_vec()
}

/// Path with a trailing slash, so rsync copies a directory's contents.
pub fn dir_arg(path: &Path) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_os_string();
    if !s.to_string_lossy().ends_with('/') {
        s.push("/");
    }
    PathBuf::from(s)
}

fn rsync_into(ctx: &BuildContext, source: &Path, destination: &Path) -> Result<()> {
    if !source.is_dir() {
        bail!("'{}' is not a directory", source.display());
    }
    fileops::ensure_dir(destination)?;
    let ok = ctx
        .compressor
        .rsync(&dir_arg(source), &dir_arg(destination), true)?;
    if !ok {
        bail!(
            "syncing '{}' into '{}' failed",
            source.display(),
            destination.display()
        );
    }
    Ok(())
}

fn in_chroot(ctx: &BuildContext, inner: &str) -> Result<PathBuf> {
    fileops::chroot_join(ctx.chroot.root(), inner)
}

fn nothing_to_do(_ctx: &mut BuildContext) -> Result<()> {
    Ok(())
}

/// Remove the chroot and every resume point.
pub fn purge(ctx: &mut BuildContext) -> Result<()> {
    tracing::info!("Purging {}", ctx.chroot.root().display());
    ctx.chroot
        .remove_root()
        .with_context(|| format!("purging chroot '{}'", ctx.chroot.root().display()))?;
    ctx.resume.clear()?;
    Ok(())
}

/// Make sure the artifact can be written: parent directory present, stale
/// artifact and companions gone.
pub fn setup_target_path(ctx: &mut BuildContext) -> Result<()> {
    let target = ctx.path("target_path")?;
    if let Some(parent) = target.parent() {
        fileops::ensure_dir(parent)?;
    }
    let artifact = artifact_path(ctx, "target_path")?;
    if artifact.is_file() {
        tracing::info!("Removing previous artifact {}", artifact.display());
        fileops::remove_path(&artifact)?;
        digest::remove_companions(&artifact)?;
    }
    Ok(())
}

/// Start the target directory empty. Mounts are released first since a
/// target may bind its own output directory.
pub fn recreate_target_dir(ctx: &mut BuildContext) -> Result<()> {
    if ctx.chroot.is_bound() {
        ctx.chroot.unbind()?;
    }
    let target = ctx.path("target_path")?;
    fileops::clear_dir(&target)
        .with_context(|| format!("recreating target directory '{}'", target.display()))?;
    Ok(())
}

fn unpack_mode(ctx: &BuildContext, source: &Path) -> Option<String> {
    match ctx.config.get_str("decompression_mode") {
        None | Some("auto") => None,
        Some(preferred) => ctx
            .decompressor
            .best_mode(preferred, &source.to_string_lossy()),
    }
}

fn extract_into(ctx: &BuildContext, source: &Path, destination: &Path) -> Result<()> {
    let mut info = InfoDict::new().source(source).destination(destination);
    if let Some(mode) = unpack_mode(ctx, source) {
        info = info.mode(mode);
    }
    if !ctx.decompressor.extract(Some(info), true)? {
        bail!(
            "could not unpack '{}' into '{}'",
            source.display(),
            destination.display()
        );
    }
    Ok(())
}

/// Unpack the seed into a freshly cleared chroot.
pub fn unpack(ctx: &mut BuildContext) -> Result<()> {
    let source = ctx.path("source_path")?;
    if !source.exists() {
        bail!("seed '{}' not found", source.display());
    }
    let chroot = ctx.chroot.root().to_path_buf();
    ctx.chroot
        .clear_root()
        .with_context(|| format!("clearing chroot '{}'", chroot.display()))?;

    tracing::info!("Unpacking {} into {}", source.display(), chroot.display());
    if source.is_dir() {
        rsync_into(ctx, &source, &chroot)
    } else {
        extract_into(ctx, &source, &chroot)
    }
}

/// Replace the repository inside the chroot with the configured snapshot.
pub fn unpack_snapshot(ctx: &mut BuildContext) -> Result<()> {
    let snapshot = ctx.path("snapshot_path")?;
    if !snapshot.exists() {
        bail!("snapshot '{}' not found", snapshot.display());
    }
    let repo_basedir = ctx.config.require_str("repo_basedir")?.to_string();
    let basedir = in_chroot(ctx, &repo_basedir)?;
    let repo = basedir.join(ctx.config.require_str("repo_name")?);
    fileops::remove_path(&repo)?;
    fileops::ensure_dir(&basedir)?;

    tracing::info!("Unpacking snapshot {} into {}", snapshot.display(), basedir.display());
    if snapshot.is_dir() {
        rsync_into(ctx, &snapshot, &repo)
    } else {
        extract_into(ctx, &snapshot, &basedir)
    }
}

/// Point `/etc/portage/make.profile` at the configured profile.
pub fn link_profile(ctx: &mut BuildContext) -> Result<()> {
    let profile = ctx.config.require_str("profile")?;
    let link = in_chroot(ctx, "/etc/portage/make.profile")?;
    if let Some(parent) = link.parent() {
        fileops::ensure_dir(parent)?;
    }
    fileops::remove_path(&link)?;

    let repo_basedir = ctx.config.require_str("repo_basedir")?.trim_matches('/');
    let repo_name = ctx.config.require_str("repo_name")?;
    let target = format!("../../{repo_basedir}/{repo_name}/profiles/{profile}");
    symlink(&target, &link)
        .with_context(|| format!("linking '{}' -> '{}'", link.display(), target))?;
    Ok(())
}

/// Copy `portage_confdir` over `/etc/portage`.
pub fn setup_config_dir(ctx: &mut BuildContext) -> Result<()> {
    let Some(confdir) = ctx.config.get_path("portage_confdir") else {
        return Ok(());
    };
    let dest = in_chroot(ctx, "/etc/portage")?;
    rsync_into(ctx, &confdir, &dest)
}

/// Copy each `portage_overlay` into the local overlay location.
pub fn overlay_repository(ctx: &mut BuildContext) -> Result<()> {
    let overlays = ctx.config.list("portage_overlay").to_vec();
    if overlays.is_empty() {
        return Ok(());
    }
    let local_overlay = ctx.config.require_str("local_overlay")?.to_string();
    let dest = in_chroot(ctx, &local_overlay)?;
    for overlay in overlays {
        rsync_into(ctx, Path::new(&overlay), &dest)?;
    }
    Ok(())
}

pub fn bind(ctx: &mut BuildContext) -> Result<()> {
    ctx.chroot.bind()?;
    Ok(())
}

pub fn unbind(ctx: &mut BuildContext) -> Result<()> {
    ctx.chroot.unbind()?;
    Ok(())
}

/// `make.conf` contents for the chroot.
pub fn render_make_conf(config: &BuildConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Generated by stage-builder for {}.",
        config.get_str("target_subpath").unwrap_or("this build")
    );
    let _ = writeln!(out, "# Changes are lost on the next build.");
    for (key, var) in [
        ("common_flags", "COMMON_FLAGS"),
        ("cflags", "CFLAGS"),
        ("cxxflags", "CXXFLAGS"),
        ("fcflags", "FCFLAGS"),
        ("fflags", "FFLAGS"),
        ("ldflags", "LDFLAGS"),
        ("cbuild", "CBUILD"),
        ("chost", "CHOST"),
        ("makeopts", "MAKEOPTS"),
    ] {
        if let Some(value) = config.get_str(key) {
            let _ = writeln!(out, "{var}=\"{value}\"");
        }
    }
    let use_flags = config.list("use");
    if !use_flags.is_empty() {
        let _ = writeln!(out, "USE=\"{}\"", use_flags.join(" "));
    }
    let _ = writeln!(
        out,
        "DISTDIR=\"{}\"",
        config.get_str("target_distdir").unwrap_or("/var/cache/distfiles")
    );
    let _ = writeln!(
        out,
        "PKGDIR=\"{}\"",
        config.get_str("target_pkgdir").unwrap_or("/var/cache/binpkgs")
    );
    out
}

/// Host DNS configuration and a generated `make.conf`.
pub fn chroot_setup(ctx: &mut BuildContext) -> Result<()> {
    let resolv = ctx
        .config
        .get_path("resolv_conf")
        .unwrap_or_else(|| PathBuf::from("/etc/resolv.conf"));
    if resolv.is_file() {
        let dest = in_chroot(ctx, "/etc/resolv.conf")?;
        if let Some(parent) = dest.parent() {
            fileops::ensure_dir(parent)?;
        }
        fileops::remove_path(&dest)?;
        fs::copy(&resolv, &dest)
            .with_context(|| format!("copying '{}' into the chroot", resolv.display()))?;
    } else {
        tracing::warn!("{} not found, chroot has no DNS configuration", resolv.display());
    }

    let make_conf = in_chroot(ctx, "/etc/portage/make.conf")?;
    if let Some(parent) = make_conf.parent() {
        fileops::ensure_dir(parent)?;
    }
    fs::write(&make_conf, render_make_conf(&ctx.config))
        .with_context(|| format!("writing '{}'", make_conf.display()))?;
    Ok(())
}

/// Capture the controller environment for the steps that follow.
pub fn setup_environment(ctx: &mut BuildContext) -> Result<()> {
    ctx.env = ctx.config.controller_env();
    tracing::debug!("exported {} variables to the controller", ctx.env.len());
    Ok(())
}

pub fn run_local_payload(ctx: &mut BuildContext) -> Result<()> {
    ctx.run_controller("run", &[])
}

pub fn build_packages(ctx: &mut BuildContext) -> Result<()> {
    let packages = prefixed_list(ctx, "packages");
    if packages.is_empty() {
        tracing::info!("no packages to build");
        return Ok(());
    }
    ctx.run_controller("build_packages", &packages)
}

/// `pre-kmerge` once, then `kernel <name>` per entry of `boot/kernel`.
/// A kernel's `config` file is staged at `/var/tmp/<name>.config`.
pub fn build_kernel(ctx: &mut BuildContext) -> Result<()> {
    let kernels = ctx.config.list("boot/kernel").to_vec();
    if kernels.is_empty() {
        tracing::info!("no kernels configured");
        return Ok(());
    }
    ctx.run_controller("pre-kmerge", &[])?;
    for kernel in kernels {
        if let Some(config) = ctx.config.get_path(&format!("boot/kernel/{kernel}/config")) {
            let dest = in_chroot(ctx, &format!("/var/tmp/{kernel}.config"))?;
            if let Some(parent) = dest.parent() {
                fileops::ensure_dir(parent)?;
            }
            fs::copy(&config, &dest).with_context(|| {
                format!("staging kernel config '{}'", config.display())
            })?;
        }
        let mut env = BTreeMap::new();
        env.insert("clst_kname".to_string(), kernel.clone());
        ctx.run_controller_with("kernel", &[kernel], &env)?;
    }
    Ok(())
}

pub fn bootloader(ctx: &mut BuildContext) -> Result<()> {
    let target = ctx.path("target_path")?;
    ctx.run_controller("bootloader", &[target.to_string_lossy().into_owned()])
}

pub fn preclean(ctx: &mut BuildContext) -> Result<()> {
    ctx.run_controller("preclean", &[])
}

pub fn update_live_image(ctx: &mut BuildContext) -> Result<()> {
    ctx.run_controller("livecd-update", &[])
}

/// Copy each `<prefix>/root_overlay` over the chroot root.
pub fn root_overlay(ctx: &mut BuildContext) -> Result<()> {
    let chroot = ctx.chroot.root().to_path_buf();
    for overlay in prefixed_list(ctx, "root_overlay") {
        rsync_into(ctx, Path::new(&overlay), &chroot)?;
    }
    Ok(())
}

pub fn run_fs_script(ctx: &mut BuildContext) -> Result<()> {
    if ctx.config.get_str(&prefixed(ctx, "fsscript")).is_none() {
        return Ok(());
    }
    ctx.run_controller("fsscript", &[])
}

pub fn update_init_scripts(ctx: &mut BuildContext) -> Result<()> {
    if prefixed_list(ctx, "rcadd").is_empty() && prefixed_list(ctx, "rcdel").is_empty() {
        return Ok(());
    }
    ctx.run_controller("rc-update", &[])
}

pub fn unmerge_packages(ctx: &mut BuildContext) -> Result<()> {
    let packages = prefixed_list(ctx, "unmerge");
    if packages.is_empty() {
        return Ok(());
    }
    ctx.run_controller("unmerge", &packages)
}

/// Delete `<prefix>/rm` patterns from the stage tree.
pub fn remove_paths(ctx: &mut BuildContext) -> Result<()> {
    let patterns = prefixed_list(ctx, "rm");
    if patterns.is_empty() {
        return Ok(());
    }
    ctx.chroot.mount_safety_check()?;
    let removed = fileops::remove_in_chroot(&ctx.path("stage_path")?, &patterns)?;
    tracing::info!("removed {} paths", removed);
    Ok(())
}

/// Empty `<prefix>/empty` directories, keeping their owner and mode.
pub fn empty_excluded_paths(ctx: &mut BuildContext) -> Result<()> {
    let patterns = prefixed_list(ctx, "empty");
    if patterns.is_empty() {
        return Ok(());
    }
    ctx.chroot.mount_safety_check()?;
    let emptied = fileops::empty_in_chroot(&ctx.path("stage_path")?, &patterns)?;
    tracing::info!("emptied {} directories", emptied);
    Ok(())
}

/// Remove `cleanables` from the stage tree, then run the controller's `clean`.
pub fn clean(ctx: &mut BuildContext) -> Result<()> {
    ctx.chroot.mount_safety_check()?;
    let stage = ctx.path("stage_path")?;
    let cleanables = ctx.config.list("cleanables").to_vec();
    let removed = fileops::remove_in_chroot(&stage, &cleanables)?;
    tracing::debug!("cleaned {} paths from {}", removed, stage.display());
    ctx.run_controller("clean", &[])
}

pub fn target_setup(ctx: &mut BuildContext) -> Result<()> {
    let target = ctx.path("target_path")?;
    ctx.run_controller("target_image_setup", &[target.to_string_lossy().into_owned()])
}

/// Copy each `<prefix>/overlay` into the target directory.
pub fn setup_overlay(ctx: &mut BuildContext) -> Result<()> {
    let target = ctx.path("target_path")?;
    for overlay in prefixed_list(ctx, "overlay") {
        rsync_into(ctx, Path::new(&overlay), &target)?;
    }
    Ok(())
}

/// Have the controller master `<prefix>/iso`, then write its companions.
pub fn create_iso(ctx: &mut BuildContext) -> Result<()> {
    let Some(iso) = ctx.config.get_path(&prefixed(ctx, "iso")) else {
        tracing::warn!("{} not set, skipping image creation", prefixed(ctx, "iso"));
        return Ok(());
    };
    if let Some(parent) = iso.parent() {
        fileops::ensure_dir(parent)?;
    }
    ctx.run_controller("iso", &[iso.to_string_lossy().into_owned()])?;
    digest_artifact(ctx, &iso, true)
}

/// Where `capture` writes: `<base>` plus the compression mode's extension,
/// unless `artifact_path` is configured.
pub fn artifact_path(ctx: &BuildContext, base_key: &str) -> Result<PathBuf> {
    if let Some(path) = ctx.config.get_path("artifact_path") {
        return Ok(path);
    }
    let base = ctx.path(base_key)?;
    let mode = ctx.compressor.default_mode();
    let mut name = base.into_os_string();
    if let Some(ext) = ctx.compressor.extension(mode) {
        name.push(ctx.compressor.separator());
        name.push(ext);
    }
    Ok(PathBuf::from(name))
}

/// Source and base directory for archiving `relative` under `basedir`.
/// Modes without a `{basedir}` template get the joined full path.
pub fn capture_info(ctx: &BuildContext, basedir: &Path, relative: &str) -> InfoDict {
    if ctx.compressor.uses_basedir(ctx.compressor.default_mode()) {
        InfoDict::new().source(relative).basedir(basedir)
    } else if relative == "." {
        InfoDict::new().source(basedir).basedir(basedir)
    } else {
        InfoDict::new().source(basedir.join(relative)).basedir(basedir)
    }
}

/// Compress `stage_path` into the target artifact.
pub fn capture(ctx: &mut BuildContext) -> Result<()> {
    let stage = ctx.path("stage_path")?;
    let target = ctx.path("target_path")?;
    if let Some(parent) = target.parent() {
        fileops::ensure_dir(parent)?;
    }
    let mut info = capture_info(ctx, &stage, ".")
        .filename(&target)
        .destination(artifact_path(ctx, "target_path")?)
        .mode(ctx.compressor.default_mode())
        .auto_extension(true);
    if let Some(arch) = ctx.config.get_str("compressor_arch") {
        info = info.arch(arch);
    }
    tracing::info!("Capturing {} into {}", stage.display(), target.display());
    if !ctx.compressor.compress(Some(info), true)? {
        bail!("capturing '{}' failed", stage.display());
    }
    Ok(())
}

/// Hash functions from `digests`, or `hash_function` when unset.
pub fn digest_kinds(config: &BuildConfig) -> Result<Vec<HashKind>> {
    let names = config.list("digests");
    if names.is_empty() {
        let name = config.get_str("hash_function").unwrap_or("sha512");
        return Ok(vec![HashKind::parse(name)?]);
    }
    names.iter().map(|n| HashKind::parse(n)).collect()
}

/// Contents listings are on unless `contents` says `none`.
pub fn contents_enabled(config: &BuildConfig) -> bool {
    !config.list("contents").iter().any(|c| c == "none")
}

/// Write `.DIGESTS` (and `.CONTENTS` when `with_contents`) beside `artifact`.
pub fn digest_artifact(ctx: &BuildContext, artifact: &Path, with_contents: bool) -> Result<()> {
    let hashes = digest_kinds(&ctx.config)?;
    let contents = with_contents && contents_enabled(&ctx.config);
    digest::generate(ctx.runner.as_ref(), artifact, &hashes, contents)
}

pub fn generate_digests(ctx: &mut BuildContext) -> Result<()> {
    let artifact = artifact_path(ctx, "target_path")?;
    digest_artifact(ctx, &artifact, true)
}

pub fn clear_resume(ctx: &mut BuildContext) -> Result<()> {
    ctx.resume.clear()
}
