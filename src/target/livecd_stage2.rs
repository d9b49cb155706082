//! Live media stage2: kernel, bootloader and image mastering on top of a
//! live stage1.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;

use super::stage_base::{self, PREPARE_CHROOT};
use super::{Target, TargetKind};
use crate::chroot::MountMap;
use crate::compress::CompressMap;
use crate::config::BuildConfig;
use crate::fileops;
use crate::pipeline::{BuildContext, HandlerTable, Step};
use crate::store::StoreLayout;

pub const DEFAULT_LIVECD_TYPE: &str = "generic-livecd";
pub const BLACKLIST_CONF: &str = "/etc/modprobe.d/blacklist.conf";
pub const BLACKLIST_MARKER: &str = "#Added by stage-builder:";

const LIVECD_KEYS: &[&str] = &[
    "cdtar",
    "empty",
    "rm",
    "unmerge",
    "iso",
    "gk_mainargs",
    "type",
    "readme",
    "motd",
    "overlay",
    "modblacklist",
    "splash_theme",
    "rcadd",
    "rcdel",
    "fsscript",
    "xinitrc",
    "root_overlay",
    "users",
    "fstype",
    "fsops",
    "linuxrc",
    "bootargs",
    "xdm",
    "xsession",
    "volid",
    "verify",
];

pub struct LivecdStage2;

impl Target for LivecdStage2 {
    fn kind(&self) -> TargetKind {
        TargetKind::LivecdStage2
    }

    fn required_keys(&self, _config: &BuildConfig) -> Vec<String> {
        stage_base::required(&["boot/kernel"])
    }

    fn valid_keys(&self) -> Vec<String> {
        let mut keys = stage_base::valid("livecd", LIVECD_KEYS);
        keys.extend(
            [
                "boot/kernel",
                "boot/kernel/*/config",
                "boot/kernel/*/sources",
                "boot/kernel/*/packages",
                "boot/kernel/*/use",
                "boot/kernel/*/extraversion",
                "boot/kernel/*/gk_kernargs",
            ]
            .map(String::from),
        );
        keys
    }

    fn prepare(
        &self,
        config: &mut BuildConfig,
        store: &StoreLayout,
        decompressor: &CompressMap,
    ) -> Result<()> {
        stage_base::prepare(config, store, decompressor, "livecd-stage2", "livecd")?;
        config.set_default("livecd/type", DEFAULT_LIVECD_TYPE);
        Ok(())
    }

    fn action_sequence(&self, config: &BuildConfig) -> Vec<Step> {
        let mut steps = PREPARE_CHROOT.to_vec();
        steps.extend([Step::RunLocalPayload, Step::BuildKernel]);
        if !config.has_option("fetch") {
            steps.extend([
                Step::Bootloader,
                Step::Preclean,
                Step::UpdateLiveImage,
                Step::RootOverlay,
                Step::RunFsScript,
                Step::UpdateInitScripts,
                Step::UnmergePackages,
                Step::Unbind,
                Step::RemovePaths,
                Step::EmptyExcludedPaths,
                Step::Clean,
                Step::TargetSetup,
                Step::SetupOverlay,
                Step::CreateIso,
            ]);
        }
        steps.push(Step::ClearResume);
        stage_base::with_purge(config, steps)
    }

    fn handlers(&self) -> HandlerTable {
        stage_base::base_handlers()
            .with(Step::SetupTargetPath, stage_base::recreate_target_dir)
            .with(Step::RunLocalPayload, blacklist_modules)
    }

    fn mounts(&self, config: &BuildConfig) -> MountMap {
        stage_base::default_mounts(config)
    }
}

/// Append a `blacklist` line per `livecd/modblacklist` entry to the chroot's
/// modprobe configuration.
pub fn blacklist_modules(ctx: &mut BuildContext) -> Result<()> {
    let modules = ctx.config.list("livecd/modblacklist").to_vec();
    if modules.is_empty() {
        return Ok(());
    }
    let path = fileops::chroot_join(ctx.chroot.root(), BLACKLIST_CONF)?;
    if let Some(parent) = path.parent() {
        fileops::ensure_dir(parent)?;
    }

    let mut text = format!("\n{BLACKLIST_MARKER}");
    for module in &modules {
        text.push_str("\nblacklist ");
        text.push_str(module);
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!("Blacklisted {} modules", modules.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_stops_after_kernel() {
        let mut config = BuildConfig::new();
        let full = LivecdStage2.action_sequence(&config);
        assert!(full.contains(&Step::CreateIso));
        assert_eq!(full.last(), Some(&Step::ClearResume));

        config.add_option("fetch");
        let fetch = LivecdStage2.action_sequence(&config);
        assert_eq!(
            &fetch[fetch.len() - 3..],
            &[Step::RunLocalPayload, Step::BuildKernel, Step::ClearResume]
        );
        assert!(!fetch.contains(&Step::Unbind));
    }

    #[test]
    fn test_kernel_keys_are_valid() {
        let mut config = BuildConfig::new();
        for (k, v) in [
            ("version_stamp", "1"),
            ("target", "livecd-stage2"),
            ("subarch", "amd64"),
            ("rel_type", "default"),
            ("profile", "p"),
            ("snapshot", "s"),
            ("source_subpath", "x"),
        ] {
            config.set_str(k, v);
        }
        config.apply_override("boot/kernel", "gentoo").unwrap();
        config
            .apply_override("boot/kernel/gentoo/config", "/etc/kernels/gentoo.config")
            .unwrap();
        config.apply_override("livecd/iso", "/srv/live.iso").unwrap();
        config
            .validate(
                &LivecdStage2.required_keys(&config),
                &LivecdStage2.valid_keys(),
            )
            .unwrap();
        assert_eq!(config.list("boot/kernel"), &["gentoo"]);
    }
}
