//! Build targets.
//!
//! Each target declares the keys it needs, derives its paths, orders its
//! steps and overrides the step bodies that differ from the shared stage
//! behavior in [`stage_base`].

pub mod grp;
pub mod livecd_stage1;
pub mod livecd_stage2;
pub mod snapshot;
pub mod stage1;
pub mod stage_base;

use anyhow::{Context, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::chroot::{ChrootSession, MountMap};
use crate::compress::CompressMap;
use crate::config::BuildConfig;
use crate::error::ConfigError;
use crate::pipeline::{compress_maps, BuildContext, HandlerTable, Pipeline, Step};
use crate::process::Runner;
use crate::resume::ResumeState;
use crate::store::StoreLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Stage1,
    LivecdStage1,
    LivecdStage2,
    Grp,
    Snapshot,
}

impl TargetKind {
    pub const ALL: [TargetKind; 5] = [
        TargetKind::Stage1,
        TargetKind::LivecdStage1,
        TargetKind::LivecdStage2,
        TargetKind::Grp,
        TargetKind::Snapshot,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TargetKind::Stage1 => "stage1",
            TargetKind::LivecdStage1 => "livecd-stage1",
            TargetKind::LivecdStage2 => "livecd-stage2",
            TargetKind::Grp => "grp",
            TargetKind::Snapshot => "snapshot",
        }
    }

    pub fn target(self) -> Box<dyn Target> {
        match self {
            TargetKind::Stage1 => Box::new(stage1::Stage1),
            TargetKind::LivecdStage1 => Box::new(livecd_stage1::LivecdStage1),
            TargetKind::LivecdStage2 => Box::new(livecd_stage2::LivecdStage2),
            TargetKind::Grp => Box::new(grp::Grp),
            TargetKind::Snapshot => Box::new(snapshot::Snapshot),
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TargetKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Underscore spellings are accepted for older spec files.
        let wanted = s.replace('_', "-");
        TargetKind::ALL
            .iter()
            .copied()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| {
                let names: Vec<&str> = TargetKind::ALL.iter().map(|k| k.name()).collect();
                ConfigError::UnknownTarget(s.to_string(), names.join(", "))
            })
    }
}

/// What a target contributes to a build.
pub trait Target {
    fn kind(&self) -> TargetKind;

    /// Keys the build spec must provide. May depend on values already present
    /// (the grp sets name their own keys).
    fn required_keys(&self, config: &BuildConfig) -> Vec<String>;

    /// Additional spec keys allowed; `*` matches one segment.
    fn valid_keys(&self) -> Vec<String>;

    /// Derive paths and compose lists. Existing list entries are kept.
    fn prepare(
        &self,
        config: &mut BuildConfig,
        store: &StoreLayout,
        decompressor: &CompressMap,
    ) -> Result<()>;

    fn action_sequence(&self, config: &BuildConfig) -> Vec<Step>;

    fn handlers(&self) -> HandlerTable;

    fn mounts(&self, config: &BuildConfig) -> MountMap;

    /// Key scoping the build lock and resume points.
    fn target_key(&self, config: &BuildConfig) -> Result<String> {
        Ok(config.require_str("target_subpath")?.to_string())
    }
}

/// Resolve, validate, prepare and run the target named by `config`.
pub fn run_target(mut config: BuildConfig, runner: Arc<dyn Runner>) -> Result<()> {
    let kind: TargetKind = config.require_str("target")?.parse()?;
    let target = kind.target();
    config.validate(&target.required_keys(&config), &target.valid_keys())?;

    let store = StoreLayout::open(&config.require_path("storedir")?)?;
    let (_, decompressor) = compress_maps(&config, runner.clone())?;
    target
        .prepare(&mut config, &store, &decompressor)
        .with_context(|| format!("preparing {} target", kind))?;

    let key = target.target_key(&config)?;
    let resume = ResumeState::open(&store, &key)?;
    let chroot_root = match config.get_path("chroot_path") {
        Some(path) => path,
        None => store.tmp_dir().join(crate::store::sanitize_key(&key)?),
    };
    let chroot = ChrootSession::new(&chroot_root, target.mounts(&config), runner.clone());

    let steps = target.action_sequence(&config);
    let mut pipeline = Pipeline::new(key.clone(), steps, target.handlers())?;
    tracing::info!(
        "Building {} ({}): {}",
        kind,
        key,
        pipeline.sequence().names().join(", ")
    );

    let mut ctx = BuildContext::new(config, store, resume, chroot, runner)?;
    pipeline.run(&mut ctx)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_names_parse() {
        for kind in TargetKind::ALL {
            assert_eq!(kind.name().parse::<TargetKind>().unwrap(), kind);
            assert_eq!(kind.target().kind(), kind);
        }
        assert_eq!("livecd_stage2".parse::<TargetKind>().unwrap(), TargetKind::LivecdStage2);
        assert!(matches!(
            "stage4".parse::<TargetKind>(),
            Err(ConfigError::UnknownTarget(..))
        ));
    }
}
