//! Live media stage1: the package set for a live image, built in a chroot
//! that the stage2 build picks up.

use anyhow::Result;

use super::stage_base::{self, PREPARE_CHROOT};
use super::{Target, TargetKind};
use crate::chroot::MountMap;
use crate::compress::CompressMap;
use crate::config::BuildConfig;
use crate::pipeline::{HandlerTable, Step};
use crate::store::StoreLayout;

pub const LIVECD_TOOLS: &str = "app-misc/livecd-tools";

pub struct LivecdStage1;

impl Target for LivecdStage1 {
    fn kind(&self) -> TargetKind {
        TargetKind::LivecdStage1
    }

    fn required_keys(&self, _config: &BuildConfig) -> Vec<String> {
        stage_base::required(&["livecd/packages"])
    }

    fn valid_keys(&self) -> Vec<String> {
        stage_base::valid("livecd", &["packages", "use"])
    }

    fn prepare(
        &self,
        config: &mut BuildConfig,
        store: &StoreLayout,
        decompressor: &CompressMap,
    ) -> Result<()> {
        stage_base::prepare(config, store, decompressor, "livecd-stage1", "livecd")?;
        config.append_list("use", ["livecd"]);
        if config.has_option("bindist") {
            config.append_list("use", ["bindist"]);
        }
        config.append_list("livecd/packages", [LIVECD_TOOLS]);
        Ok(())
    }

    fn action_sequence(&self, config: &BuildConfig) -> Vec<Step> {
        let mut steps = PREPARE_CHROOT.to_vec();
        steps.extend([
            Step::BuildPackages,
            Step::Unbind,
            Step::Clean,
            Step::ClearResume,
        ]);
        stage_base::with_purge(config, steps)
    }

    fn handlers(&self) -> HandlerTable {
        stage_base::base_handlers().with(Step::SetupTargetPath, stage_base::recreate_target_dir)
    }

    fn mounts(&self, config: &BuildConfig) -> MountMap {
        stage_base::default_mounts(config)
    }
}
