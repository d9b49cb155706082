//! First stage: a fresh root built inside a seed chroot and captured as an
//! archive.

use anyhow::Result;

use super::stage_base::{self, PREPARE_CHROOT};
use super::{Target, TargetKind};
use crate::chroot::MountMap;
use crate::compress::CompressMap;
use crate::config::BuildConfig;
use crate::pipeline::{HandlerTable, Step};
use crate::store::StoreLayout;

/// Root of the new stage, relative to the chroot.
pub const STAGE1_ROOT: &str = "tmp/stage1root";

pub struct Stage1;

impl Target for Stage1 {
    fn kind(&self) -> TargetKind {
        TargetKind::Stage1
    }

    fn required_keys(&self, _config: &BuildConfig) -> Vec<String> {
        stage_base::required(&[])
    }

    fn valid_keys(&self) -> Vec<String> {
        stage_base::valid("stage1", &["packages", "use", "rm", "empty"])
    }

    fn prepare(
        &self,
        config: &mut BuildConfig,
        store: &StoreLayout,
        decompressor: &CompressMap,
    ) -> Result<()> {
        stage_base::prepare(config, store, decompressor, "stage1", "stage1")?;
        let chroot = config.require_path("chroot_path")?;
        config.set_path("stage_path", &chroot.join(STAGE1_ROOT));
        config.append_list("cleanables", ["/usr/share/zoneinfo", "/etc/portage/package*"]);
        Ok(())
    }

    fn action_sequence(&self, config: &BuildConfig) -> Vec<Step> {
        let mut steps = PREPARE_CHROOT.to_vec();
        steps.extend([
            Step::RunLocalPayload,
            Step::Preclean,
            Step::Unbind,
            Step::RemovePaths,
            Step::EmptyExcludedPaths,
            Step::Clean,
            Step::Capture,
            Step::GenerateDigests,
            Step::ClearResume,
        ]);
        stage_base::with_purge(config, steps)
    }

    fn handlers(&self) -> HandlerTable {
        stage_base::base_handlers()
    }

    fn mounts(&self, config: &BuildConfig) -> MountMap {
        stage_base::default_mounts(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::DefinitionTable;
    use crate::pipeline::ActionSequence;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn config() -> BuildConfig {
        let mut config = BuildConfig::new();
        for (k, v) in [
            ("target", "stage1"),
            ("version_stamp", "2024.1"),
            ("subarch", "amd64"),
            ("rel_type", "default"),
            ("profile", "default/linux/amd64/23.0"),
            ("snapshot", "20240101"),
            ("source_subpath", "default/stage3-amd64-seed"),
            ("sharedir", "/usr/share/stage-builder"),
        ] {
            config.set_str(k, v);
        }
        config
    }

    #[test]
    fn test_stage_path_is_inside_chroot() {
        let temp = TempDir::new().unwrap();
        let store = StoreLayout::open(temp.path()).unwrap();
        let decompressor =
            CompressMap::new(DefinitionTable::decompression(), BTreeMap::new(), None);
        let mut config = config();
        Stage1.prepare(&mut config, &store, &decompressor).unwrap();

        let chroot = config.get_path("chroot_path").unwrap();
        assert_eq!(config.get_path("stage_path").unwrap(), chroot.join("tmp/stage1root"));
        assert!(config
            .list("cleanables")
            .contains(&"/usr/share/zoneinfo".to_string()));
    }

    #[test]
    fn test_sequence_resolves() {
        let config = config();
        let steps = Stage1.action_sequence(&config);
        let sequence = ActionSequence::new(steps, &Stage1.handlers()).unwrap();
        let names = sequence.names();
        assert_eq!(names.first(), Some(&"setup-target-path"));
        assert_eq!(names.last(), Some(&"clear-resume"));
        let unbind = names.iter().position(|n| *n == "unbind").unwrap();
        let capture = names.iter().position(|n| *n == "capture").unwrap();
        assert!(unbind < capture);
    }
}
