//! Package-set bundles: binary package sets and source sets built inside a
//! chroot that has the output directory mounted at `/tmp/grp`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::stage_base::{self, PREPARE_CHROOT};
use super::{Target, TargetKind};
use crate::chroot::MountMap;
use crate::compress::CompressMap;
use crate::config::BuildConfig;
use crate::digest::{self, DIGESTS_SUFFIX};
use crate::error::ConfigError;
use crate::fileops;
use crate::pipeline::{BuildContext, HandlerTable, Step};
use crate::store::StoreLayout;

/// Where the output directory appears inside the chroot.
pub const GRP_MOUNT: &str = "/tmp/grp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    /// Binary packages, collected under `<set>/All`.
    Pkgset,
    /// Source distfiles, collected directly under `<set>`.
    Srcset,
}

impl SetKind {
    pub fn name(self) -> &'static str {
        match self {
            SetKind::Pkgset => "pkgset",
            SetKind::Srcset => "srcset",
        }
    }

    /// Directory holding the set's artifacts.
    pub fn artifact_dir(self, target: &Path, set: &str) -> PathBuf {
        match self {
            SetKind::Pkgset => target.join(set).join("All"),
            SetKind::Srcset => target.join(set),
        }
    }
}

impl FromStr for SetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pkgset" => Ok(SetKind::Pkgset),
            "srcset" => Ok(SetKind::Srcset),
            other => Err(format!("unknown set type \"{other}\" (expected pkgset or srcset)")),
        }
    }
}

fn set_kind(config: &BuildConfig, set: &str) -> Result<SetKind, ConfigError> {
    let key = format!("grp/{set}/type");
    config
        .require_str(&key)?
        .parse::<SetKind>()
        .map_err(|message| ConfigError::InvalidValue { key, message })
}

pub struct Grp;

impl Target for Grp {
    fn kind(&self) -> TargetKind {
        TargetKind::Grp
    }

    fn required_keys(&self, config: &BuildConfig) -> Vec<String> {
        let mut keys = stage_base::required(&["grp"]);
        for set in config.list("grp") {
            keys.push(format!("grp/{set}/packages"));
            keys.push(format!("grp/{set}/type"));
        }
        keys
    }

    fn valid_keys(&self) -> Vec<String> {
        stage_base::valid("grp", &["use"])
    }

    fn prepare(
        &self,
        config: &mut BuildConfig,
        store: &StoreLayout,
        decompressor: &CompressMap,
    ) -> Result<()> {
        for set in config.list("grp") {
            set_kind(config, set)?;
        }
        stage_base::prepare(config, store, decompressor, "grp", "grp")?;
        config.append_list("use", ["bindist"]);
        Ok(())
    }

    fn action_sequence(&self, config: &BuildConfig) -> Vec<Step> {
        let mut steps = PREPARE_CHROOT.to_vec();
        steps.extend([
            Step::RunLocalPayload,
            Step::Unbind,
            Step::GenerateDigests,
            Step::ClearResume,
        ]);
        stage_base::with_purge(config, steps)
    }

    fn handlers(&self) -> HandlerTable {
        stage_base::base_handlers()
            .with(Step::SetupTargetPath, ensure_target_dir)
            .with(Step::RunLocalPayload, build_sets)
            .with(Step::GenerateDigests, digest_sets)
    }

    fn mounts(&self, config: &BuildConfig) -> MountMap {
        let mut map = stage_base::default_mounts(config);
        if let Some(target) = config.get_path("target_path") {
            map.push(GRP_MOUNT, target);
        }
        map
    }
}

/// Earlier set output is kept; the directory only has to exist.
pub fn ensure_target_dir(ctx: &mut BuildContext) -> Result<()> {
    fileops::ensure_dir(&ctx.path("target_path")?)
}

/// `controller run <type> <set> <packages…>` for every set.
pub fn build_sets(ctx: &mut BuildContext) -> Result<()> {
    for set in ctx.config.list("grp").to_vec() {
        let kind = set_kind(&ctx.config, &set)?;
        let mut args = vec![kind.name().to_string(), set.clone()];
        args.extend(ctx.config.list(&format!("grp/{set}/packages")).iter().cloned());
        tracing::info!("Building {} {}", kind.name(), set);
        ctx.run_controller("run", &args)
            .with_context(|| format!("building set '{set}'"))?;
    }
    Ok(())
}

/// Files in `dir` that get companions: regular, not hidden, not themselves
/// companions. Stale `.DIGESTS` files are removed first.
pub fn set_members(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("set directory '{}' does not exist", dir.display());
    }
    let mut members = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading '{}'", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(DIGESTS_SUFFIX) {
            fs::remove_file(&path)
                .with_context(|| format!("removing stale '{}'", path.display()))?;
            continue;
        }
        if name.starts_with('.') || digest::is_companion(&path) {
            continue;
        }
        if entry.file_type()?.is_file() {
            members.push(path);
        }
    }
    members.sort();
    Ok(members)
}

/// Digest every set member. Contents listings are written for pkgsets only.
pub fn digest_sets(ctx: &mut BuildContext) -> Result<()> {
    let target = ctx.path("target_path")?;
    let hashes = stage_base::digest_kinds(&ctx.config)?;
    let contents = stage_base::contents_enabled(&ctx.config);
    for set in ctx.config.list("grp").to_vec() {
        let kind = set_kind(&ctx.config, &set)?;
        let dir = kind.artifact_dir(&target, &set);
        tracing::info!("Digesting files in {} {}", kind.name(), set);
        for member in set_members(&dir)? {
            let with_contents = contents && kind == SetKind::Pkgset;
            digest::generate(ctx.runner.as_ref(), &member, &hashes, with_contents)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_required_keys_follow_sets() {
        let mut config = BuildConfig::new();
        config.set_list("grp", ["cd1", "src"]);
        let keys = Grp.required_keys(&config);
        for key in ["grp", "grp/cd1/packages", "grp/cd1/type", "grp/src/type"] {
            assert!(keys.contains(&key.to_string()), "missing {key}");
        }
    }

    #[test]
    fn test_set_kind_rejects_unknown_type() {
        let mut config = BuildConfig::new();
        config.set_str("grp/cd1/type", "binset");
        assert!(matches!(
            set_kind(&config, "cd1"),
            Err(ConfigError::InvalidValue { .. })
        ));
        config.set_str("grp/cd1/type", "pkgset");
        assert_eq!(set_kind(&config, "cd1").unwrap(), SetKind::Pkgset);
    }

    #[test]
    fn test_set_members_selection() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path();
        fs::write(dir.join("vim-9.0.tbz2"), "pkg").unwrap();
        fs::write(dir.join("old.tbz2.DIGESTS"), "stale").unwrap();
        fs::write(dir.join(".hidden"), "x").unwrap();
        fs::create_dir(dir.join("subdir")).unwrap();

        let members = set_members(dir).unwrap();
        assert_eq!(members, vec![dir.join("vim-9.0.tbz2")]);
        assert!(!dir.join("old.tbz2.DIGESTS").exists());
    }

    #[test]
    fn test_artifact_dirs() {
        let target = Path::new("/store/builds/grp");
        assert_eq!(
            SetKind::Pkgset.artifact_dir(target, "cd1"),
            PathBuf::from("/store/builds/grp/cd1/All")
        );
        assert_eq!(
            SetKind::Srcset.artifact_dir(target, "src"),
            PathBuf::from("/store/builds/grp/src")
        );
    }

    #[test]
    fn test_output_dir_is_mounted_last() {
        let mut config = BuildConfig::new();
        config.set_str("target_path", "/store/builds/grp");
        let map = Grp.mounts(&config);
        let last = map.entries().last().unwrap();
        assert_eq!(last.target, GRP_MOUNT);
        assert_eq!(last.host, PathBuf::from("/store/builds/grp"));
    }
}
