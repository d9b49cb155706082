use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::chroot::ChrootSession;
use crate::compress::{CompressMap, DefinitionTable};
use crate::config::BuildConfig;
use crate::error::ConfigError;
use crate::process::{run_checked, Cmd, Runner};
use crate::resume::ResumeState;
use crate::store::StoreLayout;

/// Compression and decompression maps for a configuration.
///
/// Site tables in `compress_definitions` / `decompress_definitions` add to or
/// replace built-in modes. The configured compression mode must exist.
pub fn compress_maps(
    config: &BuildConfig,
    runner: Arc<dyn Runner>,
) -> Result<(CompressMap, CompressMap)> {
    let mut compression = DefinitionTable::compression();
    if let Some(table) = config.table("compress_definitions") {
        compression
            .merge_toml(table)
            .context("loading compress_definitions")?;
    }
    let mut decompression = DefinitionTable::decompression();
    if let Some(table) = config.table("decompress_definitions") {
        decompression
            .merge_toml(table)
            .context("loading decompress_definitions")?;
    }

    let env = config.env().clone();
    let compressor = CompressMap::new(compression, env.clone(), config.get_str("compression_mode"))
        .with_runner(runner.clone());
    let decompressor = CompressMap::new(decompression, env, config.get_str("decompression_mode"))
        .with_runner(runner);

    if !compressor.is_supported(compressor.default_mode()) {
        return Err(ConfigError::UnsupportedMode {
            mode: compressor.default_mode().to_string(),
            family: compressor.family().to_string(),
        }
        .into());
    }
    let unpack_mode = decompressor.default_mode();
    if unpack_mode != "auto" && !decompressor.is_supported(unpack_mode) {
        return Err(ConfigError::UnsupportedMode {
            mode: unpack_mode.to_string(),
            family: decompressor.family().to_string(),
        }
        .into());
    }
    Ok((compressor, decompressor))
}

/// Everything a step may read or change during one run.
///
/// Owned by the caller of [`Pipeline::run`](super::Pipeline::run); each step
/// borrows it mutably for the duration of its call.
pub struct BuildContext {
    pub config: BuildConfig,
    pub store: StoreLayout,
    pub resume: ResumeState,
    pub chroot: ChrootSession,
    pub compressor: CompressMap,
    pub decompressor: CompressMap,
    pub runner: Arc<dyn Runner>,
    /// Controller environment captured by `setup-environment`.
    pub env: BTreeMap<String, String>,
}

impl BuildContext {
    pub fn new(
        config: BuildConfig,
        store: StoreLayout,
        resume: ResumeState,
        chroot: ChrootSession,
        runner: Arc<dyn Runner>,
    ) -> Result<Self> {
        let (compressor, decompressor) = compress_maps(&config, runner.clone())?;
        Ok(Self {
            config,
            store,
            resume,
            chroot,
            compressor,
            decompressor,
            runner,
            env: BTreeMap::new(),
        })
    }

    pub fn has_option(&self, token: &str) -> bool {
        self.config.has_option(token)
    }

    pub fn path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.config.require_path(key)?)
    }

    /// Environment passed to the controller: the `setup-environment` snapshot
    /// if one was taken, otherwise the current configuration.
    pub fn controller_env(&self) -> BTreeMap<String, String> {
        if self.env.is_empty() {
            self.config.controller_env()
        } else {
            self.env.clone()
        }
    }

    /// Run `<controller_file> <action> [args...]`.
    pub fn run_controller(&self, action: &str, args: &[String]) -> Result<()> {
        self.run_controller_with(action, args, &BTreeMap::new())
    }

    /// Like [`run_controller`](Self::run_controller) with extra variables.
    pub fn run_controller_with(
        &self,
        action: &str,
        args: &[String],
        extra_env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let controller = self.path("controller_file")?;
        if !controller.is_file() {
            bail!("controller '{}' not found", controller.display());
        }
        let cmd = Cmd::new(controller.to_string_lossy())
            .arg(action)
            .args(args)
            .envs(&self.controller_env())
            .envs(extra_env)
            .id("CONTROLLER");
        tracing::info!("Running controller action '{}'", action);
        run_checked(self.runner.as_ref(), &cmd)
            .with_context(|| format!("controller action '{action}' failed"))?;
        Ok(())
    }
}
