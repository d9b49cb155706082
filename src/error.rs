//! Error types shared across the build engine.
//!
//! Library layers return these typed errors; step handlers and the binary wrap
//! them in `anyhow` with context the way the rest of the crate does.

use std::path::PathBuf;

use thiserror::Error;

/// Boxed cause carried by errors that wrap an arbitrary failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Problems detected before any chroot or mount work begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required value \"{0}\" not specified")]
    MissingKey(String),

    #[error("argument \"{0}\" not recognized for this target")]
    UnrecognizedKey(String),

    #[error("target \"{0}\" not available (expected one of: {1})")]
    UnknownTarget(String, String),

    #[error("invalid value for \"{key}\": {message}")]
    InvalidValue { key: String, message: String },

    #[error("compression mode \"{mode}\" is not supported by the {family} definitions")]
    UnsupportedMode { mode: String, family: String },

    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read '{}'", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{}'", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Malformed compression definition tables.
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("definition table has no \"Type\" entry")]
    MissingType,

    #[error("unknown definitions family \"{0}\" (expected Compression or Decompression)")]
    UnknownFamily(String),

    #[error("unknown dispatch kind \"{func}\" for mode \"{mode}\"")]
    UnknownDispatch { mode: String, func: String },

    #[error("invalid definition for mode \"{mode}\": {message}")]
    InvalidEntry { mode: String, message: String },
}

/// An external tool could not be started or exited nonzero under `fatal`.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{id}: failed to execute '{command}'")]
    Spawn {
        id: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{id}: '{command}' exited with status {code}")]
    Failed {
        id: String,
        command: String,
        code: i32,
    },
}

/// Mount lifecycle failures.
#[derive(Debug, Error)]
pub enum ChrootError {
    #[error("bind mount of '{}' at '{}' failed", .host.display(), .target.display())]
    Bind {
        host: PathBuf,
        target: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("could not unmount: {}", join_paths(.0))]
    Unbind(Vec<PathBuf>),

    #[error("'{}' is still mounted beneath the chroot; refusing to touch '{}'", .mount.display(), .root.display())]
    MountedBeneath { mount: PathBuf, root: PathBuf },

    #[error("mounts are still bound under '{}'", .0.display())]
    StillBound(PathBuf),
}

/// Pipeline-level failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("step \"{0}\" has no registered handler for this target")]
    Unresolvable(&'static str),

    #[error("another build of \"{0}\" holds the build lock")]
    Locked(String),

    #[error("could not prepare the build state")]
    Setup(#[source] BoxError),

    #[error("build aborted in step \"{step}\"")]
    StepFailed {
        step: &'static str,
        #[source]
        source: BoxError,
    },
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A configuration problem found before the first step ran. Failures inside
/// a step count as build failures even when a config lookup caused them.
pub fn is_config_error(err: &anyhow::Error) -> bool {
    let in_step = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<PipelineError>(),
            Some(PipelineError::StepFailed { .. })
        )
    });
    !in_step && err.chain().any(|cause| cause.is::<ConfigError>())
}
