//! Resumable chroot build pipeline for Linux distribution artifacts.
//!
//! A build is a fixed sequence of named steps run against one
//! [`BuildContext`]: unpack a seed into a chroot, bind host directories into
//! it, drive a controller script through the build, release the mounts and
//! package the result through a [`CompressMap`].
//!
//! # Architecture
//!
//! ```text
//! stage-builder (binary)
//!     │
//!     ├── config    layered TOML settings, spec file and -C overrides
//!     ├── preflight host tools and privileges
//!     └── target::run_target
//!             │
//!             ├── Target      required keys, paths, step order, handlers
//!             ├── Pipeline    lock, resume points, abort unbinds
//!             ├── ChrootSession  bind/unbind in LIFO order
//!             ├── ResumeState    one marker file per completed step
//!             └── CompressMap    archive commands from definition tables
//! ```
//!
//! Every mount bound by a step is released before an error leaves the
//! pipeline, and completed steps are skipped on retry when the `autoresume`
//! option is set.

pub mod chroot;
pub mod compress;
pub mod config;
pub mod digest;
pub mod error;
pub mod fileops;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod resume;
pub mod store;
pub mod target;

pub use chroot::{ChrootSession, MountMap};
pub use compress::{CompressMap, DefinitionTable, InfoDict};
pub use config::BuildConfig;
pub use pipeline::{BuildContext, HandlerTable, Pipeline, Step};
pub use process::{Cmd, Runner, SystemRunner};
pub use resume::ResumeState;
pub use store::StoreLayout;
pub use target::{run_target, Target, TargetKind};
