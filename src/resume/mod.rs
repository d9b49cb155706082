//! Durable resume points.
//!
//! One marker file per completed step under
//! `<storedir>/resume/<target key>/<step>`. Markers are written atomically so
//! a crash mid-write never leaves a half-recorded point.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::store::{atomic_write, sanitize_key, StoreLayout};

/// Contents of a marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeMarker {
    pub step: String,
    pub completed_at_utc: String,
    pub version: String,
}

/// Completed steps for one build target.
#[derive(Debug, Clone)]
pub struct ResumeState {
    dir: PathBuf,
}

impl ResumeState {
    /// Open the resume points for `target_key` (a target subpath).
    pub fn open(store: &StoreLayout, target_key: &str) -> Result<Self> {
        let dir = store.resume_dir().join(sanitize_key(target_key)?);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create resume directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn marker_path(&self, step: &str) -> Result<PathBuf> {
        if step.is_empty() || step.contains(['/', '\\']) || step.starts_with('.') {
            bail!("invalid resume point name: '{step}'");
        }
        Ok(self.dir.join(step))
    }

    pub fn is_enabled(&self, step: &str) -> bool {
        self.marker_path(step).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Record `step` as completed. Recording an existing point is a no-op.
    pub fn enable(&self, step: &str) -> Result<()> {
        let path = self.marker_path(step)?;
        if path.is_file() {
            return Ok(());
        }
        let marker = ResumeMarker {
            step: step.to_string(),
            completed_at_utc: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let mut body = serde_json::to_vec_pretty(&marker)?;
        body.push(b'\n');
        atomic_write(&path, &body)
            .with_context(|| format!("Failed to record resume point '{step}'"))?;
        tracing::debug!("resume point '{}' recorded", step);
        Ok(())
    }

    pub fn disable(&self, step: &str) -> Result<()> {
        let path = self.marker_path(step)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    pub fn marker(&self, step: &str) -> Result<Option<ResumeMarker>> {
        let path = self.marker_path(step)?;
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        let marker = serde_json::from_slice(&body)
            .with_context(|| format!("Failed to parse resume marker {}", path.display()))?;
        Ok(Some(marker))
    }

    /// Recorded step names, sorted.
    pub fn points(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.dir.display()));
            }
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // Skip temp files left by an interrupted write.
            if name.starts_with('.') {
                continue;
            }
            out.push(name);
        }
        out.sort();
        Ok(out)
    }

    /// Drop every point not named in `keep`. Returns the removed names.
    pub fn retain(&self, keep: &[&str]) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for point in self.points()? {
            if !keep.contains(&point.as_str()) {
                self.disable(&point)?;
                removed.push(point);
            }
        }
        Ok(removed)
    }

    /// Remove every point for this target.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to clear {}", self.dir.display()));
            }
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create resume directory: {}", self.dir.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(temp: &TempDir, key: &str) -> ResumeState {
        let store = StoreLayout::open(temp.path()).unwrap();
        ResumeState::open(&store, key).unwrap()
    }

    #[test]
    fn test_points_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let state = open(&temp, "default/stage1-amd64-2024");
        state.enable("unpack").unwrap();
        state.enable("unpack").unwrap();
        state.enable("link-profile").unwrap();

        let reopened = open(&temp, "default/stage1-amd64-2024");
        assert!(reopened.is_enabled("unpack"));
        assert!(!reopened.is_enabled("capture"));
        assert_eq!(reopened.points().unwrap(), vec!["link-profile", "unpack"]);

        let marker = reopened.marker("unpack").unwrap().unwrap();
        assert_eq!(marker.step, "unpack");
        assert_eq!(marker.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_clear_removes_all_points() {
        let temp = TempDir::new().unwrap();
        let state = open(&temp, "default/grp-amd64-2024");
        state.enable("unpack").unwrap();
        state.enable("build-packages").unwrap();
        state.clear().unwrap();
        assert!(state.points().unwrap().is_empty());
        assert!(!state.is_enabled("unpack"));
        state.enable("unpack").unwrap();
        assert!(state.is_enabled("unpack"));
    }

    #[test]
    fn test_targets_are_isolated() {
        let temp = TempDir::new().unwrap();
        let a = open(&temp, "default/stage1-amd64-2024");
        let b = open(&temp, "default/livecd-stage1-amd64-2024");
        a.enable("unpack").unwrap();
        assert!(!b.is_enabled("unpack"));
        b.clear().unwrap();
        assert!(a.is_enabled("unpack"));
    }

    #[test]
    fn test_retain_prunes_unknown_points() {
        let temp = TempDir::new().unwrap();
        let state = open(&temp, "snap");
        state.enable("sync-repository").unwrap();
        state.enable("build-kernel").unwrap();
        let removed = state.retain(&["sync-repository", "capture"]).unwrap();
        assert_eq!(removed, vec!["build-kernel"]);
        assert_eq!(state.points().unwrap(), vec!["sync-repository"]);
    }

    #[test]
    fn test_rejects_path_like_names() {
        let temp = TempDir::new().unwrap();
        let state = open(&temp, "snap");
        assert!(state.enable("../escape").is_err());
        assert!(!state.is_enabled("../escape"));
    }
}
