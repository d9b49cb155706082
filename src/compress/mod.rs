//! Table-driven archive creation and extraction.
//!
//! A [`CompressMap`] wraps one [`DefinitionTable`]. Each mode names an external
//! tool and an argument template; `{source}`, `{destination}`, `{basedir}`,
//! `{filename}` and `{arch}` are substituted per argument, so paths with spaces
//! never pass through a shell.
//!
//! Unsupported modes and wrong-family calls are not errors: they log a
//! diagnostic and return `Ok(false)` so callers can branch on the result.
//! Only a failing tool under `fatal` produces `Err`.

mod definitions;

pub use definitions::{CompressionDefinition, DefinitionTable, Dispatch, Family};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::ToolError;
use crate::process::{run_tool, Cmd, Runner, SystemRunner};

/// Default separator between a file stem and its extension.
pub const EXTENSION_SEPARATOR: &str = ".";

/// Parameters for one compress/extract call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoDict {
    pub source: Option<String>,
    pub destination: Option<String>,
    pub basedir: Option<String>,
    pub filename: Option<String>,
    pub arch: Option<String>,
    pub mode: Option<String>,
    pub auto_extension: bool,
}

fn path_string(path: impl AsRef<Path>) -> String {
    path.as_ref().to_string_lossy().into_owned()
}

impl InfoDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: impl AsRef<Path>) -> Self {
        self.source = Some(path_string(source));
        self
    }

    pub fn destination(mut self, destination: impl AsRef<Path>) -> Self {
        self.destination = Some(path_string(destination));
        self
    }

    pub fn basedir(mut self, basedir: impl AsRef<Path>) -> Self {
        self.basedir = Some(path_string(basedir));
        self
    }

    pub fn filename(mut self, filename: impl AsRef<Path>) -> Self {
        self.filename = Some(path_string(filename));
        self
    }

    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn auto_extension(mut self, enabled: bool) -> Self {
        self.auto_extension = enabled;
        self
    }

    fn field(&self, name: &str) -> Result<Option<&str>, String> {
        let value = match name {
            "source" => &self.source,
            "destination" => &self.destination,
            "basedir" => &self.basedir,
            "filename" => &self.filename,
            "arch" => &self.arch,
            other => return Err(format!("unknown placeholder {{{other}}}")),
        };
        Ok(value.as_deref().filter(|v| !v.is_empty()))
    }
}

/// Compression or decompression front end over external tools.
pub struct CompressMap {
    family: Family,
    description: String,
    definitions: BTreeMap<String, CompressionDefinition>,
    env: BTreeMap<String, String>,
    mode: String,
    separator: String,
    runner: Arc<dyn Runner>,
}

impl std::fmt::Debug for CompressMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressMap")
            .field("family", &self.family)
            .field("mode", &self.mode)
            .field("modes", &self.available_modes())
            .finish()
    }
}

impl CompressMap {
    /// Load `table`. `default_mode` falls back to the family default.
    pub fn new(
        table: DefinitionTable,
        env: BTreeMap<String, String>,
        default_mode: Option<&str>,
    ) -> Self {
        let mode = default_mode
            .filter(|m| !m.is_empty())
            .unwrap_or(table.family.default_mode())
            .to_string();
        tracing::debug!("{} ({} modes)", table.description, table.definitions.len());
        Self {
            family: table.family,
            description: table.description,
            definitions: table.definitions,
            env,
            mode,
            separator: EXTENSION_SEPARATOR.to_string(),
            runner: Arc::new(SystemRunner),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn default_mode(&self) -> &str {
        &self.mode
    }

    /// Create an archive. Only valid on a compression-family map.
    pub fn compress(&self, info: Option<InfoDict>, fatal: bool) -> Result<bool, ToolError> {
        if self.family != Family::Compression {
            tracing::error!("compress called on {} definitions", self.family);
            return Ok(false);
        }
        let mut info = info.unwrap_or_default();
        if info.mode.is_none() {
            info.mode = Some(self.mode.clone());
        }
        if info.mode.as_deref().map_or(true, str::is_empty) {
            tracing::error!("{} error: no mode was passed in or detected", self.family);
            return Ok(false);
        }
        self.run(&info, fatal)
    }

    /// Unpack an archive. Only valid on a decompression-family map.
    ///
    /// An unset or `auto` mode is resolved from the source file name.
    pub fn extract(&self, info: Option<InfoDict>, fatal: bool) -> Result<bool, ToolError> {
        if self.family != Family::Decompression {
            tracing::error!("extract called on {} definitions", self.family);
            return Ok(false);
        }
        let mut info = info.unwrap_or_default();
        let mode = info.mode.clone().unwrap_or_else(|| self.mode.clone());
        let mode = if mode.is_empty() || mode == "auto" {
            match info.source.as_deref().and_then(|s| self.mode_for_source(s)) {
                Some(mode) => mode,
                None => {
                    tracing::error!(
                        "{} error: no mode was passed in or detected for '{}'",
                        self.family,
                        info.source.as_deref().unwrap_or("")
                    );
                    return Ok(false);
                }
            }
        } else {
            mode
        };
        info.mode = Some(mode);
        self.run(&info, fatal)
    }

    /// Mirror `source` into `destination` with the `rsync` mode.
    pub fn rsync(&self, source: &Path, destination: &Path, fatal: bool) -> Result<bool, ToolError> {
        let info = InfoDict::new()
            .source(source)
            .destination(destination)
            .mode("rsync");
        self.run(&info, fatal)
    }

    fn run(&self, info: &InfoDict, fatal: bool) -> Result<bool, ToolError> {
        let mode = info.mode.as_deref().unwrap_or("");
        if !self.is_supported(mode) {
            tracing::error!(
                "mode \"{}\" is not supported in the current {}",
                mode,
                self.description
            );
            return Ok(false);
        }
        match self.build(info) {
            Ok(cmd) => run_tool(self.runner.as_ref(), &cmd, fatal),
            Err(reason) => {
                tracing::error!("{} mode \"{}\": {}", self.family, mode, reason);
                Ok(false)
            }
        }
    }

    /// The command `compress`/`extract` would run for `info`, without running it.
    pub fn invocation(&self, info: &InfoDict) -> Option<Cmd> {
        self.build(info).ok()
    }

    fn build(&self, info: &InfoDict) -> Result<Cmd, String> {
        let mode = info.mode.as_deref().unwrap_or(&self.mode);
        let definition = self
            .definitions
            .get(mode)
            .ok_or_else(|| format!("mode \"{mode}\" not correctly set"))?;

        let mut info = info.clone();
        if info.auto_extension {
            if let (Some(filename), Some(ext)) = (info.filename.as_mut(), definition.extensions.first()) {
                filename.push_str(&self.separator);
                filename.push_str(ext);
            }
        }

        let args = match definition.dispatch {
            Dispatch::Common => definition
                .args
                .iter()
                .map(|template| substitute(template, &info))
                .collect::<Result<Vec<_>, _>>()?,
            Dispatch::Rsync => {
                let source = info.field("source")?.ok_or("placeholder {source} is not set")?;
                let destination = info
                    .field("destination")?
                    .ok_or("placeholder {destination} is not set")?;
                vec![
                    "-a".to_string(),
                    "--delete".to_string(),
                    source.to_string(),
                    destination.to_string(),
                ]
            }
        };

        Ok(Cmd::new(&definition.cmd)
            .args(args)
            .envs(&self.env)
            .id(&definition.id))
    }

    /// Last extension of the file name (`a.tar.gz` → `gz`).
    pub fn get_extension(&self, source: &str) -> Option<String> {
        let name = file_name(source);
        let (stem, ext) = name.rsplit_once(self.separator.as_str())?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_string())
    }

    /// Every dotted suffix of the file name, shortest first
    /// (`x.tar.gz` → `gz`, `tar.gz`).
    fn suffixes<'a>(&self, source: &'a str) -> Vec<&'a str> {
        let name = file_name(source);
        let mut out = Vec::new();
        let mut search = name.len();
        while let Some(pos) = name[..search].rfind(self.separator.as_str()) {
            if pos == 0 {
                break;
            }
            out.push(&name[pos + self.separator.len()..]);
            search = pos;
        }
        out
    }

    /// Mode implied by the source file's extension.
    ///
    /// The longest matching suffix wins. Ties go to a mode named after the
    /// last extension segment, then to the earlier position in the mode's
    /// extension list, then to the mode name.
    pub fn mode_for_source(&self, source: &str) -> Option<String> {
        let suffixes = self.suffixes(source);
        let last = self.get_extension(source)?;
        let mut best: Option<(usize, bool, usize, &str)> = None;
        for (mode, definition) in &self.definitions {
            for (position, ext) in definition.extensions.iter().enumerate() {
                if !suffixes.contains(&ext.as_str()) {
                    continue;
                }
                let named = *mode == last;
                let candidate = (ext.len(), named, position, mode.as_str());
                let better = match best {
                    None => true,
                    Some((len, b_named, b_pos, b_mode)) => {
                        (candidate.0, candidate.1, std::cmp::Reverse(candidate.2), std::cmp::Reverse(candidate.3))
                            > (len, b_named, std::cmp::Reverse(b_pos), std::cmp::Reverse(b_mode))
                    }
                };
                if better {
                    best = Some(candidate);
                }
            }
        }
        best.map(|(_, _, _, mode)| mode.to_string())
    }

    /// `preferred` if it handles the source's extension, otherwise the mode the
    /// extension implies.
    pub fn best_mode(&self, preferred: &str, source: &str) -> Option<String> {
        if let Some(definition) = self.definitions.get(preferred) {
            let suffixes = self.suffixes(source);
            if definition
                .extensions
                .iter()
                .any(|ext| suffixes.contains(&ext.as_str()))
            {
                return Some(preferred.to_string());
            }
        }
        self.mode_for_source(source)
    }

    pub fn is_supported(&self, mode: &str) -> bool {
        self.definitions.contains_key(mode)
    }

    pub fn available_modes(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }

    /// Primary extension appended by `auto_extension`.
    pub fn extension(&self, mode: &str) -> Option<&str> {
        self.definitions
            .get(mode)
            .and_then(|d| d.extensions.first())
            .map(String::as_str)
    }

    /// Host programs `mode` runs: the command, a `-I` filter program, and
    /// the compressor tar calls for `-j`, `-J` or `-z`.
    pub fn tools(&self, mode: &str) -> Vec<String> {
        let Some(definition) = self.definitions.get(mode) else {
            return Vec::new();
        };
        let mut tools = vec![definition.cmd.clone()];
        let mut args = definition.args.iter();
        while let Some(arg) = args.next() {
            if arg == "-I" {
                if let Some(filter) = args.next() {
                    tools.push(filter.clone());
                }
                continue;
            }
            if definition.cmd != "tar" || !arg.starts_with('-') || arg.starts_with("--") {
                continue;
            }
            for (flag, tool) in [('j', "bzip2"), ('J', "xz"), ('z', "gzip")] {
                if arg.contains(flag) {
                    tools.push(tool.to_string());
                }
            }
        }
        tools.dedup();
        tools
    }

    /// Whether `mode` changes into `{basedir}` before reading `{source}`.
    /// When false, `{source}` has to be a full path.
    pub fn uses_basedir(&self, mode: &str) -> bool {
        self.definitions
            .get(mode)
            .is_some_and(|d| d.args.iter().any(|a| a.contains("{basedir}")))
    }

    pub fn extensions(&self, mode: &str) -> &[String] {
        self.definitions
            .get(mode)
            .map(|d| d.extensions.as_slice())
            .unwrap_or(&[])
    }

    /// Every extension known to the table, longest first, without duplicates.
    pub fn all_extensions(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .definitions
            .values()
            .flat_map(|d| d.extensions.iter().cloned())
            .collect();
        all.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        all.dedup();
        all
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }
}

fn file_name(source: &str) -> &str {
    source.rsplit('/').next().unwrap_or(source)
}

fn substitute(template: &str, info: &InfoDict) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        let value = info
            .field(name)?
            .ok_or_else(|| format!("placeholder {{{name}}} is not set"))?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Vec<String>>>,
        code: i32,
    }

    impl Runner for Recorder {
        fn status(&self, cmd: &Cmd) -> std::io::Result<i32> {
            self.calls.lock().unwrap().push(cmd.argv());
            Ok(self.code)
        }

        fn capture(&self, cmd: &Cmd) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(cmd.argv());
            Ok(CommandOutput {
                code: self.code,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn recorded(code: i32) -> (Arc<Recorder>, CompressMap) {
        let recorder = Arc::new(Recorder {
            code,
            ..Default::default()
        });
        let map = CompressMap::new(DefinitionTable::compression(), BTreeMap::new(), None)
            .with_runner(recorder.clone());
        (recorder, map)
    }

    fn tar_info() -> InfoDict {
        InfoDict::new()
            .source("repo")
            .basedir("/tmp/stage")
            .filename("/out/repo.tar")
            .mode("tar")
    }

    #[test]
    fn tar_scenario_runs_exact_argv() {
        let (recorder, map) = recorded(0);
        assert!(map.compress(Some(tar_info()), true).unwrap());
        let calls = recorder.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![vec!["tar", "-cpf", "/out/repo.tar", "-C", "/tmp/stage", "repo"]]
        );
    }

    #[test]
    fn tar_scenario_reports_exit_status() {
        let (_, map) = recorded(2);
        assert!(!map.compress(Some(tar_info()), false).unwrap());
        assert!(matches!(
            map.compress(Some(tar_info()), true),
            Err(ToolError::Failed { code: 2, .. })
        ));
    }

    #[test]
    fn unsupported_mode_runs_nothing() {
        let (recorder, map) = recorded(0);
        let info = tar_info().mode("lzma-nope");
        assert!(!map.compress(Some(info), true).unwrap());
        assert!(recorder.calls.lock().unwrap().is_empty());

        let extract = CompressMap::new(DefinitionTable::decompression(), BTreeMap::new(), None)
            .with_runner(recorder.clone());
        let info = InfoDict::new()
            .source("/seeds/stage3.unknown")
            .destination("/tmp/chroot");
        assert!(!extract.extract(Some(info), true).unwrap());
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn wrong_family_entry_point_returns_false() {
        let (recorder, map) = recorded(0);
        assert!(!map.extract(Some(tar_info()), true).unwrap());
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn unset_placeholder_is_nonfatal() {
        let (recorder, map) = recorded(0);
        let info = InfoDict::new().source("repo").filename("/out/repo.tar").mode("tar");
        assert!(!map.compress(Some(info), true).unwrap());
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn auto_extension_appends_primary_extension() {
        let (recorder, map) = recorded(0);
        let info = InfoDict::new()
            .source("gentoo")
            .basedir("/tmp/snap")
            .filename("/out/gentoo-2024")
            .mode("xz")
            .auto_extension(true);
        assert!(map.compress(Some(info.clone()), true).unwrap());
        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls[0][2], "/out/gentoo-2024.tar.xz");

        let cmd = map.invocation(&info.mode("tbz2")).unwrap();
        assert_eq!(cmd.get_args()[3], "/out/gentoo-2024.tbz2");
    }

    #[test]
    fn default_mode_is_used_when_unset() {
        let (recorder, map) = recorded(0);
        let info = InfoDict::new()
            .source("stage")
            .basedir("/tmp")
            .filename("/out/stage.tbz2");
        assert!(map.compress(Some(info), true).unwrap());
        assert_eq!(recorder.calls.lock().unwrap()[0][..3], ["tar", "-I", "lbzip2"]);
    }

    #[test]
    fn rsync_uses_fixed_invocation() {
        let (recorder, map) = recorded(0);
        assert!(map
            .rsync(Path::new("/src/"), Path::new("/dst/"), true)
            .unwrap());
        assert_eq!(
            recorder.calls.lock().unwrap()[0],
            vec!["rsync", "-a", "--delete", "/src/", "/dst/"]
        );
    }

    #[test]
    fn is_supported_matches_table_keys() {
        let map = CompressMap::new(DefinitionTable::compression(), BTreeMap::new(), None);
        for mode in map.available_modes() {
            assert!(map.is_supported(mode));
        }
        assert!(!map.is_supported("Type"));
        assert!(!map.is_supported("zip"));
    }

    #[test]
    fn get_extension_takes_last_segment() {
        let map = CompressMap::new(DefinitionTable::decompression(), BTreeMap::new(), None);
        assert_eq!(map.get_extension("a.tar.gz").as_deref(), Some("gz"));
        assert_eq!(map.get_extension("/dir.d/noext"), None);
        assert_eq!(map.get_extension("noext"), None);
        assert_eq!(map.get_extension(".hidden"), None);
    }

    #[test]
    fn best_mode_prefers_matching_mode() {
        let map = CompressMap::new(DefinitionTable::compression(), BTreeMap::new(), None);
        assert_eq!(map.best_mode("tbz2", "x.tar.gz").as_deref(), Some("gzip"));
        assert_eq!(map.best_mode("tbz2", "x.tbz2").as_deref(), Some("tbz2"));
        assert_eq!(map.best_mode("tbz2", "x.unknown"), None);

        let map = CompressMap::new(DefinitionTable::decompression(), BTreeMap::new(), None);
        assert_eq!(map.best_mode("lbzip2", "stage3.tar.bz2").as_deref(), Some("lbzip2"));
        assert_eq!(map.mode_for_source("stage3.tar.xz").as_deref(), Some("xz"));
        assert_eq!(map.mode_for_source("/a/b/portage.tar.gz").as_deref(), Some("gzip"));
        assert_eq!(map.mode_for_source("image.squashfs").as_deref(), Some("squashfs"));
    }

    #[test]
    fn tools_name_the_programs_a_mode_runs() {
        let (_, map) = recorded(0);
        assert_eq!(map.tools("tbz2"), vec!["tar", "lbzip2"]);
        assert_eq!(map.tools("xz"), vec!["tar", "xz"]);
        assert_eq!(map.tools("tar"), vec!["tar"]);
        assert_eq!(map.tools("squashfs"), vec!["mksquashfs"]);
        assert!(map.tools("zip").is_empty());
    }

    #[test]
    fn only_tar_modes_use_basedir() {
        let (_, map) = recorded(0);
        assert!(map.uses_basedir("gzip"));
        assert!(!map.uses_basedir("squashfs"));
        assert!(!map.uses_basedir("rsync"));
    }

    #[test]
    fn custom_separator() {
        let map = CompressMap::new(DefinitionTable::compression(), BTreeMap::new(), None)
            .with_separator("_");
        assert_eq!(map.get_extension("stage_tar"), Some("tar".to_string()));
        let cmd = map
            .invocation(&tar_info().filename("/out/repo").auto_extension(true))
            .unwrap();
        assert_eq!(cmd.get_args()[1], "/out/repo_tar");
    }

    fn snapshot(root: &Path) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                let rel = entry.path().strip_prefix(root).unwrap();
                out.push((rel.display().to_string(), fs::read(entry.path()).unwrap()));
            }
        }
        out
    }

    fn round_trip(mode: &str) {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("base");
        fs::create_dir_all(base.join("repo/app-misc/hello")).unwrap();
        fs::write(base.join("repo/app-misc/hello/hello-1.ebuild"), "EAPI=8\n").unwrap();
        fs::write(base.join("repo/README"), vec![7u8; 4096]).unwrap();

        let out = temp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        let compressor = CompressMap::new(DefinitionTable::compression(), BTreeMap::new(), None);
        let info = InfoDict::new()
            .source("repo")
            .basedir(&base)
            .filename(out.join("repo"))
            .mode(mode)
            .auto_extension(true);
        assert!(compressor.compress(Some(info), true).unwrap());

        let ext = compressor.extension(mode).unwrap();
        let archive = out.join(format!("repo.{ext}"));
        assert!(archive.is_file());

        let dest = temp.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        let extractor = CompressMap::new(DefinitionTable::decompression(), BTreeMap::new(), None);
        let info = InfoDict::new().source(&archive).destination(&dest);
        assert!(extractor.extract(Some(info), true).unwrap());

        assert_eq!(snapshot(&base.join("repo")), snapshot(&dest.join("repo")));
    }

    #[test]
    fn tar_round_trip_reproduces_tree() {
        round_trip("tar");
    }

    #[test]
    fn gzip_round_trip_reproduces_tree() {
        round_trip("gzip");
    }
}
