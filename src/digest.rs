//! `.DIGESTS` and `.CONTENTS` companions for finished artifacts.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::process::{Cmd, Runner};
use crate::store::atomic_write;

pub const DIGESTS_SUFFIX: &str = ".DIGESTS";
pub const CONTENTS_SUFFIX: &str = ".CONTENTS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha224" => Ok(Self::Sha224),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => bail!("unsupported digest '{other}' (expected sha224, sha256, sha384 or sha512)"),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Sha224 => "SHA224",
            Self::Sha256 => "SHA256",
            Self::Sha384 => "SHA384",
            Self::Sha512 => "SHA512",
        }
    }

    pub fn hash_file(self, path: &Path) -> Result<String> {
        match self {
            Self::Sha224 => hash_with::<Sha224>(path),
            Self::Sha256 => hash_with::<Sha256>(path),
            Self::Sha384 => hash_with::<Sha384>(path),
            Self::Sha512 => hash_with::<Sha512>(path),
        }
    }
}

fn hash_with<D: Digest>(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = D::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut hex = String::new();
    for byte in hasher.finalize() {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

fn companion(artifact: &Path, suffix: &str) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn is_companion(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy())
        .map_or(false, |n| n.ends_with(DIGESTS_SUFFIX) || n.ends_with(CONTENTS_SUFFIX))
}

/// Write `<artifact>.DIGESTS` with one block per hash:
///
/// ```text
/// # SHA512 HASH
/// <hex>  <file name>
/// ```
pub fn write_digests(artifact: &Path, hashes: &[HashKind]) -> Result<PathBuf> {
    let name = artifact
        .file_name()
        .with_context(|| format!("No file name in {}", artifact.display()))?
        .to_string_lossy()
        .into_owned();
    let mut body = String::new();
    for kind in hashes {
        let hex = kind.hash_file(artifact)?;
        let _ = writeln!(body, "# {} HASH", kind.label());
        let _ = writeln!(body, "{hex}  {name}");
    }
    let out = companion(artifact, DIGESTS_SUFFIX);
    atomic_write(&out, body.as_bytes())?;
    Ok(out)
}

/// Lister used for an artifact's contents, chosen by file name.
pub fn contents_command(artifact: &Path) -> Option<Cmd> {
    let name = artifact.file_name()?.to_string_lossy().into_owned();
    let is_tar = [".tar", ".tar.gz", ".tar.bz2", ".tar.xz", ".tbz2", ".tgz", ".txz"]
        .iter()
        .any(|ext| name.ends_with(ext));
    if is_tar {
        return Some(Cmd::new("tar").arg("-tvf").arg_path(artifact).id("TAR"));
    }
    if name.ends_with(".squashfs") || name.ends_with(".sfs") {
        return Some(
            Cmd::new("unsquashfs")
                .arg("-l")
                .arg_path(artifact)
                .id("SQUASHFS"),
        );
    }
    if name.ends_with(".iso") {
        return Some(
            Cmd::new("isoinfo")
                .args(["-l", "-i"])
                .arg_path(artifact)
                .id("ISOINFO"),
        );
    }
    None
}

/// Write `<artifact>.CONTENTS` from the external lister's output.
///
/// Returns `None` when no lister handles the file type.
pub fn write_contents(runner: &dyn Runner, artifact: &Path) -> Result<Option<PathBuf>> {
    let Some(cmd) = contents_command(artifact) else {
        tracing::warn!("no contents lister for {}", artifact.display());
        return Ok(None);
    };
    let output = runner
        .capture(&cmd)
        .with_context(|| format!("Failed to execute '{cmd}'"))?;
    if !output.success() {
        bail!(
            "'{}' exited with status {}: {}",
            cmd,
            output.code,
            output.stderr.trim()
        );
    }
    let out = companion(artifact, CONTENTS_SUFFIX);
    atomic_write(&out, output.stdout.as_bytes())?;
    Ok(Some(out))
}

/// Remove stale companions next to `artifact`.
pub fn remove_companions(artifact: &Path) -> Result<()> {
    for suffix in [DIGESTS_SUFFIX, CONTENTS_SUFFIX] {
        let path = companion(artifact, suffix);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

/// Regenerate both companions for `artifact`.
pub fn generate(
    runner: &dyn Runner,
    artifact: &Path,
    hashes: &[HashKind],
    contents: bool,
) -> Result<()> {
    if !artifact.is_file() {
        bail!("artifact not found: {}", artifact.display());
    }
    remove_companions(artifact)?;
    if !hashes.is_empty() {
        let out = write_digests(artifact, hashes)?;
        tracing::info!("Wrote {}", out.display());
    }
    if contents {
        if let Some(out) = write_contents(runner, artifact)? {
            tracing::info!("Wrote {}", out.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SystemRunner;
    use tempfile::TempDir;

    #[test]
    fn test_digests_file_format() {
        let temp = TempDir::new().unwrap();
        let artifact = temp.path().join("stage1.tar");
        fs::write(&artifact, b"abc").unwrap();

        let out = write_digests(&artifact, &[HashKind::Sha256]).unwrap();
        assert_eq!(out, temp.path().join("stage1.tar.DIGESTS"));
        let body = fs::read_to_string(out).unwrap();
        assert_eq!(
            body,
            "# SHA256 HASH\n\
             ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad  stage1.tar\n"
        );
    }

    #[test]
    fn test_hash_names() {
        assert_eq!(HashKind::parse("SHA512").unwrap(), HashKind::Sha512);
        assert!(HashKind::parse("md5").is_err());
    }

    #[test]
    fn test_contents_command_by_extension() {
        let tar = contents_command(Path::new("/b/stage.tar.bz2")).unwrap();
        assert_eq!(tar.get_args()[0], "-tvf");
        let sfs = contents_command(Path::new("/b/image.squashfs")).unwrap();
        assert_eq!(sfs.program(), "unsquashfs");
        let iso = contents_command(Path::new("/b/install.iso")).unwrap();
        assert_eq!(iso.program(), "isoinfo");
        assert!(contents_command(Path::new("/b/readme.txt")).is_none());
    }

    #[test]
    fn test_generate_with_real_tar() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("hello"), "hi").unwrap();
        let artifact = temp.path().join("bundle.tar");
        let status = std::process::Command::new("tar")
            .arg("-cf")
            .arg(&artifact)
            .arg("-C")
            .arg(temp.path())
            .arg("hello")
            .status()
            .unwrap();
        assert!(status.success());

        generate(&SystemRunner, &artifact, &[HashKind::Sha512], true).unwrap();
        let contents = fs::read_to_string(temp.path().join("bundle.tar.CONTENTS")).unwrap();
        assert!(contents.contains("hello"));
        assert!(temp.path().join("bundle.tar.DIGESTS").is_file());
        assert!(is_companion(&temp.path().join("bundle.tar.DIGESTS")));
    }
}
