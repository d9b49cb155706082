//! Built-in (de)compression definition tables and TOML loading.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CompressError;

/// Which entry point a table serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Compression,
    Decompression,
}

impl Family {
    /// Mode used when the caller does not name one.
    pub fn default_mode(self) -> &'static str {
        match self {
            Family::Compression => "tbz2",
            Family::Decompression => "auto",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Compression => f.write_str("Compression"),
            Family::Decompression => f.write_str("Decompression"),
        }
    }
}

impl FromStr for Family {
    type Err = CompressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Compression" => Ok(Family::Compression),
            "Decompression" => Ok(Family::Decompression),
            other => Err(CompressError::UnknownFamily(other.to_string())),
        }
    }
}

/// How a definition is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Template substitution into `cmd args...`.
    Common,
    /// Fixed `cmd -a --delete <source> <destination>`.
    Rsync,
}

/// One mode: the external tool and how to call it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionDefinition {
    pub dispatch: Dispatch,
    pub cmd: String,
    pub args: Vec<String>,
    pub id: String,
    /// Known file extensions, primary first. Empty for rsync.
    pub extensions: Vec<String>,
}

impl CompressionDefinition {
    fn common(cmd: &str, args: &[&str], id: &str, extensions: &[&str]) -> Self {
        Self {
            dispatch: Dispatch::Common,
            cmd: cmd.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            id: id.to_string(),
            extensions: extensions.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn rsync() -> Self {
        Self {
            dispatch: Dispatch::Rsync,
            cmd: "rsync".to_string(),
            args: vec![
                "-a".to_string(),
                "--delete".to_string(),
                "{source}".to_string(),
                "{destination}".to_string(),
            ],
            id: "RSYNC".to_string(),
            extensions: Vec::new(),
        }
    }
}

/// A family descriptor plus its modes.
#[derive(Debug, Clone)]
pub struct DefinitionTable {
    pub family: Family,
    pub description: String,
    pub definitions: BTreeMap<String, CompressionDefinition>,
}

const TAR_CREATE: &[&str] = &["{filename}", "-C", "{basedir}", "{source}"];
const TAR_EXTRACT: &[&str] = &["{source}", "-C", "{destination}"];

fn with_tail(head: &[&'static str], tail: &[&'static str]) -> Vec<&'static str> {
    head.iter().chain(tail.iter()).copied().collect()
}

impl DefinitionTable {
    /// Built-in compression modes.
    pub fn compression() -> Self {
        let mut d = BTreeMap::new();
        d.insert("rsync".to_string(), CompressionDefinition::rsync());
        d.insert(
            "lbzip2".to_string(),
            CompressionDefinition::common(
                "tar",
                &with_tail(&["-I", "lbzip2", "-cf"], TAR_CREATE),
                "LBZIP2",
                &["tar.bz2"],
            ),
        );
        d.insert(
            "tbz2".to_string(),
            CompressionDefinition::common(
                "tar",
                &with_tail(&["-I", "lbzip2", "-cf"], TAR_CREATE),
                "LBZIP2",
                &["tbz2"],
            ),
        );
        d.insert(
            "bzip2".to_string(),
            CompressionDefinition::common("tar", &with_tail(&["-cpjf"], TAR_CREATE), "BZIP2", &["tar.bz2"]),
        );
        d.insert(
            "tar".to_string(),
            CompressionDefinition::common("tar", &with_tail(&["-cpf"], TAR_CREATE), "TAR", &["tar"]),
        );
        d.insert(
            "xz".to_string(),
            CompressionDefinition::common("tar", &with_tail(&["-cpJf"], TAR_CREATE), "XZ", &["tar.xz"]),
        );
        d.insert(
            "pixz".to_string(),
            CompressionDefinition::common(
                "tar",
                &with_tail(&["-I", "pixz", "-cpf"], TAR_CREATE),
                "PIXZ",
                &["tar.xz"],
            ),
        );
        d.insert(
            "gzip".to_string(),
            CompressionDefinition::common("tar", &with_tail(&["-cpzf"], TAR_CREATE), "GZIP", &["tar.gz"]),
        );
        d.insert(
            "squashfs".to_string(),
            CompressionDefinition::common(
                "mksquashfs",
                &["{source}", "{destination}", "-comp", "xz", "-Xbcj", "{arch}", "-b", "1M"],
                "SQUASHFS",
                &["squashfs", "sfs"],
            ),
        );
        Self {
            family: Family::Compression,
            description: "Compression definitions loaded".to_string(),
            definitions: d,
        }
    }

    /// Built-in decompression modes.
    pub fn decompression() -> Self {
        let mut d = BTreeMap::new();
        d.insert("rsync".to_string(), CompressionDefinition::rsync());
        d.insert(
            "lbzip2".to_string(),
            CompressionDefinition::common(
                "tar",
                &with_tail(&["-I", "lbzip2", "-xpf"], TAR_EXTRACT),
                "LBZIP2",
                &["bz2", "tar.bz2", "tbz2"],
            ),
        );
        d.insert(
            "bzip2".to_string(),
            CompressionDefinition::common(
                "tar",
                &with_tail(&["-xpf"], TAR_EXTRACT),
                "BZIP2",
                &["bz2", "tar.bz2", "tbz2"],
            ),
        );
        d.insert(
            "tar".to_string(),
            CompressionDefinition::common("tar", &with_tail(&["-xpf"], TAR_EXTRACT), "TAR", &["tar"]),
        );
        d.insert(
            "xz".to_string(),
            CompressionDefinition::common(
                "tar",
                &with_tail(&["-xpf"], TAR_EXTRACT),
                "XZ",
                &["xz", "tar.xz"],
            ),
        );
        d.insert(
            "pixz".to_string(),
            CompressionDefinition::common(
                "tar",
                &with_tail(&["-I", "pixz", "-xpf"], TAR_EXTRACT),
                "PIXZ",
                &["xz", "tar.xz"],
            ),
        );
        d.insert(
            "gzip".to_string(),
            CompressionDefinition::common(
                "tar",
                &with_tail(&["-xpzf"], TAR_EXTRACT),
                "GZIP",
                &["gz", "tar.gz"],
            ),
        );
        d.insert(
            "squashfs".to_string(),
            CompressionDefinition::common(
                "unsquashfs",
                &["-d", "{destination}", "{source}"],
                "SQUASHFS",
                &["squashfs", "sfs"],
            ),
        );
        Self {
            family: Family::Decompression,
            description: "Decompression definitions loaded".to_string(),
            definitions: d,
        }
    }

    /// Parse a complete table. A `Type` entry is required.
    ///
    /// ```toml
    /// [Type]
    /// family = "Compression"
    /// description = "site compression modes"
    ///
    /// [zstd]
    /// dispatch = "common"
    /// cmd = "tar"
    /// args = ["-I", "zstd", "-cf", "{filename}", "-C", "{basedir}", "{source}"]
    /// id = "ZSTD"
    /// extensions = ["tar.zst"]
    /// ```
    pub fn from_toml(table: &toml::Table) -> Result<Self, CompressError> {
        let ty = table.get("Type").ok_or(CompressError::MissingType)?;
        let (family, description) = parse_type(ty)?;
        let mut out = Self {
            family,
            description,
            definitions: BTreeMap::new(),
        };
        out.merge_toml(table)?;
        Ok(out)
    }

    /// Add or replace modes from a TOML table. A `Type` entry, if present,
    /// must name this table's family.
    pub fn merge_toml(&mut self, table: &toml::Table) -> Result<(), CompressError> {
        for (mode, value) in table {
            if mode == "Type" {
                let (family, _) = parse_type(value)?;
                if family != self.family {
                    return Err(CompressError::UnknownFamily(family.to_string()));
                }
                continue;
            }
            let definition = parse_definition(mode, value)?;
            self.definitions.insert(mode.clone(), definition);
        }
        Ok(())
    }
}

fn parse_type(value: &toml::Value) -> Result<(Family, String), CompressError> {
    let family = value
        .get("family")
        .and_then(toml::Value::as_str)
        .ok_or(CompressError::MissingType)?
        .parse::<Family>()?;
    let description = value
        .get("description")
        .and_then(toml::Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{family} definitions loaded"));
    Ok((family, description))
}

fn parse_definition(mode: &str, value: &toml::Value) -> Result<CompressionDefinition, CompressError> {
    let invalid = |message: &str| CompressError::InvalidEntry {
        mode: mode.to_string(),
        message: message.to_string(),
    };
    let string_list = |key: &str| -> Result<Vec<String>, CompressError> {
        match value.get(key) {
            None => Ok(Vec::new()),
            Some(toml::Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| invalid(&format!("\"{key}\" must be a list of strings")))
                })
                .collect(),
            Some(_) => Err(invalid(&format!("\"{key}\" must be a list of strings"))),
        }
    };

    let dispatch = match value.get("dispatch").and_then(toml::Value::as_str) {
        None | Some("common") => Dispatch::Common,
        Some("rsync") => Dispatch::Rsync,
        Some(other) => {
            return Err(CompressError::UnknownDispatch {
                mode: mode.to_string(),
                func: other.to_string(),
            });
        }
    };
    let cmd = value
        .get("cmd")
        .and_then(toml::Value::as_str)
        .ok_or_else(|| invalid("missing \"cmd\""))?
        .to_string();
    let id = value
        .get("id")
        .and_then(toml::Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| mode.to_uppercase());

    Ok(CompressionDefinition {
        dispatch,
        cmd,
        args: string_list("args")?,
        id,
        extensions: string_list("extensions")?,
    })
}
