use std::fs;
use std::path::{Path, PathBuf};

use super::BuildConfig;
use crate::error::ConfigError;

/// System-wide settings file consulted when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/stage-builder/stage-builder.toml";

/// Settings every build starts from before any file is read.
const DEFAULTS: &[(&str, &str)] = &[
    ("storedir", "/var/tmp/stage-builder"),
    ("sharedir", "/usr/share/stage-builder"),
    ("distdir", "/var/cache/distfiles"),
    ("portdir", "/var/db/repos/gentoo"),
    ("repo_basedir", "/var/db/repos"),
    ("repo_name", "gentoo"),
    ("target_distdir", "/var/cache/distfiles"),
    ("target_pkgdir", "/var/cache/binpkgs"),
    ("compression_mode", "tbz2"),
    ("decompression_mode", "auto"),
    ("snapshot_name", "gentoo-"),
    ("hash_function", "sha512"),
];

/// Resolve which settings file to use.
///
/// An explicit path must exist. Otherwise the system file and then the user
/// config directory are tried; `None` means built-in defaults only.
pub fn locate_config(explicit: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        return Ok(Some(path.to_path_buf()));
    }

    let system = PathBuf::from(DEFAULT_CONFIG_PATH);
    if system.is_file() {
        return Ok(Some(system));
    }

    if let Some(user) = dirs::config_dir().map(|d| d.join("stage-builder").join("config.toml")) {
        if user.is_file() {
            return Ok(Some(user));
        }
    }

    Ok(None)
}

pub fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    content
        .parse::<toml::Table>()
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Split a `KEY=VALUE` command line override.
pub fn parse_override(raw: &str) -> Result<(String, String), ConfigError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(ConfigError::InvalidValue {
            key: raw.to_string(),
            message: "expected KEY=VALUE".to_string(),
        });
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: raw.to_string(),
            message: "empty key".to_string(),
        });
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Build the configuration for one run.
///
/// Layers apply in order: defaults, settings file, spec file, overrides.
/// Spec file keys and overrides are subject to per-target validation.
pub fn load(
    config_file: Option<&Path>,
    spec_file: Option<&Path>,
    overrides: &[String],
) -> Result<BuildConfig, ConfigError> {
    let mut config = BuildConfig::new();
    for (key, value) in DEFAULTS {
        config.set_str(key, *value);
    }

    if let Some(path) = locate_config(config_file)? {
        tracing::info!("Loading settings from {}", path.display());
        config.merge_table(&read_table(&path)?, false)?;
    } else {
        tracing::debug!("no settings file found, using built-in defaults");
    }

    if let Some(path) = spec_file {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        config.merge_table(&read_table(path)?, true)?;
    }

    for raw in overrides {
        let (key, value) = parse_override(raw)?;
        config.apply_override(&key, &value)?;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_layers_in_order() {
        let temp = TempDir::new().unwrap();
        let settings = temp.path().join("settings.toml");
        fs::write(
            &settings,
            r#"
storedir = "/srv/builds"
options = "autoresume"

[env]
FEATURES = "-sandbox"
"#,
        )
        .unwrap();
        let spec = temp.path().join("stage1.toml");
        fs::write(
            &spec,
            r#"
target = "stage1"
version_stamp = "2024.1"
storedir = "/srv/override"
"#,
        )
        .unwrap();

        let overrides = vec!["version_stamp=2024.2".to_string()];
        let config = load(Some(&settings), Some(&spec), &overrides).unwrap();

        assert_eq!(config.get_str("storedir"), Some("/srv/override"));
        assert_eq!(config.get_str("version_stamp"), Some("2024.2"));
        assert_eq!(config.get_str("compression_mode"), Some("tbz2"));
        assert!(config.has_option("autoresume"));
        assert_eq!(config.env()["FEATURES"], "-sandbox");
        assert!(config.spec_keys().any(|k| k == "target"));
        assert!(!config.spec_keys().any(|k| k == "compression_mode"));
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing.toml");
        assert!(matches!(
            locate_config(Some(&missing)),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_parse_error_names_file() {
        let temp = TempDir::new().unwrap();
        let bad = temp.path().join("bad.toml");
        fs::write(&bad, "target = [").unwrap();
        let err = read_table(&bad).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("livecd/type=generic-livecd").unwrap(),
            ("livecd/type".to_string(), "generic-livecd".to_string())
        );
        assert_eq!(
            parse_override("cflags=-O2 -march=native").unwrap().1,
            "-O2 -march=native"
        );
        assert!(parse_override("no-equals").is_err());
        assert!(parse_override("=value").is_err());
    }
}
