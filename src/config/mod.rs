//! Build configuration.
//!
//! A [`BuildConfig`] is produced once from the settings file, the build spec
//! and command line overrides. Normalization decides the shape of every value
//! at ingestion time: keys matching [`LIST_KEYS`] become ordered lists and all
//! other keys become single strings, so nothing downstream has to inspect a
//! value's shape.

mod load;

pub use load::{load, locate_config, parse_override, read_table, DEFAULT_CONFIG_PATH};

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::error::ConfigError;

/// Keys whose values are always lists. `*` matches exactly one path segment.
pub const LIST_KEYS: &[&str] = &[
    "use",
    "hostuse",
    "grp",
    "grp/*/packages",
    "portage_overlay",
    "digests",
    "contents",
    "boot/kernel",
    "boot/kernel/*/packages",
    "boot/kernel/*/use",
    "*/packages",
    "*/use",
    "*/rm",
    "*/empty",
    "*/unmerge",
    "*/rcadd",
    "*/rcdel",
    "*/overlay",
    "*/root_overlay",
    "*/modblacklist",
    "*/users",
];

/// Tables that are consumed whole instead of being flattened into keys.
pub const RESERVED_TABLES: &[&str] = &["env", "compress_definitions", "decompress_definitions"];

/// A normalized configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    List(Vec<String>),
}

/// The single mutable build context shared by all steps of one run.
#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    values: BTreeMap<String, Value>,
    spec_keys: BTreeSet<String>,
    options: Vec<String>,
    env: BTreeMap<String, String>,
    tables: BTreeMap<String, toml::Table>,
}

/// Returns true when `key` matches `pattern` segment by segment.
pub fn key_matches(pattern: &str, key: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut key_parts = key.split('/');
    loop {
        match (pattern_parts.next(), key_parts.next()) {
            (None, None) => return true,
            (Some(p), Some(k)) if p == "*" || p == k => continue,
            _ => return false,
        }
    }
}

pub fn is_list_key(key: &str) -> bool {
    LIST_KEYS.iter().any(|pattern| key_matches(pattern, key))
}

impl BuildConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a raw TOML layer. Nested tables flatten to `a/b` keys.
    ///
    /// With `from_spec` the keys are remembered for per-target key validation.
    pub fn merge_table(&mut self, table: &toml::Table, from_spec: bool) -> Result<(), ConfigError> {
        for (key, value) in table {
            if RESERVED_TABLES.contains(&key.as_str()) {
                self.merge_reserved(key, value)?;
                continue;
            }
            self.merge_value(key, value, from_spec)?;
        }
        Ok(())
    }

    fn merge_reserved(&mut self, key: &str, value: &toml::Value) -> Result<(), ConfigError> {
        let toml::Value::Table(table) = value else {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "expected a table".to_string(),
            });
        };
        if key == "env" {
            for (name, value) in table {
                let text = scalar_text(name, value)?;
                self.env.insert(name.clone(), text);
            }
        } else {
            self.tables
                .entry(key.to_string())
                .or_default()
                .extend(table.clone());
        }
        Ok(())
    }

    fn merge_value(&mut self, key: &str, value: &toml::Value, from_spec: bool) -> Result<(), ConfigError> {
        if let toml::Value::Table(table) = value {
            for (child, value) in table {
                self.merge_value(&format!("{key}/{child}"), value, from_spec)?;
            }
            return Ok(());
        }

        let normalized = normalize_value(key, value)?;
        if key == "options" {
            let tokens = match &normalized {
                Value::Str(s) => s.split_whitespace().map(str::to_string).collect(),
                Value::List(items) => items.clone(),
            };
            for token in tokens {
                self.add_option(&token);
            }
            return Ok(());
        }

        if from_spec {
            self.spec_keys.insert(key.to_string());
        }
        self.values.insert(key.to_string(), normalized);
        Ok(())
    }

    /// Apply a `key=value` override as if it came from the spec file.
    pub fn apply_override(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.merge_value(key, &toml::Value::String(value.to_string()), true)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(Value::Str(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn require_str(&self, key: &str) -> Result<&str, ConfigError> {
        self.get_str(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get_str(key).map(PathBuf::from)
    }

    pub fn require_path(&self, key: &str) -> Result<PathBuf, ConfigError> {
        self.require_str(key).map(PathBuf::from)
    }

    /// List value for `key`; empty when absent.
    pub fn list(&self, key: &str) -> &[String] {
        match self.values.get(key) {
            Some(Value::List(items)) => items,
            _ => &[],
        }
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), Value::Str(value.into()));
    }

    pub fn set_path(&mut self, key: &str, value: &std::path::Path) {
        self.set_str(key, value.to_string_lossy().into_owned());
    }

    pub fn set_list<I, S>(&mut self, key: &str, items: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items = items.into_iter().map(Into::into).collect();
        self.values.insert(key.to_string(), Value::List(items));
    }

    /// Append to a list key, creating it when absent. Existing entries are kept.
    pub fn append_list<I, S>(&mut self, key: &str, items: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::List(Vec::new()));
        let new_items = items.into_iter().map(Into::into);
        match entry {
            Value::List(list) => {
                for item in new_items {
                    if !list.contains(&item) {
                        list.push(item);
                    }
                }
            }
            Value::Str(existing) => {
                let mut list: Vec<String> =
                    existing.split_whitespace().map(str::to_string).collect();
                list.extend(new_items);
                *entry = Value::List(list);
            }
        }
    }

    pub fn set_default(&mut self, key: &str, value: impl Into<String>) {
        if !self.contains(key) {
            self.set_str(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn spec_keys(&self) -> impl Iterator<Item = &str> {
        self.spec_keys.iter().map(String::as_str)
    }

    pub fn has_option(&self, token: &str) -> bool {
        self.options.iter().any(|o| o == token)
    }

    pub fn add_option(&mut self, token: &str) {
        if !token.is_empty() && !self.has_option(token) {
            self.options.push(token.to_string());
        }
    }

    pub fn remove_option(&mut self, token: &str) {
        self.options.retain(|o| o != token);
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Environment overlay from the `[env]` table.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn set_env(&mut self, key: &str, value: impl Into<String>) {
        self.env.insert(key.to_string(), value.into());
    }

    /// Reserved table (`compress_definitions`, `decompress_definitions`) if configured.
    pub fn table(&self, key: &str) -> Option<&toml::Table> {
        self.tables.get(key)
    }

    /// Check required keys and reject spec keys no pattern allows.
    pub fn validate(&self, required: &[String], valid: &[String]) -> Result<(), ConfigError> {
        for key in required {
            if !self.contains(key) {
                return Err(ConfigError::MissingKey(key.clone()));
            }
        }
        for key in &self.spec_keys {
            let allowed = required
                .iter()
                .chain(valid.iter())
                .any(|pattern| key_matches(pattern, key));
            if !allowed {
                return Err(ConfigError::UnrecognizedKey(key.clone()));
            }
        }
        Ok(())
    }

    /// Environment handed to controller scripts: every value exported as
    /// `clst_<key>` (slashes become underscores, lists space-joined), the
    /// options as `clst_options`, then the `[env]` overlay.
    pub fn controller_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for (key, value) in &self.values {
            let name = format!("clst_{}", key.replace(['/', '-'], "_"));
            let text = match value {
                Value::Str(s) => s.clone(),
                Value::List(items) => items.join(" "),
            };
            env.insert(name, text);
        }
        env.insert("clst_options".to_string(), self.options.join(" "));
        for (key, value) in &self.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

fn normalize_value(key: &str, value: &toml::Value) -> Result<Value, ConfigError> {
    match value {
        toml::Value::Array(items) => {
            let items = items
                .iter()
                .map(|item| scalar_text(key, item))
                .collect::<Result<Vec<_>, _>>()?;
            if is_list_key(key) {
                Ok(Value::List(items))
            } else {
                Ok(Value::Str(items.join(" ")))
            }
        }
        other => {
            let text = scalar_text(key, other)?;
            if is_list_key(key) {
                Ok(Value::List(
                    text.split_whitespace().map(str::to_string).collect(),
                ))
            } else {
                Ok(Value::Str(text))
            }
        }
    }
}

fn scalar_text(key: &str, value: &toml::Value) -> Result<String, ConfigError> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Datetime(d) => Ok(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "nested arrays and tables are not allowed here".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(src: &str) -> toml::Table {
        src.parse::<toml::Table>().unwrap()
    }

    #[test]
    fn key_patterns_match_single_segments() {
        assert!(key_matches("*/packages", "livecd/packages"));
        assert!(!key_matches("*/packages", "grp/cd1/packages"));
        assert!(key_matches("grp/*/packages", "grp/cd1/packages"));
        assert!(!key_matches("use", "livecd/use"));
    }

    #[test]
    fn scalar_or_list_values_are_normalized_once() {
        let mut config = BuildConfig::new();
        config
            .merge_table(
                &table(
                    r#"
                    "livecd/packages" = "app-editors/vim  sys-apps/less"
                    "livecd/modblacklist" = ["floppy", "pcspkr"]
                    cflags = ["-O2", "-pipe"]
                    version_stamp = 2024
                    "#,
                ),
                true,
            )
            .unwrap();

        assert_eq!(
            config.list("livecd/packages"),
            &["app-editors/vim".to_string(), "sys-apps/less".to_string()]
        );
        assert_eq!(config.list("livecd/modblacklist").len(), 2);
        assert_eq!(config.get_str("cflags"), Some("-O2 -pipe"));
        assert_eq!(config.get_str("version_stamp"), Some("2024"));
    }

    #[test]
    fn nested_tables_flatten_with_slashes() {
        let mut config = BuildConfig::new();
        config
            .merge_table(
                &table(
                    r#"
                    [grp.cd1]
                    type = "pkgset"
                    packages = "vim less"
                    "#,
                ),
                true,
            )
            .unwrap();
        assert_eq!(config.get_str("grp/cd1/type"), Some("pkgset"));
        assert_eq!(config.list("grp/cd1/packages").len(), 2);
        assert!(config.spec_keys().any(|k| k == "grp/cd1/type"));
    }

    #[test]
    fn options_become_a_token_set() {
        let mut config = BuildConfig::new();
        config
            .merge_table(&table(r#"options = "autoresume  purge autoresume""#), false)
            .unwrap();
        assert!(config.has_option("autoresume"));
        assert!(config.has_option("purge"));
        assert_eq!(config.options().len(), 2);
        assert!(!config.contains("options"));
    }

    #[test]
    fn reserved_tables_are_not_flattened() {
        let mut config = BuildConfig::new();
        config
            .merge_table(
                &table(
                    r#"
                    [env]
                    MAKEOPTS = "-j8"
                    [compress_definitions.Type]
                    family = "Compression"
                    "#,
                ),
                false,
            )
            .unwrap();
        assert_eq!(config.env().get("MAKEOPTS").map(String::as_str), Some("-j8"));
        assert!(config.table("compress_definitions").is_some());
        assert!(!config.contains("env/MAKEOPTS"));
    }

    #[test]
    fn append_list_extends_without_replacing() {
        let mut config = BuildConfig::new();
        config.set_list("use", ["X", "gtk"]);
        config.append_list("use", ["livecd", "X"]);
        assert_eq!(config.list("use"), &["X", "gtk", "livecd"]);
        config.append_list("livecd/packages", ["app-misc/livecd-tools"]);
        assert_eq!(config.list("livecd/packages"), &["app-misc/livecd-tools"]);
    }

    #[test]
    fn validate_rejects_missing_and_unknown_keys() {
        let mut config = BuildConfig::new();
        config
            .merge_table(&table(r#"target = "grp""#), true)
            .unwrap();
        let required = vec!["target".to_string(), "version_stamp".to_string()];
        assert!(matches!(
            config.validate(&required, &[]),
            Err(ConfigError::MissingKey(k)) if k == "version_stamp"
        ));

        config.apply_override("version_stamp", "2024").unwrap();
        config.apply_override("grp/cd1/type", "pkgset").unwrap();
        config.apply_override("bogus", "1").unwrap();
        let valid = vec!["grp/*/type".to_string()];
        assert!(matches!(
            config.validate(&required, &valid),
            Err(ConfigError::UnrecognizedKey(k)) if k == "bogus"
        ));
        config.remove(&"bogus".to_string());
    }

    #[test]
    fn controller_env_exports_clst_variables() {
        let mut config = BuildConfig::new();
        config.set_str("livecd/type", "generic-livecd");
        config.set_list("livecd/packages", ["vim", "less"]);
        config.add_option("autoresume");
        config.set_env("MAKEOPTS", "-j4");
        let env = config.controller_env();
        assert_eq!(env["clst_livecd_type"], "generic-livecd");
        assert_eq!(env["clst_livecd_packages"], "vim less");
        assert_eq!(env["clst_options"], "autoresume");
        assert_eq!(env["MAKEOPTS"], "-j4");
    }
}
