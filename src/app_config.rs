//! Optional config file for CLI defaults.
//!
//! The format is a flat `key = value` subset of TOML:
//!
//! ```toml
//! download_dir = "/data/downloads"
//! max_retries = 5
//! connect_timeout_secs = 10
//! read_timeout_secs = 60
//! progress_interval_ms = 250
//! allow_duplicate = false
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Values read from the config file; `None` means "use the built-in default".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Root directory for relative destination folders.
    pub download_dir: Option<PathBuf>,
    /// Retry ceiling per session.
    pub max_retries: Option<u8>,
    /// Probe / response-header timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// Per-chunk read timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// Minimum spacing between progress events in milliseconds.
    pub progress_interval_ms: Option<u64>,
    /// Keep existing files and pick a suffixed name instead.
    pub allow_duplicate: Option<bool>,
}

impl FileConfig {
    /// Validates config values against the ranges the CLI accepts.
    pub fn validate(&self) -> Result<()> {
        if let Some(max_retries) = self.max_retries
            && max_retries > 10
        {
            bail!("Invalid config value for `max_retries`: {max_retries}. Expected range: 0..=10");
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        if let Some(interval) = self.progress_interval_ms
            && interval > 10_000
        {
            bail!(
                "Invalid config value for `progress_interval_ms`: {interval}. Expected range: 0..=10000"
            );
        }
        Ok(())
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Path that was checked, if one could be resolved.
    pub path: Option<PathBuf>,
    /// Parsed values; defaults when no file exists.
    pub config: FileConfig,
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/kdownload/config.toml`
/// 2. `$HOME/.config/kdownload/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("kdownload")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("kdownload")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads `explicit` (which must exist), or the default path if present.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = load_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config,
        });
    }

    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path) if path.exists() => load_file_config(path)?,
        _ => FileConfig::default(),
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "download_dir" => {
                cfg.download_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(context)?,
                ));
            }
            "max_retries" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                let n = u8::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("max_retries out of range for u8"))?;
                cfg.max_retries = Some(n);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "progress_interval_ms" => {
                cfg.progress_interval_ms = Some(parse_integer_u64(value).with_context(context)?);
            }
            "allow_duplicate" => {
                cfg.allow_duplicate = Some(parse_boolean(value).with_context(context)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    if token.starts_with('-') {
        bail!("Expected non-negative integer");
    }
    Ok(token.parse::<u64>()?)
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_config_all_fields() {
        let cfg = parse_config_str(
            r#"
            # kdownload defaults
            download_dir = "/data/dl"   # trailing comment
            max_retries = 5
            connect_timeout_secs = 10
            read_timeout_secs = 60
            progress_interval_ms = 250
            allow_duplicate = true
            "#,
        )
        .unwrap();

        assert_eq!(cfg.download_dir, Some(PathBuf::from("/data/dl")));
        assert_eq!(cfg.max_retries, Some(5));
        assert_eq!(cfg.connect_timeout_secs, Some(10));
        assert_eq!(cfg.read_timeout_secs, Some(60));
        assert_eq!(cfg.progress_interval_ms, Some(250));
        assert_eq!(cfg.allow_duplicate, Some(true));
    }

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str("max_retries = 0\n").unwrap();
        assert_eq!(cfg.max_retries, Some(0));
        assert_eq!(cfg.download_dir, None);
    }

    #[test]
    fn test_parse_config_hash_inside_string_kept() {
        let cfg = parse_config_str(r#"download_dir = "/tmp/#1""#).unwrap();
        assert_eq!(cfg.download_dir, Some(PathBuf::from("/tmp/#1")));
    }

    #[test]
    fn test_parse_config_unknown_key_rejected() {
        let err = parse_config_str("concurrency = 4").unwrap_err();
        assert!(err.to_string().contains("Unknown configuration key"));
    }

    #[test]
    fn test_parse_config_missing_equals_rejected() {
        let err = parse_config_str("max_retries 4").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_parse_config_out_of_range_rejected() {
        assert!(parse_config_str("max_retries = 11").is_err());
        assert!(parse_config_str("connect_timeout_secs = 0").is_err());
        assert!(parse_config_str("read_timeout_secs = 3601").is_err());
        assert!(parse_config_str("progress_interval_ms = 10001").is_err());
    }

    #[test]
    fn test_parse_config_bad_types_rejected() {
        assert!(parse_config_str("download_dir = /unquoted").is_err());
        assert!(parse_config_str("allow_duplicate = yes").is_err());
        assert!(parse_config_str("max_retries = -1").is_err());
    }

    #[test]
    fn test_load_config_explicit_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "allow_duplicate = true\n").unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.config.allow_duplicate, Some(true));
    }

    #[test]
    fn test_load_config_explicit_missing_file_errors() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope.toml");
        assert!(load_config(Some(&missing)).is_err());
    }
}
