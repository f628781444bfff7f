//! Configuration file loading and CLI merging.
//!
//! The file holds `key = value` lines (strings double-quoted, `#` comments).
//! Values given on the command line win over file values, which win over the
//! library defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use imgsync_core::asset::RetryPolicy;
use imgsync_core::config::{DEFAULT_LINK_PREFIX, FailureLogConfig, PipelineConfig, RewriterConfig};
use imgsync_core::scheduler::SchedulerConfig;

use crate::cli::Args;

const DEFAULT_OUTPUT_DIR: &str = "imgsync-out";
const DEFAULT_CACHE_DIR: &str = ".imgsync-cache";
const ASSET_SUBDIR: &str = "assets";

/// Defaults read from the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    pub output_dir: Option<PathBuf>,
    pub asset_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub link_prefix: Option<String>,
    pub concurrency: Option<u8>,
    pub max_attempts: Option<u32>,
    pub attempt_timeout_secs: Option<u64>,
    pub item_timeout_secs: Option<u64>,
    pub max_width: Option<u32>,
    pub jpeg_quality: Option<u8>,
    pub min_process_bytes: Option<u64>,
    pub cache_ttl_days: Option<u64>,
    pub documents_per_second: Option<u64>,
    pub failure_log: Option<PathBuf>,
}

impl FileConfig {
    /// Validates config values against the same ranges the CLI enforces.
    pub fn validate(&self) -> Result<()> {
        validate_range("concurrency", self.concurrency.map(u64::from), 1, 50)?;
        validate_range("max_attempts", self.max_attempts.map(u64::from), 1, 10)?;
        validate_range("attempt_timeout_secs", self.attempt_timeout_secs, 1, 600)?;
        validate_range("item_timeout_secs", self.item_timeout_secs, 1, 3600)?;
        validate_range("max_width", self.max_width.map(u64::from), 16, 16384)?;
        validate_range("jpeg_quality", self.jpeg_quality.map(u64::from), 30, 100)?;
        validate_range("min_process_bytes", self.min_process_bytes, 0, 100 * 1024 * 1024)?;
        validate_range("cache_ttl_days", self.cache_ttl_days, 1, 3650)?;
        validate_range("documents_per_second", self.documents_per_second, 1, 100)?;
        Ok(())
    }
}

fn validate_range(field: &str, value: Option<u64>, min: u64, max: u64) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(min..=max).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/imgsync/config.toml`
/// 2. `$HOME/.config/imgsync/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join("imgsync").join("config.toml"));
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("imgsync")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads `explicit` if given (it must exist), else the default path if present.
pub fn load_file_config(explicit: Option<&Path>) -> Result<Option<FileConfig>> {
    if let Some(path) = explicit {
        return read_file_config(path).map(Some);
    }
    match resolve_default_config_path() {
        Some(path) if path.exists() => read_file_config(&path).map(Some),
        _ => Ok(None),
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!(
                "Invalid config syntax on line {}: expected key = value",
                line_index + 1
            );
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let line_number = line_index + 1;
        let context = || format!("Invalid `{key}` value on line {line_number}");

        match key {
            "output_dir" => {
                cfg.output_dir = Some(PathBuf::from(parse_string_literal(value).with_context(context)?));
            }
            "asset_dir" => {
                cfg.asset_dir = Some(PathBuf::from(parse_string_literal(value).with_context(context)?));
            }
            "cache_dir" => {
                cfg.cache_dir = Some(PathBuf::from(parse_string_literal(value).with_context(context)?));
            }
            "failure_log" => {
                cfg.failure_log = Some(PathBuf::from(parse_string_literal(value).with_context(context)?));
            }
            "link_prefix" => {
                cfg.link_prefix = Some(parse_string_literal(value).with_context(context)?);
            }
            "concurrency" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                cfg.concurrency = Some(u8::try_from(parsed).with_context(context)?);
            }
            "max_attempts" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                cfg.max_attempts = Some(u32::try_from(parsed).with_context(context)?);
            }
            "max_width" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                cfg.max_width = Some(u32::try_from(parsed).with_context(context)?);
            }
            "jpeg_quality" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                cfg.jpeg_quality = Some(u8::try_from(parsed).with_context(context)?);
            }
            "attempt_timeout_secs" => {
                cfg.attempt_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "item_timeout_secs" => {
                cfg.item_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "min_process_bytes" => {
                cfg.min_process_bytes = Some(parse_integer_u64(value).with_context(context)?);
            }
            "cache_ttl_days" => {
                cfg.cache_ttl_days = Some(parse_integer_u64(value).with_context(context)?);
            }
            "documents_per_second" => {
                cfg.documents_per_second = Some(parse_integer_u64(value).with_context(context)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_number}");
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
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

/// Everything the run needs, after merging CLI, file, and defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub pipeline: PipelineConfig,
    pub rewriter: RewriterConfig,
    pub scheduler: SchedulerConfig,
    pub failure_log: Option<FailureLogConfig>,
}

impl Settings {
    /// Merges `args` over `file` over library defaults.
    #[must_use]
    pub fn resolve(args: &Args, file: Option<&FileConfig>) -> Self {
        let file = file.cloned().unwrap_or_default();

        let output_dir = args
            .output
            .clone()
            .or(file.output_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
        let asset_dir = args
            .asset_dir
            .clone()
            .or(file.asset_dir)
            .unwrap_or_else(|| output_dir.join(ASSET_SUBDIR));
        let cache_dir = args
            .cache_dir
            .clone()
            .or(file.cache_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));

        let mut pipeline = PipelineConfig::new(asset_dir, cache_dir);
        if let Some(attempts) = args.max_attempts.or(file.max_attempts) {
            pipeline.retry = RetryPolicy::with_max_attempts(attempts);
        }
        if let Some(secs) = args.attempt_timeout.or(file.attempt_timeout_secs) {
            pipeline.attempt_timeout = Duration::from_secs(secs);
        }
        if let Some(width) = args.max_width.or(file.max_width) {
            pipeline.limits.max_width = width;
        }
        if let Some(quality) = args.jpeg_quality.or(file.jpeg_quality) {
            pipeline.jpeg_quality = quality;
        }
        if let Some(bytes) = file.min_process_bytes {
            pipeline.limits.min_process_bytes = usize::try_from(bytes).unwrap_or(usize::MAX);
        }
        if let Some(days) = file.cache_ttl_days {
            pipeline.cache_ttl = Duration::from_secs(days * 24 * 60 * 60);
        }

        let mut rewriter = RewriterConfig {
            link_prefix: args
                .link_prefix
                .clone()
                .or(file.link_prefix)
                .unwrap_or_else(|| DEFAULT_LINK_PREFIX.to_string()),
            ..RewriterConfig::default()
        };
        if let Some(concurrency) = args.concurrency.or(file.concurrency) {
            rewriter.max_concurrent = usize::from(concurrency);
        }
        if let Some(secs) = file.item_timeout_secs {
            rewriter.item_timeout = Duration::from_secs(secs);
        }

        let mut scheduler = SchedulerConfig::default();
        if let Some(per_second) = args.documents_per_second.or(file.documents_per_second) {
            scheduler.max_per_interval = usize::try_from(per_second).unwrap_or(usize::MAX);
        }

        let failure_log = args
            .failure_log
            .clone()
            .or(file.failure_log)
            .map(FailureLogConfig::new);

        Self {
            input: args.input.clone(),
            output_dir,
            pipeline,
            rewriter,
            scheduler,
            failure_log,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str(
            r#"
concurrency = 8
link_prefix = "img/" # where assets are linked
"#,
        )
        .expect("partial config should parse");
        assert_eq!(cfg.concurrency, Some(8));
        assert_eq!(cfg.link_prefix.as_deref(), Some("img/"));
        assert!(cfg.output_dir.is_none());
    }

    #[test]
    fn test_parse_config_rejects_out_of_range_values() {
        let err = parse_config_str("concurrency = 0").expect_err("invalid concurrency expected");
        assert!(err.to_string().contains("concurrency"));

        let err = parse_config_str("jpeg_quality = 10").expect_err("invalid quality expected");
        assert!(err.to_string().contains("jpeg_quality"));

        let err = parse_config_str("concurrency = 300").expect_err("u8 overflow expected");
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_parse_config_rejects_trailing_tokens() {
        let err = parse_config_str("max_attempts = 4 trailing")
            .expect_err("expected trailing token error");
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_parse_config_rejects_unquoted_strings() {
        let err = parse_config_str("cache_dir = /tmp/cache").expect_err("expected quote error");
        assert!(err.to_string().contains("cache_dir"));
    }

    #[test]
    fn test_parse_config_rejects_unknown_keys() {
        let err = parse_config_str("unknown_key = 123").expect_err("unknown key error expected");
        assert!(err.to_string().contains("Unknown configuration key"));
        assert!(err.to_string().contains("unknown_key"));
    }

    #[test]
    fn test_parse_config_keeps_hash_inside_strings() {
        let cfg = parse_config_str(r##"link_prefix = "#assets/""##).expect("should parse");
        assert_eq!(cfg.link_prefix.as_deref(), Some("#assets/"));
    }

    // ==================== Resolution Tests ====================

    #[test]
    fn test_resolve_defaults_without_file() {
        let args = Args::try_parse_from(["imgsync", "docs"]).unwrap();
        let settings = Settings::resolve(&args, None);

        assert_eq!(settings.output_dir, PathBuf::from("imgsync-out"));
        assert_eq!(settings.pipeline.asset_dir, PathBuf::from("imgsync-out/assets"));
        assert_eq!(settings.pipeline.cache_dir, PathBuf::from(".imgsync-cache"));
        assert_eq!(settings.rewriter, RewriterConfig::default());
        assert_eq!(settings.scheduler, SchedulerConfig::default());
        assert!(settings.failure_log.is_none());
    }

    #[test]
    fn test_resolve_cli_wins_over_file() {
        let file = parse_config_str(
            r#"
output_dir = "from-file"
concurrency = 2
max_width = 800
cache_ttl_days = 7
"#,
        )
        .unwrap();
        let args = Args::try_parse_from(["imgsync", "docs", "-c", "9"]).unwrap();
        let settings = Settings::resolve(&args, Some(&file));

        assert_eq!(settings.output_dir, PathBuf::from("from-file"));
        assert_eq!(settings.rewriter.max_concurrent, 9);
        assert_eq!(settings.pipeline.limits.max_width, 800);
        assert_eq!(settings.pipeline.cache_ttl, Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn test_load_explicit_missing_file_errors() {
        let temp = tempfile::TempDir::new().unwrap();
        let missing = temp.path().join("nope.toml");
        assert!(load_file_config(Some(&missing)).is_err());
    }
}
