#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::extractor::{DEFAULT_DOWNLOAD_TIMEOUT, DEFAULT_METADATA_TIMEOUT};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_STORAGE_ROOT: &str = "downloads";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_MAX_AGE_HOURS: u64 = 24;
pub const DEFAULT_SWEEP_INTERVAL_MINUTES: u64 = 60;
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 2;
pub const DEFAULT_METADATA_CONCURRENCY: usize = 8;

/// Everything the pipeline needs at runtime. Built once at start-up and
/// handed to components explicitly; nothing reads the environment later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub storage_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp_bin: PathBuf,
    pub max_file_age: Duration,
    pub sweep_interval: Duration,
    pub download_concurrency: usize,
    pub metadata_concurrency: usize,
    pub metadata_timeout: Duration,
    pub download_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            ytdlp_bin: PathBuf::from(DEFAULT_YTDLP_BIN),
            max_file_age: hours(DEFAULT_MAX_AGE_HOURS),
            sweep_interval: minutes(DEFAULT_SWEEP_INTERVAL_MINUTES),
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            metadata_concurrency: DEFAULT_METADATA_CONCURRENCY,
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }
}

/// Values supplied on the command line. They beat both the environment and
/// the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub storage_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_bin: Option<PathBuf>,
    pub max_age_hours: Option<u64>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_config_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeConfig {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeConfig {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let parsed = |key: &str| lookup(key).and_then(|value| value.parse::<u64>().ok());
    let defaults = RuntimeConfig::default();

    let storage_root = overrides
        .storage_root
        .or_else(|| lookup("GRABTUBE_STORAGE_ROOT").map(PathBuf::from))
        .unwrap_or(defaults.storage_root);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("GRABTUBE_HOST"))
        .unwrap_or(defaults.host);
    let port = overrides
        .port
        .or_else(|| lookup("GRABTUBE_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(defaults.port);
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup("GRABTUBE_YTDLP_BIN").map(PathBuf::from))
        .unwrap_or(defaults.ytdlp_bin);
    let max_file_age = overrides
        .max_age_hours
        .or_else(|| parsed("GRABTUBE_MAX_AGE_HOURS"))
        .map(hours)
        .unwrap_or(defaults.max_file_age);
    let sweep_interval = parsed("GRABTUBE_SWEEP_INTERVAL_MINUTES")
        .filter(|value| *value > 0)
        .map(minutes)
        .unwrap_or(defaults.sweep_interval);
    let download_concurrency = parsed("GRABTUBE_DOWNLOAD_CONCURRENCY")
        .map(|value| (value as usize).max(1))
        .unwrap_or(defaults.download_concurrency);
    let metadata_concurrency = parsed("GRABTUBE_METADATA_CONCURRENCY")
        .map(|value| (value as usize).max(1))
        .unwrap_or(defaults.metadata_concurrency);
    let metadata_timeout = parsed("GRABTUBE_METADATA_TIMEOUT_SECS")
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
        .unwrap_or(defaults.metadata_timeout);
    let download_timeout = parsed("GRABTUBE_DOWNLOAD_TIMEOUT_SECS")
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
        .unwrap_or(defaults.download_timeout);

    RuntimeConfig {
        storage_root,
        host,
        port,
        ytdlp_bin,
        max_file_age,
        sweep_interval,
        download_concurrency,
        metadata_concurrency,
        metadata_timeout,
        download_timeout,
    }
}

fn hours(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60 * 60))
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Reads `KEY=value` pairs. Missing files yield an empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> RuntimeConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, |_| None)
    }

    #[test]
    fn empty_sources_yield_defaults() {
        let config = build_runtime_config(&HashMap::new(), |_| None);
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.max_file_age, Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.storage_root, PathBuf::from(DEFAULT_STORAGE_ROOT));
    }

    #[test]
    fn reads_pipeline_settings_from_file() {
        let config = config_from(
            "GRABTUBE_STORAGE_ROOT=\"/srv/grab\"\n\
             GRABTUBE_PORT=\"4242\"\n\
             GRABTUBE_MAX_AGE_HOURS=6\n\
             GRABTUBE_SWEEP_INTERVAL_MINUTES=5\n\
             GRABTUBE_DOWNLOAD_CONCURRENCY=3\n\
             GRABTUBE_DOWNLOAD_TIMEOUT_SECS=90\n",
        );
        assert_eq!(config.storage_root, PathBuf::from("/srv/grab"));
        assert_eq!(config.port, 4242);
        assert_eq!(config.max_file_age, Duration::from_secs(6 * 3600));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.download_concurrency, 3);
        assert_eq!(config.download_timeout, Duration::from_secs(90));
    }

    #[test]
    fn invalid_or_zero_values_fall_back() {
        let config = config_from(
            "GRABTUBE_PORT=\"nope\"\n\
             GRABTUBE_DOWNLOAD_CONCURRENCY=0\n\
             GRABTUBE_SWEEP_INTERVAL_MINUTES=0\n\
             GRABTUBE_METADATA_TIMEOUT_SECS=-4\n",
        );
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.download_concurrency, 1);
        assert_eq!(
            config.sweep_interval,
            Duration::from_secs(DEFAULT_SWEEP_INTERVAL_MINUTES * 60)
        );
        assert_eq!(config.metadata_timeout, DEFAULT_METADATA_TIMEOUT);
    }

    #[test]
    fn env_beats_file() {
        let vars = read_env_file(make_config("GRABTUBE_STORAGE_ROOT=\"/file\"\n").path()).unwrap();
        let config = build_runtime_config(&vars, |key| {
            (key == "GRABTUBE_STORAGE_ROOT").then(|| "/env".to_string())
        });
        assert_eq!(config.storage_root, PathBuf::from("/env"));
    }

    #[test]
    fn overrides_beat_env_and_file() {
        let mut vars = HashMap::new();
        vars.insert("GRABTUBE_STORAGE_ROOT".to_string(), "/file".to_string());
        vars.insert("GRABTUBE_HOST".to_string(), "file-host".to_string());
        vars.insert("GRABTUBE_MAX_AGE_HOURS".to_string(), "12".to_string());

        let config = build_runtime_config_with_overrides(
            &vars,
            |key| (key == "GRABTUBE_PORT").then(|| "8000".to_string()),
            RuntimeOverrides {
                storage_root: Some(PathBuf::from("/override")),
                port: Some(9000),
                max_age_hours: Some(1),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(config.storage_root, PathBuf::from("/override"));
        assert_eq!(config.host, "file-host");
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_file_age, Duration::from_secs(3600));
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let config = build_runtime_config_with_overrides(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export GRABTUBE_STORAGE_ROOT="/media"
            GRABTUBE_YTDLP_BIN='/opt/yt-dlp'
            GRABTUBE_HOST =  "0.0.0.0"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("GRABTUBE_STORAGE_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("GRABTUBE_YTDLP_BIN").unwrap(), "/opt/yt-dlp");
        assert_eq!(vars.get("GRABTUBE_HOST").unwrap(), "0.0.0.0");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }
}
