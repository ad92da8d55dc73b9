//! Settings for tenderwatch.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (TENDERWATCH_HOME, TENDERWATCH_DATABASE,
//!    TENDERWATCH_COMPLETION_ENDPOINT, TENDERWATCH_COMPLETION_TOKEN,
//!    TENDERWATCH_REGISTRY_URL)
//! 2. Config file (.tenderwatch/config.yaml)
//! 3. Defaults (~/.tenderwatch)
//!
//! Config file discovery:
//! - Searches current directory and parents for .tenderwatch/config.yaml
//! - Paths in config file are relative to the .tenderwatch/ directory

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::office::ConverterConfig;
use crate::adapters::registry::RegistryConfig;
use crate::core::limits::ExtractionLimits;
use crate::core::pricing::PricingConfig;
use crate::core::ranking::RankingConfig;
use crate::core::retry::RetryPolicy;

const CONFIG_DIR: &str = ".tenderwatch";
const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub paths: PathsSection,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub completion: CompletionSettings,

    #[serde(default)]
    pub pricing: PricingConfig,

    #[serde(default)]
    pub extraction: ExtractionLimits,

    #[serde(default)]
    pub ranking: RankingConfig,

    #[serde(default)]
    pub batch: BatchSettings,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub converter: ConverterConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsSection {
    /// State directory (relative to .tenderwatch/)
    pub home: Option<String>,

    /// SQLite database file (relative to .tenderwatch/)
    pub database: Option<String>,
}

/// Resolved absolute paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Paths {
    pub home: PathBuf,

    pub database: PathBuf,
}

impl Paths {
    fn under(home: PathBuf) -> Self {
        Self {
            database: home.join("tenderwatch.db"),
            home,
        }
    }

    /// Root of the filesystem blob store
    pub fn blob_root(&self) -> PathBuf {
        self.home.join("blobs")
    }

    /// Directory of the JSONL work-queue logs
    pub fn queue_dir(&self) -> PathBuf {
        self.home.join("queue")
    }
}

/// Completion engine endpoint and input ceiling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bearer token, never printed
    #[serde(default, skip_serializing)]
    pub token: Option<String>,

    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,

    /// Hard ceiling on prompt plus file tokens
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: u64,
}

fn default_endpoint() -> String {
    "http://localhost:8080".to_string()
}
fn default_completion_timeout() -> u64 {
    600
}
fn default_max_input_tokens() -> u64 {
    1_048_576
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            token: None,
            timeout_secs: default_completion_timeout(),
            max_input_tokens: default_max_input_tokens(),
        }
    }
}

/// Batch driver pacing and ranked-run defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSettings {
    /// Items processed between sleeps
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_sleep_seconds")]
    pub sleep_seconds: u64,

    /// Share of a ranked run's budget open to procurements without votes
    #[serde(default = "default_zero_vote_percent")]
    pub zero_vote_percent: f64,

    /// Stop after this many items (unlimited when unset)
    #[serde(default)]
    pub max_messages: Option<usize>,
}

fn default_batch_size() -> usize {
    100
}
fn default_sleep_seconds() -> u64 {
    60
}
fn default_zero_vote_percent() -> f64 {
    10.0
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sleep_seconds: default_sleep_seconds(),
            zero_vote_percent: default_zero_vote_percent(),
            max_messages: None,
        }
    }
}

/// Queue consumer limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Topic analysis requests are published to
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Messages processed at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Lease length before an unacknowledged message is redelivered
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Wait between empty pulls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_topic() -> String {
    "analysis-requests".to_string()
}
fn default_max_concurrency() -> usize {
    4
}
fn default_visibility_timeout() -> u64 {
    3600
}
fn default_poll_interval() -> u64 {
    5
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            max_concurrency: default_max_concurrency(),
            visibility_timeout_secs: default_visibility_timeout(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// Fully resolved settings, loaded once in `main` and passed down
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub paths: Paths,

    pub registry: RegistryConfig,

    pub completion: CompletionSettings,

    pub pricing: PricingConfig,

    pub extraction: ExtractionLimits,

    pub ranking: RankingConfig,

    pub batch: BatchSettings,

    pub retry: RetryPolicy,

    pub worker: WorkerSettings,

    pub converter: ConverterConfig,

    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Settings {
    /// Defaults rooted at `home`
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self::from_file(ConfigFile::default(), Paths::under(home.into()), None)
    }

    fn from_file(file: ConfigFile, paths: Paths, config_file: Option<PathBuf>) -> Self {
        Self {
            paths,
            registry: file.registry,
            completion: file.completion,
            pricing: file.pricing,
            extraction: file.extraction,
            ranking: file.ranking,
            batch: file.batch,
            retry: file.retry,
            worker: file.worker,
            converter: file.converter,
            config_file,
        }
    }

    /// Load from the process environment and the nearest config file
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        let default_home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(CONFIG_DIR);
        Self::load_with(find_config_file(&cwd).as_deref(), default_home, |key| {
            std::env::var(key).ok()
        })
    }

    /// Load from an explicit config file and environment lookup
    pub fn load_with(
        config_path: Option<&Path>,
        default_home: PathBuf,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file = match config_path {
            Some(path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };
        // Paths are relative to .tenderwatch/
        let config_dir = config_path.and_then(Path::parent).unwrap_or(Path::new("."));

        let home = if let Some(env_home) = env("TENDERWATCH_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home) = file.paths.home {
            resolve_path(config_dir, home)
        } else {
            default_home
        };

        let mut paths = Paths::under(home);
        if let Some(env_db) = env("TENDERWATCH_DATABASE") {
            paths.database = PathBuf::from(env_db);
        } else if let Some(ref database) = file.paths.database {
            paths.database = resolve_path(config_dir, database);
        }

        let mut settings = Self::from_file(file, paths, config_path.map(Path::to_path_buf));

        if let Some(endpoint) = env("TENDERWATCH_COMPLETION_ENDPOINT") {
            settings.completion.endpoint = endpoint;
        }
        if let Some(token) = env("TENDERWATCH_COMPLETION_TOKEN") {
            settings.completion.token = Some(token);
        }
        if let Some(url) = env("TENDERWATCH_REGISTRY_URL") {
            settings.registry.query_api_url = url;
        }

        Ok(settings)
    }
}

/// Find config file by searching `start` and its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(&path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(root: &Path, yaml: &str) -> PathBuf {
        let dir = root.join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::load_with(None, PathBuf::from("/srv/tw"), no_env).unwrap();

        assert_eq!(settings.paths.home, PathBuf::from("/srv/tw"));
        assert_eq!(settings.paths.database, PathBuf::from("/srv/tw/tenderwatch.db"));
        assert_eq!(settings.paths.blob_root(), PathBuf::from("/srv/tw/blobs"));
        assert_eq!(settings.completion.max_input_tokens, 1_048_576);
        assert_eq!(settings.batch.batch_size, 100);
        assert_eq!(settings.batch.zero_vote_percent, 10.0);
        assert_eq!(settings.retry, RetryPolicy::default());
        assert!(settings.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            r#"
paths:
  home: ./state
registry:
  target_ibge_codes: ["3550308"]
completion:
  max_input_tokens: 200000
batch:
  batch_size: 10
retry:
  max_retries: 5
worker:
  topic: analyses
"#,
        );

        let settings = Settings::load_with(Some(&path), PathBuf::from("/unused"), no_env).unwrap();
        assert_eq!(settings.paths.home, temp.path().join(CONFIG_DIR).join("state"));
        assert_eq!(settings.registry.target_ibge_codes, vec!["3550308".to_string()]);
        // untouched keys keep their defaults
        assert_eq!(settings.registry.modalities, vec![6, 8, 9, 4]);
        assert_eq!(settings.completion.max_input_tokens, 200_000);
        assert_eq!(settings.batch.batch_size, 10);
        assert_eq!(settings.batch.sleep_seconds, 60);
        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.worker.topic, "analyses");
        assert_eq!(settings.config_file.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            "paths:\n  home: ./state\ncompletion:\n  endpoint: http://file:1\n",
        );
        let env: HashMap<&str, &str> = [
            ("TENDERWATCH_HOME", "/env/home"),
            ("TENDERWATCH_DATABASE", "/env/db.sqlite"),
            ("TENDERWATCH_COMPLETION_ENDPOINT", "http://env:2"),
            ("TENDERWATCH_COMPLETION_TOKEN", "secret"),
            ("TENDERWATCH_REGISTRY_URL", "http://registry"),
        ]
        .into_iter()
        .collect();

        let settings = Settings::load_with(Some(&path), PathBuf::from("/unused"), |k| {
            env.get(k).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(settings.paths.home, PathBuf::from("/env/home"));
        assert_eq!(settings.paths.database, PathBuf::from("/env/db.sqlite"));
        assert_eq!(settings.completion.endpoint, "http://env:2");
        assert_eq!(settings.completion.token.as_deref(), Some("secret"));
        assert_eq!(settings.registry.query_api_url, "http://registry");
    }

    #[test]
    fn test_token_is_not_printed() {
        let mut settings = Settings::with_home("/tmp/tw");
        settings.completion.token = Some("secret".to_string());
        let yaml = serde_yaml::to_string(&settings).unwrap();
        assert!(!yaml.contains("secret"));
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let temp = TempDir::new().unwrap();
        let path = write_config(temp.path(), "{}\n");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config_file(&nested), Some(path));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/./subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
