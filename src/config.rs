//! Configuration for autoship.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (AUTOSHIP_HOME, AUTOSHIP_TEST_THRESHOLD, ...)
//! 2. Config file (.autoship/config.yaml)
//! 3. Defaults (~/.autoship)
//!
//! Config file discovery:
//! - Searches current directory and parents for .autoship/config.yaml
//! - Paths in config file are relative to the .autoship/ directory
//!
//! Secrets (API keys, tokens) are only ever read from the environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::domain::SpecLimits;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
    #[serde(default)]
    pub sandbox: Option<SandboxConfig>,
    #[serde(default)]
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub publish: Option<PublishConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (database lives here)
    pub home: Option<String>,
    /// Directory that holds test workspaces
    pub workspaces: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    pub test_threshold: Option<u8>,
    pub max_retries: Option<u32>,
    pub progress_grace_seconds: Option<u64>,
    pub min_request_chars: Option<usize>,
    pub max_models: Option<usize>,
    pub max_endpoints: Option<usize>,
    pub collaborator_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxConfig {
    /// argv of the dependency installer; an empty list disables the step
    pub install_command: Option<Vec<String>>,
    /// argv of the test harness
    pub test_command: Option<Vec<String>>,
    pub install_timeout_seconds: Option<u64>,
    pub test_timeout_seconds: Option<u64>,
    pub test_dir: Option<String>,
    pub package_marker: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmConfig {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishConfig {
    pub repo_prefix: Option<String>,
    /// Record a manual deployment reference when no provider token is set
    pub manual_deploy: Option<bool>,
}

/// Settings that drive the stage sequence
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Minimum pass percentage for a clean completion
    pub test_threshold: u8,
    /// Domain-level retry budget (0 disables retries)
    pub max_retries: u32,
    /// How long RunProgress survives a terminal state
    pub progress_grace: Duration,
    pub min_request_chars: usize,
    pub spec_limits: SpecLimits,
    /// Upper bound on any single generator, publish or deploy call
    pub collaborator_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            test_threshold: 80,
            max_retries: 1,
            progress_grace: Duration::from_secs(120),
            min_request_chars: 10,
            spec_limits: SpecLimits::default(),
            collaborator_timeout: Duration::from_secs(300),
        }
    }
}

/// Settings for the execution sandbox
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub workspaces_dir: PathBuf,
    pub install_command: Vec<String>,
    pub test_command: Vec<String>,
    pub install_timeout: Duration,
    pub test_timeout: Duration,
    /// Test directory relative to the workspace root
    pub test_dir: String,
    /// Marker file the harness needs to resolve project-local imports
    pub package_marker: String,
}

impl SandboxSettings {
    /// Default harness conventions rooted at the given workspaces directory
    pub fn with_workspaces_dir(workspaces_dir: PathBuf) -> Self {
        Self {
            workspaces_dir,
            install_command: default_install_command(),
            test_command: default_test_command(),
            install_timeout: Duration::from_secs(120),
            test_timeout: Duration::from_secs(120),
            test_dir: "tests".to_string(),
            package_marker: "__init__.py".to_string(),
        }
    }
}

fn default_install_command() -> Vec<String> {
    ["pip", "install", "-r", "requirements.txt", "pytest", "httpx"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_test_command() -> Vec<String> {
    ["python", "-m", "pytest", "tests/", "-v", "--tb=short"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Text-completion service settings
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub api_key: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            temperature: 0.2,
            max_tokens: 16000,
            api_key: None,
        }
    }
}

/// Publish/deploy settings
#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub repo_prefix: String,
    pub manual_deploy: bool,
    pub github_token: Option<String>,
    pub railway_token: Option<String>,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            repo_prefix: "autoship-".to_string(),
            manual_deploy: false,
            github_token: None,
            railway_token: None,
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to autoship home (state)
    pub home: PathBuf,
    /// SQLite database path
    pub database_path: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub pipeline: PipelineSettings,
    pub sandbox: SandboxSettings,
    pub llm: LlmSettings,
    pub publish: PublishSettings,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".autoship").join("config.yaml");
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

    parse_config(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn parse_config(content: &str) -> Result<ConfigFile> {
    Ok(serde_yaml::from_str(content)?)
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Read and parse an environment variable, ignoring unset or malformed values
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_secret(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Merge file settings and env overrides into a resolved config
fn resolve(file: Option<(&Path, ConfigFile)>, default_home: PathBuf) -> ResolvedConfig {
    let (config_dir, file) = match file {
        Some((path, file)) => (path.parent().map(Path::to_path_buf), Some(file)),
        None => (None, None),
    };

    let paths = file.as_ref().map(|f| f.paths.clone()).unwrap_or_default();
    let relative = |p: &str| match config_dir {
        Some(ref dir) => resolve_path(dir, p),
        None => PathBuf::from(p),
    };

    let home = std::env::var("AUTOSHIP_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| paths.home.as_deref().map(relative))
        .unwrap_or(default_home);

    let workspaces_dir = std::env::var("AUTOSHIP_WORKSPACES")
        .map(PathBuf::from)
        .ok()
        .or_else(|| paths.workspaces.as_deref().map(relative))
        .unwrap_or_else(|| home.join("workspaces"));

    let pc = file
        .as_ref()
        .and_then(|f| f.pipeline.clone())
        .unwrap_or_default();
    let defaults = PipelineSettings::default();
    let pipeline = PipelineSettings {
        test_threshold: env_parse("AUTOSHIP_TEST_THRESHOLD")
            .or(pc.test_threshold)
            .unwrap_or(defaults.test_threshold)
            .min(100),
        max_retries: env_parse("AUTOSHIP_MAX_RETRIES")
            .or(pc.max_retries)
            .unwrap_or(defaults.max_retries),
        progress_grace: pc
            .progress_grace_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.progress_grace),
        min_request_chars: pc.min_request_chars.unwrap_or(defaults.min_request_chars),
        spec_limits: SpecLimits {
            max_models: pc.max_models.unwrap_or(defaults.spec_limits.max_models),
            max_endpoints: pc
                .max_endpoints
                .unwrap_or(defaults.spec_limits.max_endpoints),
        },
        collaborator_timeout: pc
            .collaborator_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.collaborator_timeout),
    };

    let sc = file
        .as_ref()
        .and_then(|f| f.sandbox.clone())
        .unwrap_or_default();
    let mut sandbox = SandboxSettings::with_workspaces_dir(workspaces_dir);
    if let Some(cmd) = sc.install_command {
        sandbox.install_command = cmd;
    }
    if let Some(cmd) = sc.test_command {
        sandbox.test_command = cmd;
    }
    if let Some(secs) = sc.install_timeout_seconds {
        sandbox.install_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = sc.test_timeout_seconds {
        sandbox.test_timeout = Duration::from_secs(secs);
    }
    if let Some(dir) = sc.test_dir {
        sandbox.test_dir = dir;
    }
    if let Some(marker) = sc.package_marker {
        sandbox.package_marker = marker;
    }

    let lc = file.as_ref().and_then(|f| f.llm.clone()).unwrap_or_default();
    let llm_defaults = LlmSettings::default();
    let llm = LlmSettings {
        model: std::env::var("OPENAI_MODEL")
            .ok()
            .or(lc.model)
            .unwrap_or(llm_defaults.model),
        base_url: lc.base_url.unwrap_or(llm_defaults.base_url),
        temperature: lc.temperature.unwrap_or(llm_defaults.temperature),
        max_tokens: lc.max_tokens.unwrap_or(llm_defaults.max_tokens),
        api_key: env_secret("OPENAI_API_KEY"),
    };

    let pubc = file
        .as_ref()
        .and_then(|f| f.publish.clone())
        .unwrap_or_default();
    let publish = PublishSettings {
        repo_prefix: pubc
            .repo_prefix
            .unwrap_or_else(|| PublishSettings::default().repo_prefix),
        manual_deploy: pubc.manual_deploy.unwrap_or(false),
        github_token: env_secret("GITHUB_TOKEN"),
        railway_token: env_secret("RAILWAY_TOKEN"),
    };

    ResolvedConfig {
        database_path: home.join("autoship.db"),
        home,
        config_file: None,
        pipeline,
        sandbox,
        llm,
        publish,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".autoship");

    let config_file = find_config_file();

    let mut resolved = match config_file {
        Some(ref path) => {
            let file = load_config_file(path)?;
            resolve(Some((path, file)), default_home)
        }
        None => resolve(None, default_home),
    };
    resolved.config_file = config_file;

    Ok(resolved)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
