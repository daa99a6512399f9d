use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acquisition::{AcquisitionSettings, ProbeSettings};
use crate::download::EngineSettings;
use crate::source::RestrictedDomains;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub restrictions: RestrictionsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_sample_ms")]
    pub sample_ms: u64,
    #[serde(default = "default_buffer_limit_bytes")]
    pub buffer_limit_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Durable cache root. Without it nothing is kept between installations.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub temp_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictionsConfig {
    #[serde(default = "default_restricted_domains")]
    pub restricted_domains: Vec<String>,
}

// Default value functions
fn default_user_agent() -> String {
    format!("sourcepick/{}", env!("CARGO_PKG_VERSION"))
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_window_ms() -> u64 {
    2500
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_sample_ms() -> u64 {
    2000
}
fn default_buffer_limit_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_restricted_domains() -> Vec<String> {
    vec!["archive.org".to_string()]
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            sample_ms: default_sample_ms(),
            buffer_limit_bytes: default_buffer_limit_bytes(),
        }
    }
}

impl Default for RestrictionsConfig {
    fn default() -> Self {
        Self {
            restricted_domains: default_restricted_domains(),
        }
    }
}

impl Config {
    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            window: Duration::from_millis(self.probe.window_ms),
            poll_interval: Duration::from_millis(self.probe.poll_interval_ms),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            user_agent: self.general.user_agent.clone(),
            request_timeout: Duration::from_secs(self.general.request_timeout_secs),
            sample_duration: Duration::from_millis(self.probe.sample_ms),
            buffer_limit: usize::try_from(self.probe.buffer_limit_bytes).unwrap_or(usize::MAX),
        }
    }

    pub fn acquisition_settings(&self) -> AcquisitionSettings {
        AcquisitionSettings {
            durable_cache: self.cache.directory.clone(),
            temp_root: self
                .cache
                .temp_directory
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("sourcepick")),
            restricted: RestrictedDomains::new(self.restrictions.restricted_domains.clone()),
        }
    }
}

pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new ConfigManager and load existing config or create default
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("", "", "sourcepick")
            .context("Failed to determine config directory")?;

        Self::from_path(project_dirs.config_dir().join("config.toml"))
    }

    /// Use an explicit config file, writing the defaults there if it is missing
    pub fn from_path(config_file: impl Into<PathBuf>) -> Result<Self> {
        let config_file = config_file.into();
        let config_dir = config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        // Create config directory if it doesn't exist
        if !config_dir.as_os_str().is_empty() && !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
        }

        let config = if config_file.exists() {
            Self::load_config(&config_file)?
        } else {
            let default_config = Config::default();
            Self::save_config(&config_file, &default_config)?;
            default_config
        };

        Ok(Self {
            config_dir,
            config_file,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Save the current config to disk
    pub fn save(&self) -> Result<()> {
        Self::save_config(&self.config_file, &self.config)
    }

    /// Reload config from disk
    pub fn reload(&mut self) -> Result<()> {
        self.config = Self::load_config(&self.config_file)?;
        Ok(())
    }

    /// Replace the config with the defaults and write it out
    pub fn reset(&mut self) -> Result<()> {
        self.config = Config::default();
        self.save()
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    fn load_config(config_file: &Path) -> Result<Config> {
        let content = fs::read_to_string(config_file)
            .with_context(|| format!("Failed to read config file: {:?}", config_file))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_file))?;

        Ok(config)
    }

    fn save_config(config_file: &Path, config: &Config) -> Result<()> {
        let content = toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(config_file, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_file))?;

        Ok(())
    }

    /// Validate the current configuration
    pub fn validate(&self) -> Result<()> {
        let probe = &self.config.probe;
        if probe.window_ms == 0 {
            anyhow::bail!("probe.window_ms must be greater than 0");
        }

        if probe.poll_interval_ms == 0 {
            anyhow::bail!("probe.poll_interval_ms must be greater than 0");
        }

        if probe.poll_interval_ms > probe.window_ms {
            anyhow::bail!(
                "probe.poll_interval_ms ({}) cannot exceed probe.window_ms ({})",
                probe.poll_interval_ms,
                probe.window_ms
            );
        }

        if probe.sample_ms >= probe.window_ms {
            anyhow::bail!(
                "probe.sample_ms ({}) must be shorter than probe.window_ms ({})",
                probe.sample_ms,
                probe.window_ms
            );
        }

        if probe.buffer_limit_bytes == 0 {
            anyhow::bail!("probe.buffer_limit_bytes must be greater than 0");
        }

        if self.config.general.request_timeout_secs == 0 {
            anyhow::bail!("general.request_timeout_secs must be greater than 0");
        }

        if let Some(position) = self
            .config
            .restrictions
            .restricted_domains
            .iter()
            .position(|domain| domain.trim().is_empty())
        {
            anyhow::bail!("restrictions.restricted_domains[{}] is empty", position);
        }

        Ok(())
    }
}
