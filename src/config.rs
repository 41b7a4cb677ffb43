use anyhow::{Context, Result};
use reconcile::{CLONE_PENDING, CLONE_READY, DEFAULT_MAX_BATCH_SIZE, ReadinessPoller, SettlePolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the config directory path (~/.config/cdnver)
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("cdnver"))
}

// ============================================================================
// Tool Config
// ============================================================================

/// Tool-wide settings, independent of any one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    /// Largest chunk sent to a bulk endpoint
    pub batch_size: usize,
    pub settle: SettleConfig,
    pub deployment: DeploymentConfig,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_MAX_BATCH_SIZE,
            settle: SettleConfig::default(),
            deployment: DeploymentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettleMode {
    /// Use the cloned version immediately
    None,
    /// Sleep for a fixed delay
    Delay,
    /// Poll until the clone reads back as mutable
    #[default]
    Poll,
}

/// How to wait for a freshly cloned version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettleConfig {
    pub mode: SettleMode,
    pub delay_ms: u64,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub min_interval_ms: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            mode: SettleMode::Poll,
            delay_ms: 2000,
            timeout_secs: 300,
            poll_interval_ms: 1000,
            min_interval_ms: 250,
        }
    }
}

/// How to wait for rule deployments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeploymentConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub min_interval_ms: u64,
    pub required_observations: u32,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            poll_interval_ms: 5000,
            min_interval_ms: 1000,
            required_observations: 1,
        }
    }
}

impl ToolConfig {
    /// Load the tool config.
    ///
    /// A missing default file yields defaults; a missing explicit file is an
    /// error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = config_dir()?.join("config.toml");
                if !path.exists() {
                    log::debug!("No config at {}, using defaults", path.display());
                    return Ok(Self::default());
                }
                path
            }
        };
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        Ok(config)
    }

    /// Wait policy applied after cloning a version
    pub fn settle_policy(&self) -> SettlePolicy {
        let settle = &self.settle;
        match settle.mode {
            SettleMode::None => SettlePolicy::None,
            SettleMode::Delay => SettlePolicy::Delay(Duration::from_millis(settle.delay_ms)),
            SettleMode::Poll => SettlePolicy::Poll(
                ReadinessPoller::new([CLONE_PENDING], [CLONE_READY])
                    .with_timeout(Duration::from_secs(settle.timeout_secs))
                    .with_poll_interval(Duration::from_millis(settle.poll_interval_ms))
                    .with_min_interval(Duration::from_millis(settle.min_interval_ms)),
            ),
        }
    }

    /// Poller for rule deployments
    pub fn deployment_poller(&self) -> ReadinessPoller {
        let deployment = &self.deployment;
        ReadinessPoller::new(["pending", "in_progress"], ["completed"])
            .with_timeout(Duration::from_secs(deployment.timeout_secs))
            .with_poll_interval(Duration::from_millis(deployment.poll_interval_ms))
            .with_min_interval(Duration::from_millis(deployment.min_interval_ms))
            .with_required_observations(deployment.required_observations)
    }
}
