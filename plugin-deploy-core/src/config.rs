//! Deployment configuration, loaded from YAML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::types::ProcessKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Tag attached to every deployed process model.
    pub tenant_tag: String,
    /// Keys forced to EXCLUDED even when loaded.
    pub exclude: Vec<ProcessKey>,
    /// Keys forced to RETIRED.
    pub retire: Vec<ProcessKey>,
    pub retry: RetryConfig,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            tenant_tag: "default".to_string(),
            exclude: Vec::new(),
            retire: Vec::new(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry around resource store calls. `attempts: null` retries forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: Option<u32>,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: Some(3),
            delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.delay_ms);
        match self.attempts {
            Some(attempts) => RetryPolicy::Bounded {
                attempts: attempts.max(1),
                delay,
            },
            None => RetryPolicy::Unbounded { delay },
        }
    }
}

impl DeployConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Parsing deploy config")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }
}
