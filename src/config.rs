use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Expand tilde (~) in path to user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(stripped) = s.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if s == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// Configuration for oras-inspect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InspectorConfig {
    /// Number of references kept in history
    #[serde(default = "defaults::history_capacity")]
    pub history_capacity: usize,
    /// History file; `null` keeps history in memory only
    #[serde(default = "defaults::history_path")]
    pub history_path: Option<PathBuf>,
    /// Quiet period before a tag selection loads (milliseconds)
    #[serde(default = "defaults::tag_debounce_ms")]
    pub tag_debounce_ms: u64,
    /// Bound on digests expanded per referrer traversal
    #[serde(default = "defaults::max_referrers")]
    pub max_referrers: usize,
    #[serde(default = "defaults::enabled")]
    pub verify_digests: bool,
    #[serde(default = "defaults::enabled")]
    pub cancel_superseded: bool,
    /// Directory holding the local registry layout
    #[serde(default = "defaults::layout_root")]
    pub layout_root: PathBuf,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        InspectorConfig {
            history_capacity: defaults::history_capacity(),
            history_path: defaults::history_path(),
            tag_debounce_ms: defaults::tag_debounce_ms(),
            max_referrers: defaults::max_referrers(),
            verify_digests: defaults::enabled(),
            cancel_superseded: defaults::enabled(),
            layout_root: defaults::layout_root(),
        }
    }
}

impl InspectorConfig {
    /// Load configuration from the config file (if any) and environment variables
    pub fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        tracing::debug!("loading oras-inspect config from {:?}", config_path);
        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            tracing::debug!("no config file, using defaults");
            Self::default()
        };

        config.apply_env_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `ORAS_INSPECT_*` overrides looked up through `var`
    pub fn apply_env_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(capacity) = var("ORAS_INSPECT_HISTORY_CAPACITY") {
            self.history_capacity = capacity
                .parse()
                .context("Failed to parse ORAS_INSPECT_HISTORY_CAPACITY as usize")?;
        }

        if let Some(path) = var("ORAS_INSPECT_HISTORY") {
            self.history_path = if path.is_empty() {
                None
            } else {
                Some(expand_tilde(&PathBuf::from(path)))
            };
        }

        if let Some(ms) = var("ORAS_INSPECT_TAG_DEBOUNCE_MS") {
            self.tag_debounce_ms = ms
                .parse()
                .context("Failed to parse ORAS_INSPECT_TAG_DEBOUNCE_MS as u64")?;
        }

        if let Some(max) = var("ORAS_INSPECT_MAX_REFERRERS") {
            self.max_referrers = max
                .parse()
                .context("Failed to parse ORAS_INSPECT_MAX_REFERRERS as usize")?;
        }

        if let Some(verify) = var("ORAS_INSPECT_VERIFY_DIGESTS") {
            self.verify_digests = verify
                .parse()
                .context("Failed to parse ORAS_INSPECT_VERIFY_DIGESTS as bool")?;
        }

        if let Some(cancel) = var("ORAS_INSPECT_CANCEL_SUPERSEDED") {
            self.cancel_superseded = cancel
                .parse()
                .context("Failed to parse ORAS_INSPECT_CANCEL_SUPERSEDED as bool")?;
        }

        if let Some(root) = var("ORAS_INSPECT_ROOT") {
            self.layout_root = expand_tilde(&PathBuf::from(root));
        }
        Ok(())
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: InspectorConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.layout_root = expand_tilde(&config.layout_root);
        if let Some(ref history_path) = config.history_path {
            config.history_path = Some(expand_tilde(history_path));
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get default config file path
    pub fn config_file_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".config/oras-inspect/config.yaml"))
            .context("Could not determine home directory for config file")
    }

    /// Get the layout root, creating it if necessary
    pub fn ensure_layout_root(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.layout_root).with_context(|| {
            format!("Failed to create layout directory: {:?}", self.layout_root)
        })?;
        Ok(self.layout_root.clone())
    }
}

mod defaults {
    use std::path::PathBuf;

    pub(crate) fn history_capacity() -> usize {
        crate::history::DEFAULT_CAPACITY
    }

    pub(crate) fn history_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/oras-inspect/history.yaml"))
    }

    pub(crate) fn tag_debounce_ms() -> u64 {
        500
    }

    pub(crate) fn max_referrers() -> usize {
        crate::referrers::DEFAULT_MAX_DESCRIPTORS
    }

    pub(crate) fn enabled() -> bool {
        true
    }

    pub(crate) fn layout_root() -> PathBuf {
        dirs::home_dir()
            .map(|home| home.join(".local/share/oras-inspect/registry"))
            .unwrap_or_else(|| PathBuf::from("oras-inspect-registry"))
    }
}
