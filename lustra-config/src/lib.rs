//! Configuration models and loading for Lustra.
//!
//! Settings come from a TOML file (`lustra.toml` by default) with serde
//! defaults matching the engine's conventions, and are validated before the
//! pipeline starts: a missing library root or an empty height list is a
//! startup error, never something to limp along with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use lustra_core::classify::ClassificationRules;

/// Locations probed, in order, when no explicit config path is given.
pub const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["lustra.toml", "/etc/lustra/lustra.toml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    Missing { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The library tree and its naming conventions.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LibrarySettings {
    /// Root folder of the media tree. Required.
    pub root: PathBuf,
    pub image_extensions: Vec<String>,
    pub video_extensions: Vec<String>,
    pub skip_prefixes: Vec<String>,
    pub skip_suffixes: Vec<String>,
    pub skip_contains: Vec<String>,
    /// Role naming conventions; carried for API consumers, not consulted by
    /// the engine.
    pub role_prefixes: Vec<String>,
    pub role_suffixes: Vec<String>,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        let rules = ClassificationRules::default();
        Self {
            root: PathBuf::new(),
            image_extensions: rules.image_extensions,
            video_extensions: rules.video_extensions,
            skip_prefixes: rules.skip_prefixes,
            skip_suffixes: rules.skip_suffixes,
            skip_contains: rules.skip_contains,
            role_prefixes: vec![
                "private_", "public_", "family_", "extfamily_", "friends_",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            role_suffixes: vec![
                "_private", "_public", "_family", "_extfamily", "_friends",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Derivative rendition generation.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DerivativeSettings {
    /// Target heights, one rendition per height.
    pub heights: Vec<u32>,
}

impl Default for DerivativeSettings {
    fn default() -> Self {
        Self {
            heights: vec![400, 1080, 1440],
        }
    }
}

/// Scan cadence and dispatch width.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanSettings {
    /// Seconds between reconciliation ticks.
    pub interval_secs: u64,
    /// Bounded-parallel dispatch degree; 0 selects the host CPU count.
    pub parallelism: usize,
    /// Debounce window for live "changed" events, in milliseconds.
    pub debounce_ms: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            parallelism: 0,
            debounce_ms: 300,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LustraConfig {
    pub library: LibrarySettings,
    pub derivatives: DerivativeSettings,
    pub scan: ScanSettings,
}

impl LustraConfig {
    /// Load configuration. An explicit path must exist; with no explicit
    /// path the default locations are probed and plain defaults are used
    /// when none is present (the root must then come from the CLI).
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::Missing {
                        path: path.to_path_buf(),
                    });
                }
                Some(path.to_path_buf())
            }
            None => DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists()),
        };

        match path {
            Some(path) => Self::load_file(&path),
            None => {
                tracing::debug!("no configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Startup validation: errors here prevent the pipeline from starting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.library.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "library.root is required (set it in lustra.toml or pass --folder)".into(),
            ));
        }
        if !self.library.root.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "library.root does not exist or is not a directory: {}",
                self.library.root.display()
            )));
        }
        if self.derivatives.heights.is_empty() {
            return Err(ConfigError::Invalid(
                "derivatives.heights must list at least one height".into(),
            ));
        }
        if self.derivatives.heights.iter().any(|&h| h == 0) {
            return Err(ConfigError::Invalid(
                "derivatives.heights must be positive".into(),
            ));
        }
        for ext in self
            .library
            .image_extensions
            .iter()
            .chain(self.library.video_extensions.iter())
        {
            if !ext.starts_with('.') || ext.len() < 2 {
                return Err(ConfigError::Invalid(format!(
                    "extensions must be dotted, e.g. \".jpg\" (got {ext:?})"
                )));
            }
        }
        Ok(())
    }

    /// The engine-facing rule set.
    pub fn classification_rules(&self) -> ClassificationRules {
        ClassificationRules {
            image_extensions: self.library.image_extensions.clone(),
            video_extensions: self.library.video_extensions.clone(),
            skip_prefixes: self.library.skip_prefixes.clone(),
            skip_suffixes: self.library.skip_suffixes.clone(),
            skip_contains: self.library.skip_contains.clone(),
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan.interval_secs.max(1))
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.scan.debounce_ms.max(1))
    }

    /// Effective dispatch degree: configured value, or the CPU count.
    pub fn parallelism(&self) -> usize {
        if self.scan.parallelism == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.scan.parallelism
        }
    }
}
