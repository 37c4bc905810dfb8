//! Generation settings and the optional TOML configuration file.
//!
//! Values are layered: explicit command line flags win over the file, which
//! wins over the built-in defaults. The merged [`InferenceConfig`] is frozen
//! once a session is created.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_TEMPERATURE: f64 = 0.8;
pub const DEFAULT_MAX_NEW_TOKENS: usize = 2048;
pub const DEFAULT_TOP_K: usize = 50;
pub const DEFAULT_TOP_P: f64 = 1.0;
/// Offload every layer to the GPU.
pub const DEFAULT_GPU_LAYERS: i32 = -1;
pub const DEFAULT_ENGINE_BIN: &str = "llama-server";
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 120;

/// Sampling and context parameters used for every turn of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceConfig {
    pub temperature: f64,
    pub max_new_tokens: usize,
    pub top_k: usize,
    pub top_p: f64,
    pub stop_words: Vec<String>,
    pub context_length: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            top_k: DEFAULT_TOP_K,
            top_p: DEFAULT_TOP_P,
            stop_words: Vec::new(),
            // The context window tracks the generation budget unless set explicitly.
            context_length: DEFAULT_MAX_NEW_TOKENS,
        }
    }
}

/// Generation overrides, as given on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct GenerationOverrides {
    pub temperature: Option<f64>,
    pub max_new_tokens: Option<usize>,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub stop_words: Option<Vec<String>>,
    pub context_length: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationSection {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop_words: Option<Vec<String>>,
    #[serde(default)]
    pub context_length: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default)]
    pub gpu_layers: Option<i32>,
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubSection {
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub token: Option<String>,
}

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub hub: HubSection,
}

impl FileConfig {
    /// Parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        toml::from_str(&raw).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load `path` if given, otherwise the default location if that file exists.
    /// A missing default file is not an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match default_config_path() {
                Some(path) if path.exists() => {
                    tracing::debug!("Reading configuration from {}", path.display());
                    Self::load(&path)
                }
                _ => Ok(Self::default()),
            },
        }
    }

    /// Merge the file with command line overrides into the final generation settings.
    pub fn inference_config(&self, overrides: &GenerationOverrides) -> InferenceConfig {
        let defaults = InferenceConfig::default();
        let file = &self.generation;
        let max_new_tokens = overrides
            .max_new_tokens
            .or(file.max_new_tokens)
            .unwrap_or(defaults.max_new_tokens);
        InferenceConfig {
            temperature: overrides
                .temperature
                .or(file.temperature)
                .unwrap_or(defaults.temperature),
            max_new_tokens,
            top_k: overrides.top_k.or(file.top_k).unwrap_or(defaults.top_k),
            top_p: overrides.top_p.or(file.top_p).unwrap_or(defaults.top_p),
            stop_words: overrides
                .stop_words
                .clone()
                .or_else(|| file.stop_words.clone())
                .unwrap_or_default(),
            context_length: overrides
                .context_length
                .or(file.context_length)
                .unwrap_or(max_new_tokens),
        }
    }
}

/// Per-user directories for configuration and prompt history.
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("ai", "vlmrs", "vlmrs")
}

pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}
