use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// The server's recognized configuration, as a single JSON object.
/// Arrives either from a local file at startup or through a
/// `workspace/configuration` pull after initialization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub eval: EvalConfig,
    pub options: OptionsConfig,
    pub formatting: FormattingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Size cap for the eval worker pool.
    pub workers: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfig { workers: 3 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OptionsConfig {
    /// Whether option workers are consulted at all.
    pub enable: bool,
    /// JSON file mapping option attribute paths to their declarations.
    pub declarations: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FormattingConfig {
    /// External formatter executable; the draft is piped through it.
    pub command: String,
}

impl Default for FormattingConfig {
    fn default() -> Self {
        FormattingConfig {
            command: "nixpkgs-fmt".to_string(),
        }
    }
}

impl Config {
    /// Default configuration file probed in the working directory.
    pub const FILE_NAME: &'static str = ".nixd.json";

    pub fn load_file(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
