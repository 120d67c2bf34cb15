//! Configuration loading and resolution.

use std::path::{Path, PathBuf};

use clap::Args;

use scene_relay::{ChatTemplate, RelayConfig, RelayResult};

/// Explicit config file location.
pub const CONFIG_ENV: &str = "SCENE_RELAY_CONFIG";
/// Overrides `generation.executable`.
pub const LLM_ENV: &str = "SCENE_RELAY_LLM";
/// Overrides `generation.model`.
pub const MODEL_ENV: &str = "SCENE_RELAY_MODEL";

const CONFIG_RELATIVE: &str = ".scene-relay/config.json";

/// A resolved configuration and the file it came from, if any.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: RelayConfig,
    pub source: Option<PathBuf>,
}

/// Resolve the config file path.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    let env_path = std::env::var(CONFIG_ENV).ok();
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .ok()
        .map(PathBuf::from);
    resolve_config_path_from(explicit, env_path.as_deref(), Path::new("."), home.as_deref())
}

fn resolve_config_path_from(
    explicit: Option<&str>,
    env_path: Option<&str>,
    cwd: &Path,
    home: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }

    if let Some(path) = env_path.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }

    let cwd_config = cwd.join(CONFIG_RELATIVE);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    home.map(|h| h.join(CONFIG_RELATIVE)).filter(|p| p.exists())
}

/// Load the effective configuration: file (if any), then environment overrides.
pub fn load_config(explicit: Option<&str>) -> RelayResult<LoadedConfig> {
    let source = resolve_config_path(explicit);
    let mut config = match &source {
        Some(path) => {
            tracing::info!("Config: {}", path.display());
            RelayConfig::from_file(path)?
        }
        None => {
            tracing::debug!("No config file found; using built-in defaults");
            RelayConfig::default()
        }
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(LoadedConfig { config, source })
}

/// Apply `SCENE_RELAY_LLM` / `SCENE_RELAY_MODEL` through `lookup`.
pub fn apply_env_overrides(config: &mut RelayConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(llm) = lookup(LLM_ENV).filter(|v| !v.is_empty()) {
        config.generation.executable = llm;
    }
    if let Some(model) = lookup(MODEL_ENV).filter(|v| !v.is_empty()) {
        config.generation.model = Some(PathBuf::from(model));
    }
}

/// Per-invocation overrides from the command line. Flags win over the config
/// file and the environment.
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// Question to ask about the image.
    #[arg(short, long)]
    pub question: Option<String>,

    /// Language-model executable (e.g. llama-cli).
    #[arg(long)]
    pub llm: Option<String>,

    /// Path to the language-model weights (.gguf).
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Context size passed to the model.
    #[arg(long)]
    pub ctx_size: Option<u32>,

    /// Thread count passed to the model.
    #[arg(long)]
    pub threads: Option<u32>,

    /// Kill the model after this many seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Chat template (chatml, llama2, default).
    #[arg(long)]
    pub template: Option<ChatTemplate>,
}

impl Overrides {
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(question) = &self.question {
            config.prompt.question = question.clone();
        }
        if let Some(llm) = &self.llm {
            config.generation.executable = llm.clone();
        }
        if let Some(model) = &self.model {
            config.generation.model = Some(model.clone());
        }
        if let Some(ctx_size) = self.ctx_size {
            config.generation.ctx_size = ctx_size;
        }
        if let Some(threads) = self.threads {
            config.generation.threads = threads;
        }
        if let Some(timeout) = self.timeout {
            config.generation.timeout_secs = Some(timeout);
        }
        if let Some(template) = self.template {
            config.prompt.template = template;
        }
    }
}
