//! Run configuration: every path and tuning knob the pipeline needs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::prompt::ChatTemplate;
use crate::types::{RelayError, RelayResult};

pub const DEFAULT_INSTRUCTION: &str = "Describe this image.";
pub const DEFAULT_SYSTEM: &str = "You are a helpful assistant.";
pub const DEFAULT_QUESTION: &str =
    "What could be happening in the scene, and how does it relate to human emotion?";
pub const DEFAULT_EXECUTABLE: &str = "llama-cli";
pub const DEFAULT_CTX_SIZE: u32 = 2048;
pub const DEFAULT_THREADS: u32 = 6;
pub const DEFAULT_MAX_NEW_TOKENS: usize = 128;

#[allow(clippy::excessive_precision)]
const BLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
#[allow(clippy::excessive_precision)]
const BLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// Top-level configuration for one relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub image: Option<PathBuf>,
    pub caption: CaptionConfig,
    pub prompt: PromptConfig,
    pub generation: GenerationConfig,
}

/// Which captioning backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptionBackend {
    #[default]
    Onnx,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    pub backend: CaptionBackend,
    pub instruction: Option<String>,
    pub onnx: OnnxCaptionConfig,
    pub command: CommandCaptionConfig,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            backend: CaptionBackend::default(),
            instruction: Some(DEFAULT_INSTRUCTION.to_string()),
            onnx: OnnxCaptionConfig::default(),
            command: CommandCaptionConfig::default(),
        }
    }
}

/// Encoder/decoder captioning model exported to ONNX.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnnxCaptionConfig {
    pub encoder: Option<PathBuf>,
    pub decoder: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub image_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Falls back to the tokenizer's `[DEC]`/`[CLS]`/`<s>`/`<|endoftext|>` token.
    pub decoder_start_token_id: Option<u32>,
    /// Falls back to the tokenizer's `[SEP]`/`</s>`/`<|endoftext|>` token.
    pub eos_token_id: Option<u32>,
    pub max_new_tokens: usize,
    pub intra_threads: usize,
}

impl Default for OnnxCaptionConfig {
    fn default() -> Self {
        Self {
            encoder: None,
            decoder: None,
            tokenizer: None,
            image_size: 384,
            mean: BLIP_MEAN,
            std: BLIP_STD,
            decoder_start_token_id: None,
            eos_token_id: None,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            intra_threads: 1,
        }
    }
}

/// External captioning executable. `{image}` and `{instruction}` in `args`
/// are substituted per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandCaptionConfig {
    pub program: Option<String>,
    pub args: Vec<String>,
}

impl Default for CommandCaptionConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec![
                "--image".to_string(),
                "{image}".to_string(),
                "-p".to_string(),
                "{instruction}".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub template: ChatTemplate,
    pub system: String,
    pub question: String,
    pub add_generation_prompt: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            template: ChatTemplate::ChatMl,
            system: DEFAULT_SYSTEM.to_string(),
            question: DEFAULT_QUESTION.to_string(),
            add_generation_prompt: false,
        }
    }
}

/// How to launch the language-model executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub executable: String,
    pub model: Option<PathBuf>,
    pub ctx_size: u32,
    pub threads: u32,
    pub extra_args: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub forward_stderr: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            executable: DEFAULT_EXECUTABLE.to_string(),
            model: None,
            ctx_size: DEFAULT_CTX_SIZE,
            threads: DEFAULT_THREADS,
            extra_args: Vec::new(),
            timeout_secs: None,
            forward_stderr: true,
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Check the settings a launch depends on.
    pub fn validate(&self) -> RelayResult<()> {
        if self.executable.trim().is_empty() {
            return Err(RelayError::Config(
                "generation.executable must not be empty".to_string(),
            ));
        }
        if self.model.is_none() {
            return Err(RelayError::Config(
                "generation.model is not set".to_string(),
            ));
        }
        if self.ctx_size == 0 {
            return Err(RelayError::Config(
                "generation.ctx_size must be positive".to_string(),
            ));
        }
        if self.threads == 0 {
            return Err(RelayError::Config(
                "generation.threads must be positive".to_string(),
            ));
        }
        if self.timeout_secs == Some(0) {
            return Err(RelayError::Config(
                "generation.timeout_secs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

impl RelayConfig {
    /// Read a JSON config file. Missing sections take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> RelayResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: RelayConfig = serde_json::from_str(&raw)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Check the settings a full run depends on.
    pub fn validate(&self) -> RelayResult<()> {
        self.generation.validate()?;
        if self.caption.backend == CaptionBackend::Command
            && self
                .caption
                .command
                .program
                .as_deref()
                .map_or(true, |p| p.trim().is_empty())
        {
            return Err(RelayError::Config(
                "caption.command.program is required for the command backend".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_run() {
        let config = RelayConfig::default();
        assert_eq!(config.generation.ctx_size, 2048);
        assert_eq!(config.generation.threads, 6);
        assert_eq!(config.caption.onnx.max_new_tokens, 128);
        assert_eq!(
            config.caption.instruction.as_deref(),
            Some("Describe this image.")
        );
        assert!(config.generation.forward_stderr);
        assert!(config.generation.timeout().is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: RelayConfig = serde_json::from_str(
            r#"{
                "generation": { "model": "/models/qwen.Q4_K_M.gguf", "threads": 8 },
                "prompt": { "template": "llama2" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.generation.threads, 8);
        assert_eq!(config.generation.ctx_size, DEFAULT_CTX_SIZE);
        assert_eq!(config.generation.executable, DEFAULT_EXECUTABLE);
        assert_eq!(config.prompt.template, ChatTemplate::Llama2);
        assert_eq!(config.prompt.system, DEFAULT_SYSTEM);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_model() {
        let config = RelayConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("generation.model"));
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let mut config = RelayConfig::default();
        config.generation.model = Some(PathBuf::from("model.gguf"));
        config.generation.threads = 0;
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_command_backend_requires_program() {
        let mut config = RelayConfig::default();
        config.generation.model = Some(PathBuf::from("model.gguf"));
        config.caption.backend = CaptionBackend::Command;
        assert!(config.validate().is_err());

        config.caption.command.program = Some("llama-mtmd-cli".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generation_checks_ignore_captioner() {
        let mut config = RelayConfig::default();
        config.generation.model = Some(PathBuf::from("model.gguf"));
        config.caption.backend = CaptionBackend::Command;
        assert!(config.generation.validate().is_ok());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "generation": { "timeout_secs": 30 } }"#).unwrap();

        let config = RelayConfig::from_file(&path).unwrap();
        assert_eq!(config.generation.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_from_file_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(
            RelayConfig::from_file(&path),
            Err(RelayError::Json(_))
        ));
    }
}
