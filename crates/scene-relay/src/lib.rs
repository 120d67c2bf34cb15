//! scene-relay: caption an image, fold the caption into a chat prompt, and
//! stream a local language model's answer.

pub mod caption;
pub mod config;
pub mod generation;
pub mod image_input;
pub mod pipeline;
pub mod prompt;
pub mod types;

pub use caption::{Captioner, CommandCaptioner, FixedCaptioner, OnnxCaptioner};
pub use config::{
    CaptionBackend, CaptionConfig, CommandCaptionConfig, GenerationConfig, OnnxCaptionConfig,
    PromptConfig, RelayConfig,
};
pub use generation::{stream_command, ConsoleSink, LineSink, LlmLauncher, StreamOptions};
pub use image_input::{is_supported_format, load_image, LoadedImage};
pub use pipeline::Pipeline;
pub use prompt::{ChatTemplate, Prompt, PromptTemplate, Role, Turn};
pub use types::*;
