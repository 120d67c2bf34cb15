//! Caption stage: turn an image into one descriptive sentence.

mod command;
mod onnx;

pub use command::CommandCaptioner;
pub use onnx::{preprocess, OnnxCaptioner};

use crate::config::{CaptionBackend, CaptionConfig};
use crate::image_input::LoadedImage;
use crate::types::RelayResult;

/// Anything that can describe an image in text.
pub trait Captioner: Send {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Describe `image`, optionally steered by `instruction`.
    fn caption(&mut self, image: &LoadedImage, instruction: Option<&str>) -> RelayResult<String>;
}

/// A captioner that always returns the same text. Used when the caller
/// already has a description and wants to skip the vision model.
#[derive(Debug, Clone)]
pub struct FixedCaptioner {
    caption: String,
}

impl FixedCaptioner {
    pub fn new(caption: impl Into<String>) -> Self {
        Self {
            caption: caption.into(),
        }
    }
}

impl Captioner for FixedCaptioner {
    fn name(&self) -> &str {
        "fixed"
    }

    fn caption(&mut self, _image: &LoadedImage, _instruction: Option<&str>) -> RelayResult<String> {
        Ok(self.caption.clone())
    }
}

/// Build the captioner selected by `config`.
pub fn from_config(config: &CaptionConfig) -> RelayResult<Box<dyn Captioner>> {
    match config.backend {
        CaptionBackend::Onnx => Ok(Box::new(OnnxCaptioner::new(&config.onnx)?)),
        CaptionBackend::Command => Ok(Box::new(CommandCaptioner::new(&config.command)?)),
    }
}

#[cfg(test)]
mod tests {
    use image::DynamicImage;

    use super::*;
    use crate::types::RelayError;

    #[test]
    fn test_fixed_captioner() {
        let image = LoadedImage {
            path: "unused.png".into(),
            image: DynamicImage::new_rgb8(1, 1),
        };
        let mut captioner = FixedCaptioner::new("a lighthouse at dusk");
        assert_eq!(captioner.name(), "fixed");
        assert_eq!(
            captioner.caption(&image, Some("ignored")).unwrap(),
            "a lighthouse at dusk"
        );
    }

    #[test]
    fn test_from_config_without_model_files() {
        let err = from_config(&CaptionConfig::default()).err().unwrap();
        assert!(matches!(err, RelayError::ModelNotAvailable(_)));
    }

    #[test]
    fn test_from_config_command_backend() {
        let mut config = CaptionConfig {
            backend: CaptionBackend::Command,
            ..CaptionConfig::default()
        };
        config.command.program = Some("llama-mtmd-cli".to_string());

        let captioner = from_config(&config).unwrap();
        assert_eq!(captioner.name(), "llama-mtmd-cli");
    }
}
