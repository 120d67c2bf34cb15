//! Captioning through an external executable.

use std::process::{Command, Stdio};

use crate::config::CommandCaptionConfig;
use crate::image_input::LoadedImage;
use crate::types::{RelayError, RelayResult};

use super::Captioner;

const IMAGE_PLACEHOLDER: &str = "{image}";
const INSTRUCTION_PLACEHOLDER: &str = "{instruction}";

/// Runs a captioning program once per image and reads the caption from its
/// stdout.
#[derive(Debug, Clone)]
pub struct CommandCaptioner {
    program: String,
    args: Vec<String>,
}

impl CommandCaptioner {
    pub fn new(config: &CommandCaptionConfig) -> RelayResult<Self> {
        let program = config
            .program
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                RelayError::Config(
                    "caption.command.program is required for the command backend".to_string(),
                )
            })?;

        Ok(Self {
            program: program.to_string(),
            args: config.args.clone(),
        })
    }

    /// Arguments with placeholders filled in.
    pub fn args_for(&self, image: &LoadedImage, instruction: Option<&str>) -> Vec<String> {
        let image_path = image.path.display().to_string();
        let instruction = instruction.unwrap_or("");
        self.args
            .iter()
            .map(|arg| {
                arg.replace(IMAGE_PLACEHOLDER, &image_path)
                    .replace(INSTRUCTION_PLACEHOLDER, instruction)
            })
            .collect()
    }
}

impl Captioner for CommandCaptioner {
    fn name(&self) -> &str {
        &self.program
    }

    fn caption(&mut self, image: &LoadedImage, instruction: Option<&str>) -> RelayResult<String> {
        let args = self.args_for(image, instruction);
        tracing::debug!("Running {} {:?}", self.program, args);

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RelayError::ExecutableNotFound(self.program.clone())
                } else {
                    RelayError::Spawn {
                        program: self.program.clone(),
                        source: e,
                    }
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RelayError::Caption(format!(
                "{} {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let caption = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if caption.is_empty() {
            return Err(RelayError::Caption(format!(
                "{} produced no caption",
                self.program
            )));
        }
        Ok(caption)
    }
}

#[cfg(test)]
mod tests {
    use image::DynamicImage;

    use super::*;

    fn image_at(path: &str) -> LoadedImage {
        LoadedImage {
            path: path.into(),
            image: DynamicImage::new_rgb8(1, 1),
        }
    }

    fn sh_captioner(script: &str) -> CommandCaptioner {
        CommandCaptioner::new(&CommandCaptionConfig {
            program: Some("sh".to_string()),
            args: vec![
                "-c".to_string(),
                script.to_string(),
                "{image}".to_string(),
                "{instruction}".to_string(),
            ],
        })
        .unwrap()
    }

    #[test]
    fn test_requires_program() {
        let err = CommandCaptioner::new(&CommandCaptionConfig {
            program: Some("   ".to_string()),
            args: Vec::new(),
        })
        .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_placeholders() {
        let captioner = CommandCaptioner::new(&CommandCaptionConfig {
            program: Some("llama-mtmd-cli".to_string()),
            ..CommandCaptionConfig::default()
        })
        .unwrap();
        let args = captioner.args_for(&image_at("/tmp/cat.jpg"), Some("Describe this image."));
        assert_eq!(args, ["--image", "/tmp/cat.jpg", "-p", "Describe this image."]);

        let args = captioner.args_for(&image_at("/tmp/cat.jpg"), None);
        assert_eq!(args[3], "");
    }

    #[cfg(unix)]
    #[test]
    fn test_caption_from_stdout() {
        let mut captioner = sh_captioner("echo \"  a photo of $0 ($1)  \"");
        let caption = captioner
            .caption(&image_at("beach.png"), Some("be brief"))
            .unwrap();
        assert_eq!(caption, "a photo of beach.png (be brief)");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_program() {
        let mut captioner = sh_captioner("echo 'model load failed' 1>&2; exit 2");
        let err = captioner.caption(&image_at("x.png"), None).unwrap_err();
        match err {
            RelayError::Caption(msg) => assert!(msg.contains("model load failed")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_empty_caption_is_an_error() {
        let mut captioner = sh_captioner("true");
        assert!(matches!(
            captioner.caption(&image_at("x.png"), None),
            Err(RelayError::Caption(_))
        ));
    }

    #[test]
    fn test_missing_program() {
        let mut captioner = CommandCaptioner::new(&CommandCaptionConfig {
            program: Some("/nonexistent/captioner".to_string()),
            args: Vec::new(),
        })
        .unwrap();
        assert!(matches!(
            captioner.caption(&image_at("x.png"), None),
            Err(RelayError::ExecutableNotFound(_))
        ));
    }
}
