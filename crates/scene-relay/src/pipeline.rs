//! The caption → prompt → generation chain.

use std::path::Path;

use crate::caption::{self, Captioner};
use crate::config::RelayConfig;
use crate::generation::{LineSink, LlmLauncher};
use crate::image_input::load_image;
use crate::prompt::{Prompt, PromptTemplate};
use crate::types::{RelayResult, RunReport, StreamOutcome};

/// One configured relay: a captioner, a prompt template, and a launcher for
/// the language model.
pub struct Pipeline {
    captioner: Box<dyn Captioner>,
    instruction: Option<String>,
    template: PromptTemplate,
    launcher: LlmLauncher,
}

impl Pipeline {
    /// Validate `config` and load the captioner it selects.
    pub fn from_config(config: &RelayConfig) -> RelayResult<Self> {
        config.validate()?;
        let captioner = caption::from_config(&config.caption)?;
        Ok(Self::with_captioner(config, captioner))
    }

    /// Build a pipeline around an already constructed captioner.
    pub fn with_captioner(config: &RelayConfig, captioner: Box<dyn Captioner>) -> Self {
        Self {
            captioner,
            instruction: config.caption.instruction.clone(),
            template: PromptTemplate::new(&config.prompt),
            launcher: LlmLauncher::new(config.generation.clone()),
        }
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    pub fn launcher(&self) -> &LlmLauncher {
        &self.launcher
    }

    pub fn captioner_name(&self) -> &str {
        self.captioner.name()
    }

    /// Load `image_path` and caption it.
    pub fn describe(&mut self, image_path: &Path) -> RelayResult<String> {
        let image = load_image(image_path)?;
        tracing::info!(
            "Captioning {} with {}",
            image.path.display(),
            self.captioner.name()
        );
        self.captioner.caption(&image, self.instruction.as_deref())
    }

    pub fn prompt_for(&self, caption: &str) -> Prompt {
        self.template.assemble(caption)
    }

    pub async fn generate<S: LineSink + ?Sized>(
        &self,
        prompt: &Prompt,
        sink: &mut S,
    ) -> RelayResult<StreamOutcome> {
        self.launcher.generate(prompt, sink).await
    }

    /// Stream the model's answer about a caption obtained elsewhere. No image
    /// is read.
    pub async fn answer<S: LineSink + ?Sized>(
        &self,
        caption: String,
        sink: &mut S,
    ) -> RelayResult<RunReport> {
        let prompt = self.prompt_for(&caption);
        let outcome = self.generate(&prompt, sink).await?;

        Ok(RunReport {
            image: None,
            caption,
            prompt: prompt.into_string(),
            outcome,
        })
    }

    /// Caption `image_path`, hand the caption to `on_caption`, then stream
    /// the model's answer into `sink`.
    pub async fn run<S, F>(
        &mut self,
        image_path: &Path,
        on_caption: F,
        sink: &mut S,
    ) -> RelayResult<RunReport>
    where
        S: LineSink + ?Sized,
        F: FnOnce(&str),
    {
        let caption = self.describe(image_path)?;
        on_caption(&caption);

        let mut report = self.answer(caption, sink).await?;
        report.image = Some(image_path.to_path_buf());
        Ok(report)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("captioner", &self.captioner.name())
            .field("instruction", &self.instruction)
            .field("template", &self.template)
            .field("launcher", &self.launcher)
            .finish()
    }
}
