//! scene-relay entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use scene_relay::{
    caption, load_image, ChatTemplate, ConsoleSink, FixedCaptioner, Pipeline, PromptTemplate,
    RelayError,
};
use scene_relay_cli::config::{load_config, Overrides};
use scene_relay_cli::{doctor, repl};

#[derive(Parser)]
#[command(
    name = "scene-relay",
    about = "Caption an image and ask a local language model about it",
    version
)]
struct Cli {
    /// Path to a JSON config file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Caption an image and stream the model's answer.
    Run {
        /// Image to describe. Falls back to `image` in the config file.
        image: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,

        /// Use this caption instead of running the captioning model. No image
        /// is read.
        #[arg(long)]
        caption: Option<String>,

        /// Write a JSON report of the run to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Caption an image and print the caption.
    Caption {
        /// Image to describe.
        image: PathBuf,
    },

    /// Print the prompt that would be sent for a caption.
    Prompt {
        /// Caption text to embed.
        caption: String,

        /// Question to ask about the image.
        #[arg(short, long)]
        question: Option<String>,

        /// Chat template (chatml, llama2, default).
        #[arg(long)]
        template: Option<ChatTemplate>,
    },

    /// Print the effective configuration as JSON.
    Config,

    /// Check executables and model files.
    Doctor,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   scene-relay completions bash > ~/.local/share/bash-completion/completions/scene-relay
    ///   scene-relay completions zsh > ~/.zfunc/_scene-relay
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },

    /// Launch interactive REPL mode.
    Repl {
        /// Image to caption on startup.
        image: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = execute(cli).await {
        eprintln!("Error: {err:#}");
        let code = err
            .downcast_ref::<RelayError>()
            .map(RelayError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn print_caption(caption: &str) {
    println!("Image description: {caption}\n");
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run {
            image,
            overrides,
            caption,
            report,
        } => {
            let mut loaded = load_config(cli.config.as_deref())?;
            overrides.apply(&mut loaded.config);
            let config = loaded.config;

            let mut sink = ConsoleSink::stdout();
            let result = match caption {
                Some(text) => {
                    config.generation.validate()?;
                    let pipeline =
                        Pipeline::with_captioner(&config, Box::new(FixedCaptioner::new(&text)));
                    print_caption(&text);
                    pipeline.answer(text, &mut sink).await?
                }
                None => {
                    let image = image.or_else(|| config.image.clone()).ok_or_else(|| {
                        RelayError::InvalidInput(
                            "no image given and no `image` in the config file".to_string(),
                        )
                    })?;
                    let mut pipeline = Pipeline::from_config(&config)?;
                    pipeline.run(&image, print_caption, &mut sink).await?
                }
            };

            tracing::info!(
                "Generation finished: {} lines in {} ms",
                result.outcome.lines_forwarded,
                result.outcome.elapsed_ms
            );

            if let Some(path) = report {
                let json = serde_json::to_string_pretty(&result)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("cannot write report to {}", path.display()))?;
            }
        }

        Commands::Caption { image } => {
            let loaded = load_config(cli.config.as_deref())?;
            let mut captioner = caption::from_config(&loaded.config.caption)?;
            let image = load_image(&image)?;
            let text = captioner.caption(&image, loaded.config.caption.instruction.as_deref())?;
            println!("{text}");
        }

        Commands::Prompt {
            caption,
            question,
            template,
        } => {
            let mut loaded = load_config(cli.config.as_deref())?;
            if let Some(template) = template {
                loaded.config.prompt.template = template;
            }
            let mut prompt_template = PromptTemplate::new(&loaded.config.prompt);
            if let Some(question) = question {
                prompt_template = prompt_template.with_question(question);
            }
            println!("{}", prompt_template.assemble(&caption));
        }

        Commands::Config => {
            let loaded = load_config(cli.config.as_deref())?;
            match &loaded.source {
                Some(path) => tracing::info!("Config file: {}", path.display()),
                None => tracing::info!("No config file; showing built-in defaults"),
            }
            println!("{}", serde_json::to_string_pretty(&loaded.config)?);
        }

        Commands::Doctor => {
            let loaded = load_config(cli.config.as_deref())?;
            if !doctor::run(&loaded.config, loaded.source.as_deref()) {
                std::process::exit(1);
            }
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "scene-relay", &mut std::io::stdout());
        }

        Commands::Repl { image } => {
            let loaded = load_config(cli.config.as_deref())?;
            repl::run(loaded.config, loaded.source, image).await?;
        }
    }

    Ok(())
}
