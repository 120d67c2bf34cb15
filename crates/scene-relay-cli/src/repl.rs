//! Interactive REPL for scene-relay.
//!
//! Launch with `scene-relay repl` to enter interactive mode.
//! Type `/help` for available commands, Tab for completion.

use std::path::{Path, PathBuf};

use rustyline::completion::{Completer, Pair};
use rustyline::config::CompletionType;
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Config, Editor, Helper};

use scene_relay::caption::{self, Captioner};
use scene_relay::{
    is_supported_format, load_image, ConsoleSink, LlmLauncher, PromptTemplate, RelayConfig,
    RelayResult,
};

use crate::doctor;

/// Available REPL commands.
const COMMANDS: &[(&str, &str)] = &[
    ("/image", "Caption an image file"),
    ("/caption", "Set the caption by hand"),
    ("/ask", "Ask the model about the current caption"),
    ("/prompt", "Show the prompt that /ask would send"),
    ("/config", "Show the effective configuration"),
    ("/doctor", "Check executables and model files"),
    ("/clear", "Clear the screen"),
    ("/help", "Show available commands"),
    ("/exit", "Quit the REPL"),
];

/// Completion candidates for `input`: command names, or image files in `dir`
/// after `/image `. Returns the byte offset the candidates replace from.
fn completions(input: &str, dir: &Path) -> (usize, Vec<String>) {
    let Some(partial) = input.strip_prefix("/image ") else {
        if input.contains(' ') {
            return (input.len(), Vec::new());
        }
        let commands = COMMANDS
            .iter()
            .map(|(cmd, _)| *cmd)
            .filter(|cmd| cmd.starts_with(input))
            .map(|cmd| format!("{cmd} "))
            .collect();
        return (0, commands);
    };

    let mut files: Vec<String> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| is_supported_format(path))
        .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
        .filter(|name| name.starts_with(partial))
        .collect();
    files.sort();
    (input.len() - partial.len(), files)
}

#[derive(Default)]
struct RelayHelper;

impl Completer for RelayHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let (start, candidates) = completions(&line[..pos], Path::new("."));
        let pairs = candidates
            .into_iter()
            .map(|c| Pair {
                display: c.trim_end().to_string(),
                replacement: c,
            })
            .collect();
        Ok((start, pairs))
    }
}

impl Hinter for RelayHelper {
    type Hint = String;
}
impl Highlighter for RelayHelper {}
impl Validator for RelayHelper {}
impl Helper for RelayHelper {}

/// Session state.
struct ReplState {
    config: RelayConfig,
    source: Option<PathBuf>,
    captioner: Option<Box<dyn Captioner>>,
    image: Option<PathBuf>,
    caption: Option<String>,
}

impl ReplState {
    /// The captioner is loaded on first use; model loading can be slow.
    fn describe(&mut self, path: &Path) -> RelayResult<String> {
        let captioner = match self.captioner.take() {
            Some(captioner) => captioner,
            None => caption::from_config(&self.config.caption)?,
        };
        let captioner = self.captioner.insert(captioner);
        let image = load_image(path)?;
        captioner.caption(&image, self.config.caption.instruction.as_deref())
    }
}

/// Run the interactive REPL.
pub async fn run(
    config: RelayConfig,
    source: Option<PathBuf>,
    image: Option<PathBuf>,
) -> anyhow::Result<()> {
    eprintln!(
        "scene-relay v{}. Type /help for commands, /exit to quit.",
        env!("CARGO_PKG_VERSION")
    );

    let rl_config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .completion_type(CompletionType::List)
        .build();

    let mut rl: Editor<RelayHelper, rustyline::history::DefaultHistory> =
        Editor::with_config(rl_config)?;
    rl.set_helper(Some(RelayHelper));

    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    let hist_path = PathBuf::from(&home).join(".scene_relay_history");
    if hist_path.exists() {
        let _ = rl.load_history(&hist_path);
    }

    let mut state = ReplState {
        config,
        source,
        captioner: None,
        image: None,
        caption: None,
    };
    if let Some(path) = image {
        cmd_image(&path.display().to_string(), &mut state);
    }

    let prompt = "scene> ";

    loop {
        match rl.readline(prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let Some(input) = line.strip_prefix('/') else {
                    cmd_ask(line, &state).await;
                    continue;
                };
                if input.is_empty() {
                    cmd_help();
                    continue;
                }

                let mut parts = input.splitn(2, ' ');
                let cmd = parts.next().unwrap_or("");
                let args = parts.next().unwrap_or("").trim();

                match cmd {
                    "exit" | "quit" => {
                        eprintln!("Goodbye.");
                        break;
                    }
                    "help" | "h" | "?" => cmd_help(),
                    "clear" | "cls" => eprint!("\x1b[2J\x1b[H"),
                    "image" => cmd_image(args, &mut state),
                    "caption" => cmd_caption(args, &mut state),
                    "ask" => cmd_ask(args, &state).await,
                    "prompt" => cmd_prompt(args, &state),
                    "config" => cmd_config(&state),
                    "doctor" => {
                        doctor::run(&state.config, state.source.as_deref());
                    }
                    _ => {
                        eprintln!("  Unknown command '/{cmd}'. Type /help for commands.");
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                eprintln!("(Ctrl+C) Type /exit to quit.");
            }
            Err(ReadlineError::Eof) => {
                eprintln!("Goodbye.");
                break;
            }
            Err(err) => {
                eprintln!("  Error: {err}");
                break;
            }
        }
    }

    let _ = std::fs::create_dir_all(hist_path.parent().unwrap_or(Path::new(".")));
    let _ = rl.save_history(&hist_path);

    Ok(())
}

fn cmd_help() {
    eprintln!();
    eprintln!("  Commands:");
    eprintln!();
    for (cmd, desc) in COMMANDS {
        eprintln!("    {cmd:<18} {desc}");
    }
    eprintln!();
    eprintln!("  Anything not starting with / is sent as a question, like /ask.");
    eprintln!();
}

fn cmd_image(args: &str, state: &mut ReplState) {
    if args.is_empty() {
        eprintln!("  Usage: /image <path>");
        return;
    }
    let path = PathBuf::from(args);
    match state.describe(&path) {
        Ok(caption) => {
            println!("  Image description: {caption}");
            state.image = Some(path);
            state.caption = Some(caption);
        }
        Err(e) => eprintln!("  Failed to caption {}: {e}", path.display()),
    }
}

fn cmd_caption(args: &str, state: &mut ReplState) {
    if args.is_empty() {
        match &state.caption {
            Some(caption) => eprintln!("  Current caption: {caption}"),
            None => eprintln!("  Usage: /caption <text>"),
        }
        return;
    }
    state.caption = Some(args.to_string());
    state.image = None;
    eprintln!("  Caption set.");
}

fn template_for(question: &str, state: &ReplState) -> PromptTemplate {
    let template = PromptTemplate::new(&state.config.prompt);
    if question.is_empty() {
        template
    } else {
        template.with_question(question)
    }
}

async fn cmd_ask(question: &str, state: &ReplState) {
    let Some(caption) = &state.caption else {
        eprintln!("  No caption yet. Use /image <path> or /caption <text> first.");
        return;
    };
    if let Err(e) = state.config.generation.validate() {
        eprintln!("  {e}");
        return;
    }

    let prompt = template_for(question, state).assemble(caption);
    let launcher = LlmLauncher::new(state.config.generation.clone());
    let mut sink = ConsoleSink::stdout();
    println!();
    match launcher.generate(&prompt, &mut sink).await {
        Ok(outcome) => {
            println!();
            eprintln!(
                "  \x1b[90m{} lines in {:.1}s\x1b[0m",
                outcome.lines_forwarded,
                outcome.elapsed_ms as f64 / 1000.0
            );
        }
        Err(e) => eprintln!("  Generation failed: {e}"),
    }
}

fn cmd_prompt(question: &str, state: &ReplState) {
    match &state.caption {
        Some(caption) => {
            let prompt = template_for(question, state).assemble(caption);
            println!("{prompt}");
        }
        None => eprintln!("  No caption yet. Use /image <path> or /caption <text> first."),
    }
}

fn cmd_config(state: &ReplState) {
    match serde_json::to_string_pretty(&state.config) {
        Ok(json) => {
            eprintln!();
            match &state.source {
                Some(path) => eprintln!("  Config file: {}", path.display()),
                None => eprintln!("  Config file: (none, built-in defaults)"),
            }
            if let Some(image) = &state.image {
                eprintln!("  Current image: {}", image.display());
            }
            eprintln!();
            println!("{json}");
        }
        Err(e) => eprintln!("  Cannot render config: {e}"),
    }
}
