//! Environment readiness check.

use std::path::{Path, PathBuf};

use scene_relay::{CaptionBackend, RelayConfig};

/// One line of the doctor report.
#[derive(Debug, Clone)]
pub struct Check {
    pub label: String,
    pub ok: bool,
    pub detail: String,
}

impl Check {
    fn pass(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Locate an executable either by explicit path or on `PATH`.
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let as_path = Path::new(program);
    if as_path.components().count() > 1 {
        return as_path.is_file().then(|| as_path.to_path_buf());
    }
    which::which(program).ok()
}

fn file_check(label: &str, path: Option<&Path>) -> Check {
    match path {
        Some(p) if p.is_file() => Check::pass(label, p.display().to_string()),
        Some(p) => Check::fail(label, format!("not found: {}", p.display())),
        None => Check::fail(label, "not configured"),
    }
}

fn executable_check(label: &str, program: Option<&str>) -> Check {
    match program {
        Some(program) => match find_executable(program) {
            Some(path) => Check::pass(label, path.display().to_string()),
            None => Check::fail(label, format!("{program} not found")),
        },
        None => Check::fail(label, "not configured"),
    }
}

/// Evaluate everything a run needs.
pub fn checks(config: &RelayConfig) -> Vec<Check> {
    let mut checks = vec![
        executable_check("LLM executable", Some(&config.generation.executable)),
        file_check("LLM model", config.generation.model.as_deref()),
    ];

    match config.caption.backend {
        CaptionBackend::Onnx => {
            let onnx = &config.caption.onnx;
            checks.push(file_check("Caption encoder", onnx.encoder.as_deref()));
            checks.push(file_check("Caption decoder", onnx.decoder.as_deref()));
            checks.push(file_check("Caption tokenizer", onnx.tokenizer.as_deref()));
        }
        CaptionBackend::Command => {
            checks.push(executable_check(
                "Caption executable",
                config.caption.command.program.as_deref(),
            ));
        }
    }

    if let Some(image) = &config.image {
        checks.push(file_check("Default image", Some(image)));
    }

    checks
}

/// Print the report. Returns whether everything passed.
pub fn run(config: &RelayConfig, source: Option<&Path>) -> bool {
    println!("scene-relay doctor");
    println!("==================");
    println!();
    match source {
        Some(path) => println!("Config: {}", path.display()),
        None => println!("Config: built-in defaults"),
    }
    println!();

    let results = checks(config);
    for check in &results {
        let mark = if check.ok { "[OK]" } else { "[!!]" };
        println!("{mark} {:<18} {}", check.label, check.detail);
    }

    println!();
    let ready = results.iter().all(|c| c.ok);
    if ready {
        println!("Status: READY");
    } else {
        println!("Status: NOT READY");
        println!("  Point the config (or --llm / --model) at the missing pieces.");
    }
    ready
}
