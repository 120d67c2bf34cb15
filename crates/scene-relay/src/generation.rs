//! Generation stage: launch the language-model executable and stream its
//! output line by line while it runs.

use std::io::Write;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::GenerationConfig;
use crate::prompt::Prompt;
use crate::types::{ProcessState, RelayError, RelayResult, StreamOutcome};

/// Lines buffered between the pipe readers and the sink.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Destination for streamed lines.
pub trait LineSink {
    fn forward(&mut self, line: &str) -> std::io::Result<()>;
}

/// Writes each line straight through and flushes, so text shows up as soon
/// as the child produces it.
pub struct ConsoleSink<W: Write> {
    writer: W,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self {
            writer: std::io::stdout(),
        }
    }
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> LineSink for ConsoleSink<W> {
    fn forward(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()
    }
}

impl LineSink for Vec<String> {
    fn forward(&mut self, line: &str) -> std::io::Result<()> {
        self.push(line.to_string());
        Ok(())
    }
}

/// How a child's output is consumed.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub timeout: Option<Duration>,
    /// Forward stderr lines to the sink alongside stdout. When false they go
    /// to the debug log instead.
    pub forward_stderr: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            forward_stderr: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct OutputLine {
    pipe: Pipe,
    text: String,
}

/// Launches the configured LLM executable for a prompt.
#[derive(Debug, Clone)]
pub struct LlmLauncher {
    config: GenerationConfig,
}

impl LlmLauncher {
    pub fn new(config: GenerationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Argument vector for `prompt`: model, prompt, context size, threads,
    /// then any extra arguments.
    pub fn args(&self, prompt: &Prompt) -> RelayResult<Vec<String>> {
        let model = self
            .config
            .model
            .as_ref()
            .ok_or_else(|| RelayError::Config("generation.model is not set".to_string()))?;

        let mut args = vec![
            "-m".to_string(),
            model.display().to_string(),
            "-p".to_string(),
            prompt.as_str().to_string(),
            "--ctx-size".to_string(),
            self.config.ctx_size.to_string(),
            "--threads".to_string(),
            self.config.threads.to_string(),
        ];
        args.extend(self.config.extra_args.iter().cloned());
        Ok(args)
    }

    /// Run the executable on `prompt` and forward its output to `sink`.
    pub async fn generate<S: LineSink + ?Sized>(
        &self,
        prompt: &Prompt,
        sink: &mut S,
    ) -> RelayResult<StreamOutcome> {
        let args = self.args(prompt)?;
        if let Some(model) = &self.config.model {
            ensure_model_file(model)?;
        }

        tracing::info!(
            "Launching {} (ctx {}, {} threads)",
            self.config.executable,
            self.config.ctx_size,
            self.config.threads
        );

        let mut command = Command::new(&self.config.executable);
        command.args(&args);

        let options = StreamOptions {
            timeout: self.config.timeout(),
            forward_stderr: self.config.forward_stderr,
        };
        stream_command(command, options, sink).await
    }
}

fn ensure_model_file(model: &Path) -> RelayResult<()> {
    if model.is_file() {
        Ok(())
    } else {
        Err(RelayError::ModelNotAvailable(format!(
            "LLM weights not found at {}",
            model.display()
        )))
    }
}

fn transition(state: &mut ProcessState, next: ProcessState) {
    tracing::debug!("Generation process: {state} -> {next}");
    *state = next;
}

/// Where the child's output is read from.
enum OutputPipes {
    /// stdout and stderr write into one pipe, so lines keep their write order.
    #[cfg(unix)]
    Shared(std::io::PipeReader),
    Separate,
}

#[cfg_attr(not(unix), allow(unused_variables))]
fn attach_pipes(command: &mut Command, merge: bool) -> std::io::Result<OutputPipes> {
    #[cfg(unix)]
    {
        if merge {
            let (reader, writer) = std::io::pipe()?;
            command.stdout(writer.try_clone()?).stderr(writer);
            return Ok(OutputPipes::Shared(reader));
        }
    }
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    Ok(OutputPipes::Separate)
}

/// Spawn `command`, forward every output line to `sink` as it arrives, and
/// wait for the process to exit.
///
/// When stderr is forwarded it shares stdout's pipe on unix, keeping the
/// child's write order; otherwise the two are read separately. The exit
/// status decides the result: code 0 is success, any other code is
/// [`RelayError::ProcessFailed`] (nothing forwarded) or
/// [`RelayError::PartialOutput`], and death by signal is
/// [`RelayError::ProcessCrashed`]. When `options.timeout` elapses the child is
/// killed and [`RelayError::TimedOut`] is returned.
pub async fn stream_command<S: LineSink + ?Sized>(
    mut command: Command,
    options: StreamOptions,
    sink: &mut S,
) -> RelayResult<StreamOutcome> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    command.stdin(Stdio::null()).kill_on_drop(true);
    let pipes = attach_pipes(&mut command, options.forward_stderr)?;

    let mut state = ProcessState::NotStarted;
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RelayError::ExecutableNotFound(program));
        }
        Err(e) => return Err(RelayError::Spawn { program, source: e }),
    };
    // Closes the parent's copies of a shared pipe's write end.
    drop(command);
    transition(&mut state, ProcessState::Running { pid: child.id() });

    let (tx, mut rx) = mpsc::channel::<OutputLine>(LINE_CHANNEL_CAPACITY);
    let readers = match pipes {
        #[cfg(unix)]
        OutputPipes::Shared(reader) => {
            let reader = tokio::net::unix::pipe::Receiver::from_owned_fd(reader.into())?;
            vec![tokio::spawn(read_lines(reader, Pipe::Stdout, tx))]
        }
        OutputPipes::Separate => {
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| std::io::Error::other("child stdout was not captured"))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| std::io::Error::other("child stderr was not captured"))?;
            vec![
                tokio::spawn(read_lines(stdout, Pipe::Stdout, tx.clone())),
                tokio::spawn(read_lines(stderr, Pipe::Stderr, tx)),
            ]
        }
    };

    let started = Instant::now();
    let mut forwarded = 0usize;

    let pump = async {
        while let Some(line) = rx.recv().await {
            if line.pipe == Pipe::Stdout || options.forward_stderr {
                sink.forward(&line.text)?;
                forwarded += 1;
            } else {
                tracing::debug!(target: "scene_relay::child_stderr", "{}", line.text.trim_end());
            }
        }
        let status = child.wait().await?;
        Ok::<ExitStatus, RelayError>(status)
    };

    let waited = match options.timeout {
        Some(limit) => tokio::time::timeout(limit, pump).await.ok(),
        None => Some(pump.await),
    };

    let status = match waited {
        Some(result) => result?,
        None => {
            let limit = options.timeout.unwrap_or_default();
            tracing::warn!(
                "{program} did not finish within {}s; killing it",
                limit.as_secs_f32()
            );
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill {program}: {e}");
            }
            for reader in &readers {
                reader.abort();
            }
            transition(&mut state, ProcessState::Exited { code: None });
            return Err(RelayError::TimedOut {
                after: limit,
                lines_forwarded: forwarded,
            });
        }
    };

    for reader in readers {
        match reader.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Error reading {program} output: {e}"),
            Err(e) => tracing::warn!("Output reader for {program} failed: {e}"),
        }
    }

    transition(&mut state, ProcessState::Exited { code: status.code() });
    let elapsed_ms = started.elapsed().as_millis() as u64;
    tracing::info!("{program} {status} after {elapsed_ms}ms, {forwarded} lines");

    match status.code() {
        Some(0) => Ok(StreamOutcome {
            exit_code: 0,
            lines_forwarded: forwarded,
            elapsed_ms,
        }),
        Some(code) if forwarded == 0 => Err(RelayError::ProcessFailed { code }),
        Some(code) => Err(RelayError::PartialOutput {
            code,
            lines_forwarded: forwarded,
        }),
        None => Err(RelayError::ProcessCrashed {
            status: status.to_string(),
            lines_forwarded: forwarded,
        }),
    }
}

/// Read `pipe` to EOF, sending each line (newline included) to `tx`.
async fn read_lines<R: AsyncRead + Unpin>(
    pipe: R,
    which: Pipe,
    tx: mpsc::Sender<OutputLine>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let bytes_read = reader.read_until(b'\n', &mut buf).await?;
        if bytes_read == 0 {
            return Ok(());
        }

        let line = OutputLine {
            pipe: which,
            text: String::from_utf8_lossy(&buf).into_owned(),
        };
        if tx.send(line).await.is_err() {
            // Receiver is gone; nobody wants the rest.
            return Ok(());
        }
    }
}
