//! External-program inference adapter
//!
//! Runs a configured captioning command once per image and reads the caption
//! from stdout. Arguments are templated:
//!
//! - `{image}`: absolute image path
//! - `{prompt}`: the prompt type's task template (e.g. `<DETAILED_CAPTION>`)
//! - `{model}`: model name from the session defaults (empty if unset)

use super::{InferenceEngine, InferenceError};
use crate::models::PromptType;
use annoforge_common::config::InferenceConfig;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Inference through an external command
#[derive(Debug, Clone)]
pub struct CommandInferenceEngine {
    program: String,
    args: Vec<String>,
    model: String,
    timeout: Duration,
}

impl CommandInferenceEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            model: String::new(),
            timeout,
        }
    }

    /// Build from the `[inference]` config table; `None` if no command is configured
    pub fn from_config(config: &InferenceConfig, model: Option<&str>) -> Option<Self> {
        let program = config.command.as_deref()?.trim();
        if program.is_empty() {
            return None;
        }
        let engine = Self::new(
            program,
            config.args.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        );
        Some(match model {
            Some(model) => engine.with_model(model),
            None => engine,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn expand_args(&self, image_path: &Path, prompt_type: &PromptType) -> Vec<String> {
        let image = image_path.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{image}", &image)
                    .replace("{prompt}", &prompt_type.template)
                    .replace("{model}", &self.model)
            })
            .collect()
    }

    /// Poll the child until it exits or the deadline passes
    fn wait_with_deadline(&self, child: &mut Child) -> Result<std::process::ExitStatus, InferenceError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if Instant::now() >= deadline => {
                    if let Err(e) = child.kill() {
                        warn!(error = %e, "Failed to kill timed-out inference process");
                    }
                    let _ = child.wait();
                    return Err(InferenceError::Timeout(self.timeout));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(InferenceError::ModelError(format!(
                        "Failed to wait for {}: {}",
                        self.program, e
                    )))
                }
            }
        }
    }
}

impl InferenceEngine for CommandInferenceEngine {
    fn infer(&self, image_path: &Path, prompt_type: &PromptType) -> Result<String, InferenceError> {
        if !image_path.is_file() {
            return Err(InferenceError::InvalidInput(format!(
                "Image not found: {}",
                image_path.display()
            )));
        }

        let args = self.expand_args(image_path, prompt_type);
        debug!(
            program = %self.program,
            image = %image_path.display(),
            prompt_type = %prompt_type.id,
            "Running inference command"
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                InferenceError::ModelError(format!("Failed to execute {}: {}", self.program, e))
            })?;

        // Drain pipes while waiting
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let status = self.wait_with_deadline(&mut child)?;
        let stdout = stdout.map(join_reader).unwrap_or_default();
        let stderr = stderr.map(join_reader).unwrap_or_default();

        if !status.success() {
            let detail = stderr.trim();
            return Err(InferenceError::ModelError(if detail.is_empty() {
                format!("{} exited with {}", self.program, status)
            } else {
                detail.to_string()
            }));
        }

        Ok(stdout)
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
