//! Command execution: the seam between jobs and the host shell.
//!
//! Jobs carry a fully-assembled [`CommandSpec`]; a [`CommandRunner`] turns it
//! into a process. The production [`ShellRunner`] spawns `sh -c` with the
//! agent's environment extended by the spec's pairs and an optional secret
//! payload piped to stdin (mount passphrases). Tests inject their own runner.

use std::process::Stdio;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ExecutionError;

/// Maximum bytes of stdout/stderr retained per invocation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Maximum stderr length quoted inside an error message.
const MAX_ERROR_EXCERPT: usize = 512;

/// One fully-assembled external invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    command: String,
    env: Vec<(String, String)>,
    stdin: Option<SecretString>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: Vec::new(),
            stdin: None,
        }
    }

    /// Append one environment variable to the inherited environment.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Append several environment variables at once.
    pub fn with_env_pairs(mut self, pairs: Vec<(String, String)>) -> Self {
        self.env.extend(pairs);
        self
    }

    /// Pipe a secret payload to the process's stdin.
    pub fn with_stdin(mut self, payload: SecretString) -> Self {
        self.stdin = Some(payload);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn has_stdin(&self) -> bool {
        self.stdin.is_some()
    }
}

/// Captured outcome of one runner invocation.
///
/// A non-zero exit is an `Ok` capture with `status != 0`; only a failure to
/// start the process at all is an `Err` at the runner level.
#[derive(Debug, Clone)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Error view of a failed invocation, with a stderr excerpt attached.
    pub fn to_error(&self) -> ExecutionError {
        ExecutionError::CommandFailed {
            status: self.status,
            stderr: excerpt(&self.stderr),
        }
    }
}

/// Executes external processes for the job registry.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one command to completion, capturing stdout, stderr, and exit
    /// status.
    async fn run(&self, spec: &CommandSpec) -> Result<Captured, ExecutionError>;
}

/// Production runner: `sh -c <command>`.
///
/// No timeout is applied; a hung process keeps its job open indefinitely.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<Captured, ExecutionError> {
        let mut command = Command::new("sh");
        command
            .args(["-c", spec.command()])
            .envs(spec.env().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| ExecutionError::Spawn {
            reason: e.to_string(),
        })?;

        if let Some(payload) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(payload.expose_secret().as_bytes())
                    .await
                    .map_err(|e| ExecutionError::Spawn {
                        reason: format!("failed to write stdin: {e}"),
                    })?;
                // Dropping the handle closes the pipe.
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecutionError::Spawn {
                reason: e.to_string(),
            })?;

        Ok(Captured {
            stdout: truncate_output(&String::from_utf8_lossy(&output.stdout)),
            stderr: truncate_output(&String::from_utf8_lossy(&output.stderr)),
            status: output.status.code().unwrap_or(-1),
        })
    }
}

/// Truncate output to fit within limits, keeping head and tail.
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let head = floor_char_boundary(s, MAX_OUTPUT_SIZE / 2);
    let tail = ceil_char_boundary(s, s.len() - MAX_OUTPUT_SIZE / 2);
    format!(
        "{}\n\n... [truncated {} bytes] ...\n\n{}",
        &s[..head],
        s.len() - MAX_OUTPUT_SIZE,
        &s[tail..]
    )
}

/// Truncate stderr for error messages, on a char boundary.
fn excerpt(s: &str) -> String {
    let s = s.trim_end();
    if s.chars().count() <= MAX_ERROR_EXCERPT {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(MAX_ERROR_EXCERPT).collect::<String>())
    }
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
