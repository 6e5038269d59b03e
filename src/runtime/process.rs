//! Subprocess service: spawn a command, feed stdin, collect both streams,
//! wait for exit. Non-zero exit is a fatal build failure carrying the
//! quoted command line and stderr.

use crate::errors::{BuildError, SharedError, SharedResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

/// A command list plus optional stdin bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    /// Shell-quoted rendering for error messages and witness hashing.
    pub fn render(&self) -> String {
        let mut parts = vec![quote(&self.program)];
        parts.extend(self.args.iter().map(|a| quote(a)));
        parts.join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn quote(arg: &str) -> String {
    if arg.is_empty() || arg.contains([' ', '"', '\'', '\\']) {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Collected result of a completed subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command: String,
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// True when the subprocess produced no output on either stream.
    pub fn is_silent(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

impl super::TaskRuntime {
    /// Spawn the command and collect its output. Runs concurrently with
    /// other tasks, bounded by the subprocess semaphore (one permit in
    /// sequential mode). On interrupt the child is killed and the call
    /// completes with the interrupt error.
    pub async fn run_command(&self, spec: &CommandSpec) -> SharedResult<CommandOutput> {
        let permit = tokio::select! {
            permit = self.procs.acquire() => {
                permit.map_err(|_| SharedError::from(BuildError::Shutdown))?
            }
            err = self.interrupt.triggered() => return Err(err),
        };
        let _permit = permit;
        self.interrupt.check()?;

        tracing::debug!(command = %spec, "spawning subprocess");

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| {
            SharedError::from(BuildError::SpawnFailed {
                command: spec.render(),
                source,
            })
        })?;

        if let Some(bytes) = &spec.stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin.write_all(bytes).await.map_err(|source| {
                SharedError::from(BuildError::Io {
                    path: spec.program.clone(),
                    source,
                })
            })?;
            // Dropping the handle closes the pipe.
        }

        let output = tokio::select! {
            out = child.wait_with_output() => out.map_err(|source| {
                SharedError::from(BuildError::Io {
                    path: spec.program.clone(),
                    source,
                })
            })?,
            // Dropping the in-flight child kills it (kill_on_drop).
            err = self.interrupt.triggered() => return Err(err),
        };

        let code = output.status.code().unwrap_or(-1);
        let collected = CommandOutput {
            command: spec.render(),
            code,
            stdout: output.stdout,
            stderr: output.stderr,
        };

        if code != 0 {
            let stderr = collected.stderr_text();
            return Err(SharedError::from(BuildError::CommandFailed {
                command: collected.command,
                code,
                stderr,
            }));
        }
        Ok(collected)
    }
}
