//! Process bridge to the external exporter.
//!
//! Every exporter call is a child process. [`ProcessBridge::invoke`] buffers
//! its output; [`ProcessBridge::invoke_streaming`] forwards output chunks on a
//! channel as the pipes yield them, so callers can track progress while the
//! export runs.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ExporterConfig;
use crate::error::{Error, Result};

const READ_BUFFER_SIZE: usize = 4096;

/// Buffered result of a successful exporter call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Runs exporter commands.
///
/// Implementations must fail with [`Error::ExecutableNotFound`] when the
/// exporter cannot be started and with [`Error::CommandFailed`] on a non-zero
/// exit.
#[async_trait]
pub trait ProcessBridge: Send + Sync {
    /// Run to completion and capture stdout and stderr.
    async fn invoke(&self, args: &[String]) -> Result<CommandOutput>;

    /// Run to completion, sending every output chunk on `chunks` as it
    /// arrives. Returns the accumulated output. Cancelling `cancel` kills the
    /// process and fails with [`Error::Cancelled`].
    async fn invoke_streaming(
        &self,
        args: &[String],
        chunks: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<String>;
}

/// Argv for listing mailboxes. Also serves as the connectivity probe.
pub fn list_args() -> Vec<String> {
    vec!["list".to_string()]
}

/// Argv for counting the messages of one mailbox.
pub fn count_args(mailbox: &str) -> Vec<String> {
    vec!["count".to_string(), mailbox.to_string()]
}

/// Argv for the interactive OAuth2 setup.
pub fn setup_args() -> Vec<String> {
    vec!["setup".to_string()]
}

/// Bridge that runs the real exporter, usually `python3 muttpu.py`.
#[derive(Debug, Clone)]
pub struct ExporterBridge {
    program: String,
    script: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ExporterBridge {
    pub fn new(
        program: impl Into<String>,
        script: Option<PathBuf>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            program: program.into(),
            script,
            timeout,
        }
    }

    pub fn from_config(config: &ExporterConfig) -> Result<Self> {
        Ok(Self::new(
            config.program.clone(),
            config.script_path()?,
            config.timeout(),
        ))
    }

    fn command(&self, args: &[String]) -> Result<Command> {
        let program = which::which(&self.program)
            .map_err(|_| Error::ExecutableNotFound(self.program.clone()))?;
        let mut cmd = Command::new(program);
        if let Some(script) = &self.script {
            if !script.is_file() {
                return Err(Error::ExecutableNotFound(script.display().to_string()));
            }
            cmd.arg(script);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("exporter: {} {:?}", self.program, args);
        Ok(cmd)
    }

    fn spawn(&self, args: &[String]) -> Result<Child> {
        let mut cmd = self.command(args)?;
        cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Error::ExecutableNotFound(format!("{}: {e}", self.program))
            }
            _ => Error::Io(e),
        })
    }

    fn timed_out(&self) -> Error {
        Error::Timeout(self.timeout.unwrap_or_default())
    }
}

#[async_trait]
impl ProcessBridge for ExporterBridge {
    async fn invoke(&self, args: &[String]) -> Result<CommandOutput> {
        let child = self.spawn(args)?;
        let pending = child.wait_with_output();
        // Dropping the future on timeout drops the child, which kills it.
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| self.timed_out())??,
            None => pending.await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            return Err(Error::CommandFailed {
                exit_code,
                stdout,
                stderr,
            });
        }
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn invoke_streaming(
        &self,
        args: &[String],
        chunks: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<String> {
        let mut child = self.spawn(args)?;
        let mut stdout = take_pipe(child.stdout.take(), "stdout")?;
        let mut stderr = take_pipe(child.stderr.take(), "stderr")?;

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        let mut combined = String::new();
        let mut out_text = String::new();
        let mut err_text = String::new();
        let mut out_buf = [0u8; READ_BUFFER_SIZE];
        let mut err_buf = [0u8; READ_BUFFER_SIZE];
        let (mut out_open, mut err_open) = (true, true);
        let mut out_utf8 = Utf8Decoder::default();
        let mut err_utf8 = Utf8Decoder::default();

        let mut forward = |chunk: String, sink: &mut String| {
            if chunk.is_empty() {
                return;
            }
            sink.push_str(&chunk);
            combined.push_str(&chunk);
            // The receiver may have stopped listening; the buffer still counts.
            let _ = chunks.send(chunk);
        };

        while out_open || err_open {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(Error::Cancelled);
                }
                _ = &mut expired => {
                    let _ = child.kill().await;
                    return Err(self.timed_out());
                }
                read = stdout.read(&mut out_buf), if out_open => match read? {
                    0 => {
                        out_open = false;
                        forward(out_utf8.finish(), &mut out_text);
                    }
                    n => forward(out_utf8.decode(&out_buf[..n]), &mut out_text),
                },
                read = stderr.read(&mut err_buf), if err_open => match read? {
                    0 => {
                        err_open = false;
                        forward(err_utf8.finish(), &mut err_text);
                    }
                    n => forward(err_utf8.decode(&err_buf[..n]), &mut err_text),
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(Error::Cancelled);
            }
            _ = &mut expired => {
                let _ = child.kill().await;
                return Err(self.timed_out());
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            return Err(Error::CommandFailed {
                exit_code: status.code().unwrap_or(-1),
                stdout: out_text,
                stderr: err_text,
            });
        }
        Ok(combined)
    }
}

/// Decodes a byte stream read in arbitrary pieces.
///
/// A UTF-8 sequence cut off at the end of a read is held back until the next
/// read completes it.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    match err.error_len() {
                        // Incomplete sequence at the end; wait for more bytes.
                        None => {
                            text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                            self.pending.drain(..valid);
                            return text;
                        }
                        Some(bad) => {
                            let end = valid + bad;
                            text.push_str(&String::from_utf8_lossy(&self.pending[..end]));
                            self.pending.drain(..end);
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left once the stream has ended.
    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

fn take_pipe<T: AsyncRead + Unpin>(pipe: Option<T>, name: &str) -> Result<T> {
    pipe.ok_or_else(|| Error::Io(std::io::Error::other(format!("{name} was not captured"))))
}
