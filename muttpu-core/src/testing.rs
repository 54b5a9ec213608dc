//! Scripted collaborators for orchestrator tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::bridge::{CommandOutput, ProcessBridge};
use crate::error::{Error, Result};
use crate::settings::SettingsStore;
use crate::types::AppSettings;

/// What the fake exporter does for one call.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Exit 0 after printing these chunks.
    Output(Vec<String>),
    /// Exit 0 after printing to both streams.
    Streams { stdout: String, stderr: String },
    /// Exit non-zero after printing `output`.
    Fail { exit_code: i32, output: String },
    /// Wait for [`FakeBridge::release`] (or cancellation), then run the inner reply.
    Gated(Box<Reply>),
    /// Like `Gated`, but ignores cancellation.
    Stubborn(Box<Reply>),
}

impl Reply {
    pub fn ok(text: &str) -> Self {
        Reply::Output(vec![text.to_string()])
    }

    pub fn chunks(chunks: &[&str]) -> Self {
        Reply::Output(chunks.iter().map(|c| c.to_string()).collect())
    }

    pub fn streams(stdout: &str, stderr: &str) -> Self {
        Reply::Streams {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    pub fn fail(output: &str) -> Self {
        Reply::Fail {
            exit_code: 1,
            output: output.to_string(),
        }
    }

    pub fn gated(self) -> Self {
        Reply::Gated(Box::new(self))
    }

    pub fn stubborn(self) -> Self {
        Reply::Stubborn(Box::new(self))
    }
}

struct Rule {
    prefix: Vec<String>,
    replies: VecDeque<Reply>,
}

/// Bridge answering from scripted rules matched by argv prefix.
///
/// Each rule replays its replies in order and repeats the last one. Calls
/// with no matching rule fail with `ExecutableNotFound`.
pub struct FakeBridge {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Vec<String>>>,
    gate: Arc<Semaphore>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn on(self, prefix: &[&str], replies: Vec<Reply>) -> Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            replies: replies.into(),
        });
        self
    }

    /// Let `n` gated calls proceed.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, command: &str) -> usize {
        self.calls()
            .iter()
            .filter(|args| args.first().map(String::as_str) == Some(command))
            .count()
    }

    fn next_reply(&self, args: &[String]) -> Option<Reply> {
        self.calls.lock().unwrap().push(args.to_vec());
        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .find(|rule| args.starts_with(&rule.prefix))?;
        if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            rule.replies.front().cloned()
        }
    }

    async fn settle(&self, mut reply: Reply, cancel: &CancellationToken) -> Result<Reply> {
        loop {
            reply = match reply {
                Reply::Gated(inner) => {
                    tokio::select! {
                        permit = self.gate.acquire() => {
                            permit.map_err(|_| Error::Closed)?.forget();
                        }
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                    *inner
                }
                Reply::Stubborn(inner) => {
                    self.gate.acquire().await.map_err(|_| Error::Closed)?.forget();
                    *inner
                }
                done => return Ok(done),
            };
        }
    }
}

#[async_trait]
impl ProcessBridge for FakeBridge {
    async fn invoke(&self, args: &[String]) -> Result<CommandOutput> {
        let reply = self
            .next_reply(args)
            .ok_or_else(|| Error::ExecutableNotFound("fake exporter".into()))?;
        match self.settle(reply, &CancellationToken::new()).await? {
            Reply::Output(chunks) => Ok(CommandOutput {
                stdout: chunks.concat(),
                ..Default::default()
            }),
            Reply::Streams { stdout, stderr } => Ok(CommandOutput {
                stdout,
                stderr,
                exit_code: 0,
            }),
            Reply::Fail { exit_code, output } => Err(Error::CommandFailed {
                exit_code,
                stdout: output,
                stderr: String::new(),
            }),
            _ => unreachable!("settle resolves gates"),
        }
    }

    async fn invoke_streaming(
        &self,
        args: &[String],
        chunks: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<String> {
        let reply = self
            .next_reply(args)
            .ok_or_else(|| Error::ExecutableNotFound("fake exporter".into()))?;
        match self.settle(reply, &cancel).await? {
            Reply::Output(parts) => {
                for part in &parts {
                    let _ = chunks.send(part.clone());
                    tokio::task::yield_now().await;
                }
                Ok(parts.concat())
            }
            Reply::Streams { stdout, stderr } => {
                let _ = chunks.send(stdout.clone());
                let _ = chunks.send(stderr.clone());
                Ok(stdout + &stderr)
            }
            Reply::Fail { exit_code, output } => {
                let _ = chunks.send(output.clone());
                Err(Error::CommandFailed {
                    exit_code,
                    stdout: output,
                    stderr: String::new(),
                })
            }
            _ => unreachable!("settle resolves gates"),
        }
    }
}

/// Settings kept in memory; optionally refuses to save.
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Option<AppSettings>>,
    fail_saves: bool,
}

impl MemoryStore {
    pub fn with(settings: AppSettings) -> Self {
        Self {
            saved: Mutex::new(Some(settings)),
            fail_saves: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Default::default()
        }
    }

    pub fn saved(&self) -> Option<AppSettings> {
        self.saved.lock().unwrap().clone()
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<Option<AppSettings>> {
        Ok(self.saved())
    }

    fn save(&self, settings: &AppSettings) -> Result<()> {
        if self.fail_saves {
            return Err(Error::Settings("disk full".into()));
        }
        *self.saved.lock().unwrap() = Some(settings.clone());
        Ok(())
    }
}
