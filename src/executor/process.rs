//! Child-process executor
//!
//! Each work item is a program. It is spawned with the run options in its
//! environment and must write its events to stdout as NDJSON, the format
//! [`crate::output::NdjsonSink`] produces. Anything else it prints is kept
//! as console passthrough.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::error::ExecutorError;
use super::worker::{Executor, StreamTally};
use crate::config::EnvBuilder;
use crate::models::{Event, StreamChannel, WorkItem};
use crate::output::EventSink;

/// Runs work items as child processes
#[derive(Clone, Debug, Default)]
pub struct ProcessExecutor {
    env: Vec<(String, String)>,
    args: Vec<String>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables set on every child
    pub fn with_env(mut self, env: EnvBuilder) -> Self {
        self.env.extend(env.into_vars());
        self
    }

    /// Arguments passed to every child after the program path
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, program: &str) -> Command {
        let mut command = Command::new(program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl Executor for ProcessExecutor {
    fn execute(&self, item: WorkItem, sink: Arc<dyn EventSink>) -> BoxFuture<'static, ()> {
        let command = self.command(&item.reference);

        async move {
            let mut stream = ChildStream::new(&item.reference, sink);
            let error = match stream.run(command).await {
                Ok(status) if stream.tally.is_closed() => {
                    debug!("{}: {} exited with {}", item.id, item.reference, status);
                    return;
                }
                Ok(status) => ExecutorError::Incomplete {
                    program: item.reference.clone(),
                    status: status.to_string(),
                },
                Err(error) => error,
            };

            warn!("{}: {}", item.id, error);
            for event in stream.tally.finish(&error) {
                stream.sink.report(event);
            }
        }
        .boxed()
    }
}

/// Output of one child, parsed and forwarded as it arrives
struct ChildStream {
    program: String,
    sink: Arc<dyn EventSink>,
    tally: StreamTally,
}

impl ChildStream {
    fn new(program: &str, sink: Arc<dyn EventSink>) -> Self {
        Self {
            program: program.to_string(),
            sink,
            tally: StreamTally::new(program),
        }
    }

    async fn run(&mut self, mut command: Command) -> Result<ExitStatus, ExecutorError> {
        let spawn_error = |source| ExecutorError::Spawn {
            program: self.program.clone(),
            source,
        };
        let mut child = command.spawn().map_err(spawn_error)?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ExecutorError::Spawn {
                program: self.program.clone(),
                source: std::io::Error::other("child output was not captured"),
            });
        };

        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let (mut stdout_open, mut stderr_open) = (true, true);

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => self.stdout_line(line),
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!("Failed to read stdout of {}: {}", self.program, e);
                        stdout_open = false;
                    }
                },
                line = stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => self.passthrough(StreamChannel::Stderr, line),
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        warn!("Failed to read stderr of {}: {}", self.program, e);
                        stderr_open = false;
                    }
                },
            }
        }

        child.wait().await.map_err(|source| ExecutorError::Spawn {
            program: self.program.clone(),
            source,
        })
    }

    fn stdout_line(&mut self, line: String) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if !trimmed.starts_with('{') {
            self.passthrough(StreamChannel::Stdout, line);
            return;
        }

        match serde_json::from_str::<Event>(trimmed) {
            Ok(event) => self.forward(event),
            Err(e) => {
                warn!("Malformed event from {}: {}", self.program, e);
                self.passthrough(StreamChannel::Stdout, line);
            }
        }
    }

    fn passthrough(&mut self, channel: StreamChannel, text: String) {
        let event = Event::stream(self.tally.current_scope(), channel, text);
        self.forward(event);
    }

    fn forward(&mut self, event: Event) {
        // The stream ends with the root scope-exit.
        if self.tally.is_closed() {
            debug!("Dropping {} output after its root closed", self.program);
            return;
        }
        self.tally.observe(&event);
        self.sink.report(event);
    }
}
