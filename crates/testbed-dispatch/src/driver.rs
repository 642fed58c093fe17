//! Subprocess Driver.
//!
//! Runs one local command and captures both output streams without ever
//! blocking on a full pipe. Each stream gets its own reader task, started
//! before the control path waits on the child, and both forward tagged lines
//! over an unbounded channel so neither stream can back-pressure the other.
//!
//! The child is placed in its own process group. On timeout, or when the
//! driver future is dropped mid-run, the whole group is killed so that
//! helpers spawned through `sh -c` do not outlive the assignment.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{DriverError, DriverResult};

/// How long readers may keep going after the process has exited.
pub const DEFAULT_READER_GRACE: Duration = Duration::from_secs(2);

/// A command to run locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// `None` runs without a deadline
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    /// `sh -c <script>`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// One line of output tagged with its origin stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedLine {
    pub stream: StreamKind,
    pub line: String,
}

/// A stream that could not be read to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderFailure {
    pub stream: StreamKind,
    pub message: String,
}

impl ReaderFailure {
    fn new(stream: StreamKind, message: impl Into<String>) -> Self {
        Self {
            stream,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ReaderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.stream.as_str(), self.message)
    }
}

/// Everything captured from one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverOutput {
    /// Exit code; `None` if the process was killed by a signal or timed out
    pub exit_status: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Both streams interleaved in arrival order
    pub lines: Vec<TaggedLine>,
    pub elapsed: Duration,
    pub reader_failures: Vec<ReaderFailure>,
    /// Streams still held open by a leftover child after the reader grace;
    /// their tail is missing but nothing failed to read
    pub lingering: Vec<StreamKind>,
}

impl DriverOutput {
    /// True when output was lost, either to a failed read or to a stream
    /// cut off after the grace.
    pub fn degraded(&self) -> bool {
        !self.reader_failures.is_empty() || !self.lingering.is_empty()
    }

    fn push(&mut self, line: TaggedLine, live: Option<&UnboundedSender<TaggedLine>>) {
        if let Some(live) = live {
            let _ = live.send(line.clone());
        }
        match line.stream {
            StreamKind::Stdout => self.stdout.push(line.line.clone()),
            StreamKind::Stderr => self.stderr.push(line.line.clone()),
        }
        self.lines.push(line);
    }
}

/// Local process runner.
#[derive(Debug, Clone)]
pub struct Driver {
    reader_grace: Duration,
}

impl Default for Driver {
    fn default() -> Self {
        Self {
            reader_grace: DEFAULT_READER_GRACE,
        }
    }
}

impl Driver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound on how long output may keep arriving after the process exits,
    /// e.g. from a background child that inherited the pipes.
    pub fn with_reader_grace(mut self, grace: Duration) -> Self {
        self.reader_grace = grace;
        self
    }

    pub async fn run(&self, spec: &CommandSpec) -> DriverResult<DriverOutput> {
        self.run_with_sink(spec, None).await
    }

    /// Run `spec`, forwarding every line to `live` as it arrives.
    pub async fn run_with_sink(
        &self,
        spec: &CommandSpec,
        live: Option<UnboundedSender<TaggedLine>>,
    ) -> DriverResult<DriverOutput> {
        let started = Instant::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| DriverError::Launch {
            program: spec.program.clone(),
            source,
        })?;
        let mut group = ProcessGroup::new(child.id());
        debug!(program = %spec.program, pid = ?child.id(), "process started");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut output = DriverOutput::default();
        let mut readers = Vec::with_capacity(2);
        match child.stdout.take() {
            Some(pipe) => readers.push(spawn_reader(StreamKind::Stdout, pipe, tx.clone())),
            None => output
                .reader_failures
                .push(ReaderFailure::new(StreamKind::Stdout, "stream not captured")),
        }
        match child.stderr.take() {
            Some(pipe) => readers.push(spawn_reader(StreamKind::Stderr, pipe, tx.clone())),
            None => output
                .reader_failures
                .push(ReaderFailure::new(StreamKind::Stderr, "stream not captured")),
        }
        drop(tx);

        let deadline = spec.timeout.map(|t| started + t);
        let waited = {
            let wait = child.wait();
            tokio::pin!(wait);
            let timer = sleep_until(deadline);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    Some(line) = rx.recv() => output.push(line, live.as_ref()),
                    status = &mut wait => break Some(status),
                    _ = &mut timer => break None,
                }
            }
        };

        let status = match waited {
            Some(Ok(status)) => status,
            Some(Err(source)) => {
                group.kill();
                return Err(DriverError::Wait {
                    program: spec.program.clone(),
                    source,
                });
            }
            None => {
                group.kill();
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "child already gone");
                }
                self.finish_readers(&mut group, readers, &mut rx, &mut output, live.as_ref())
                    .await;
                output.elapsed = started.elapsed();
                let timeout = spec.timeout.unwrap_or_default();
                warn!(program = %spec.program, timeout_ms = timeout.as_millis() as u64, "process timed out");
                return Err(DriverError::TimeoutExceeded {
                    timeout,
                    output: Box::new(output),
                });
            }
        };

        self.finish_readers(&mut group, readers, &mut rx, &mut output, live.as_ref())
            .await;
        group.disarm();
        output.exit_status = status.code();
        output.elapsed = started.elapsed();
        debug!(
            program = %spec.program,
            exit_status = ?output.exit_status,
            lines = output.lines.len(),
            "process finished"
        );
        Ok(output)
    }

    /// Drain the channel until both readers hit EOF or the grace runs out.
    /// Readers still running after the grace are aborted and their streams
    /// recorded as lingering; whatever they had already sent is kept.
    async fn finish_readers(
        &self,
        group: &mut ProcessGroup,
        readers: Vec<(StreamKind, JoinHandle<Result<(), ReaderFailure>>)>,
        rx: &mut UnboundedReceiver<TaggedLine>,
        output: &mut DriverOutput,
        live: Option<&UnboundedSender<TaggedLine>>,
    ) {
        let grace_deadline = Instant::now() + self.reader_grace;
        let mut lingering = false;
        loop {
            match tokio::time::timeout_at(grace_deadline, rx.recv()).await {
                Ok(Some(line)) => output.push(line, live),
                Ok(None) => break,
                Err(_) => {
                    lingering = true;
                    break;
                }
            }
        }

        if lingering {
            // Something in the group still holds a pipe open.
            group.kill();
            for (_, handle) in &readers {
                handle.abort();
            }
        }

        for (stream, handle) in readers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => {
                    warn!(failure = %failure, "output stream lost");
                    output.reader_failures.push(failure);
                }
                Err(e) if e.is_cancelled() => {
                    warn!(stream = stream.as_str(), "stream still open after the process exited");
                    output.lingering.push(stream);
                }
                Err(e) => output
                    .reader_failures
                    .push(ReaderFailure::new(stream, e.to_string())),
            }
        }
        while let Ok(line) = rx.try_recv() {
            output.push(line, live);
        }
    }
}

fn spawn_reader<R>(
    stream: StreamKind,
    pipe: R,
    tx: UnboundedSender<TaggedLine>,
) -> (StreamKind, JoinHandle<Result<(), ReaderFailure>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => return Ok(()),
                Ok(_) => {
                    let line = String::from_utf8_lossy(strip_newline(&buf)).into_owned();
                    if tx.send(TaggedLine { stream, line }).is_err() {
                        return Ok(());
                    }
                }
                Err(e) => return Err(ReaderFailure::new(stream, e.to_string())),
            }
        }
    });
    (stream, handle)
}

fn strip_newline(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Kills the child's process group when dropped while still armed.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            signal_group(pgid);
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(pgid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        debug!(pgid, error = %e, "process group already gone");
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32) {}
