//! Judge and bot processes, seen as line-oriented endpoints.
//!
//! A [`ProcessHandle`] owns the child process plus two threads: one writing queued lines to
//! its stdin, one turning its stdout into a stream of lines. Reads and writes can therefore
//! give up after a deadline or when the run's [`CancelToken`] fires, instead of blocking the
//! worker forever on a process that stopped talking or stopped listening.
//!
//! Every child leads its own process group. [`ProcessHandle::stop`] (or, failing that, drop)
//! kills the whole group, so pipes inherited by its descendants are closed too and both
//! threads end.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Write},
    os::unix::process::CommandExt,
    path::Path,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tracing::{debug, instrument, trace, warn};

use crate::error::RefereeError;

/// How often a blocked read or write re-checks its cancellation token.
const POLL_SLICE: Duration = Duration::from_millis(20);

/// Something the relay can exchange lines with.
pub trait LineEndpoint {
    /// Name used in errors and logs.
    fn name(&self) -> &str;

    /// Send `text` followed by a single newline, flushing immediately.
    ///
    /// Trailing whitespace of `text` is dropped.
    fn write_line(&mut self, text: &str) -> Result<(), RefereeError>;

    /// Block until one full line is available and return it without its line terminator.
    fn read_line(&mut self) -> Result<String, RefereeError>;
}

/// Shared flag force-failing every pending and future exchange of one run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) was called on any clone of this token.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One running judge or bot.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    child: Option<Child>,
    stdin: Option<LineWriter>,
    lines: Option<Receiver<io::Result<String>>>,
    timeout: Option<Duration>,
    cancel: CancelToken,
}

/// Sending side of the stdin writer thread, with its acknowledgements.
#[derive(Debug)]
struct LineWriter {
    lines: Sender<String>,
    written: Receiver<io::Result<()>>,
}

enum Waited<T> {
    Ready(T),
    Closed,
}

impl ProcessHandle {
    /// Spawn `executable` with piped stdin and stdout.
    ///
    /// stderr is written to `stderr_file` when given, discarded otherwise. The child is
    /// started in a new process group.
    #[instrument(skip(arguments))]
    pub fn start(
        name: &str,
        executable: &Path,
        arguments: &[String],
        stderr_file: Option<&Path>,
    ) -> Result<ProcessHandle, RefereeError> {
        let launch_error = |source: io::Error| RefereeError::Launch {
            entity: name.to_string(),
            source,
        };

        let stderr = match stderr_file {
            Some(path) => Stdio::from(File::create(path).map_err(launch_error)?),
            None => Stdio::null(),
        };

        let mut child = Command::new(executable)
            .args(arguments)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(launch_error)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(launch_error(io::Error::other("child pipes were not created")));
        };

        let pipes = spawn_line_writer(name, stdin)
            .and_then(|stdin| Ok((stdin, spawn_line_reader(name, stdout)?)));
        let (stdin, lines) = match pipes {
            Ok(pipes) => pipes,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(launch_error(e));
            }
        };
        debug!(pid = child.id(), "process started");

        Ok(ProcessHandle {
            name: name.to_string(),
            child: Some(child),
            stdin: Some(stdin),
            lines: Some(lines),
            timeout: None,
            cancel: CancelToken::new(),
        })
    }

    /// Fail reads and writes that wait longer than `timeout`. `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Abort reads and writes as soon as `token` fires.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// OS process id, `None` once stopped.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// False once [`stop`](Self::stop) ran.
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Kill the process group and release the pipes. Calling it again does nothing.
    pub fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        drop(self.stdin.take());
        self.lines = None;

        // the leader is not reaped yet, so its pid still names the group
        let group = Pid::from_raw(child.id() as i32);
        if let Err(e) = killpg(group, Signal::SIGKILL) {
            trace!(name = %self.name, "could not kill process group: {e}");
            if let Err(e) = child.kill() {
                warn!(name = %self.name, "could not kill process: {e}");
            }
        }
        match child.wait() {
            Ok(status) => trace!(name = %self.name, %status, "process stopped"),
            Err(e) => warn!(name = %self.name, "could not reap process: {e}"),
        }
    }

    /// Wait on `rx` until it yields, honouring the deadline and the cancellation token.
    fn wait_for<T>(&self, rx: &Receiver<T>) -> Result<Waited<T>, RefereeError> {
        let deadline = self.timeout.map(|t| (Instant::now() + t, t));

        loop {
            if self.cancel.is_cancelled() {
                return Err(RefereeError::Cancelled {
                    entity: self.name.clone(),
                });
            }

            let wait = match deadline {
                Some((at, after)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(RefereeError::Timeout {
                            entity: self.name.clone(),
                            after,
                        });
                    }
                    (at - now).min(POLL_SLICE)
                }
                None => POLL_SLICE,
            };

            match rx.recv_timeout(wait) {
                Ok(value) => return Ok(Waited::Ready(value)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(Waited::Closed),
            }
        }
    }
}

impl LineEndpoint for ProcessHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_line(&mut self, text: &str) -> Result<(), RefereeError> {
        let broken_pipe = |entity: &str, source: io::Error| RefereeError::BrokenPipe {
            entity: entity.to_string(),
            source,
        };
        let Some(stdin) = self.stdin.as_ref() else {
            return Err(broken_pipe(
                &self.name,
                io::Error::new(io::ErrorKind::BrokenPipe, "process was stopped"),
            ));
        };

        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text.trim_end());
        line.push('\n');

        if stdin.lines.send(line).is_err() {
            return Err(broken_pipe(
                &self.name,
                io::Error::new(io::ErrorKind::BrokenPipe, "input closed"),
            ));
        }
        match self.wait_for(&stdin.written)? {
            Waited::Ready(Ok(())) => Ok(()),
            Waited::Ready(Err(source)) => Err(broken_pipe(&self.name, source)),
            Waited::Closed => Err(broken_pipe(
                &self.name,
                io::Error::new(io::ErrorKind::BrokenPipe, "input closed"),
            )),
        }
    }

    fn read_line(&mut self) -> Result<String, RefereeError> {
        let Some(lines) = self.lines.as_ref() else {
            return Err(RefereeError::protocol(&self.name, "process was stopped"));
        };

        match self.wait_for(lines)? {
            Waited::Ready(Ok(line)) => Ok(line.trim_end_matches(['\n', '\r']).to_string()),
            Waited::Ready(Err(e)) => Err(RefereeError::protocol(
                &self.name,
                format!("unreadable output: {e}"),
            )),
            Waited::Closed => Err(RefereeError::protocol(
                &self.name,
                "output closed before a full line was read",
            )),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Write every queued line to stdin, acknowledging each one, until the queue or the pipe
/// closes.
fn spawn_line_writer(name: &str, mut stdin: ChildStdin) -> io::Result<LineWriter> {
    let (tx_line, rx_line) = mpsc::channel::<String>();
    let (tx_written, rx_written) = mpsc::channel();
    thread::Builder::new()
        .name(format!("{name}-stdin"))
        .spawn(move || {
            for line in rx_line {
                let written = stdin
                    .write_all(line.as_bytes())
                    .and_then(|_| stdin.flush());
                let failed = written.is_err();
                if tx_written.send(written).is_err() || failed {
                    break;
                }
            }
        })?;
    Ok(LineWriter {
        lines: tx_line,
        written: rx_written,
    })
}

/// Forward every stdout line to a channel until the stream closes.
fn spawn_line_reader(name: &str, stdout: ChildStdout) -> io::Result<Receiver<io::Result<String>>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("{name}-stdout"))
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}
