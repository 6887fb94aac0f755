use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// an external tool as configured by the user: the program plus its argument
// template. placeholders like {domain} are expanded when the command is built.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ToolSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn command(&self, vars: &[(&str, &str)]) -> ToolCommand {
        ToolCommand::new(&self.program).args(
            self.args
                .iter()
                .map(|arg| expand_placeholders(arg, vars))
                .collect::<Vec<_>>(),
        )
    }
}

// only exact `{name}` tokens are replaced, so curl write-out formats such as
// `%{http_code}` pass through untouched.
pub fn expand_placeholders(arg: &str, vars: &[(&str, &str)]) -> String {
    let mut out = arg.to_string();
    for (name, value) in vars {
        let token = format!("{{{name}}}");
        if out.contains(&token) {
            out = out.replace(&token, value);
        }
    }
    out
}

#[derive(Clone, Debug)]
pub enum StdinSource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<StdinSource>,
    pub timeout: Option<Duration>,
}

impl ToolCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, source: StdinSource) -> Self {
        self.stdin = Some(source);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            return self.program.clone();
        }
        format!("{} {}", self.program, self.args.join(" "))
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", after.as_secs())]
    TimedOut { program: String, after: Duration },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("failed to feed stdin to {program}: {source}")]
    Stdin {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read output of {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    pub fn is_launch(&self) -> bool {
        matches!(self, CommandError::Launch { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CommandError::Cancelled { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolExit {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl ToolExit {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "termination by signal".to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessEntry {
    pub program: String,
    pub pid: Option<u32>,
}

#[derive(Debug)]
struct ProcessTableInner {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, ProcessEntry>>,
    count: watch::Sender<usize>,
}

// every running child is registered here for the lifetime of its invocation.
// children are spawned with kill_on_drop, so once the table is drained no
// tool launched through it is still running.
#[derive(Clone, Debug)]
pub struct ProcessTable {
    inner: Arc<ProcessTableInner>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(ProcessTableInner {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(HashMap::new()),
                count,
            }),
        }
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, program: &str, pid: Option<u32>) -> ProcessGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(
            id,
            ProcessEntry {
                program: program.to_string(),
                pid,
            },
        );
        self.inner.count.send_replace(entries.len());
        ProcessGuard {
            table: self.clone(),
            id,
        }
    }

    fn release(&self, id: u64) {
        let mut entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.remove(&id);
        self.inner.count.send_replace(entries.len());
    }

    pub fn active(&self) -> Vec<ProcessEntry> {
        let entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        *self.inner.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn drained(&self) {
        let mut rx = self.inner.count.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

#[derive(Debug)]
pub struct ProcessGuard {
    table: ProcessTable,
    id: u64,
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}

enum Interrupt {
    TimedOut,
    Cancelled,
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

// lazily yields the stdout lines of a running tool. the stream ends when the
// tool closes its stdout; `finish` then reaps the process.
#[derive(Debug)]
pub struct LineStream {
    program: String,
    child: Child,
    stdout: BufReader<ChildStdout>,
    buf: Vec<u8>,
    stderr: Option<JoinHandle<String>>,
    stdin: Option<JoinHandle<std::io::Result<()>>>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    _guard: ProcessGuard,
}

impl LineStream {
    pub async fn next_line(&mut self) -> Result<Option<String>, CommandError> {
        loop {
            self.buf.clear();
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
                _ = wait_deadline(self.deadline) => Err(Interrupt::TimedOut),
                read = self.stdout.read_until(b'\n', &mut self.buf) => Ok(read),
            };
            let read = match read {
                Ok(read) => read,
                Err(interrupt) => return Err(self.interrupt(interrupt).await),
            };
            let n = read.map_err(|e| CommandError::Io {
                program: self.program.clone(),
                source: e,
            })?;
            if n == 0 {
                return Ok(None);
            }
            let line = String::from_utf8_lossy(&self.buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(line.to_string()));
        }
    }

    // drains whatever output is left and waits for the tool to exit.
    pub async fn finish(mut self) -> Result<ToolExit, CommandError> {
        while self.next_line().await?.is_some() {}

        let waited: Result<std::io::Result<ExitStatus>, Interrupt> = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = wait_deadline(self.deadline) => Err(Interrupt::TimedOut),
            status = self.child.wait() => Ok(status),
        };
        let status = match waited {
            Ok(status) => status,
            Err(interrupt) => return Err(self.interrupt(interrupt).await),
        };
        let status = status.map_err(|e| CommandError::Io {
            program: self.program.clone(),
            source: e,
        })?;

        if let Some(stdin) = self.stdin.take() {
            match stdin.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(program = %self.program, "tool closed stdin before reading all input");
                }
                Ok(Err(e)) => {
                    return Err(CommandError::Stdin {
                        program: self.program.clone(),
                        source: e,
                    })
                }
                Err(e) => debug!(program = %self.program, "stdin feeder task failed: {e}"),
            }
        }

        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(ToolExit {
            exit_code: status.code(),
            stderr,
        })
    }

    async fn interrupt(&mut self, interrupt: Interrupt) -> CommandError {
        if let Err(e) = self.child.start_kill() {
            debug!(program = %self.program, "kill failed: {e}");
        }
        let _ = self.child.wait().await;
        match interrupt {
            Interrupt::Cancelled => CommandError::Cancelled {
                program: self.program.clone(),
            },
            Interrupt::TimedOut => CommandError::TimedOut {
                program: self.program.clone(),
                after: self.timeout.unwrap_or_default(),
            },
        }
    }
}

pub async fn run_streaming(
    cmd: &ToolCommand,
    processes: &ProcessTable,
    cancel: &CancellationToken,
) -> Result<LineStream, CommandError> {
    if cancel.is_cancelled() {
        return Err(CommandError::Cancelled {
            program: cmd.program.clone(),
        });
    }

    let stdin_bytes = match cmd.stdin.as_ref() {
        Some(StdinSource::Bytes(bytes)) => Some(bytes.clone()),
        Some(StdinSource::File(path)) => {
            Some(
                tokio::fs::read(path)
                    .await
                    .map_err(|e| CommandError::Stdin {
                        program: cmd.program.clone(),
                        source: e,
                    })?,
            )
        }
        None => None,
    };

    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdin(if stdin_bytes.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = %cmd.display(), "spawning tool");
    let mut child = command.spawn().map_err(|e| CommandError::Launch {
        program: cmd.program.clone(),
        source: e,
    })?;
    let guard = processes.register(&cmd.program, child.id());

    let stdin = match (stdin_bytes, child.stdin.take()) {
        (Some(bytes), Some(mut pipe)) => Some(tokio::spawn(async move {
            pipe.write_all(&bytes).await?;
            pipe.shutdown().await
        })),
        _ => None,
    };

    let stderr = child.stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut raw = Vec::new();
            let _ = pipe.read_to_end(&mut raw).await;
            String::from_utf8_lossy(&raw).trim().to_string()
        })
    });

    let stdout = child.stdout.take().ok_or_else(|| CommandError::Io {
        program: cmd.program.clone(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "stdout was not captured"),
    })?;

    Ok(LineStream {
        program: cmd.program.clone(),
        child,
        stdout: BufReader::new(stdout),
        buf: Vec::new(),
        stderr,
        stdin,
        timeout: cmd.timeout,
        deadline: cmd.timeout.map(|t| Instant::now() + t),
        cancel: cancel.clone(),
        _guard: guard,
    })
}

pub async fn run_buffered(
    cmd: &ToolCommand,
    processes: &ProcessTable,
    cancel: &CancellationToken,
) -> Result<ToolOutput, CommandError> {
    let mut stream = run_streaming(cmd, processes, cancel).await?;
    let mut stdout_lines = Vec::new();
    while let Some(line) = stream.next_line().await? {
        stdout_lines.push(line);
    }
    let exit = stream.finish().await?;
    Ok(ToolOutput {
        exit_code: exit.exit_code,
        stdout_lines,
        stderr: exit.stderr,
    })
}
