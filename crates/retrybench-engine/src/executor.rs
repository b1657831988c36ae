use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use retrybench_core::{MethodCall, TestCase};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::prompt::clip;

const HARNESS: &str = include_str!("harness.py");
const HARNESS_FILE: &str = "harness.py";
const SOLUTION_FILE: &str = "solution.py";
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to start {interpreter}: {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Worker protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WorkerEvent {
    Ready,
    LoadError { error: String },
    MissingFunction { defined: Vec<String> },
    Result { value: Value },
    Raised { error: String },
}

#[derive(Serialize)]
struct CallRequest<'a> {
    args: &'a [Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    calls: Option<&'a [MethodCall]>,
}

pub enum LoadOutcome {
    Ready(PythonWorker),
    LoadError(String),
    MissingFunction { defined: Vec<String> },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Returned(Value),
    Raised(String),
    TimedOut,
    /// The worker died or broke protocol; it must not be reused.
    Crashed(String),
}

/// Scratch directory holding the harness and one candidate solution.
/// Dropping it removes the directory.
pub struct WorkerSandbox {
    dir: TempDir,
    interpreter: String,
}

impl WorkerSandbox {
    pub fn prepare(code: &str, interpreter: &str) -> Result<Self> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join(HARNESS_FILE), HARNESS)?;
        std::fs::write(dir.path().join(SOLUTION_FILE), code)?;
        Ok(Self {
            dir,
            interpreter: interpreter.to_string(),
        })
    }

    /// Starts a fresh worker and waits up to `timeout` for the candidate to load.
    pub async fn spawn(&self, function_name: &str, timeout: Duration) -> Result<LoadOutcome> {
        let mut child = Command::new(&self.interpreter)
            .args(["-I", "-u", HARNESS_FILE, SOLUTION_FILE, function_name])
            .current_dir(self.dir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                interpreter: self.interpreter.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ExecutorError::Protocol("worker pipes unavailable".into()));
        };

        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stderr_tail);
        tokio::spawn(async move {
            let mut stderr = stderr;
            let mut chunk = [0u8; 1024];
            while let Ok(n) = stderr.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
                if let Ok(mut buf) = sink.lock() {
                    buf.extend_from_slice(&chunk[..n]);
                    let excess = buf.len().saturating_sub(STDERR_TAIL_BYTES);
                    buf.drain(..excess);
                }
            }
        });

        let mut worker = PythonWorker {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr_tail,
        };

        let outcome = match tokio::time::timeout(timeout, worker.next_event()).await {
            Err(_) => LoadOutcome::TimedOut,
            Ok(Ok(Some(WorkerEvent::Ready))) => return Ok(LoadOutcome::Ready(worker)),
            Ok(Ok(Some(WorkerEvent::LoadError { error }))) => LoadOutcome::LoadError(error),
            Ok(Ok(Some(WorkerEvent::MissingFunction { defined }))) => {
                LoadOutcome::MissingFunction { defined }
            }
            Ok(Ok(Some(other))) => {
                return Err(ExecutorError::Protocol(format!(
                    "unexpected event during load: {other:?}"
                )))
            }
            Ok(Ok(None)) => LoadOutcome::LoadError(worker.exit_message()),
            Ok(Err(e)) => return Err(e),
        };
        worker.shutdown().await;
        Ok(outcome)
    }
}

/// A live interpreter with the candidate loaded, answering one call per line.
pub struct PythonWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
}

impl PythonWorker {
    pub async fn call(&mut self, case: &TestCase, timeout: Duration) -> CallOutcome {
        let request = CallRequest {
            args: &case.args,
            calls: case.calls.as_deref(),
        };
        let line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(e) => return CallOutcome::Crashed(format!("could not encode arguments: {e}")),
        };

        match tokio::time::timeout(timeout, self.exchange(&line)).await {
            Err(_) => CallOutcome::TimedOut,
            Ok(Ok(Some(WorkerEvent::Result { value }))) => CallOutcome::Returned(value),
            Ok(Ok(Some(WorkerEvent::Raised { error }))) => CallOutcome::Raised(error),
            Ok(Ok(Some(other))) => {
                CallOutcome::Crashed(format!("unexpected worker event {other:?}"))
            }
            Ok(Ok(None)) => CallOutcome::Crashed(self.exit_message()),
            Ok(Err(e)) => CallOutcome::Crashed(e.to_string()),
        }
    }

    pub async fn shutdown(mut self) {
        let _ = self.child.kill().await;
    }

    async fn exchange(&mut self, line: &str) -> Result<Option<WorkerEvent>> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        self.next_event().await
    }

    async fn next_event(&mut self) -> Result<Option<WorkerEvent>> {
        while let Some(line) = self.stdout.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).map_err(|e| {
                ExecutorError::Protocol(format!("{e}: {}", clip(&line, 200)))
            })?;
            return Ok(Some(event));
        }
        Ok(None)
    }

    fn stderr_text(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).trim().to_string())
            .unwrap_or_default()
    }

    fn exit_message(&mut self) -> String {
        let status = match self.child.try_wait() {
            Ok(Some(status)) => status.to_string(),
            _ => "closed its output".to_string(),
        };
        match self.stderr_text() {
            stderr if stderr.is_empty() => format!("worker exited ({status})"),
            stderr => format!("worker exited ({status}): {stderr}"),
        }
    }
}

/// Runs `<interpreter> --version`, returning what it printed.
pub async fn probe_interpreter(interpreter: &str) -> Result<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(10),
        Command::new(interpreter)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| ExecutorError::Protocol(format!("{interpreter} --version timed out")))?
    .map_err(|source| ExecutorError::Spawn {
        interpreter: interpreter.to_string(),
        source,
    })?;

    if !output.status.success() {
        return Err(ExecutorError::Protocol(format!(
            "{interpreter} --version exited with {}",
            output.status
        )));
    }
    let text = [output.stdout, output.stderr].concat();
    Ok(String::from_utf8_lossy(&text).trim().to_string())
}
