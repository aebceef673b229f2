//! Worker subprocess supervision.
//!
//! Spawns the external CLI agent for a single request and exposes its
//! stdout as a stream of chunks over a channel, ending with exactly one
//! terminal event. Enforces a no-output timeout and first-class
//! cancellation; both kill the process group (best effort, since detached
//! grandchildren may survive).

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::WorkerConfig;

const READ_BUF_BYTES: usize = 4096;
/// Grace period for the process to exit after a kill.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// A fully-resolved worker invocation: program plus argv.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Environment variables removed from the child.
    pub scrub_env: Vec<String>,
}

impl WorkerInvocation {
    /// Builds the invocation for a session request.
    ///
    /// First request for a session id passes `--session-id` (new session);
    /// later requests pass `--resume` with the same id. The prompt always
    /// follows a `--` terminator so it can never be parsed as a flag.
    pub fn for_session(
        config: &WorkerConfig,
        session_id: &str,
        resume: bool,
        model: Option<&str>,
        prompt: &str,
    ) -> Self {
        let mut args = vec!["-p".to_string()];

        if resume {
            args.push("--resume".to_string());
        } else {
            args.push("--session-id".to_string());
        }
        args.push(session_id.to_string());

        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }

        args.extend(config.extra_args.iter().cloned());

        args.push("--".to_string());
        args.push(prompt.to_string());

        Self {
            program: config.command.clone(),
            args,
            scrub_env: config.scrub_env.clone(),
        }
    }
}

/// Events emitted by a running worker. The stream always ends with exactly
/// one of the terminal variants, after which the channel closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A chunk of stdout (lossy UTF-8).
    Chunk(String),
    /// Process exited on its own; 0 is success.
    Exited { code: i32 },
    /// No output within the configured duration; process killed.
    TimedOut,
    /// Cancellation requested; process killed.
    Cancelled,
}

/// Handle to a running worker process.
pub struct WorkerHandle {
    pub events: mpsc::Receiver<WorkerEvent>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    /// Requests termination. Idempotent; a no-op after natural completion.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this worker; clone to cancel from elsewhere.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Spawns the worker and a supervision task feeding [`WorkerEvent`]s.
///
/// `timeout` is the no-output timeout: the clock restarts on every chunk.
/// `None` disables it.
///
/// # Errors
/// Returns an error if the process cannot be spawned (binary missing or not
/// executable). Everything after a successful spawn is reported through the
/// event stream, never as an `Err`.
pub fn start(invocation: &WorkerInvocation, timeout: Option<Duration>) -> Result<WorkerHandle> {
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for var in &invocation.scrub_env {
        command.env_remove(var);
    }

    // Own process group so a kill reaches the worker's children too.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn worker '{}'", invocation.program))?;

    let stdout = child
        .stdout
        .take()
        .context("Worker stdout pipe missing")?;
    let stderr = child
        .stderr
        .take()
        .context("Worker stderr pipe missing")?;

    // Drain stderr concurrently so a chatty worker can't deadlock on a full
    // pipe buffer.
    let stderr_task = tokio::spawn(async move {
        let mut stderr = stderr;
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).trim().to_string()
    });

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(64);

    let token = cancel.clone();
    let program = invocation.program.clone();
    tokio::spawn(async move {
        let terminal = supervise(&mut child, stdout, timeout, &token, &tx).await;

        if let Ok(stderr_text) = stderr_task.await
            && !stderr_text.is_empty()
        {
            let snippet: String = stderr_text.chars().take(500).collect();
            warn!(worker = %program, "worker stderr: {}", snippet);
        }

        let _ = tx.send(terminal).await;
    });

    Ok(WorkerHandle { events: rx, cancel })
}

/// Reads stdout until EOF, timeout, or cancellation; returns the terminal
/// event. The child is dead by the time this returns.
async fn supervise(
    child: &mut Child,
    mut stdout: tokio::process::ChildStdout,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<WorkerEvent>,
) -> WorkerEvent {
    let mut buf = [0u8; READ_BUF_BYTES];

    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => {
                kill_tree(child).await;
                return WorkerEvent::Cancelled;
            }
            read = read_chunk(&mut stdout, &mut buf, timeout) => read,
        };

        match read {
            ReadOutcome::Chunk(text) => {
                if tx.send(WorkerEvent::Chunk(text)).await.is_err() {
                    // Receiver gone; nobody wants the output anymore.
                    kill_tree(child).await;
                    return WorkerEvent::Cancelled;
                }
            }
            ReadOutcome::Eof => {
                // stdout closed, but the process may still be running;
                // cancellation and the timeout must keep working here.
                return match wait_after_eof(child, timeout, cancel).await {
                    Waited::Exited(code) => WorkerEvent::Exited { code },
                    Waited::Cancelled => {
                        kill_tree(child).await;
                        WorkerEvent::Cancelled
                    }
                    Waited::TimedOut => {
                        kill_tree(child).await;
                        WorkerEvent::TimedOut
                    }
                };
            }
            ReadOutcome::TimedOut => {
                kill_tree(child).await;
                return WorkerEvent::TimedOut;
            }
        }
    }
}

enum ReadOutcome {
    Chunk(String),
    Eof,
    TimedOut,
}

async fn read_chunk(
    stdout: &mut tokio::process::ChildStdout,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> ReadOutcome {
    let read = stdout.read(buf);
    let result = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, read).await {
            Ok(result) => result,
            Err(_) => return ReadOutcome::TimedOut,
        },
        None => read.await,
    };

    match result {
        Ok(0) | Err(_) => ReadOutcome::Eof,
        Ok(n) => ReadOutcome::Chunk(String::from_utf8_lossy(&buf[..n]).into_owned()),
    }
}

enum Waited {
    Exited(i32),
    Cancelled,
    TimedOut,
}

/// Waits for the process after its output stream closed, still honoring
/// cancellation and the no-output timeout.
async fn wait_after_eof(
    child: &mut Child,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Waited {
    let wait = async {
        match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        }
    };
    tokio::pin!(wait);

    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        code = &mut wait => Waited::Exited(code),
        () = cancel.cancelled() => Waited::Cancelled,
        () = deadline => Waited::TimedOut,
    }
}

/// Kills the worker's process group and reaps it, hard-killing after a
/// grace period.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child was spawned as its own process group leader.
        // SAFETY: killpg with a known pgid is async-signal-safe.
        unsafe {
            libc::killpg(pid as i32, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    let _ = child.start_kill();

    if tokio::time::timeout(KILL_WAIT, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> WorkerInvocation {
        WorkerInvocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            scrub_env: Vec::new(),
        }
    }

    async fn collect(handle: &mut WorkerHandle) -> (String, WorkerEvent) {
        let mut text = String::new();
        loop {
            match handle.events.recv().await {
                Some(WorkerEvent::Chunk(chunk)) => text.push_str(&chunk),
                Some(terminal) => return (text, terminal),
                None => panic!("stream ended without a terminal event"),
            }
        }
    }

    #[test]
    fn new_session_args_use_session_id_flag() {
        let config = WorkerConfig::default();
        let invocation = WorkerInvocation::for_session(&config, "sid-1", false, None, "hello");

        assert_eq!(invocation.program, "claude");
        assert_eq!(
            invocation.args,
            vec!["-p", "--session-id", "sid-1", "--", "hello"]
        );
    }

    #[test]
    fn resume_args_use_resume_flag_and_model() {
        let config = WorkerConfig {
            extra_args: vec!["--verbose".to_string()],
            ..WorkerConfig::default()
        };
        let invocation =
            WorkerInvocation::for_session(&config, "sid-2", true, Some("opus"), "continue");

        assert_eq!(
            invocation.args,
            vec![
                "-p",
                "--resume",
                "sid-2",
                "--model",
                "opus",
                "--verbose",
                "--",
                "continue"
            ]
        );
    }

    #[test]
    fn prompt_follows_terminator_even_when_flag_like() {
        let config = WorkerConfig::default();
        let invocation = WorkerInvocation::for_session(&config, "sid", false, None, "--resume");
        assert_eq!(invocation.args.last().unwrap(), "--resume");
        assert_eq!(invocation.args[invocation.args.len() - 2], "--");
    }

    #[tokio::test]
    async fn streams_stdout_and_reports_exit() {
        let mut handle = start(&sh("printf 'hello world'"), None).unwrap();
        let (text, terminal) = collect(&mut handle).await;
        assert_eq!(text, "hello world");
        assert_eq!(terminal, WorkerEvent::Exited { code: 0 });
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_surfaced() {
        let mut handle = start(&sh("exit 3"), None).unwrap();
        let (text, terminal) = collect(&mut handle).await;
        assert_eq!(text, "");
        assert_eq!(terminal, WorkerEvent::Exited { code: 3 });
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let mut handle = start(&sh("sleep 5"), Some(Duration::from_millis(100))).unwrap();
        let (text, terminal) = collect(&mut handle).await;
        assert_eq!(text, "");
        assert_eq!(terminal, WorkerEvent::TimedOut);
    }

    #[tokio::test]
    async fn going_quiet_after_output_still_times_out() {
        let mut handle = start(
            &sh("printf early; sleep 5"),
            Some(Duration::from_millis(200)),
        )
        .unwrap();
        let (text, terminal) = collect(&mut handle).await;
        assert_eq!(text, "early");
        assert_eq!(terminal, WorkerEvent::TimedOut);
    }

    #[tokio::test]
    async fn timeout_clock_restarts_on_each_chunk() {
        // Total runtime exceeds the timeout, but no single gap does.
        let mut handle = start(
            &sh("printf a; sleep 0.1; printf b; sleep 0.1; printf c"),
            Some(Duration::from_millis(250)),
        )
        .unwrap();
        let (text, terminal) = collect(&mut handle).await;
        assert_eq!(text, "abc");
        assert_eq!(terminal, WorkerEvent::Exited { code: 0 });
    }

    #[tokio::test]
    async fn closed_stdout_with_live_worker_still_times_out() {
        let mut handle = start(
            &sh("exec 1>&-; sleep 30"),
            Some(Duration::from_millis(200)),
        )
        .unwrap();
        let (text, terminal) = collect(&mut handle).await;
        assert_eq!(text, "");
        assert_eq!(terminal, WorkerEvent::TimedOut);
    }

    #[tokio::test]
    async fn cancel_unblocks_after_worker_closes_stdout() {
        let mut handle = start(&sh("exec 1>&-; sleep 30"), None).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        let (_, terminal) = collect(&mut handle).await;
        assert_eq!(terminal, WorkerEvent::Cancelled);
    }

    #[tokio::test]
    async fn cancel_kills_a_running_worker() {
        let mut handle = start(&sh("sleep 5"), None).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        let (_, terminal) = collect(&mut handle).await;
        assert_eq!(terminal, WorkerEvent::Cancelled);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_a_noop() {
        let mut handle = start(&sh("true"), None).unwrap();
        let (_, terminal) = collect(&mut handle).await;
        assert_eq!(terminal, WorkerEvent::Exited { code: 0 });
        handle.cancel();
        handle.cancel();
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let invocation = WorkerInvocation {
            program: "dgate-no-such-binary".to_string(),
            args: Vec::new(),
            scrub_env: Vec::new(),
        };
        assert!(start(&invocation, None).is_err());
    }
}
