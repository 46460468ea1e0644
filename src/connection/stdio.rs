//! Subprocess sessions for stdio capability servers
//!
//! A [`StdioSession`] spawns the configured server command and talks to
//! it over stdin/stdout pipes with newline-delimited framing. The
//! child's stderr is drained into a diagnostic stream; diagnostic
//! output is not an error condition.
//!
//! # Lifecycle
//!
//! [`StdioSession::spawn`] starts the child and three background Tokio
//! tasks (stdin writer, stdout drain, stderr drain). Teardown is
//! best-effort and idempotent: [`terminate`](StdioSession::terminate)
//! sends SIGTERM on Unix (`start_kill` elsewhere) and may be called any
//! number of times; `Drop` does the same as a last resort.

use std::collections::HashMap;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::error::{BrokerError, Result};

/// A running stdio capability server.
///
/// # Examples
///
/// ```no_run
/// use std::collections::HashMap;
/// use capbroker::connection::stdio::StdioSession;
///
/// # fn example() -> capbroker::error::Result<()> {
/// let session = StdioSession::spawn("cat", &[], &HashMap::new())?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct StdioSession {
    /// Sender side of the stdin channel; `send()` writes here.
    stdin_tx: mpsc::UnboundedSender<String>,
    /// Shared receiver for stdout lines (one message per line).
    stdout_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    /// Shared receiver for stderr lines (diagnostics only).
    stderr_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    /// Handle to the spawned child process.
    child: Arc<Mutex<Child>>,
}

impl StdioSession {
    /// Spawns the server command and wires up the stdio pipes.
    ///
    /// The child inherits the full parent environment with the
    /// server-specific `env` overrides applied on top, so catalog
    /// entries only need to list the variables they change.
    ///
    /// # Arguments
    ///
    /// * `command` - Executable to run.
    /// * `args` - Command-line arguments.
    /// * `env` - Environment overrides merged over the parent
    ///   environment.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Transport`] if the process cannot be
    /// spawned or a stdio pipe is unavailable.
    pub fn spawn(command: &str, args: &[String], env: &HashMap<String, String>) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Merge: parent environment plus the server's overrides.
        cmd.envs(env);

        let mut child = cmd.spawn().map_err(|e| {
            BrokerError::Transport(format!("failed to spawn capability server `{command}`: {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::Transport("child stdin unavailable after spawn".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Transport("child stdout unavailable after spawn".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BrokerError::Transport("child stderr unavailable after spawn".into()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel::<String>();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel::<String>();

        // Background task: forward stdin_rx -> child stdin.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = stdin_rx.recv().await {
                let line = format!("{}\n", msg);
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // Background task: drain child stdout -> stdout_tx.
        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stdout_tx.send(line).is_err() {
                    break;
                }
            }
        });

        // Background task: drain child stderr -> stderr_tx + log.
        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(
                    target: "capbroker::connection::stdio",
                    "capability server stderr: {}",
                    line
                );
                if stderr_tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            stdin_tx,
            stdout_rx: Arc::new(Mutex::new(stdout_rx)),
            stderr_rx: Arc::new(Mutex::new(stderr_rx)),
            child: Arc::new(Mutex::new(child)),
        })
    }

    /// Sends one message to the child via its stdin.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Transport`] when the internal channel is
    /// closed (the background writer has exited, typically because the
    /// child died).
    pub async fn send(&self, message: String) -> Result<()> {
        self.stdin_tx
            .send(message)
            .map_err(|e| BrokerError::Transport(format!("stdin channel closed: {e}")).into())
    }

    /// Stream of messages from the child's stdout, one per line.
    pub fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.stdout_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let mut guard = rx.lock().await;
            let item = guard.recv().await?;
            drop(guard);
            Some((item, rx))
        }))
    }

    /// Stream of diagnostic lines from the child's stderr.
    pub fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.stderr_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let mut guard = rx.lock().await;
            let item = guard.recv().await?;
            drop(guard);
            Some((item, rx))
        }))
    }

    /// Best-effort, non-blocking termination of the child.
    ///
    /// Idempotent: signalling an already-dead child is harmless, and a
    /// contended lock just skips the attempt (the OS reaps the child
    /// when the broker exits).
    pub fn terminate(&self) {
        if let Ok(child) = self.child.try_lock() {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    // SAFETY: pid comes from a live tokio::process::Child.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let mut child = child;
                let _ = child.start_kill();
            }
        }
    }
}

impl Drop for StdioSession {
    /// Last-resort child termination when the session handle is
    /// dropped without an explicit disconnect.
    fn drop(&mut self) {
        self.terminate();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    /// `spawn` returns an error when the executable does not exist.
    #[test]
    fn test_spawn_nonexistent_executable_returns_error() {
        let result = StdioSession::spawn(
            "/nonexistent/binary/that/does/not/exist",
            &[],
            &HashMap::new(),
        );
        assert!(result.is_err(), "expected error for missing executable");
        let msg = result.unwrap_err().to_string();
        assert!(
            msg.contains("failed to spawn"),
            "unexpected error message: {msg}"
        );
    }

    /// A `cat` child echoes what we write; the echo arrives on
    /// `receive`.
    #[tokio::test]
    async fn test_send_and_receive_round_trip() {
        let session = match StdioSession::spawn("cat", &[], &HashMap::new()) {
            Ok(s) => s,
            // Skip when `cat` is unavailable (rare, but possible in CI).
            Err(_) => return,
        };

        let msg = r#"{"method":"probe","params":{}}"#.to_string();
        session.send(msg.clone()).await.unwrap();

        let mut stream = session.receive();
        let received = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for echo")
            .expect("stream ended unexpectedly");

        assert_eq!(received, msg);
    }

    /// Environment overrides reach the child while the parent
    /// environment is preserved.
    #[tokio::test]
    async fn test_env_overrides_are_merged_not_replacing() {
        let mut env = HashMap::new();
        env.insert("CAPBROKER_STDIO_TEST_VAR".to_string(), "injected".to_string());

        // `sh -c` resolves via PATH, which must still be inherited.
        let session = match StdioSession::spawn(
            "sh",
            &["-c".to_string(), "echo $CAPBROKER_STDIO_TEST_VAR".to_string()],
            &env,
        ) {
            Ok(s) => s,
            Err(_) => return,
        };

        let mut stream = session.receive();
        let line = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for output")
            .expect("stream ended unexpectedly");

        assert_eq!(line, "injected");
    }

    /// `receive_err` stays silent when the child writes no stderr.
    #[tokio::test]
    async fn test_receive_err_empty_when_no_stderr() {
        let session = match StdioSession::spawn("cat", &[], &HashMap::new()) {
            Ok(s) => s,
            Err(_) => return,
        };

        let mut err_stream = session.receive_err();
        let result = tokio::time::timeout(Duration::from_millis(100), err_stream.next()).await;
        assert!(result.is_err(), "expected timeout (no stderr), got a message");
    }

    /// `terminate` can be called repeatedly without panicking.
    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let session = match StdioSession::spawn("cat", &[], &HashMap::new()) {
            Ok(s) => s,
            Err(_) => return,
        };
        session.terminate();
        session.terminate();
    }
}
