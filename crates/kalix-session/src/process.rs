//! Engine process handle.
//!
//! Wraps a `tokio::process::Child` with the stdio wiring a session needs:
//! a locked stdin for line writes, buffered line readers handed to the
//! monitor tasks, and a close-once flag so teardown paths can overlap safely.
//! `kill_on_drop` guarantees no orphaned engine survives a dropped session.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::SessionError;

/// Buffered line readers for the engine's output streams.
///
/// Consumed exactly once, by the session monitor tasks.
#[derive(Debug)]
pub struct EngineOutput {
    pub stdout: Lines<BufReader<ChildStdout>>,
    pub stderr: Lines<BufReader<ChildStderr>>,
}

/// Handle to a spawned engine process.
pub struct EngineProcess {
    pid: Option<u32>,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    closed: AtomicBool,
}

impl EngineProcess {
    /// Spawn the engine described by `config` with all three stdio streams
    /// piped. Must be called from within a tokio runtime.
    pub fn spawn(config: &EngineConfig) -> Result<(Self, EngineOutput), SessionError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| SessionError::Launch(format!("{}: {e}", config.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Launch("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Launch("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::Launch("stderr not captured".into()))?;
        let pid = child.id();

        Ok((
            Self {
                pid,
                child: Mutex::new(child),
                stdin: Mutex::new(stdin),
                closed: AtomicBool::new(false),
            },
            EngineOutput {
                stdout: BufReader::new(stdout).lines(),
                stderr: BufReader::new(stderr).lines(),
            },
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether teardown has begun. Writes are refused after this.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse further writes without killing the process yet.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Write one protocol line (newline appended) and flush.
    pub async fn write_line(&self, line: &str) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "engine process closed",
            )));
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Non-blocking liveness check. A handle busy in `wait` counts as alive.
    pub fn is_running(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.child.try_lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            Err(_) => true,
        }
    }

    /// Wait up to `timeout` for the process to exit on its own.
    /// Returns true when it exited within the window.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        let mut child = self.child.lock().await;
        tokio::time::timeout(timeout, child.wait()).await.is_ok()
    }

    /// Force-kill and reap. Idempotent.
    pub async fn kill(&self) {
        self.mark_closed();
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "kill signal not delivered, process likely exited");
        }
        let _ = child.wait().await;
    }
}

impl std::fmt::Debug for EngineProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineProcess")
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_failure_is_a_launch_error() {
        let config = EngineConfig::new("/definitely/not/a/real/engine");
        match EngineProcess::spawn(&config) {
            Err(SessionError::Launch(message)) => {
                assert!(message.contains("/definitely/not/a/real/engine"));
            }
            other => panic!("expected launch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn writes_are_refused_after_close() {
        // `cat` reads stdin forever, which is all this test needs.
        let config = EngineConfig::new("cat");
        let (process, _output) = EngineProcess::spawn(&config).unwrap();
        assert!(process.is_running());

        process.write_line("hello").await.unwrap();
        process.kill().await;

        assert!(!process.is_running());
        assert!(matches!(
            process.write_line("too late").await,
            Err(SessionError::Io(_))
        ));
        // kill twice is fine
        process.kill().await;
    }
}
