//! Child-process plumbing shared by the stdio adapters.
//!
//! Spawns the CLI with piped stdio and runs three background tasks: a stdin
//! writer fed by a line channel, a stdout reader feeding a bounded line
//! channel, and a stderr logger. The child is killed via a `kill` channel;
//! stdout EOF is the end-of-stream signal.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use bc_domain::error::{Error, Result};

/// Capacity of the stdout line channel.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Handles to a spawned CLI child.
#[derive(Debug)]
pub struct ChildPipes {
    pub pid: Option<u32>,
    /// Lines written to the child's stdin (newline appended).
    pub stdin_tx: mpsc::Sender<String>,
    /// Lines read from the child's stdout. Closed on EOF.
    pub stdout_rx: mpsc::Receiver<String>,
    /// Any send kills the child.
    pub kill_tx: mpsc::Sender<()>,
}

/// Spawn `binary args…` with piped stdio and start the pump tasks.
pub fn spawn_child(
    adapter: &'static str,
    binary: &str,
    args: &[String],
    cwd: Option<&Path>,
) -> Result<ChildPipes> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|e| Error::ConnectFailed {
        adapter: adapter.to_string(),
        message: format!("spawn {binary}: {e}"),
    })?;

    let pid = child.id();
    let mut stdin = child.stdin.take().ok_or_else(|| Error::ConnectFailed {
        adapter: adapter.to_string(),
        message: "child stdin unavailable".into(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| Error::ConnectFailed {
        adapter: adapter.to_string(),
        message: "child stdout unavailable".into(),
    })?;
    let stderr = child.stderr.take();

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
    let (stdout_tx, stdout_rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
    let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

    // Stdin writer.
    tokio::spawn(async move {
        while let Some(line) = stdin_rx.recv().await {
            if stdin.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdin.write_all(b"\n").await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
        // Channel closed: send EOF so well-behaved CLIs exit.
        let _ = stdin.shutdown().await;
    });

    // Stdout reader.
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if stdout_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(adapter, error = %e, "stdout read error");
                    break;
                }
            }
        }
        // Dropping stdout_tx closes the channel = end of stream.
    });

    // Stderr logger.
    if let Some(stderr) = stderr {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(adapter, line = %line, "backend stderr");
            }
        });
    }

    // Child monitor: kill on request, reap on exit.
    tokio::spawn(async move {
        let exited = tokio::select! {
            _ = kill_rx.recv() => None,
            status = child.wait() => Some(status),
        };
        match exited {
            Some(Ok(status)) => {
                tracing::debug!(adapter, code = ?status.code(), "backend child exited");
            }
            Some(Err(e)) => tracing::debug!(adapter, error = %e, "backend child wait failed"),
            None => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    });

    Ok(ChildPipes {
        pid,
        stdin_tx,
        stdout_rx,
        kill_tx,
    })
}
