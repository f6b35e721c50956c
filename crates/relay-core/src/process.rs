use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How long a terminated subprocess gets between SIGTERM and SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

const STDERR_TAIL_BYTES: usize = 4096;

/// Result of a streamed subprocess run.
#[derive(Debug)]
pub struct ProcessOutcome {
    /// Exit code; -1 when the process died without one (signal).
    pub exit_code: i32,
    /// Last few KiB of stderr, for error records.
    pub stderr_tail: String,
    /// The deadline elapsed and the process was terminated.
    pub timed_out: bool,
    /// The cancel token fired and the process was terminated.
    pub aborted: bool,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.aborted
    }
}

/// Spawn `cmd`, stream its stdout line-by-line into `stream_tx`, and wait
/// for exit, deadline, or cancellation, whichever comes first.
///
/// On deadline or cancellation the process receives SIGTERM, then SIGKILL
/// after [`TERM_GRACE`]. `kill_on_drop` backs all paths so no exit route
/// leaks an orphan.
pub async fn run_streaming(
    mut cmd: Command,
    stream_tx: Option<UnboundedSender<String>>,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<ProcessOutcome> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("spawn subprocess")?;

    let stdout = child.stdout.take().context("take subprocess stdout")?;
    let stderr = child.stderr.take().context("take subprocess stderr")?;

    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(tx) = &stream_tx {
                if tx.send(line).is_err() {
                    break;
                }
            }
        }
    });

    let stderr_task = tokio::spawn(async move {
        let mut tail = String::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tail.push_str(&line);
            tail.push('\n');
            if tail.len() > STDERR_TAIL_BYTES {
                let cut = tail.len() - STDERR_TAIL_BYTES;
                // Keep the tail on a char boundary.
                let cut = (cut..tail.len())
                    .find(|i| tail.is_char_boundary(*i))
                    .unwrap_or(0);
                tail.drain(..cut);
            }
        }
        tail
    });

    enum Waited {
        Exited(i32),
        TimedOut,
        Cancelled,
    }

    let waited = tokio::select! {
        status = child.wait() => {
            let status = status.context("wait for subprocess")?;
            Waited::Exited(status.code().unwrap_or(-1))
        }
        _ = cancel.cancelled() => Waited::Cancelled,
        _ = sleep_opt(timeout) => Waited::TimedOut,
    };

    let (exit_code, timed_out, aborted) = match waited {
        Waited::Exited(code) => (code, false, false),
        Waited::TimedOut => (terminate(&mut child).await, true, false),
        Waited::Cancelled => (terminate(&mut child).await, false, true),
    };

    // Reader tasks end when the pipes close; ignore their join errors.
    let _ = stdout_task.await;
    let stderr_tail = stderr_task.await.unwrap_or_default();

    Ok(ProcessOutcome {
        exit_code,
        stderr_tail,
        timed_out,
        aborted,
    })
}

async fn sleep_opt(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child) -> i32 {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.code().unwrap_or(-1),
        Ok(Err(e)) => {
            warn!("process: wait after SIGTERM: {e}");
            -1
        }
        Err(_) => {
            if let Err(e) = child.start_kill() {
                warn!("process: SIGKILL: {e}");
            }
            match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!("process: wait after SIGKILL: {e}");
                    -1
                }
            }
        }
    }
}
