/*! fleetlink::exec — bounded execution of external handler programs
 *
 * Runs `<interpreter> <path> <args…>` with no stdin, captures stdout and
 * stderr up to a byte cap each, and enforces a wall-clock deadline. The
 * child is always reaped: on timeout it is killed first, and the process
 * handle carries kill-on-drop so a cancelled caller cannot leak it either.
 *
 * Exit codes seen by callers:
 *   child exited normally  → its exit code
 *   child died to a signal → 128
 *   deadline hit           → 124
 */

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Exit code reported when the deadline kills the child.
pub const RC_TIMEOUT: i32 = 124;
/// Exit code reported when the child dies to a signal.
pub const RC_SIGNALED: i32 = 128;
/// After the child is reaped, how long a still-open pipe (e.g. held by an
/// orphaned grandchild) may delay the response.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// What one handler run produced.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub rc: i32,
    pub elapsed_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

/// Run one handler to completion or deadline.
///
/// Returns Err only when the child could not be spawned at all; every
/// in-flight failure mode (timeout, signal death, nonzero exit) comes back
/// as a normal Outcome with the corresponding rc.
pub async fn run(
    interpreter: &str,
    path: &str,
    args: &[String],
    timeout_ms: u64,
    max_output_bytes: usize,
) -> Result<Outcome> {
    let started = Instant::now();

    let mut child = Command::new(interpreter)
        .arg(path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn {interpreter} {path}"))?;

    // Drain both pipes concurrently so the child never stalls on a full
    // pipe, even once the caps are reached. The buffers are shared so a
    // pipe that never reaches EOF still yields what was captured.
    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let out_task = drain(child.stdout.take(), max_output_bytes, Arc::clone(&stdout_buf));
    let err_task = drain(child.stderr.take(), max_output_bytes, Arc::clone(&stderr_buf));

    let status = match tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait()).await
    {
        Ok(waited) => Some(waited.context("wait on child")?),
        Err(_) => {
            warn!("[exec] {path}: deadline after {timeout_ms} ms, killing child");
            if let Err(e) = child.start_kill() {
                debug!("[exec] kill failed (already gone?): {e}");
            }
            // Reap synchronously so no zombie outlives the request.
            let _ = child.wait().await;
            None
        }
    };

    // Normal exits close the pipes and both drains finish promptly. An
    // orphaned grandchild can keep a write end open; give it one grace
    // period, then answer with whatever was captured.
    let out_abort = out_task.abort_handle();
    let err_abort = err_task.abort_handle();
    if tokio::time::timeout(DRAIN_GRACE, out_task).await.is_err() {
        out_abort.abort();
    }
    if tokio::time::timeout(DRAIN_GRACE, err_task).await.is_err() {
        err_abort.abort();
    }
    let stdout = String::from_utf8_lossy(&stdout_buf.lock().await).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_buf.lock().await).into_owned();

    let rc = match status {
        None => RC_TIMEOUT,
        Some(st) => match st.code() {
            Some(code) => code,
            None => {
                debug!("[exec] {path}: killed by signal {:?}", st.signal());
                RC_SIGNALED
            }
        },
    };

    Ok(Outcome {
        rc,
        elapsed_ms: started.elapsed().as_millis() as u64,
        stdout,
        stderr,
    })
}

/// Read a pipe to EOF, retaining at most `cap` bytes and discarding the rest.
fn drain<R>(
    pipe: Option<R>,
    cap: usize,
    kept: Arc<Mutex<Vec<u8>>>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut kept = kept.lock().await;
                    if kept.len() < cap {
                        let take = n.min(cap - kept.len());
                        kept.extend_from_slice(&buf[..take]);
                    }
                    // Past the cap: keep reading, keep nothing.
                }
            }
        }
    })
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn script(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let s = script("echo hi\n");
        let out = run("/bin/sh", s.path().to_str().unwrap(), &[], 5000, 65536)
            .await
            .unwrap();
        assert_eq!(out.rc, 0);
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.stderr, "");
    }

    #[tokio::test]
    async fn test_args_and_exit_code() {
        let s = script("echo \"$1 $2\" >&2\nexit 7\n");
        let out = run(
            "/bin/sh",
            s.path().to_str().unwrap(),
            &["alpha".into(), "beta".into()],
            5000,
            65536,
        )
        .await
        .unwrap();
        assert_eq!(out.rc, 7);
        assert_eq!(out.stderr, "alpha beta\n");
    }

    #[tokio::test]
    async fn test_output_capped_at_exactly_cap() {
        // Writes cap+1 bytes; the returned buffer must hold exactly cap.
        let s = script("head -c 1025 /dev/zero\n");
        let out = run("/bin/sh", s.path().to_str().unwrap(), &[], 5000, 1024)
            .await
            .unwrap();
        assert_eq!(out.rc, 0);
        assert_eq!(out.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn test_output_at_cap_not_truncated() {
        let s = script("head -c 1024 /dev/zero\n");
        let out = run("/bin/sh", s.path().to_str().unwrap(), &[], 5000, 1024)
            .await
            .unwrap();
        assert_eq!(out.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports_124() {
        let s = script("sleep 30\n");
        let started = Instant::now();
        let out = run("/bin/sh", s.path().to_str().unwrap(), &[], 200, 65536)
            .await
            .unwrap();
        assert_eq!(out.rc, RC_TIMEOUT);
        // Deadline plus one drain pass, nowhere near the sleep duration.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_partial_output_survives_timeout() {
        let s = script("echo early\nsleep 30\n");
        let out = run("/bin/sh", s.path().to_str().unwrap(), &[], 300, 65536)
            .await
            .unwrap();
        assert_eq!(out.rc, RC_TIMEOUT);
        assert_eq!(out.stdout, "early\n");
    }

    #[tokio::test]
    async fn test_signal_death_reports_128() {
        let s = script("kill -9 $$\n");
        let out = run("/bin/sh", s.path().to_str().unwrap(), &[], 5000, 65536)
            .await
            .unwrap();
        assert_eq!(out.rc, RC_SIGNALED);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let got = run("/nonexistent/interp", "/also/nope", &[], 1000, 65536).await;
        assert!(got.is_err());
    }
}
