use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;

use super::ExecutionOutcome;

/// How to start the interpreter or compiler for a submission
///
/// The child is started from an argument vector, never through a shell:
/// `command`, then each option, then the workspace path as a single argument.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub command: &'a str,
    pub options: &'a [&'a str],
}

/// Runs the submission once, feeding `stdin` and enforcing a wall-clock limit
///
/// Stdout and stderr are drained while the child runs so a chatty program
/// cannot block on a full pipe; at most `output_limit` bytes of each are kept
/// and the rest is discarded. On timeout the partial output is dropped. The
/// child's process group is killed on every exit path, so nothing it left in
/// the background outlives the test.
///
/// # Errors
///
/// Returns an `Err` if the process cannot be spawned or its pipes fail. A
/// timeout is not an error.
pub async fn execute(
    invocation: Invocation<'_>,
    workspace_path: &Path,
    working_dir: &Path,
    stdin: &str,
    time_limit: Duration,
    output_limit: usize,
) -> Result<ExecutionOutcome> {
    let mut cmd = Command::new(invocation.command);
    cmd.args(invocation.options)
        .arg(workspace_path)
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", invocation.command))?;
    let pid = child.id();

    let child_stdin = child.stdin.take();
    let child_stdout = child.stdout.take();
    let child_stderr = child.stderr.take();
    let (Some(child_stdout), Some(child_stderr)) = (child_stdout, child_stderr) else {
        terminate(&mut child, pid).await;
        bail!("Child output was not captured");
    };

    let start_time = Instant::now();

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let execution_result = timeout(time_limit, async {
        let feed = async move {
            if let Some(mut pipe) = child_stdin {
                // The child may exit without reading its input
                if let Err(e) = pipe.write_all(stdin.as_bytes()).await {
                    log::debug!("Child closed stdin early: {e}");
                }
                drop(pipe);
            }
        };
        let (_, out, err, status) = tokio::join!(
            feed,
            drain(child_stdout, &mut stdout, output_limit),
            drain(child_stderr, &mut stderr, output_limit),
            child.wait(),
        );
        Ok::<_, std::io::Error>((out?, err?, status?))
    })
    .await;

    let wall_time_ms = start_time.elapsed().as_millis() as u64;

    // Background descendants survive a normal exit of the child otherwise
    terminate(&mut child, pid).await;

    match execution_result {
        Ok(result) => {
            let (stdout_truncated, stderr_truncated, status) =
                result.context("Failed to collect child process output")?;
            if stdout_truncated || stderr_truncated {
                log::debug!("Child output exceeded {output_limit} bytes and was truncated");
            }
            Ok(ExecutionOutcome {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                timed_out: false,
                output_truncated: stdout_truncated,
                exit_code: status.code(),
                wall_time_ms,
            })
        }
        Err(_) => Ok(ExecutionOutcome {
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
            output_truncated: false,
            exit_code: None,
            wall_time_ms,
        }),
    }
}

/// Reads `pipe` to EOF, keeping at most `limit` bytes in `buf`
///
/// Returns whether anything was discarded.
async fn drain<R: AsyncRead + Unpin>(
    mut pipe: R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<bool> {
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(truncated);
        }
        let room = limit.saturating_sub(buf.len());
        if n > room {
            truncated = true;
        }
        buf.extend_from_slice(&chunk[..n.min(room)]);
    }
}

/// Kills the child together with anything it spawned into its process group
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: `pid` leads a process group created for this child only
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc == -1 {
            let e = std::io::Error::last_os_error();
            // ESRCH: the whole group is already gone
            if e.raw_os_error() != Some(libc::ESRCH) {
                log::warn!("Failed to kill process group {pid}: {e}");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.kill().await {
        log::debug!("Child already reaped: {e}");
    }
}
