//! Bounded subprocess execution shared by the command-backed collaborators.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::config::CommandSpec;
use crate::error::{PlaybookError, Result};

pub const MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024; // 2MB

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// Run `command` with `stdin` piped in, capped output, and a hard timeout.
///
/// - No shell: `Command::new` + args.
/// - The child leads its own process group; on timeout the whole group is killed.
/// - `kill_on_drop` covers every other early exit.
/// - A non-zero exit is returned as output, not an error; callers decide.
pub async fn run_command(
    command: &CommandSpec,
    stdin: Option<String>,
    timeout: Duration,
    working_dir: Option<&Path>,
) -> Result<ProcessOutput> {
    let start = Instant::now();

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| PlaybookError::Collaborator {
        collaborator: "process",
        message: format!("failed to spawn {}: {e}", command.program),
    })?;

    // Feed stdin from a task so a chatty child cannot deadlock against us.
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            let _ = pipe.write_all(input.as_bytes()).await;
        });
    }

    let child_pid = child.id();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let read_future = async {
        let stdout_handle = tokio::spawn(read_capped(stdout_pipe));
        let stderr_handle = tokio::spawn(read_capped(stderr_pipe));
        let stdout = stdout_handle.await.unwrap_or_default();
        let stderr = stderr_handle.await.unwrap_or_default();
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((stdout, stderr, status))
    };

    let (stdout, stderr, status) = match tokio::time::timeout(timeout, read_future).await {
        Ok(result) => result?,
        Err(_) => {
            if let Some(pid) = child_pid {
                kill_group(pid);
            }
            let elapsed_ms = start.elapsed().as_millis() as u64;
            tracing::warn!(program = %command.program, elapsed_ms, "process timed out");
            return Err(PlaybookError::Timeout(elapsed_ms));
        }
    };

    Ok(ProcessOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        elapsed: start.elapsed(),
    })
}

async fn read_capped<R>(pipe: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Vec::new();
    };
    let mut buf = Vec::with_capacity(64 * 1024);
    let mut capped = pipe.take(MAX_OUTPUT_BYTES as u64);
    if let Err(e) = capped.read_to_end(&mut buf).await {
        tracing::warn!("process: pipe read error: {e}");
        return buf;
    }
    // Past the cap, keep draining so the child never blocks on a full pipe.
    let mut rest = capped.into_inner();
    match tokio::io::copy(&mut rest, &mut tokio::io::sink()).await {
        Ok(0) => {}
        Ok(dropped) => tracing::debug!(dropped, "process: output truncated"),
        Err(e) => tracing::warn!("process: pipe drain error: {e}"),
    }
    buf
}

fn kill_group(pid: u32) {
    // SAFETY: signalling a process group we created; a stale pid only yields ESRCH.
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

/// Run `command` and parse its stdout as JSON; non-zero exit is an error.
pub async fn run_json<T: serde::de::DeserializeOwned>(
    command: &CommandSpec,
    stdin: String,
    timeout: Duration,
    collaborator: &'static str,
) -> Result<T> {
    let output = run_command(command, Some(stdin), timeout, None).await?;
    if !output.success() {
        return Err(PlaybookError::ProcessExit {
            code: output.code(),
            stderr: output.stderr,
        });
    }
    if !output.stderr.trim().is_empty() {
        tracing::debug!(program = %command.program, stderr = %output.stderr, "{collaborator} stderr");
    }
    serde_json::from_str(extract_json(&output.stdout)).map_err(|e| PlaybookError::Collaborator {
        collaborator,
        message: format!("unparseable output: {e}"),
    })
}

/// The outermost `{...}` or `[...]` span, tolerating banners around it.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let open = trimmed.find(['{', '[']);
    let close = trimmed.rfind(['}', ']']);
    match (open, close) {
        (Some(o), Some(c)) if c > o => &trimmed[o..=c],
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run_command(&sh("echo hi; exit 3"), None, Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.code(), 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn stdin_is_delivered() {
        let out = run_command(&sh("cat"), Some("ping".into()), Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(out.stdout, "ping");
    }

    #[tokio::test]
    async fn timeout_kills_child() {
        let err = run_command(&sh("sleep 5"), None, Duration::from_millis(100), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlaybookError::Timeout(_)));
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_without_stalling() {
        let out = run_command(
            &sh("head -c 3000000 /dev/zero; echo done >&2"),
            None,
            Duration::from_secs(10),
            None,
        )
        .await
        .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.len(), MAX_OUTPUT_BYTES);
        assert_eq!(out.stderr.trim(), "done");
    }

    #[tokio::test]
    async fn missing_program_is_collaborator_error() {
        let missing = CommandSpec {
            program: "definitely-not-a-real-binary-xyz".into(),
            args: vec![],
        };
        let err = run_command(&missing, None, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn extract_json_skips_banners() {
        assert_eq!(extract_json("banner\n{\"a\":1}\ntrailer"), "{\"a\":1}");
        assert_eq!(extract_json("[1,2]"), "[1,2]");
        assert_eq!(extract_json("plain"), "plain");
    }
}
