//! Process Adapter (C1): spawns external subprocesses (the container
//! runtime CLI) with fully drained stdout/stderr and no shell interpolation.
//!
//! Grounded in `tokio::process::Command` usage from the retrieved
//! `clawforge` sandbox docker adapter: arguments are always passed as a
//! list, never interpolated into a shell string.

use crate::error::ProcessError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Runs `program args...` to completion, draining stdout/stderr fully so no
/// zombie FDs are left behind. A non-zero exit surfaces as a failure
/// carrying the stderr tail (last 4KB).
pub async fn run(program: &str, args: &[&str]) -> Result<ProcessOutput, ProcessError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let exit_code = output.status.code().unwrap_or(-1);

    if !output.status.success() {
        return Err(ProcessError::NonZeroExit {
            program: program.to_string(),
            code: exit_code,
            stderr_tail: tail(&stderr, 4096),
        });
    }

    Ok(ProcessOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// Like `run`, but yields each stdout line as it arrives via the callback,
/// then resolves with the final exit status once the child has exited.
pub async fn run_streaming<F>(
    program: &str,
    args: &[&str],
    mut on_line: F,
) -> Result<ProcessOutput, ProcessError>
where
    F: FnMut(&str) + Send,
{
    let mut child = Command::new(program)
        .args(args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout = child.stdout.take().expect("piped stdout");
    let mut lines = BufReader::new(stdout).lines();
    let mut collected_stdout = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        on_line(&line);
        collected_stdout.push_str(&line);
        collected_stdout.push('\n');
    }

    let mut stderr_buf = Vec::new();
    if let Some(mut stderr) = child.stderr.take() {
        use tokio::io::AsyncReadExt;
        let _ = stderr.read_to_end(&mut stderr_buf).await;
    }
    let stderr = String::from_utf8_lossy(&stderr_buf).into_owned();

    let status = child
        .wait()
        .await
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;
    let exit_code = status.code().unwrap_or(-1);

    if !status.success() {
        return Err(ProcessError::NonZeroExit {
            program: program.to_string(),
            code: exit_code,
            stderr_tail: tail(&stderr, 4096),
        });
    }

    Ok(ProcessOutput {
        stdout: collected_stdout,
        stderr,
        exit_code,
    })
}

fn tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        s.to_string()
    } else {
        s[s.len() - max_bytes..].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let out = run("echo", &["hello"]).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn run_surfaces_nonzero_exit() {
        let err = run("sh", &["-c", "echo boom >&2; exit 3"])
            .await
            .unwrap_err();
        match err {
            ProcessError::NonZeroExit {
                code, stderr_tail, ..
            } => {
                assert_eq!(code, 3);
                assert!(stderr_tail.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
