use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;

/// Per-stream capture cap. Bytes past it are drained and discarded so the
/// child never stalls on a full pipe.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

const TIMEOUT_RETURNCODE: i32 = 124;
const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Spawns a child with explicit argv and environment, captures both output
/// streams concurrently with a hard byte cap, and enforces a wall-clock
/// timeout by killing the child.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        command: &[String],
        timeout: Duration,
        env: &HashMap<String, String>,
    ) -> io::Result<ProcessOutput>;
}

pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        command: &[String],
        timeout: Duration,
        env: &HashMap<String, String>,
    ) -> io::Result<ProcessOutput> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "command args are empty"))?;
        tracing::info!(
            "process start timeout={}s argv={:?}",
            timeout.as_secs(),
            &command[..command.len().min(8)]
        );

        let child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = consume_capped_output(child, timeout).await?;
        tracing::info!(
            "process complete timed_out={} returncode={} stdout_bytes={} stderr_bytes={}",
            output.timed_out,
            output.returncode,
            output.stdout.len(),
            output.stderr.len()
        );
        Ok(output)
    }
}

async fn consume_capped_output(mut child: Child, timeout: Duration) -> io::Result<ProcessOutput> {
    // Both streams were configured with `Stdio::piped()` above, so `take()`
    // should normally return `Some`; anything else is an I/O error.
    let stdout_reader = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout pipe was unexpectedly not available"))?;
    let stderr_reader = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr pipe was unexpectedly not available"))?;

    let stdout_handle = tokio::spawn(read_capped(
        BufReader::new(stdout_reader),
        MAX_CAPTURE_BYTES,
    ));
    let stderr_handle = tokio::spawn(read_capped(
        BufReader::new(stderr_reader),
        MAX_CAPTURE_BYTES,
    ));

    let mut timed_out = false;
    let exit_code = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?.code().unwrap_or(0),
        Err(_) => {
            timed_out = true;
            child.start_kill()?;
            // Reap so the kill is observed before the readers are joined.
            let _ = child.wait().await?;
            TIMEOUT_RETURNCODE
        }
    };

    let (stdout_buf, stdout_truncated) = stdout_handle.await.map_err(io::Error::other)??;
    let (stderr_buf, stderr_truncated) = stderr_handle.await.map_err(io::Error::other)??;

    Ok(ProcessOutput {
        returncode: exit_code,
        stdout: decode_output(&stdout_buf, stdout_truncated),
        stderr: decode_output(&stderr_buf, stderr_truncated),
        timed_out,
    })
}

async fn read_capped<R: AsyncRead + Unpin + Send + 'static>(
    mut reader: R,
    max_output: usize,
) -> io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::with_capacity(max_output.min(8 * 1024));
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        let keep = n.min(max_output - buf.len());
        buf.extend_from_slice(&tmp[..keep]);
        if n > keep {
            truncated = true;
        }
        // Continue reading to EOF even once the cap is hit.
    }

    Ok((buf, truncated))
}

fn decode_output(raw: &[u8], truncated: bool) -> String {
    let text = String::from_utf8_lossy(raw).into_owned();
    if truncated {
        format!("{text}{TRUNCATION_MARKER}")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn no_env() -> HashMap<String, String> {
        HashMap::from([(
            "PATH".to_string(),
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        )])
    }

    #[tokio::test]
    async fn successful_run_reports_exit_code_zero() {
        let runner = TokioProcessRunner;
        let result = runner
            .run(&sh("echo ok"), Duration::from_secs(2), &no_env())
            .await
            .unwrap();

        assert_eq!(result.returncode, 0);
        assert_eq!(result.stdout.trim(), "ok");
        assert_eq!(result.stderr, "");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_passed_through() {
        let runner = TokioProcessRunner;
        let result = runner
            .run(&sh("echo bad >&2; exit 3"), Duration::from_secs(2), &no_env())
            .await
            .unwrap();

        assert_eq!(result.returncode, 3);
        assert_eq!(result.stderr.trim(), "bad");
    }

    #[tokio::test]
    async fn timeout_kills_the_child_and_reports_124() {
        let runner = TokioProcessRunner;
        // `exec` keeps this a single process so the kill also closes the
        // output pipe.
        let result = runner
            .run(
                &sh("echo late; exec sleep 10"),
                Duration::from_secs(1),
                &no_env(),
            )
            .await
            .unwrap();

        assert_eq!(result.returncode, 124);
        assert!(result.timed_out);
        assert!(result.stdout.contains("late"));
    }

    #[tokio::test]
    async fn output_exactly_at_cap_is_not_marked_truncated() {
        let runner = TokioProcessRunner;
        // dd emits exactly MAX_CAPTURE_BYTES NUL bytes, mapped to 'x'.
        let script = format!(
            "dd if=/dev/zero bs=65536 count={} 2>/dev/null | tr '\\0' x",
            MAX_CAPTURE_BYTES / 65536
        );
        let result = runner
            .run(&sh(&script), Duration::from_secs(10), &no_env())
            .await
            .unwrap();

        assert_eq!(result.returncode, 0);
        assert_eq!(result.stdout.len(), MAX_CAPTURE_BYTES);
        assert!(!result.stdout.contains("[output truncated]"));
    }

    #[tokio::test]
    async fn output_one_byte_past_cap_is_marked_truncated() {
        let runner = TokioProcessRunner;
        let script = format!(
            "dd if=/dev/zero bs=65536 count={} 2>/dev/null | tr '\\0' x; printf x",
            MAX_CAPTURE_BYTES / 65536
        );
        let result = runner
            .run(&sh(&script), Duration::from_secs(10), &no_env())
            .await
            .unwrap();

        assert_eq!(result.returncode, 0);
        assert!(result.stdout.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            result.stdout.len(),
            MAX_CAPTURE_BYTES + TRUNCATION_MARKER.len()
        );
    }

    #[tokio::test]
    async fn empty_command_is_an_input_error() {
        let runner = TokioProcessRunner;
        let err = runner
            .run(&[], Duration::from_secs(1), &no_env())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn environment_is_explicit() {
        let runner = TokioProcessRunner;
        let mut env = no_env();
        env.insert("TRIAGE_PROBE".to_string(), "probe-value".to_string());
        let result = runner
            .run(
                &sh("echo \"$TRIAGE_PROBE:$HOME\""),
                Duration::from_secs(2),
                &env,
            )
            .await
            .unwrap();

        // HOME is absent because the child env is exactly what was passed.
        assert_eq!(result.stdout.trim(), "probe-value:");
    }
}
