//! Launches and monitors an external H.264 producer process per stream,
//! exposing its standard output as a byte stream (§4.4.1, §4.4.3).

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{AgentError, Result};

const STARTUP_CHECK_DELAY: Duration = Duration::from_millis(500);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL_CHARS: usize = 200;

/// Search paths tried, in order, for the transcoder binary (§6).
const BINARY_SEARCH_PATHS: &[&str] = &[
    "ffmpeg",
    "/usr/bin/ffmpeg",
    "/usr/local/bin/ffmpeg",
    "/opt/homebrew/bin/ffmpeg",
];

pub fn locate_binary() -> Option<String> {
    for candidate in BINARY_SEARCH_PATHS {
        if candidate.contains('/') {
            if std::path::Path::new(candidate).exists() {
                return Some(candidate.to_string());
            }
        } else if which_on_path(candidate).is_some() {
            return Some(candidate.to_string());
        }
    }
    None
}

fn which_on_path(binary: &str) -> Option<String> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|p| p.exists())
        .map(|p| p.to_string_lossy().to_string())
}

/// Builds the transcode arguments: read RTSP over TCP with a 5 s I/O
/// timeout, re-encode to H.264 baseline yuv420p at 2 Mbit/s, GOP 30, no
/// audio, Annex-B on stdout.
fn build_args(rtsp_url: &str) -> Vec<String> {
    vec![
        "-rtsp_transport".into(),
        "tcp".into(),
        "-timeout".into(),
        "5000000".into(),
        "-i".into(),
        rtsp_url.to_string(),
        "-an".into(),
        "-c:v".into(),
        "libx264".into(),
        "-profile:v".into(),
        "baseline".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-b:v".into(),
        "2M".into(),
        "-g".into(),
        "30".into(),
        "-f".into(),
        "h264".into(),
        "pipe:1".into(),
    ]
}

pub struct TranscoderHandle {
    child: Child,
    pub stdout: Option<ChildStdout>,
    stream_key: String,
}

impl TranscoderHandle {
    /// Spawns the transcoder for `rtsp_url`, then after a short grace
    /// period checks whether it's still alive — a typical startup failure
    /// (bad credentials, unreachable camera) exits almost immediately.
    pub async fn spawn(stream_key: &str, rtsp_url: &str) -> Result<Self> {
        let binary = locate_binary()
            .ok_or_else(|| AgentError::Core(core_common::CoreError::ResourceUnavailable(
                "transcoder binary not found".to_string(),
            )))?;

        let mut command = Command::new(&binary);
        command
            .args(build_args(rtsp_url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(AgentError::Io)?;
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        sleep(STARTUP_CHECK_DELAY).await;

        if let Ok(Some(status)) = child.try_wait() {
            let tail = read_stderr_tail(&mut stderr).await;
            let message = classify_transcoder_error(&tail);
            warn!(stream_key, ?status, message, "transcoder exited immediately");
            return Err(AgentError::Transcoder(message));
        }

        info!(stream_key, binary, "transcoder started");
        drop(stderr);
        Ok(TranscoderHandle {
            child,
            stdout: stdout.take(),
            stream_key: stream_key.to_string(),
        })
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Returns `Ok(Some(status))` if the process has already exited.
    pub fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    /// Closes stdin (many transcoders treat this as a shutdown request)
    /// and waits up to the grace period before escalating to a hard kill
    /// (§4.4.3).
    pub async fn terminate(mut self) {
        drop(self.child.stdin.take());

        let waited = tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await;
        if waited.is_err() {
            warn!(stream_key = %self.stream_key, "transcoder did not exit in time, killing");
            let _ = self.child.kill().await;
        }
    }
}

async fn read_stderr_tail(stderr: &mut Option<tokio::process::ChildStderr>) -> String {
    let Some(stderr) = stderr else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = stderr.read_to_end(&mut buf).await;
    let text = String::from_utf8_lossy(&buf);
    let tail_start = text.len().saturating_sub(STDERR_TAIL_CHARS);
    text[tail_start..].to_string()
}

/// Translates transcoder stderr into a single user-visible phrase (§7).
pub fn classify_transcoder_error(stderr_tail: &str) -> String {
    let lower = stderr_tail.to_ascii_lowercase();
    if lower.contains("connection refused") {
        "camera offline or wrong IP".to_string()
    } else if lower.contains("connection timed out") {
        "camera did not respond".to_string()
    } else if lower.contains("401") || lower.contains("unauthorized") || lower.contains("authentication") {
        "bad credentials".to_string()
    } else if lower.contains("404") || lower.contains("not found") {
        "wrong stream URL".to_string()
    } else if lower.contains("invalid data") {
        "unsupported stream format".to_string()
    } else if lower.contains("no route to host") {
        "network unreachable".to_string()
    } else {
        stderr_tail
            .lines()
            .rev()
            .find(|l| l.to_ascii_lowercase().contains("error"))
            .unwrap_or(stderr_tail)
            .chars()
            .take(200)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_refused() {
        assert_eq!(classify_transcoder_error("Connection refused\n"), "camera offline or wrong IP");
    }

    #[test]
    fn classifies_auth_failure() {
        assert_eq!(
            classify_transcoder_error("HTTP error 401 Unauthorized\n"),
            "bad credentials"
        );
    }

    #[test]
    fn falls_back_to_last_error_line() {
        let tail = "some info line\nReal error: invalid stream header\n";
        assert_eq!(classify_transcoder_error(tail), "Real error: invalid stream header");
    }

    #[test]
    fn build_args_includes_required_encode_settings() {
        let args = build_args("rtsp://10.0.0.5/cam");
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"yuv420p".to_string()));
        assert!(args.contains(&"2M".to_string()));
    }
}
