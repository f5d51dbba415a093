//! Capture through `ffmpeg` child processes, one per stream, each muxing
//! WebM to stdout. Consent is implied by the process surviving its probe
//! window; an immediate exit (no display, camera busy or refused) counts as
//! a denial.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use super::{
    CapturePlatform, MediaRecorder, MediaStream, RecorderEvent, RecorderProfile, RecorderState,
    StreamKind,
};
use crate::config::CaptureSettings;
use crate::error::{ProctorError, ProctorResult};

const READ_BUFFER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct FfmpegPlatform {
    program: PathBuf,
    display_args: Vec<String>,
    camera_args: Vec<String>,
    consent_probe: Duration,
}

impl FfmpegPlatform {
    pub fn new(settings: &CaptureSettings) -> Self {
        Self {
            program: PathBuf::from(&settings.ffmpeg_path),
            display_args: settings.display_args.clone(),
            camera_args: settings.camera_args.clone(),
            consent_probe: Duration::from_millis(settings.consent_probe_ms),
        }
    }

    fn args(&self, kind: StreamKind) -> &[String] {
        match kind {
            StreamKind::Display => &self.display_args,
            StreamKind::Camera => &self.camera_args,
        }
    }
}

#[derive(Debug)]
pub struct FfmpegStream {
    kind: StreamKind,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    released: bool,
}

impl MediaStream for FfmpegStream {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.child.start_kill() {
            debug!(kind = %self.kind, error = %e, "capture process already gone");
        }
    }

    fn is_live(&self) -> bool {
        !self.released
    }
}

#[derive(Debug)]
pub struct FfmpegRecorder {
    kind: StreamKind,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    recording: Arc<AtomicBool>,
}

impl MediaRecorder for FfmpegRecorder {
    fn start(
        &mut self,
        timeslice: Duration,
        events: mpsc::UnboundedSender<RecorderEvent>,
    ) -> Result<(), String> {
        let mut stdout = self
            .stdout
            .take()
            .ok_or_else(|| "capture output already consumed".to_string())?;
        let recording = Arc::clone(&self.recording);
        let kind = self.kind;
        recording.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut pending = Vec::new();
            let mut read_buf = vec![0u8; READ_BUFFER_BYTES];
            let mut ticker = interval_at(Instant::now() + timeslice, timeslice);
            loop {
                tokio::select! {
                    read = stdout.read(&mut read_buf) => match read {
                        Ok(0) => break,
                        Ok(n) => pending.extend_from_slice(&read_buf[..n]),
                        Err(e) => {
                            warn!(%kind, error = %e, "capture output read failed");
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if !pending.is_empty() {
                            let _ = events.send(RecorderEvent::DataAvailable(std::mem::take(&mut pending)));
                        }
                    }
                }
            }
            if !pending.is_empty() {
                let _ = events.send(RecorderEvent::DataAvailable(pending));
            }
            recording.store(false, Ordering::SeqCst);
            let _ = events.send(RecorderEvent::Stopped);
        });
        Ok(())
    }

    fn request_stop(&mut self) {
        let Some(mut stdin) = self.stdin.take() else {
            return;
        };
        let kind = self.kind;
        // ffmpeg finalizes the container and exits when it reads `q`.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = stdin.write_all(b"q").await {
                        debug!(%kind, error = %e, "could not signal capture process");
                    }
                    let _ = stdin.flush().await;
                });
            }
            Err(_) => drop(stdin),
        }
    }

    fn state(&self) -> RecorderState {
        if self.recording.load(Ordering::SeqCst) {
            RecorderState::Recording
        } else {
            RecorderState::Inactive
        }
    }
}

#[async_trait]
impl CapturePlatform for FfmpegPlatform {
    type Stream = FfmpegStream;
    type Recorder = FfmpegRecorder;

    fn support(&self) -> Result<(), String> {
        match which::which(&self.program) {
            Ok(path) => {
                debug!(path = %path.display(), "capture program found");
                Ok(())
            }
            Err(e) => Err(format!("`{}` is not runnable: {e}", self.program.display())),
        }
    }

    async fn acquire(&self, kind: StreamKind) -> ProctorResult<FfmpegStream> {
        let mut child = Command::new(&self.program)
            .args(self.args(kind))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProctorError::Capture {
                kind,
                reason: format!("could not launch {}: {e}", display_name(&self.program)),
            })?;

        tokio::time::sleep(self.consent_probe).await;
        match child.try_wait() {
            Ok(None) => {
                info!(%kind, pid = child.id(), "capture source opened");
                Ok(FfmpegStream {
                    kind,
                    stdin: child.stdin.take(),
                    stdout: child.stdout.take(),
                    child,
                    released: false,
                })
            }
            Ok(Some(status)) => {
                warn!(%kind, %status, "capture source refused");
                Err(ProctorError::PermissionDenied(kind))
            }
            Err(e) => Err(ProctorError::Capture {
                kind,
                reason: e.to_string(),
            }),
        }
    }

    fn recorder(
        &self,
        stream: &mut FfmpegStream,
        profile: &RecorderProfile,
    ) -> ProctorResult<FfmpegRecorder> {
        let kind = stream.kind;
        if !profile.mime_type.starts_with("video/webm") {
            return Err(ProctorError::Capture {
                kind,
                reason: format!("unsupported recording format {}", profile.mime_type),
            });
        }
        let stdout = stream.stdout.take().ok_or_else(|| ProctorError::Capture {
            kind,
            reason: "capture output already attached to a recorder".to_string(),
        })?;

        Ok(FfmpegRecorder {
            kind,
            stdin: stream.stdin.take(),
            stdout: Some(stdout),
            recording: Arc::new(AtomicBool::new(false)),
        })
    }
}

fn display_name(program: &Path) -> String {
    program
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program_is_unsupported() {
        let settings = CaptureSettings {
            ffmpeg_path: "definitely-not-a-real-capture-binary".to_string(),
            ..CaptureSettings::default()
        };
        let platform = FfmpegPlatform::new(&settings);
        let err = platform.support().unwrap_err();
        assert!(err.contains("definitely-not-a-real-capture-binary"));
    }

    #[cfg(unix)]
    #[test]
    fn test_explicit_path_must_be_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("ffmpeg");
        let settings = CaptureSettings {
            ffmpeg_path: program.display().to_string(),
            ..CaptureSettings::default()
        };
        assert!(FfmpegPlatform::new(&settings).support().is_err());

        std::fs::write(&program, b"").unwrap();
        assert!(FfmpegPlatform::new(&settings).support().is_err());

        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(FfmpegPlatform::new(&settings).support().is_ok());
    }

    #[test]
    fn test_default_args_write_webm_to_stdout() {
        let platform = FfmpegPlatform::new(&CaptureSettings::default());
        for kind in [StreamKind::Display, StreamKind::Camera] {
            let args = platform.args(kind);
            assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
            assert!(args.iter().any(|a| a == "webm"));
            assert!(args.iter().any(|a| a == "-an"));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_that_exits_immediately_is_a_denial() {
        let settings = CaptureSettings {
            ffmpeg_path: "false".to_string(),
            consent_probe_ms: 200,
            ..CaptureSettings::default()
        };
        let platform = FfmpegPlatform::new(&settings);
        if platform.support().is_err() {
            return;
        }
        let err = platform.acquire(StreamKind::Camera).await.unwrap_err();
        assert!(matches!(err, ProctorError::PermissionDenied(StreamKind::Camera)));
    }
}
