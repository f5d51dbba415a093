//! Screen + camera capture used as the integrity gate of a test attempt.
//!
//! The controller owns both pipelines outright. Each pipeline is a stream
//! (the tracks), a recorder feeding an unbounded channel, and a collector
//! task that owns the chunk buffer. Stopping is a join over the two
//! collectors finishing; teardown is idempotent and also runs on drop.

pub mod ffmpeg;
pub mod simulated;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CaptureSettings;
use crate::error::{ProctorError, ProctorResult};

pub use ffmpeg::FfmpegPlatform;
pub use simulated::{SimulatedPlatform, SimulationScript};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StreamKind {
    /// Screen capture.
    Display,
    Camera,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderProfile {
    pub mime_type: String,
    pub timeslice: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    DataAvailable(Vec<u8>),
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Inactive,
    Recording,
}

/// An acquired capture source. Releasing stops every track.
pub trait MediaStream: Send + 'static {
    fn kind(&self) -> StreamKind;
    /// Idempotent.
    fn release(&mut self);
    fn is_live(&self) -> bool;
}

/// Encodes a stream into chunks delivered as [`RecorderEvent`]s.
pub trait MediaRecorder: Send + 'static {
    fn start(
        &mut self,
        timeslice: Duration,
        events: mpsc::UnboundedSender<RecorderEvent>,
    ) -> Result<(), String>;
    /// Asks the recorder to flush and emit [`RecorderEvent::Stopped`]. Does not wait.
    fn request_stop(&mut self);
    fn state(&self) -> RecorderState;
}

#[async_trait]
pub trait CapturePlatform: Send + Sync {
    type Stream: MediaStream;
    type Recorder: MediaRecorder;

    /// `Err` carries a human-readable reason the platform cannot capture.
    fn support(&self) -> Result<(), String>;

    /// Prompts for consent and opens the source. Denial is
    /// [`ProctorError::PermissionDenied`].
    async fn acquire(&self, kind: StreamKind) -> ProctorResult<Self::Stream>;

    fn recorder(
        &self,
        stream: &mut Self::Stream,
        profile: &RecorderProfile,
    ) -> ProctorResult<Self::Recorder>;
}

/// One finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub kind: StreamKind,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub chunk_count: usize,
    /// The recorder delivered its stop event before the pipeline closed.
    pub stopped_cleanly: bool,
}

impl Recording {
    pub fn file_name(&self) -> String {
        match self.kind {
            StreamKind::Display => "screen-recording.webm".to_string(),
            StreamKind::Camera => "camera-recording.webm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureArtifacts {
    pub screen: Option<Recording>,
    pub camera: Option<Recording>,
}

impl CaptureArtifacts {
    pub fn is_empty(&self) -> bool {
        self.screen.is_none() && self.camera.is_none()
    }
}

#[derive(Debug, Default)]
struct Collected {
    chunks: Vec<Vec<u8>>,
    stopped: bool,
}

async fn collect(
    kind: StreamKind,
    mut events: mpsc::UnboundedReceiver<RecorderEvent>,
    mut cancel: oneshot::Receiver<()>,
) -> Collected {
    let mut collected = Collected::default();
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(RecorderEvent::DataAvailable(chunk)) => {
                    debug!(%kind, bytes = chunk.len(), "chunk available");
                    if !chunk.is_empty() {
                        collected.chunks.push(chunk);
                    }
                }
                Some(RecorderEvent::Stopped) => {
                    collected.stopped = true;
                    break;
                }
                None => break,
            },
            _ = &mut cancel => break,
        }
    }

    // A final chunk can land after the stop event.
    while let Ok(event) = events.try_recv() {
        if let RecorderEvent::DataAvailable(chunk) = event {
            if !chunk.is_empty() {
                collected.chunks.push(chunk);
            }
        }
    }
    collected
}

struct Pipeline<P: CapturePlatform> {
    kind: StreamKind,
    mime_type: String,
    stream: P::Stream,
    recorder: P::Recorder,
    collector: Option<JoinHandle<Collected>>,
    cancel: Option<oneshot::Sender<()>>,
}

impl<P: CapturePlatform> Pipeline<P> {
    /// Stops the recorder, waits for its stop event (bounded), then releases
    /// the stream. `None` when nothing was recorded.
    async fn finish(mut self, stop_timeout: Duration) -> Option<Recording> {
        let was_recording = self.recorder.state() == RecorderState::Recording;
        if was_recording {
            self.recorder.request_stop();
        } else if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }

        let collected = match self.collector.take() {
            Some(mut handle) => match tokio::time::timeout(stop_timeout, &mut handle).await {
                Ok(joined) => joined.unwrap_or_default(),
                Err(_) => {
                    warn!(kind = %self.kind, ?stop_timeout, "recorder never reported stop");
                    if let Some(cancel) = self.cancel.take() {
                        let _ = cancel.send(());
                    }
                    handle.await.unwrap_or_default()
                }
            },
            None => Collected::default(),
        };

        self.stream.release();
        info!(
            kind = %self.kind,
            chunks = collected.chunks.len(),
            stopped = collected.stopped,
            "capture pipeline closed"
        );

        if collected.chunks.is_empty() {
            return None;
        }
        Some(Recording {
            kind: self.kind,
            mime_type: self.mime_type,
            chunk_count: collected.chunks.len(),
            data: collected.chunks.concat(),
            stopped_cleanly: collected.stopped,
        })
    }

    fn abort(&mut self) {
        if self.recorder.state() == RecorderState::Recording {
            self.recorder.request_stop();
        }
        self.stream.release();
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(handle) = self.collector.take() {
            handle.abort();
        }
    }
}

/// Owns the display and camera pipelines of one attempt.
pub struct ProctoringCaptureController<P: CapturePlatform> {
    platform: P,
    profile: RecorderProfile,
    stop_timeout: Duration,
    display: Option<Pipeline<P>>,
    camera: Option<Pipeline<P>>,
}

impl<P: CapturePlatform> ProctoringCaptureController<P> {
    pub fn new(platform: P, settings: &CaptureSettings) -> Self {
        Self {
            platform,
            profile: RecorderProfile {
                mime_type: settings.mime_type.clone(),
                timeslice: Duration::from_millis(settings.timeslice_ms),
            },
            stop_timeout: Duration::from_millis(settings.stop_timeout_ms),
            display: None,
            camera: None,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn is_active(&self) -> bool {
        self.display.is_some() && self.camera.is_some()
    }

    /// Acquires display then camera and starts both recorders. On any failure
    /// everything acquired so far is released. Calling again starts over
    /// from scratch.
    pub async fn start(&mut self) -> ProctorResult<()> {
        self.teardown();
        self.platform
            .support()
            .map_err(ProctorError::PlatformUnsupported)?;

        let mut display_stream = self.platform.acquire(StreamKind::Display).await?;
        let mut camera_stream = match self.platform.acquire(StreamKind::Camera).await {
            Ok(stream) => stream,
            Err(e) => {
                display_stream.release();
                return Err(e);
            }
        };

        let mut display = match self.launch(display_stream) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                camera_stream.release();
                return Err(e);
            }
        };
        let camera = match self.launch(camera_stream) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                display.abort();
                return Err(e);
            }
        };

        info!(mime = %self.profile.mime_type, "screen and camera recording started");
        self.display = Some(display);
        self.camera = Some(camera);
        Ok(())
    }

    fn launch(&self, mut stream: P::Stream) -> ProctorResult<Pipeline<P>> {
        let kind = stream.kind();
        let mut recorder = match self.platform.recorder(&mut stream, &self.profile) {
            Ok(recorder) => recorder,
            Err(e) => {
                stream.release();
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(reason) = recorder.start(self.profile.timeslice, tx) {
            stream.release();
            return Err(ProctorError::Capture { kind, reason });
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        Ok(Pipeline {
            kind,
            mime_type: self.profile.mime_type.clone(),
            stream,
            recorder,
            collector: Some(tokio::spawn(collect(kind, rx, cancel_rx))),
            cancel: Some(cancel_tx),
        })
    }

    /// Stops both pipelines and resolves once both have torn down.
    pub async fn stop(&mut self) -> CaptureArtifacts {
        let display = self.display.take();
        let camera = self.camera.take();
        let timeout = self.stop_timeout;

        let (screen, camera) = tokio::join!(
            finish_pipeline(display, timeout),
            finish_pipeline(camera, timeout),
        );
        CaptureArtifacts { screen, camera }
    }

    /// Forced cleanup without waiting. Safe to call any number of times.
    pub fn teardown(&mut self) {
        for pipeline in [self.display.take(), self.camera.take()].iter_mut().flatten() {
            debug!(kind = %pipeline.kind, "tearing down capture pipeline");
            pipeline.abort();
        }
    }
}

async fn finish_pipeline<P: CapturePlatform>(
    pipeline: Option<Pipeline<P>>,
    stop_timeout: Duration,
) -> Option<Recording> {
    match pipeline {
        Some(pipeline) => pipeline.finish(stop_timeout).await,
        None => None,
    }
}

impl<P: CapturePlatform> Drop for ProctoringCaptureController<P> {
    fn drop(&mut self) {
        self.teardown();
    }
}
