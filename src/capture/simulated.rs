//! In-process capture platform with scripted consent and recorder faults.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use super::{
    CapturePlatform, MediaRecorder, MediaStream, RecorderEvent, RecorderProfile, RecorderState,
    StreamKind,
};
use crate::error::{ProctorError, ProctorResult};

#[derive(Debug, Clone, Default)]
pub struct SimulationScript {
    pub unsupported: bool,
    /// Streams whose consent prompt is refused.
    pub deny: Vec<StreamKind>,
    /// Recorder whose `start` fails.
    pub failing_recorder: Option<StreamKind>,
    /// Recorder that accepts `start` but never records.
    pub idle_recorder: Option<StreamKind>,
    /// Recorder that flushes on stop but never emits its stop event.
    pub never_stops: Option<StreamKind>,
    /// Emit the final flush after the stop event instead of before it.
    pub late_final_chunk: bool,
}

#[derive(Debug, Clone)]
struct Track {
    kind: StreamKind,
    live: Arc<AtomicBool>,
}

/// Shared view of what the platform handed out.
#[derive(Debug, Clone, Default)]
pub struct TrackProbe {
    tracks: Arc<Mutex<Vec<Track>>>,
    prompts: Arc<AtomicUsize>,
}

impl TrackProbe {
    pub fn live_tracks(&self) -> Vec<StreamKind> {
        self.tracks
            .lock()
            .map(|tracks| {
                tracks
                    .iter()
                    .filter(|t| t.live.load(Ordering::SeqCst))
                    .map(|t| t.kind)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn acquired_count(&self) -> usize {
        self.tracks.lock().map(|t| t.len()).unwrap_or_default()
    }

    pub fn consent_prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedPlatform {
    script: SimulationScript,
    probe: TrackProbe,
}

impl SimulatedPlatform {
    pub fn new(script: SimulationScript) -> Self {
        Self {
            script,
            probe: TrackProbe::default(),
        }
    }

    pub fn probe(&self) -> TrackProbe {
        self.probe.clone()
    }

    pub fn live_tracks(&self) -> Vec<StreamKind> {
        self.probe.live_tracks()
    }

    pub fn acquired_count(&self) -> usize {
        self.probe.acquired_count()
    }

    pub fn consent_prompts(&self) -> usize {
        self.probe.consent_prompts()
    }
}

pub struct SimulatedStream {
    kind: StreamKind,
    live: Arc<AtomicBool>,
}

impl MediaStream for SimulatedStream {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn release(&mut self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

pub struct SimulatedRecorder {
    kind: StreamKind,
    fails: bool,
    idle: bool,
    never_stops: bool,
    late_final_chunk: bool,
    state: RecorderState,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SimulatedRecorder {
    fn chunk(kind: StreamKind, seq: u32) -> Vec<u8> {
        format!("{kind}:{seq};").into_bytes()
    }
}

impl MediaRecorder for SimulatedRecorder {
    fn start(
        &mut self,
        timeslice: Duration,
        events: mpsc::UnboundedSender<RecorderEvent>,
    ) -> Result<(), String> {
        if self.fails {
            return Err("encoder refused the stream".to_string());
        }
        if self.idle {
            return Ok(());
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let kind = self.kind;
        let never_stops = self.never_stops;
        let late_final_chunk = self.late_final_chunk;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + timeslice, timeslice);
            let mut seq = 0u32;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        seq += 1;
                        if events.send(RecorderEvent::DataAvailable(Self::chunk(kind, seq))).is_err() {
                            return;
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }

            let flush = RecorderEvent::DataAvailable(Self::chunk(kind, seq + 1));
            if never_stops {
                let _ = events.send(flush);
                // hold the sender so the pipeline sees neither stop nor close
                std::future::pending::<()>().await;
            } else if late_final_chunk {
                let _ = events.send(RecorderEvent::Stopped);
                let _ = events.send(flush);
            } else {
                let _ = events.send(flush);
                let _ = events.send(RecorderEvent::Stopped);
            }
        }));
        self.stop = Some(stop_tx);
        self.state = RecorderState::Recording;
        Ok(())
    }

    fn request_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.state = RecorderState::Inactive;
    }

    fn state(&self) -> RecorderState {
        self.state
    }
}

impl Drop for SimulatedRecorder {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl CapturePlatform for SimulatedPlatform {
    type Stream = SimulatedStream;
    type Recorder = SimulatedRecorder;

    fn support(&self) -> Result<(), String> {
        if self.script.unsupported {
            Err("simulated platform configured as unsupported".to_string())
        } else {
            Ok(())
        }
    }

    async fn acquire(&self, kind: StreamKind) -> ProctorResult<SimulatedStream> {
        self.probe.prompts.fetch_add(1, Ordering::SeqCst);
        if self.script.deny.contains(&kind) {
            return Err(ProctorError::PermissionDenied(kind));
        }

        let live = Arc::new(AtomicBool::new(true));
        if let Ok(mut tracks) = self.probe.tracks.lock() {
            tracks.push(Track {
                kind,
                live: Arc::clone(&live),
            });
        }
        Ok(SimulatedStream { kind, live })
    }

    fn recorder(
        &self,
        stream: &mut SimulatedStream,
        _profile: &RecorderProfile,
    ) -> ProctorResult<SimulatedRecorder> {
        let kind = stream.kind;
        Ok(SimulatedRecorder {
            kind,
            fails: self.script.failing_recorder == Some(kind),
            idle: self.script.idle_recorder == Some(kind),
            never_stops: self.script.never_stops == Some(kind),
            late_final_chunk: self.script.late_final_chunk,
            state: RecorderState::Inactive,
            stop: None,
            task: None,
        })
    }
}
