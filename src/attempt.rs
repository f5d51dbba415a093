//! One proctored attempt end to end: fetch the test, gate typing on capture
//! consent, feed keys and ticks to the session, then stop capture and hand
//! the result to the submission coordinator.

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::ResultsApi;
use crate::capture::{CapturePlatform, ProctoringCaptureController};
use crate::config::CaptureSettings;
use crate::error::{ProctorError, ProctorResult};
use crate::journal::SubmissionJournal;
use crate::keystroke::KeyInput;
use crate::session::{BlockReason, CompletionSnapshot, KeyOutcome, SessionSnapshot, TestSession};
use crate::submission::{SubmissionCoordinator, SubmissionPayload, SubmissionReceipt};
use crate::test_definition::PriorResult;

const DEFAULT_CANNOT_ATTEMPT: &str = "You cannot attempt this test.";

/// Byte sizes of what capture produced, kept after the blobs are uploaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordingSizes {
    pub screen: Option<usize>,
    pub camera: Option<usize>,
}

pub struct ProctoredAttempt<P: CapturePlatform, A: ResultsApi> {
    session: TestSession,
    capture: ProctoringCaptureController<P>,
    submissions: SubmissionCoordinator<A>,
    prior: Option<PriorResult>,
    completion: Option<CompletionSnapshot>,
    recordings: Option<RecordingSizes>,
    finished: bool,
}

impl<P: CapturePlatform, A: ResultsApi> ProctoredAttempt<P, A> {
    /// Fetches the test. A test that cannot be attempted still loads, blocked.
    pub async fn load<R: Rng + ?Sized>(
        api: A,
        test_id: &str,
        platform: P,
        settings: &CaptureSettings,
        journal: Option<SubmissionJournal>,
        rng: &mut R,
    ) -> ProctorResult<Self> {
        let fetched = api.fetch_test(test_id).await?;
        info!(
            test_id,
            title = %fetched.test.title,
            can_attempt = fetched.can_attempt,
            timed = fetched.test.has_time_limit,
            "test loaded"
        );

        let mut session = TestSession::from_definition(fetched.test, rng);
        if !fetched.can_attempt {
            let message = fetched
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CANNOT_ATTEMPT.to_string());
            session.block(BlockReason::CannotAttempt(message));
        } else if let Err(reason) = platform.support() {
            warn!(test_id, %reason, "capture unavailable on this machine");
            session.block(BlockReason::PlatformUnsupported(reason));
        }

        Ok(Self {
            session,
            capture: ProctoringCaptureController::new(platform, settings),
            submissions: SubmissionCoordinator::new(api, journal),
            prior: fetched.result,
            completion: None,
            recordings: None,
            finished: false,
        })
    }

    pub fn session(&self) -> &TestSession {
        &self.session
    }

    pub fn capture(&self) -> &ProctoringCaptureController<P> {
        &self.capture
    }

    pub fn submissions(&self) -> &SubmissionCoordinator<A> {
        &self.submissions
    }

    pub fn prior_result(&self) -> Option<&PriorResult> {
        self.prior.as_ref()
    }

    pub fn completion(&self) -> Option<&CompletionSnapshot> {
        self.completion.as_ref()
    }

    pub fn recordings(&self) -> Option<RecordingSizes> {
        self.recordings
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.session.subscribe()
    }

    /// The session is complete and waiting for [`Self::finish`].
    pub fn awaiting_finish(&self) -> bool {
        self.completion.is_some() && !self.finished
    }

    /// Requests both capture streams from scratch and, once they are live,
    /// lets typing begin. Any failure leaves the session blocked.
    pub async fn begin(&mut self) -> ProctorResult<()> {
        if let Some(reason) = self.session.blocked() {
            if !reason.is_retryable() {
                return Err(match reason {
                    BlockReason::CannotAttempt(message) => {
                        ProctorError::CannotAttempt(message.clone())
                    }
                    BlockReason::PlatformUnsupported(reason) => {
                        ProctorError::PlatformUnsupported(reason.clone())
                    }
                    _ => ProctorError::InvalidPhase("begin"),
                });
            }
            self.session.retry_consent();
        }

        match self.capture.start().await {
            Ok(()) => self.session.consent_granted(Utc::now()),
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "capture did not start");
                if let Some(reason) = BlockReason::from_error(&e) {
                    self.session.block(reason);
                }
                Err(e)
            }
        }
    }

    pub fn key(&mut self, key: KeyInput, now: DateTime<Utc>) -> KeyOutcome {
        let outcome = self.session.handle_key(key, now);
        if let Some(done) = &outcome.completion {
            self.completion = Some(done.clone());
        }
        outcome
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        match self.session.tick(now) {
            Some(done) => {
                self.completion = Some(done);
                true
            }
            None => false,
        }
    }

    /// Stops capture, waits for both recordings, then submits. Runs once.
    pub async fn finish(&mut self) -> ProctorResult<SubmissionReceipt> {
        if self.finished {
            return Err(ProctorError::InvalidPhase("a second finish"));
        }
        let done = self
            .completion
            .clone()
            .ok_or(ProctorError::InvalidPhase("finish"))?;
        self.finished = true;

        let artifacts = self.capture.stop().await;
        self.recordings = Some(RecordingSizes {
            screen: artifacts.screen.as_ref().map(|r| r.data.len()),
            camera: artifacts.camera.as_ref().map(|r| r.data.len()),
        });

        let test = self.session.test();
        let payload = SubmissionPayload::build(test, &done);
        let test_id = test.id.clone();
        match self.submissions.submit(&test_id, payload, &artifacts).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                if let Some(reason) = BlockReason::from_error(&e) {
                    self.session.block(reason);
                }
                Err(e)
            }
        }
    }

    /// Leaving the attempt early. Releases every capture track.
    pub fn abandon(&mut self) {
        if !self.finished {
            info!(test_id = %self.session.test().id, phase = %self.session.phase(), "attempt abandoned");
        }
        self.capture.teardown();
    }
}
