use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::capture::StreamKind;
use crate::error::{ProctorError, ProctorResult};
use crate::keystroke::{KeyDisposition, KeyInput, Keystroke, KeystrokeRecorder, RecordOutcome};
use crate::letter_stats::{ErrorPattern, LetterStatsAggregator, LetterSummary};
use crate::metrics::{LiveMetrics, LiveMetricsEngine};
use crate::test_definition::TestDefinition;

/// Attempt phases, in the only order they may be entered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, strum_macros::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    AwaitingConsent,
    NotStarted,
    Running,
    Complete,
}

/// Why typing is currently not allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    PermissionDenied(StreamKind),
    PlatformUnsupported(String),
    CaptureFailed(String),
    CannotAttempt(String),
    SubmissionFailed(String),
}

impl BlockReason {
    pub fn from_error(err: &ProctorError) -> Option<Self> {
        match err {
            ProctorError::PermissionDenied(kind) => Some(BlockReason::PermissionDenied(*kind)),
            ProctorError::PlatformUnsupported(reason) => {
                Some(BlockReason::PlatformUnsupported(reason.clone()))
            }
            ProctorError::Capture { .. } => Some(BlockReason::CaptureFailed(err.to_string())),
            ProctorError::CannotAttempt(message) => Some(BlockReason::CannotAttempt(message.clone())),
            ProctorError::SubmissionFailed(reason) => {
                Some(BlockReason::SubmissionFailed(reason.clone()))
            }
            _ => None,
        }
    }

    /// Consent can be asked for again from the top.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BlockReason::PermissionDenied(_) | BlockReason::CaptureFailed(_)
        )
    }

    pub fn message(&self) -> String {
        match self {
            BlockReason::PermissionDenied(kind) => format!(
                "Recording not permitted: {kind} access was refused. Both screen and camera recording are required to take this test."
            ),
            BlockReason::PlatformUnsupported(reason) => {
                format!("This device cannot record the screen and camera ({reason}).")
            }
            BlockReason::CaptureFailed(reason) => format!("Recording could not start: {reason}"),
            BlockReason::CannotAttempt(message) => message.clone(),
            BlockReason::SubmissionFailed(reason) => {
                format!("Submission failed, do not leave this page. ({reason})")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionTrigger {
    TextMatched,
    TimeExpired,
}

/// Everything the completion routine needs, captured once.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSnapshot {
    pub trigger: CompletionTrigger,
    pub metrics: LiveMetrics,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub completion_secs: i64,
    pub final_input: String,
    pub keystrokes: Vec<Keystroke>,
    pub backspace_count: usize,
    pub letter_data: Vec<LetterSummary>,
    pub error_patterns: Vec<ErrorPattern>,
}

/// Read-only view published to observers after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub input_len: usize,
    pub keystroke_count: usize,
    pub metrics: LiveMetrics,
    pub time_remaining_secs: Option<i64>,
    pub blocked: Option<String>,
    pub letters: Vec<LetterSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyOutcome {
    pub record: RecordOutcome,
    pub completion: Option<CompletionSnapshot>,
}

/// One attempt at a test. Single owner; every mutation goes through `&mut self`.
#[derive(Debug)]
pub struct TestSession {
    test: TestDefinition,
    target: String,
    phase: Phase,
    recorder: KeystrokeRecorder,
    letters: LetterStatsAggregator,
    metrics: LiveMetricsEngine,
    time_limit_secs: Option<i64>,
    time_remaining_secs: Option<i64>,
    ready_at: Option<DateTime<Utc>>,
    completed: bool,
    blocked: Option<BlockReason>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl TestSession {
    pub fn new(test: TestDefinition, target: impl Into<String>) -> Self {
        let target = target.into();
        let time_limit_secs = test.time_limit_secs();
        let recorder = KeystrokeRecorder::new(&target, test.disable_backspace);
        let (snapshots, _) = watch::channel(SessionSnapshot {
            phase: Phase::AwaitingConsent,
            input_len: 0,
            keystroke_count: 0,
            metrics: LiveMetrics::default(),
            time_remaining_secs: time_limit_secs,
            blocked: None,
            letters: Vec::new(),
        });

        Self {
            test,
            target,
            phase: Phase::AwaitingConsent,
            recorder,
            letters: LetterStatsAggregator::new(),
            metrics: LiveMetricsEngine::new(),
            time_limit_secs,
            time_remaining_secs: time_limit_secs,
            ready_at: None,
            completed: false,
            blocked: None,
            snapshots,
        }
    }

    /// Creates a session on one of the test's texts chosen at random.
    pub fn from_definition<R: Rng + ?Sized>(test: TestDefinition, rng: &mut R) -> Self {
        let target = test.select_text(rng);
        Self::new(test, target)
    }

    pub fn test(&self) -> &TestDefinition {
        &self.test
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn blocked(&self) -> Option<&BlockReason> {
        self.blocked.as_ref()
    }

    pub fn recorder(&self) -> &KeystrokeRecorder {
        &self.recorder
    }

    pub fn letters(&self) -> &LetterStatsAggregator {
        &self.letters
    }

    pub fn metrics(&self) -> LiveMetrics {
        self.metrics.current()
    }

    pub fn time_remaining_secs(&self) -> Option<i64> {
        self.time_remaining_secs
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            input_len: self.recorder.input().len(),
            keystroke_count: self.recorder.keystrokes().len(),
            metrics: self.metrics.current(),
            time_remaining_secs: self.time_remaining_secs,
            blocked: self.blocked.as_ref().map(BlockReason::message),
            letters: self.letters.summaries(),
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    fn advance(&mut self, to: Phase) {
        if to > self.phase {
            info!(test_id = %self.test.id, from = %self.phase, to = %to, "phase change");
            self.phase = to;
        }
    }

    pub fn block(&mut self, reason: BlockReason) {
        info!(test_id = %self.test.id, reason = %reason.message(), "session blocked");
        self.blocked = Some(reason);
        self.publish();
    }

    /// Clears a retryable block so consent can be requested again.
    pub fn retry_consent(&mut self) -> bool {
        match &self.blocked {
            Some(reason) if reason.is_retryable() && self.phase == Phase::AwaitingConsent => {
                self.blocked = None;
                self.publish();
                true
            }
            _ => false,
        }
    }

    /// Both capture streams are live; typing may begin.
    pub fn consent_granted(&mut self, now: DateTime<Utc>) -> ProctorResult<()> {
        if self.phase != Phase::AwaitingConsent {
            return Err(ProctorError::InvalidPhase("consent"));
        }
        if self.blocked.is_some() {
            return Err(ProctorError::InvalidPhase("consent while blocked"));
        }
        self.ready_at = Some(now);
        self.time_remaining_secs = self.time_limit_secs;
        self.advance(Phase::NotStarted);
        self.publish();
        Ok(())
    }

    fn accepts_input(&self) -> bool {
        !self.completed
            && self.blocked.is_none()
            && matches!(self.phase, Phase::NotStarted | Phase::Running)
    }

    pub fn handle_key(&mut self, key: KeyInput, now: DateTime<Utc>) -> KeyOutcome {
        if !self.accepts_input() {
            return KeyOutcome {
                record: RecordOutcome {
                    disposition: KeyDisposition::Ignored,
                    prevent_default: false,
                    started: false,
                },
                completion: None,
            };
        }

        let record = self.recorder.record(key, now);
        if record.disposition != KeyDisposition::Accepted {
            return KeyOutcome {
                record,
                completion: None,
            };
        }

        if record.started {
            self.time_remaining_secs = self.time_limit_secs;
            self.advance(Phase::Running);
        }

        if let (Some(last), previous) = self.recorder.last_two() {
            debug!(key = ?last.key, correct = last.correct, position = last.position, "keystroke");
            self.letters.apply(last, previous);
        }
        self.metrics.recompute(
            self.recorder.input(),
            self.recorder.target(),
            self.recorder.started_at(),
            now,
        );

        let completion = if self.recorder.matches_target() {
            self.complete(CompletionTrigger::TextMatched, now)
        } else {
            None
        };
        self.publish();

        KeyOutcome { record, completion }
    }

    /// One countdown tick. Returns the completion snapshot when this tick
    /// expired the timer and nothing completed the session before.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<CompletionSnapshot> {
        if self.completed || self.phase < Phase::NotStarted {
            return None;
        }
        let limit = self.time_limit_secs?;
        let anchor = self.recorder.started_at().or(self.ready_at)?;

        let remaining = limit - (now - anchor).num_seconds();
        self.time_remaining_secs = Some(remaining.max(0));

        let completion = if remaining <= 0 {
            self.complete(CompletionTrigger::TimeExpired, now)
        } else {
            None
        };
        self.publish();
        completion
    }

    /// Enters `Complete`. Only the first caller gets the snapshot.
    pub fn complete(
        &mut self,
        trigger: CompletionTrigger,
        now: DateTime<Utc>,
    ) -> Option<CompletionSnapshot> {
        if self.completed {
            debug!(?trigger, "completion already latched");
            return None;
        }
        self.completed = true;
        self.advance(Phase::Complete);

        let started_at = self.recorder.started_at();
        let completion_secs = started_at
            .map(|start| ((now - start).num_milliseconds().max(0) as f64 / 1000.0).round() as i64)
            .unwrap_or(0);

        let snapshot = CompletionSnapshot {
            trigger,
            metrics: self.metrics.current(),
            started_at,
            ended_at: now,
            completion_secs,
            final_input: self.recorder.current_input(),
            keystrokes: self.recorder.keystrokes().to_vec(),
            backspace_count: self.recorder.backspace_count(),
            letter_data: self.letters.summaries(),
            error_patterns: self.letters.error_patterns(),
        };
        info!(
            test_id = %self.test.id,
            ?trigger,
            wpm = snapshot.metrics.wpm,
            accuracy = snapshot.metrics.accuracy,
            "session complete"
        );
        self.publish();
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_definition::PassingCriteria;
    use assert_matches::assert_matches;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn timed(text: &str, minutes: f64) -> TestDefinition {
        let mut test = TestDefinition::new("t1", text);
        test.has_time_limit = true;
        test.time_limit_minutes = Some(minutes);
        test
    }

    fn ready(test: TestDefinition) -> TestSession {
        let text = test.text.clone();
        let mut session = TestSession::new(test, text);
        session.consent_granted(t0()).unwrap();
        session
    }

    fn type_str(session: &mut TestSession, s: &str, start_ms: i64) -> Option<CompletionSnapshot> {
        let mut done = None;
        for (i, c) in s.chars().enumerate() {
            let outcome = session.handle_key(
                KeyInput::Char(c),
                t0() + Duration::milliseconds(start_ms + 200 * i as i64),
            );
            done = done.or(outcome.completion);
        }
        done
    }

    #[test]
    fn test_keys_ignored_before_consent() {
        let mut session = TestSession::new(TestDefinition::new("t1", "ab"), "ab");
        let outcome = session.handle_key(KeyInput::Char('a'), t0());

        assert_eq!(outcome.record.disposition, KeyDisposition::Ignored);
        assert!(session.recorder().keystrokes().is_empty());
        assert_eq!(session.phase(), Phase::AwaitingConsent);
        assert!(!outcome.record.prevent_default);
    }

    #[test]
    fn test_every_key_is_intercepted_while_typing() {
        let mut session = ready(TestDefinition::new("t1", "ab"));
        for key in [KeyInput::Ignored, KeyInput::Char('a'), KeyInput::Ignored] {
            let outcome = session.handle_key(key, t0() + Duration::seconds(1));
            assert!(outcome.record.prevent_default);
        }
        assert_eq!(session.recorder().current_input(), "a");
        assert_eq!(session.recorder().keystrokes().len(), 1);
    }

    #[test]
    fn test_phases_advance_in_order() {
        let mut session = ready(TestDefinition::new("t1", "hi"));
        assert_eq!(session.phase(), Phase::NotStarted);

        session.handle_key(KeyInput::Char('h'), t0() + Duration::seconds(1));
        assert_eq!(session.phase(), Phase::Running);

        let done = session.handle_key(KeyInput::Char('i'), t0() + Duration::seconds(2));
        assert_eq!(session.phase(), Phase::Complete);
        let snapshot = done.completion.unwrap();
        assert_eq!(snapshot.trigger, CompletionTrigger::TextMatched);
        assert_eq!(snapshot.final_input, "hi");
        assert_eq!(snapshot.completion_secs, 1);

        assert_matches!(
            session.consent_granted(t0()),
            Err(ProctorError::InvalidPhase(_))
        );
        assert_eq!(session.phase(), Phase::Complete);
    }

    #[test]
    fn test_completion_latch_fires_once() {
        let mut session = ready(timed("ab", 1.0));
        type_str(&mut session, "a", 0);

        // the final key and the expiry land on the same instant
        let at_expiry = t0() + Duration::seconds(60);
        let by_text = session.handle_key(KeyInput::Char('b'), at_expiry);
        let by_timer = session.tick(at_expiry);

        assert!(by_text.completion.is_some());
        assert!(by_timer.is_none());
        for s in 61..70 {
            assert!(session.tick(t0() + Duration::seconds(s)).is_none());
        }
        assert!(session.complete(CompletionTrigger::TimeExpired, at_expiry).is_none());
    }

    #[test]
    fn test_timer_wins_when_it_fires_first() {
        let mut session = ready(timed("ab", 1.0));
        type_str(&mut session, "a", 0);

        let expired = session.tick(t0() + Duration::seconds(60)).unwrap();
        assert_eq!(expired.trigger, CompletionTrigger::TimeExpired);

        let late = session.handle_key(KeyInput::Char('b'), t0() + Duration::seconds(60));
        assert_eq!(late.record.disposition, KeyDisposition::Ignored);
        assert!(late.completion.is_none());
        assert_eq!(session.recorder().current_input(), "a");
    }

    #[test]
    fn test_untouched_timed_test_expires_with_defaults() {
        let mut session = ready(timed("the quick brown fox", 1.0));

        let mut completion = None;
        for s in 1..=60 {
            if let Some(done) = session.tick(t0() + Duration::seconds(s)) {
                completion = Some((s, done));
            }
        }

        let (at, done) = completion.unwrap();
        assert_eq!(at, 60);
        assert_eq!(done.metrics.accuracy, 100.0);
        assert_eq!(done.metrics.wpm, 0.0);
        assert_eq!(done.completion_secs, 0);
        assert!(done.started_at.is_none());
        assert_eq!(session.time_remaining_secs(), Some(0));
    }

    #[test]
    fn test_first_keystroke_restarts_countdown() {
        let mut session = ready(timed("abc", 1.0));
        session.tick(t0() + Duration::seconds(30));
        assert_eq!(session.time_remaining_secs(), Some(30));

        session.handle_key(KeyInput::Char('a'), t0() + Duration::seconds(40));
        assert_eq!(session.time_remaining_secs(), Some(60));

        session.tick(t0() + Duration::seconds(45));
        assert_eq!(session.time_remaining_secs(), Some(55));
        assert!(session.tick(t0() + Duration::seconds(99)).is_none());
        assert!(session.tick(t0() + Duration::seconds(100)).is_some());
    }

    #[test]
    fn test_remaining_is_clamped_at_zero() {
        let mut session = ready(timed("abc", 0.5));
        let done = session.tick(t0() + Duration::seconds(95));
        assert!(done.is_some());
        assert_eq!(session.time_remaining_secs(), Some(0));
    }

    #[test]
    fn test_untimed_tick_is_a_no_op() {
        let mut session = ready(TestDefinition::new("t1", "abc"));
        assert!(session.tick(t0() + Duration::hours(5)).is_none());
        assert_eq!(session.time_remaining_secs(), None);
        assert_eq!(session.phase(), Phase::NotStarted);
    }

    #[test]
    fn test_disabled_backspace_policy() {
        let mut test = TestDefinition::new("t1", "cat");
        test.disable_backspace = true;
        let mut session = ready(test);

        for (i, key) in ["c", "a", "x", "Backspace", "t"].iter().enumerate() {
            session.handle_key(KeyInput::classify(key), t0() + Duration::milliseconds(i as i64 * 100));
        }

        assert_eq!(session.recorder().keystrokes().len(), 4);
        assert_eq!(session.recorder().current_input(), "caxt");
        assert!(!session.is_complete());
    }

    #[test]
    fn test_completion_snapshot_carries_telemetry() {
        let mut test = TestDefinition::new("t1", "cat");
        test.passing_criteria = PassingCriteria::Accuracy;
        let mut session = ready(test);

        let keys = ["c", "a", "x", "Backspace", "t"];
        let mut done = None;
        for (i, key) in keys.iter().enumerate() {
            let outcome = session.handle_key(
                KeyInput::classify(key),
                t0() + Duration::milliseconds(1000 + i as i64 * 250),
            );
            done = done.or(outcome.completion);
        }

        let done = done.unwrap();
        assert_eq!(done.keystrokes.len(), 5);
        assert_eq!(done.backspace_count, 1);
        assert_eq!(done.started_at, Some(t0() + Duration::seconds(1)));
        assert_eq!(done.metrics.accuracy, 100.0);
        assert_eq!(done.error_patterns.len(), 1);
        assert_eq!(done.error_patterns[0].pattern, "t→x");
        let t = done.letter_data.iter().find(|l| l.letter == 't').unwrap();
        assert_eq!(t.incorrect_count, 1);
        assert_eq!(t.correct_count, 1);
    }

    #[test]
    fn test_block_and_retry_consent() {
        let mut session = TestSession::new(TestDefinition::new("t1", "ab"), "ab");
        session.block(BlockReason::PermissionDenied(StreamKind::Camera));

        assert_matches!(
            session.consent_granted(t0()),
            Err(ProctorError::InvalidPhase(_))
        );
        assert!(session.handle_key(KeyInput::Char('a'), t0()).record.disposition == KeyDisposition::Ignored);

        assert!(session.retry_consent());
        session.consent_granted(t0()).unwrap();
        assert_eq!(session.phase(), Phase::NotStarted);
    }

    #[test]
    fn test_cannot_attempt_is_permanent() {
        let mut session = TestSession::new(TestDefinition::new("t1", "ab"), "ab");
        session.block(BlockReason::CannotAttempt("No attempts left".into()));
        assert!(!session.retry_consent());
        assert_eq!(session.snapshot().blocked.as_deref(), Some("No attempts left"));
    }

    #[test]
    fn test_observers_see_snapshots() {
        let mut session = ready(TestDefinition::new("t1", "abc"));
        let rx = session.subscribe();

        session.handle_key(KeyInput::Char('a'), t0());
        session.handle_key(KeyInput::Char('x'), t0() + Duration::seconds(1));

        let seen = rx.borrow().clone();
        assert_eq!(seen.phase, Phase::Running);
        assert_eq!(seen.input_len, 2);
        assert_eq!(seen.keystroke_count, 2);
        assert_eq!(seen.metrics.accuracy, 50.0);
    }

    #[test]
    fn test_from_definition_uses_a_known_text() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let mut test = TestDefinition::new("t1", "alpha");
        test.alternate_texts = vec!["beta".into()];
        let session = TestSession::from_definition(test, &mut StdRng::seed_from_u64(3));
        assert!(["alpha", "beta"].contains(&session.target()));
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::AwaitingConsent.to_string(), "awaiting-consent");
        assert_eq!(Phase::NotStarted.to_string(), "not-started");
        assert!(Phase::Running < Phase::Complete);
    }
}
