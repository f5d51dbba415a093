use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::api::ResultsApi;
use crate::capture::CaptureArtifacts;
use crate::error::{ProctorError, ProctorResult};
use crate::journal::SubmissionJournal;
use crate::keystroke::Keystroke;
use crate::letter_stats::{ErrorPattern, LetterSummary};
use crate::session::CompletionSnapshot;
use crate::test_definition::{PassingCriteria, TestDefinition};

/// `round(accuracy * wpm / 10)`
pub fn score(accuracy: f64, wpm: f64) -> f64 {
    (accuracy * wpm / 10.0).round()
}

pub fn passed(test: &TestDefinition, accuracy: f64, wpm: f64) -> bool {
    let accurate = accuracy >= test.min_accuracy;
    let fast = wpm >= test.min_speed;
    match test.passing_criteria {
        PassingCriteria::Everyone => true,
        PassingCriteria::Accuracy => accurate,
        PassingCriteria::Speed => fast,
        PassingCriteria::Both => accurate && fast,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTelemetry {
    pub keystrokes: Vec<Keystroke>,
    pub total_keystrokes: usize,
    pub backspace_count: usize,
    pub peak_speed: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionPayload {
    pub score: f64,
    pub speed: f64,
    pub accuracy: f64,
    pub completion_time: i64,
    pub passed: bool,
    pub session_data: SessionTelemetry,
    pub letter_data: Vec<LetterSummary>,
    pub error_patterns: Vec<ErrorPattern>,
}

impl SubmissionPayload {
    pub fn build(test: &TestDefinition, done: &CompletionSnapshot) -> Self {
        let wpm = done.metrics.wpm;
        let accuracy = done.metrics.accuracy;
        Self {
            score: score(accuracy, wpm),
            speed: wpm,
            accuracy,
            completion_time: done.completion_secs,
            passed: passed(test, accuracy, wpm),
            session_data: SessionTelemetry {
                keystrokes: done.keystrokes.clone(),
                total_keystrokes: done.keystrokes.len(),
                backspace_count: done.backspace_count,
                peak_speed: done.metrics.peak_wpm.max(wpm),
                start_time: done.started_at,
                end_time: done.ended_at,
            },
            letter_data: done.letter_data.clone(),
            error_patterns: done.error_patterns.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Neither pipeline produced a recording.
    NothingToUpload,
    Uploaded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReceipt {
    pub result_id: String,
    pub payload: SubmissionPayload,
    pub upload: UploadOutcome,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryReport {
    /// `(journal id, result id)`
    pub sent: Vec<(i64, String)>,
    /// `(journal id, failure)`
    pub failed: Vec<(i64, String)>,
}

/// Submits the graded result, then uploads the recordings tagged with the
/// returned id.
pub struct SubmissionCoordinator<A: ResultsApi> {
    api: A,
    journal: Option<SubmissionJournal>,
}

impl<A: ResultsApi> SubmissionCoordinator<A> {
    pub fn new(api: A, journal: Option<SubmissionJournal>) -> Self {
        Self { api, journal }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn journal(&self) -> Option<&SubmissionJournal> {
        self.journal.as_ref()
    }

    pub async fn submit(
        &self,
        test_id: &str,
        payload: SubmissionPayload,
        artifacts: &CaptureArtifacts,
    ) -> ProctorResult<SubmissionReceipt> {
        let body = serde_json::to_value(&payload)?;

        let result_id = match self.api.submit_result(test_id, &body).await {
            Ok(id) => id,
            Err(e) => {
                let reason = match e {
                    ProctorError::SubmissionFailed(reason) => reason,
                    other => other.to_string(),
                };
                error!(test_id, %reason, "submission failed");
                self.journal_failure(test_id, &body, &reason);
                return Err(ProctorError::SubmissionFailed(reason));
            }
        };
        info!(
            test_id,
            %result_id,
            score = payload.score,
            passed = payload.passed,
            "result submitted"
        );

        let upload = if artifacts.is_empty() {
            UploadOutcome::NothingToUpload
        } else {
            match self.api.upload_recordings(test_id, &result_id, artifacts).await {
                Ok(()) => {
                    info!(test_id, %result_id, "recordings uploaded");
                    UploadOutcome::Uploaded
                }
                Err(e) => {
                    warn!(test_id, %result_id, error = %e, "recording upload failed");
                    UploadOutcome::Failed(e.to_string())
                }
            }
        };

        Ok(SubmissionReceipt {
            result_id,
            payload,
            upload,
        })
    }

    fn journal_failure(&self, test_id: &str, body: &serde_json::Value, reason: &str) {
        let Some(journal) = &self.journal else {
            warn!(test_id, "no journal configured, submission is not kept");
            return;
        };
        if let Err(e) = journal.record(test_id, body, reason, Utc::now()) {
            error!(test_id, error = %e, "could not journal failed submission");
        }
    }

    /// Re-sends every journaled submission. Recordings are not journaled,
    /// so nothing is uploaded here.
    pub async fn retry_pending(&self) -> ProctorResult<RetryReport> {
        let Some(journal) = &self.journal else {
            return Ok(RetryReport::default());
        };

        let mut report = RetryReport::default();
        for entry in journal.pending()? {
            match self.api.submit_result(&entry.test_id, &entry.payload).await {
                Ok(result_id) => {
                    journal.mark_sent(entry.id, Utc::now())?;
                    info!(id = entry.id, test_id = %entry.test_id, %result_id, "journaled submission sent");
                    report.sent.push((entry.id, result_id));
                }
                Err(e) => {
                    let reason = e.to_string();
                    journal.mark_failed(entry.id, &reason)?;
                    warn!(id = entry.id, test_id = %entry.test_id, %reason, "journaled submission still failing");
                    report.failed.push((entry.id, reason));
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Recording, StreamKind};
    use crate::metrics::LiveMetrics;
    use crate::session::CompletionTrigger;
    use crate::test_definition::FetchTestResponse;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeApi {
        fail_submit: AtomicBool,
        fail_upload: bool,
        submitted: Mutex<Vec<(String, serde_json::Value)>>,
        uploads: Mutex<Vec<(String, String, bool, bool)>>,
    }

    #[async_trait]
    impl ResultsApi for FakeApi {
        async fn fetch_test(&self, test_id: &str) -> ProctorResult<FetchTestResponse> {
            Err(ProctorError::TestUnavailable {
                test_id: test_id.into(),
                reason: "not used".into(),
            })
        }

        async fn submit_result(
            &self,
            test_id: &str,
            payload: &serde_json::Value,
        ) -> ProctorResult<String> {
            if self.fail_submit.load(Ordering::SeqCst) {
                return Err(ProctorError::SubmissionFailed("503 Service Unavailable".into()));
            }
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push((test_id.to_string(), payload.clone()));
            Ok(format!("r{}", submitted.len()))
        }

        async fn upload_recordings(
            &self,
            test_id: &str,
            result_id: &str,
            artifacts: &CaptureArtifacts,
        ) -> ProctorResult<()> {
            if self.fail_upload {
                return Err(ProctorError::UploadFailed("413 Payload Too Large".into()));
            }
            self.uploads.lock().unwrap().push((
                test_id.into(),
                result_id.into(),
                artifacts.screen.is_some(),
                artifacts.camera.is_some(),
            ));
            Ok(())
        }
    }

    fn thresholds(criteria: PassingCriteria) -> TestDefinition {
        let mut test = TestDefinition::new("t1", "cat");
        test.passing_criteria = criteria;
        test.min_accuracy = 90.0;
        test.min_speed = 40.0;
        test
    }

    fn snapshot(wpm: f64, accuracy: f64) -> CompletionSnapshot {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        CompletionSnapshot {
            trigger: CompletionTrigger::TextMatched,
            metrics: LiveMetrics {
                wpm,
                accuracy,
                peak_wpm: wpm + 10.0,
            },
            started_at: Some(start),
            ended_at: start + chrono::Duration::seconds(30),
            completion_secs: 30,
            final_input: "cat".into(),
            keystrokes: Vec::new(),
            backspace_count: 0,
            letter_data: Vec::new(),
            error_patterns: Vec::new(),
        }
    }

    fn recording(kind: StreamKind) -> Recording {
        Recording {
            kind,
            mime_type: "video/webm;codecs=vp9".into(),
            data: b"chunk".to_vec(),
            chunk_count: 1,
            stopped_cleanly: true,
        }
    }

    #[test]
    fn test_score_is_rounded_composite() {
        assert_eq!(score(95.0, 45.0), 428.0);
        assert_eq!(score(100.0, 0.0), 0.0);
        assert_eq!(score(84.0, 50.0), 420.0);
    }

    #[test]
    fn test_passing_criteria() {
        let both = thresholds(PassingCriteria::Both);
        assert!(!passed(&both, 95.0, 35.0));
        assert!(passed(&both, 95.0, 45.0));
        assert!(!passed(&both, 85.0, 45.0));

        assert!(passed(&thresholds(PassingCriteria::Everyone), 0.0, 0.0));
        assert!(passed(&thresholds(PassingCriteria::Accuracy), 90.0, 1.0));
        assert!(!passed(&thresholds(PassingCriteria::Accuracy), 89.0, 100.0));
        assert!(passed(&thresholds(PassingCriteria::Speed), 10.0, 40.0));
        assert!(!passed(&thresholds(PassingCriteria::Speed), 100.0, 39.0));
    }

    #[test]
    fn test_payload_serializes_with_wire_names() {
        let payload = SubmissionPayload::build(&thresholds(PassingCriteria::Both), &snapshot(45.0, 95.0));
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["score"], 428.0);
        assert_eq!(json["speed"], 45.0);
        assert_eq!(json["completionTime"], 30);
        assert_eq!(json["passed"], true);
        assert_eq!(json["sessionData"]["totalKeystrokes"], 0);
        assert_eq!(json["sessionData"]["peakSpeed"], 55.0);
        assert!(json["sessionData"]["startTime"].is_string());
        assert!(json["letterData"].is_array());
        assert!(json["errorPatterns"].is_array());
    }

    #[tokio::test]
    async fn test_submit_then_upload_with_result_id() {
        let coordinator = SubmissionCoordinator::new(FakeApi::default(), None);
        let artifacts = CaptureArtifacts {
            screen: Some(recording(StreamKind::Display)),
            camera: None,
        };
        let payload = SubmissionPayload::build(&thresholds(PassingCriteria::Both), &snapshot(45.0, 95.0));

        let receipt = coordinator.submit("t1", payload, &artifacts).await.unwrap();

        assert_eq!(receipt.result_id, "r1");
        assert_eq!(receipt.upload, UploadOutcome::Uploaded);
        let uploads = coordinator.api().uploads.lock().unwrap().clone();
        assert_eq!(uploads, vec![("t1".into(), "r1".into(), true, false)]);
    }

    #[tokio::test]
    async fn test_no_recordings_skips_upload() {
        let coordinator = SubmissionCoordinator::new(FakeApi::default(), None);
        let payload = SubmissionPayload::build(&thresholds(PassingCriteria::Everyone), &snapshot(0.0, 100.0));

        let receipt = coordinator
            .submit("t1", payload, &CaptureArtifacts::default())
            .await
            .unwrap();

        assert_eq!(receipt.upload, UploadOutcome::NothingToUpload);
        assert!(coordinator.api().uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_is_not_fatal() {
        let api = FakeApi {
            fail_upload: true,
            ..FakeApi::default()
        };
        let coordinator = SubmissionCoordinator::new(api, None);
        let artifacts = CaptureArtifacts {
            screen: Some(recording(StreamKind::Display)),
            camera: Some(recording(StreamKind::Camera)),
        };
        let payload = SubmissionPayload::build(&thresholds(PassingCriteria::Everyone), &snapshot(30.0, 90.0));

        let receipt = coordinator.submit("t1", payload, &artifacts).await.unwrap();
        assert_matches!(receipt.upload, UploadOutcome::Failed(reason) if reason.contains("413"));
    }

    #[tokio::test]
    async fn test_failed_submission_is_journaled_and_retried() {
        let api = FakeApi::default();
        api.fail_submit.store(true, Ordering::SeqCst);
        let journal = SubmissionJournal::open_in_memory().unwrap();
        let coordinator = SubmissionCoordinator::new(api, Some(journal));
        let artifacts = CaptureArtifacts {
            screen: Some(recording(StreamKind::Display)),
            camera: Some(recording(StreamKind::Camera)),
        };
        let payload = SubmissionPayload::build(&thresholds(PassingCriteria::Both), &snapshot(45.0, 95.0));

        let err = coordinator.submit("t1", payload, &artifacts).await.unwrap_err();
        assert_matches!(err, ProctorError::SubmissionFailed(ref reason) if reason.contains("503"));
        assert!(coordinator.api().uploads.lock().unwrap().is_empty());

        let pending = coordinator.journal().unwrap().pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["score"], 428.0);

        let report = coordinator.retry_pending().await.unwrap();
        assert!(report.sent.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(coordinator.journal().unwrap().pending().unwrap()[0].attempts, 2);

        coordinator.api().fail_submit.store(false, Ordering::SeqCst);
        let report = coordinator.retry_pending().await.unwrap();
        assert_eq!(report.sent, vec![(pending[0].id, "r1".to_string())]);
        assert!(coordinator.journal().unwrap().pending().unwrap().is_empty());
        assert_eq!(coordinator.api().submitted.lock().unwrap()[0].1["passed"], true);
    }
}
