//! HTTP collaborators: fetch a test, submit a graded result, upload the
//! recordings that back it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, info};

use crate::capture::{CaptureArtifacts, Recording};
use crate::error::{ProctorError, ProctorResult};
use crate::test_definition::FetchTestResponse;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait ResultsApi: Send + Sync {
    /// `GET /tests/{id}`
    async fn fetch_test(&self, test_id: &str) -> ProctorResult<FetchTestResponse>;

    /// `POST /tests/{id}/submit`, returning the server-issued result id.
    async fn submit_result(
        &self,
        test_id: &str,
        payload: &serde_json::Value,
    ) -> ProctorResult<String>;

    /// `POST /tests/{id}/upload-recordings` as multipart form data.
    async fn upload_recordings(
        &self,
        test_id: &str,
        result_id: &str,
        artifacts: &CaptureArtifacts,
    ) -> ProctorResult<()>;
}

#[async_trait]
impl<T: ResultsApi + ?Sized> ResultsApi for Arc<T> {
    async fn fetch_test(&self, test_id: &str) -> ProctorResult<FetchTestResponse> {
        (**self).fetch_test(test_id).await
    }

    async fn submit_result(
        &self,
        test_id: &str,
        payload: &serde_json::Value,
    ) -> ProctorResult<String> {
        (**self).submit_result(test_id, payload).await
    }

    async fn upload_recordings(
        &self,
        test_id: &str,
        result_id: &str,
        artifacts: &CaptureArtifacts,
    ) -> ProctorResult<()> {
        (**self).upload_recordings(test_id, result_id, artifacts).await
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    result: SubmittedResult,
}

#[derive(Debug, Deserialize)]
struct SubmittedResult {
    id: serde_json::Value,
}

impl SubmittedResult {
    /// Servers hand out either string or numeric ids.
    fn id_string(&self) -> Option<String> {
        match &self.id {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResultsApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpResultsApi {
    pub fn new(base_url: &str, token: Option<String>) -> ProctorResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let base_url = base_url.trim_end_matches('/').to_string();
        info!(%base_url, authenticated = token.is_some(), "results api client created");
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, test_id: &str, tail: &str) -> String {
        if tail.is_empty() {
            format!("{}/tests/{}", self.base_url, test_id)
        } else {
            format!("{}/tests/{}/{}", self.base_url, test_id, tail)
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn recording_part(recording: &Recording) -> ProctorResult<Part> {
    let mime = recording
        .mime_type
        .split(';')
        .next()
        .unwrap_or("video/webm")
        .to_string();
    Part::bytes(recording.data.clone())
        .file_name(recording.file_name())
        .mime_str(&mime)
        .map_err(|e| ProctorError::UploadFailed(format!("bad recording part: {e}")))
}

async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if body.is_empty() {
        status.to_string()
    } else {
        format!("{status} - {body}")
    }
}

#[async_trait]
impl ResultsApi for HttpResultsApi {
    async fn fetch_test(&self, test_id: &str) -> ProctorResult<FetchTestResponse> {
        let unavailable = |reason: String| ProctorError::TestUnavailable {
            test_id: test_id.to_string(),
            reason,
        };

        let url = self.url(test_id, "");
        debug!(%url, "fetching test");
        let response = self
            .authorize(self.client.get(&url).timeout(REQUEST_TIMEOUT))
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(unavailable(error_body(response).await));
        }
        response
            .json::<FetchTestResponse>()
            .await
            .map_err(|e| unavailable(format!("unreadable test definition: {e}")))
    }

    async fn submit_result(
        &self,
        test_id: &str,
        payload: &serde_json::Value,
    ) -> ProctorResult<String> {
        let url = self.url(test_id, "submit");
        debug!(%url, "submitting result");
        let response = self
            .authorize(self.client.post(&url).timeout(REQUEST_TIMEOUT))
            .json(payload)
            .send()
            .await
            .map_err(|e| ProctorError::SubmissionFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProctorError::SubmissionFailed(error_body(response).await));
        }

        let body = response
            .json::<SubmitResponse>()
            .await
            .map_err(|e| ProctorError::SubmissionFailed(format!("unreadable response: {e}")))?;
        body.result
            .id_string()
            .ok_or_else(|| ProctorError::SubmissionFailed("response carried no result id".into()))
    }

    async fn upload_recordings(
        &self,
        test_id: &str,
        result_id: &str,
        artifacts: &CaptureArtifacts,
    ) -> ProctorResult<()> {
        let mut form = Form::new();
        if let Some(screen) = &artifacts.screen {
            form = form.part("screenRecording", recording_part(screen)?);
        }
        if let Some(camera) = &artifacts.camera {
            form = form.part("cameraRecording", recording_part(camera)?);
        }
        form = form.text("resultId", result_id.to_string());

        let url = self.url(test_id, "upload-recordings");
        debug!(%url, result_id, "uploading recordings");
        let response = self
            .authorize(self.client.post(&url).timeout(UPLOAD_TIMEOUT))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProctorError::UploadFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProctorError::UploadFailed(error_body(response).await));
        }
        Ok(())
    }
}
