use reqwest::{multipart, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("Base url is invalid: {0}")]
    InvalidBaseUrl(String),

    #[error("Audio payload is invalid: {0}")]
    InvalidPayload(String),

    #[error("Resource was not found")]
    NotFound,

    #[error("Failed to reach the speech API: {0}")]
    FetchError(String),

    #[error("Failed to parse speech API response: {0}")]
    ParseError(String),

    #[error("{0}")]
    Other(String),
}

/// The transcription and token statistics for one uploaded recording.
///
/// `spacy_stats` is treated as an opaque object and handed back to the
/// feedback call verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessedAudio {
    pub transcription: String,
    pub spacy_stats: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRequest {
    pub student_id: String,
    pub attempt_id: String,
    pub speech_text: String,
    pub spacy_stats: Value,
}

/// Feedback produced for one speaking attempt
#[derive(Debug, Clone, Deserialize)]
pub struct Feedback {
    pub summary: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FeedbackResponse {
    feedback: Feedback,
}

/// Client for the remote speech-analysis API.
pub struct SpeechClient {
    base: Url,
    client: Client,
}

impl SpeechClient {
    pub fn new(base_url: &str) -> Result<Self, SpeechError> {
        let base = Url::parse(base_url).map_err(|e| SpeechError::InvalidBaseUrl(e.to_string()))?;

        Ok(Self {
            base,
            client: Client::new(),
        })
    }

    /// Uploads a recording for transcription against the expected text.
    pub async fn process_audio(
        &self,
        file_name: &str,
        mime: &str,
        bytes: Vec<u8>,
        expected_text: &str,
    ) -> Result<ProcessedAudio, SpeechError> {
        let url = self.endpoint("process-audio")?;

        let file = multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime)
            .map_err(|e| SpeechError::InvalidPayload(e.to_string()))?;

        let form = multipart::Form::new()
            .part("file", file)
            .text("expected_text", expected_text.to_string());

        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SpeechError::FetchError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(handle_unsuccessful_request(response, status).await);
        }

        response
            .json()
            .await
            .map_err(|e| SpeechError::ParseError(e.to_string()))
    }

    /// Requests feedback for a transcribed attempt.
    pub async fn analyze_feedback(
        &self,
        request: &FeedbackRequest,
    ) -> Result<Feedback, SpeechError> {
        let url = self.endpoint("analyze-feedback")?;

        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| SpeechError::FetchError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(handle_unsuccessful_request(response, status).await);
        }

        let result: FeedbackResponse = response
            .json()
            .await
            .map_err(|e| SpeechError::ParseError(e.to_string()))?;

        Ok(result.feedback)
    }

    fn endpoint(&self, path: &str) -> Result<Url, SpeechError> {
        self.base
            .join(path)
            .map_err(|e| SpeechError::InvalidBaseUrl(e.to_string()))
    }
}

async fn handle_unsuccessful_request(response: Response, status: StatusCode) -> SpeechError {
    if status == StatusCode::NOT_FOUND {
        return SpeechError::NotFound;
    }

    let result = response.text().await;

    match result {
        Ok(text) => SpeechError::Other(text),
        Err(e) => SpeechError::Other(e.to_string()),
    }
}
