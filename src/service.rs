use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::config::ResolvedService;

/// Failure talking to the annotation service. Classification drives the
/// transport retry loop: only transient failures consume retry budget.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service returned http {status}: {message}")]
    Status {
        status: u16,
        retryable: bool,
        message: String,
    },
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
}

impl ServiceError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { retryable, .. } => *retryable,
            // Connectivity and timeouts are worth retrying; anything the
            // client itself got wrong is not.
            Self::Network(err) => !err.is_builder() && !err.is_body() && !err.is_decode(),
        }
    }
}

/// Structural failure in an otherwise delivered response. Retried on its
/// own, larger budget.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("response is not a JSON object")]
    NotObject,
    #[error("response missing `{0}`")]
    MissingField(&'static str),
    #[error("response field `{0}` has the wrong shape")]
    WrongShape(&'static str),
}

/// Validated top-level response shape. Containers stay as raw JSON;
/// individual entries are interpreted leniently by the integrator.
#[derive(Clone, Debug, Default)]
pub struct AnnotationResponse {
    pub word_data: serde_json::Map<String, Value>,
    pub segment_data: serde_json::Map<String, Value>,
    pub idioms: Vec<Value>,
}

/// Check the annotation contract: a JSON object carrying `wordData`
/// (object), `segmentData` (object) and `idioms` (array). Anything else is
/// a validation failure and re-issues the call.
pub fn validate_response(raw: &str) -> Result<AnnotationResponse, ValidationError> {
    let value: Value = serde_json::from_str(raw)?;
    let Some(object) = value.as_object() else {
        return Err(ValidationError::NotObject);
    };
    let field = |name: &'static str| {
        object
            .get(name)
            .ok_or(ValidationError::MissingField(name))
    };
    let word_data = field("wordData")?
        .as_object()
        .ok_or(ValidationError::WrongShape("wordData"))?
        .clone();
    let segment_data = field("segmentData")?
        .as_object()
        .ok_or(ValidationError::WrongShape("segmentData"))?
        .clone();
    let idioms = field("idioms")?
        .as_array()
        .ok_or(ValidationError::WrongShape("idioms"))?
        .clone();
    Ok(AnnotationResponse {
        word_data,
        segment_data,
        idioms,
    })
}

/// Lenient per-word wire record. `word` must be present (it marks the entry
/// as word-shaped) but is discarded on merge in favor of the stored surface.
/// Absent fields leave the stored value alone.
#[derive(Clone, Debug, Deserialize)]
pub struct WireWordEntry {
    #[allow(dead_code)]
    pub word: String,
    #[serde(default)]
    pub pos: Option<String>,
    #[serde(default)]
    pub lemma: Option<String>,
    #[serde(default)]
    pub best_translation: Option<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub possible_translations: Option<Vec<String>>,
    #[serde(default)]
    pub details: Option<serde_json::Map<String, Value>>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub lemma_translations: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireSegment {
    pub id: String,
    #[serde(rename = "startWordKey")]
    pub start_word_key: u32,
    #[serde(rename = "endWordKey")]
    pub end_word_key: u32,
    pub translations: serde_json::Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireIdiom {
    pub id: String,
    pub text: String,
    #[serde(rename = "startWordKey")]
    pub start_word_key: u32,
    #[serde(rename = "endWordKey")]
    pub end_word_key: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// Models sometimes flatten a list into one comma-separated string.
fn string_or_list<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<String>>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        One(String),
    }
    Ok(match Option::<Raw>::deserialize(de)? {
        None => None,
        Some(Raw::List(list)) => Some(list),
        Some(Raw::One(s)) => Some(
            s.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect(),
        ),
    })
}

/// What a blocked or empty completion degrades to: a structurally valid
/// response that annotates nothing.
pub const EMPTY_RESPONSE_JSON: &str = r#"{"wordData":{},"segmentData":{},"idioms":[]}"#;

/// The seam to the external annotation service. The pipeline only ever sees
/// this trait, so tests drive it with scripted clients.
#[allow(async_fn_in_trait)]
pub trait AnnotationClient {
    async fn annotate(&self, prompt: &str) -> Result<String, ServiceError>;
}

/// Reference client for a Gemini-style `generateContent` REST endpoint.
pub struct HttpAnnotationClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl HttpAnnotationClient {
    pub fn new(service: &ResolvedService) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(service.timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url: service.base_url.trim_end_matches('/').to_string(),
            model: service.model.clone(),
            api_key: service.api_key.clone(),
        })
    }
}

impl AnnotationClient for HttpAnnotationClient {
    async fn annotate(&self, prompt: &str) -> Result<String, ServiceError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "response_mime_type": "application/json" },
        });
        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let retryable = matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 529);
            let message = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                status: status.as_u16(),
                retryable,
                message,
            });
        }
        let value: Value = response.json().await?;
        // A blocked/empty candidate is not an error; it just carries nothing.
        Ok(candidate_text(&value).unwrap_or_else(|| EMPTY_RESPONSE_JSON.to_string()))
    }
}

fn candidate_text(value: &Value) -> Option<String> {
    value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()
        .map(|s| s.to_string())
}
