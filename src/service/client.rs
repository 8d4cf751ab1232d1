use crate::common::config::BackendConfig;
use crate::service::protocol::{ErrorBody, ImageRequest};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("could not store reference image: {0}")]
    Storage(String),

    #[error("fetch was abandoned")]
    Cancelled,
}

impl FetchError {
    pub fn user_message(&self) -> String {
        match self {
            FetchError::Backend { message, .. } => {
                format!("The school server refused the request: {}", message)
            }
            FetchError::Transport(_) => {
                "Could not reach the school server. Check your connection and try again.".to_string()
            }
            FetchError::Storage(_) => {
                "The reference image could not be saved on this computer.".to_string()
            }
            FetchError::Cancelled => "The reference image request was cancelled.".to_string(),
        }
    }
}

/// Anything that can hand back the reference image for a student.
pub trait ImageBackend: Send + Sync {
    fn fetch_image(&self, request: &ImageRequest) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpBackend {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| FetchError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: config.image_url.clone(),
            client,
        })
    }
}

impl ImageBackend for HttpBackend {
    fn fetch_image(&self, request: &ImageRequest) -> Result<Vec<u8>, FetchError> {
        tracing::debug!("POST {} for student {}", self.url, request.national_code);

        let response = self.client
            .post(&self.url)
            .json(request)
            .send()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes()
                .map_err(|e| FetchError::Transport(format!("failed to read body: {}", e)))?;
            if bytes.is_empty() {
                return Err(FetchError::Backend {
                    status: status.as_u16(),
                    message: "empty image body".to_string(),
                });
            }
            return Ok(bytes.to_vec());
        }

        let body = response.text().unwrap_or_default();
        Err(backend_error(status.as_u16(), &body, status.canonical_reason()))
    }
}

/// Turn a non-success reply into a `FetchError`, preferring the server's own
/// `error` message.
pub fn backend_error(status: u16, body: &str, reason: Option<&str>) -> FetchError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .filter(|m| !m.trim().is_empty())
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.chars().take(200).collect())
        })
        .or_else(|| reason.map(str::to_string))
        .unwrap_or_else(|| "unknown error".to_string());

    FetchError::Backend { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_server_error_field() {
        let err = backend_error(404, r#"{"error": "Student not found"}"#, Some("Not Found"));
        assert_eq!(err, FetchError::Backend { status: 404, message: "Student not found".into() });
    }

    #[test]
    fn falls_back_to_raw_body() {
        let err = backend_error(500, "  internal failure \n", Some("Internal Server Error"));
        assert_eq!(err, FetchError::Backend { status: 500, message: "internal failure".into() });
    }

    #[test]
    fn falls_back_to_reason_phrase() {
        let err = backend_error(503, "", Some("Service Unavailable"));
        assert_eq!(err, FetchError::Backend { status: 503, message: "Service Unavailable".into() });

        let err = backend_error(599, r#"{"error": ""}"#, None);
        assert!(matches!(err, FetchError::Backend { status: 599, .. }));
    }

    #[test]
    fn request_serializes_expected_fields() {
        let request = ImageRequest {
            school_code: "123".into(),
            class_name: "1052".into(),
            national_code: "09295".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&request).unwrap();
        assert_eq!(json["school_code"], "123");
        assert_eq!(json["class_name"], "1052");
        assert_eq!(json["national_code"], "09295");
    }
}
