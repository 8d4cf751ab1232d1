use thiserror::Error;

use crate::core::token::TokenFormatError;
use crate::service::FetchError;

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Invalid class token: {0}")]
    Token(#[from] TokenFormatError),

    #[error("Reference image fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Reference image missing: {0}")]
    MissingReferenceImage(String),

    #[error("Reference image unusable: {0}")]
    ReferenceUnusable(String),

    #[error("No captured frame available")]
    NoCaptureAvailable,

    #[error("Failed to persist registered face: {0}")]
    Persistence(#[source] std::io::Error),

    #[error("Operation not allowed in state {state}: {action}")]
    InvalidState { state: &'static str, action: &'static str },

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RegistrationError {
    /// The one message shown to the student for this failure.
    pub fn user_message(&self) -> String {
        match self {
            RegistrationError::Token(_) => {
                "The class code is not valid. Ask your teacher for a new one.".to_string()
            }
            RegistrationError::Fetch(e) => e.user_message(),
            RegistrationError::MissingReferenceImage(_) => {
                "Your reference image is not available yet. Start the registration again.".to_string()
            }
            RegistrationError::ReferenceUnusable(_) => {
                "The image on the school server has no usable face. Fetch it again or contact your school."
                    .to_string()
            }
            RegistrationError::NoCaptureAvailable => "You have not taken a picture!".to_string(),
            RegistrationError::Persistence(_) => {
                "Your face matched but could not be saved. Try saving again.".to_string()
            }
            other => format!("An error occurred: {}", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistrationError>;
