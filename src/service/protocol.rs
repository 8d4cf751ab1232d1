use serde::{Serialize, Deserialize};

/// Body of the POST to the backend image endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub school_code: String,
    pub class_name: String,
    pub national_code: String,
}

/// Body the backend sends with a non-success status.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
}

pub const DEFAULT_IMAGE_URL: &str = "http://127.0.0.1:5000/get_student_image";
