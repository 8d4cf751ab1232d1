use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use crate::common::dev_mode::{normalize, DevMode};
use crate::common::error::{RegistrationError, Result};
use crate::service::protocol::DEFAULT_IMAGE_URL;

pub const DEFAULT_CONFIG_PATH: &str = "configs/attendface.toml";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub comparison: ComparisonConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_image_url")]
    pub image_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_image_url() -> String {
    DEFAULT_IMAGE_URL.to_string()
}
fn default_timeout() -> u64 { 15 }

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            image_url: default_image_url(),
            timeout_seconds: default_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,
    #[serde(default = "default_warmup_delay")]
    pub warmup_delay_ms: u64,
}

fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_warmup_frames() -> u32 { 3 }
fn default_warmup_delay() -> u64 { 50 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: default_width(),
            height: default_height(),
            warmup_frames: default_warmup_frames(),
            warmup_delay_ms: default_warmup_delay(),
        }
    }
}

/// Relative paths are resolved against the data directory picked by `DevMode`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_reference_path")]
    pub reference_image_path: PathBuf,
    #[serde(default = "default_registered_path")]
    pub registered_face_path: PathBuf,
}

fn default_reference_path() -> PathBuf { PathBuf::from("reference/reference_image.jpg") }
fn default_registered_path() -> PathBuf { PathBuf::from("faces/registered_image.jpg") }

impl StorageConfig {
    /// Both storage paths under the data directory, refusing a layout where
    /// they end up as the same file.
    pub fn resolve(&self, dev_mode: &DevMode) -> Result<(PathBuf, PathBuf)> {
        let reference = dev_mode.resolve(&self.reference_image_path);
        let registered = dev_mode.resolve(&self.registered_face_path);
        if reference == registered {
            return Err(RegistrationError::Config(format!(
                "reference_image_path and registered_face_path both resolve to {}",
                reference.display()
            )));
        }
        Ok((reference, registered))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            reference_image_path: default_reference_path(),
            registered_face_path: default_registered_path(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ComparisonConfig {
    #[serde(default = "default_detector_path")]
    pub detector_path: PathBuf,
    #[serde(default = "default_recognizer_path")]
    pub recognizer_path: PathBuf,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f32,
    #[serde(default = "default_detector_input")]
    pub detector_input_width: u32,
    #[serde(default = "default_detector_input")]
    pub detector_input_height: u32,
    #[serde(default = "default_recognizer_input")]
    pub recognizer_input_size: u32,
    #[serde(default = "default_normalization_value")]
    pub normalization_value: f32,
    #[serde(default = "default_optimization_level")]
    pub optimization_level: u32,
}

fn default_detector_path() -> PathBuf { PathBuf::from("models/detector.onnx") }
fn default_recognizer_path() -> PathBuf { PathBuf::from("models/recognizer.onnx") }
fn default_similarity_threshold() -> f32 { 0.5 }
fn default_detection_confidence() -> f32 { 0.6 }
fn default_detector_input() -> u32 { 640 }
fn default_recognizer_input() -> u32 { 112 }
fn default_normalization_value() -> f32 { 127.5 }
fn default_optimization_level() -> u32 { 3 }

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            detector_path: default_detector_path(),
            recognizer_path: default_recognizer_path(),
            similarity_threshold: default_similarity_threshold(),
            detection_confidence: default_detection_confidence(),
            detector_input_width: default_detector_input(),
            detector_input_height: default_detector_input(),
            recognizer_input_size: default_recognizer_input(),
            normalization_value: default_normalization_value(),
            optimization_level: default_optimization_level(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from_path(&PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Err(RegistrationError::Config(format!(
                "Config file not found: {}. Please create it from the example.", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| RegistrationError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.image_url.trim().is_empty() {
            return Err(RegistrationError::Config("Backend image_url must not be empty".into()));
        }
        if self.backend.timeout_seconds < 1 || self.backend.timeout_seconds > 300 {
            return Err(RegistrationError::Config(format!(
                "Backend timeout must be between 1 and 300 seconds, got {}",
                self.backend.timeout_seconds
            )));
        }

        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(RegistrationError::Config(format!(
                "Camera width must be between 1 and 4096, got {}", self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(RegistrationError::Config(format!(
                "Camera height must be between 1 and 4096, got {}", self.camera.height
            )));
        }

        if normalize(&self.storage.reference_image_path) == normalize(&self.storage.registered_face_path) {
            return Err(RegistrationError::Config(
                "reference_image_path and registered_face_path must differ".into()
            ));
        }

        let cmp = &self.comparison;
        if !(0.0..=1.0).contains(&cmp.similarity_threshold) {
            return Err(RegistrationError::Config(format!(
                "Similarity threshold must be between 0.0 and 1.0, got {}",
                cmp.similarity_threshold
            )));
        }
        if !(0.0..=1.0).contains(&cmp.detection_confidence) {
            return Err(RegistrationError::Config(format!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                cmp.detection_confidence
            )));
        }
        if cmp.detector_input_width == 0 || cmp.detector_input_width > 4096
            || cmp.detector_input_height == 0 || cmp.detector_input_height > 4096 {
            return Err(RegistrationError::Config(format!(
                "Detector input must be between 1 and 4096 on each side, got {}x{}",
                cmp.detector_input_width, cmp.detector_input_height
            )));
        }
        if cmp.recognizer_input_size == 0 || cmp.recognizer_input_size > 1024 {
            return Err(RegistrationError::Config(format!(
                "Recognizer input size must be between 1 and 1024, got {}",
                cmp.recognizer_input_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.backend.image_url, "http://127.0.0.1:5000/get_student_image");
        assert_eq!(config.camera.device_index, 0);
        assert_eq!(config.comparison.recognizer_input_size, 112);
    }

    #[test]
    fn partial_sections_fill_in() {
        let config = Config::from_toml(
            r#"
            [backend]
            image_url = "http://school.example/get_student_image"

            [camera]
            device_index = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.image_url, "http://school.example/get_student_image");
        assert_eq!(config.backend.timeout_seconds, 15);
        assert_eq!(config.camera.device_index, 2);
        assert_eq!(config.camera.width, 640);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = Config::from_toml("[comparison]\nsimilarity_threshold = 1.5\n").unwrap_err();
        assert!(matches!(err, RegistrationError::Config(_)));
    }

    #[test]
    fn rejects_shared_storage_path() {
        let err = Config::from_toml(
            "[storage]\nreference_image_path = \"a.jpg\"\nregistered_face_path = \"a.jpg\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, RegistrationError::Config(_)));
    }

    #[test]
    fn rejects_storage_paths_differing_only_in_spelling() {
        let err = Config::from_toml(
            "[storage]\nreference_image_path = \"a.jpg\"\nregistered_face_path = \"./a.jpg\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, RegistrationError::Config(_)));
    }

    #[test]
    fn rejects_storage_paths_colliding_after_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mode = DevMode::with_base_dir(false, dir.path().to_path_buf()).unwrap();
        let storage = StorageConfig {
            reference_image_path: PathBuf::from("faces/a.jpg"),
            registered_face_path: dir.path().join("faces/a.jpg"),
        };
        let config = Config { storage: storage.clone(), ..Config::default() };
        assert!(config.validate().is_ok());
        assert!(matches!(storage.resolve(&mode), Err(RegistrationError::Config(_))));

        let (reference, registered) = StorageConfig::default().resolve(&mode).unwrap();
        assert_eq!(reference, dir.path().join("reference/reference_image.jpg"));
        assert_eq!(registered, dir.path().join("faces/registered_image.jpg"));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(Config::from_toml("[camera\n"), Err(RegistrationError::Config(_))));
    }
}
