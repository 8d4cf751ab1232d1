use crate::common::{RegistrationError, Result};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder};
use std::path::Path;
use std::sync::Arc;

/// An ONNX session together with the environment it must outlive.
pub struct OnnxModel {
    pub session: Session,
    _environment: Arc<Environment>,
}

impl OnnxModel {
    pub fn load(name: &str, model_path: &Path, optimization_level: u32) -> Result<Self> {
        if !model_path.exists() {
            return Err(RegistrationError::Model(
                format!("{} model not found at: {:?}", name, model_path)
            ));
        }

        let environment = Arc::new(
            Environment::builder()
                .with_name(name)
                .build()
                .map_err(|e| RegistrationError::Model(format!("Failed to create environment: {}", e)))?
        );

        let opt_level = match optimization_level {
            0 => GraphOptimizationLevel::Disable,
            1 => GraphOptimizationLevel::Level1,
            2 => GraphOptimizationLevel::Level2,
            _ => GraphOptimizationLevel::Level3,
        };
        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(opt_level)?
            .with_model_from_file(model_path)?;

        tracing::debug!("Loaded {} model from {:?}", name, model_path);
        Ok(Self { session, _environment: environment })
    }
}
