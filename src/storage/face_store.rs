use crate::common::{DevMode, RegistrationError, Result};
use crate::core::token::ClassIdentity;
use crate::storage::{sidecar_path, write_atomic, STORAGE_VERSION};
use serde::{Serialize, Deserialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Who a committed face belongs to.
#[derive(Debug, Clone, Copy)]
pub struct Registration<'a> {
    pub identity: &'a ClassIdentity,
    pub student_id: &'a str,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub version: u32,
    pub school_code: String,
    pub class_name: String,
    pub student_id: String,
    pub image_len: u64,
    pub registered_at: i64,
}

/// Where an accepted face ends up. Writing here is what "registered" means.
pub trait FaceSink {
    fn commit(&self, registration: &Registration<'_>, image: &[u8]) -> std::io::Result<()>;
}

pub struct FaceStore {
    image_path: PathBuf,
    record_path: PathBuf,
}

impl FaceStore {
    pub fn new(image_path: PathBuf) -> Self {
        let record_path = sidecar_path(&image_path, ".record");
        Self { image_path, record_path }
    }

    pub fn new_with_dev_mode(image_path: &Path, dev_mode: &DevMode) -> Self {
        let resolved = dev_mode.resolve(image_path);
        if dev_mode.is_enabled() {
            tracing::debug!("FaceStore writing to dev path: {:?}", resolved);
        }
        Self::new(resolved)
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn load_record(&self) -> Result<Option<RegistrationRecord>> {
        let data = match fs::read(&self.record_path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut record: RegistrationRecord = bincode::deserialize(&data)
            .map_err(|e| RegistrationError::Storage(format!("Failed to deserialize: {}", e)))?;

        if record.version < STORAGE_VERSION {
            record.version = STORAGE_VERSION;
        }
        Ok(Some(record))
    }
}

impl FaceSink for FaceStore {
    fn commit(&self, registration: &Registration<'_>, image: &[u8]) -> std::io::Result<()> {
        let record = RegistrationRecord {
            version: STORAGE_VERSION,
            school_code: registration.identity.school_code.clone(),
            class_name: registration.identity.class_name.clone(),
            student_id: registration.student_id.to_string(),
            image_len: image.len() as u64,
            registered_at: chrono::Utc::now().timestamp(),
        };
        let encoded = bincode::serialize(&record)
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;

        write_atomic(&self.image_path, image)?;
        write_atomic(&self.record_path, &encoded)?;

        tracing::info!("Face for student {} saved as {:?}", registration.student_id, self.image_path);
        Ok(())
    }
}
