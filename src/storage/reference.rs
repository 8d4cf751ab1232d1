use crate::common::{RegistrationError, Result};
use crate::core::token::ClassIdentity;
use crate::storage::{sidecar_path, write_atomic, STORAGE_VERSION};
use serde::{Serialize, Deserialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Written next to the reference image so a later reader can tell whose
/// image is sitting at the fixed path and whether it is intact.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReferenceStamp {
    pub version: u32,
    pub school_code: String,
    pub class_name: String,
    pub student_id: String,
    pub sha256: String,
    pub fetched_at: i64,
}

impl ReferenceStamp {
    fn belongs_to(&self, identity: &ClassIdentity, student_id: &str) -> bool {
        self.school_code == identity.school_code
            && self.class_name == identity.class_name
            && self.student_id == student_id
    }
}

/// The single well-known location of the reference image.
#[derive(Debug, Clone)]
pub struct ReferenceSlot {
    image_path: PathBuf,
    stamp_path: PathBuf,
}

impl ReferenceSlot {
    pub fn new(image_path: PathBuf) -> Self {
        let stamp_path = sidecar_path(&image_path, ".stamp");
        Self { image_path, stamp_path }
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    /// Overwrites whatever is at the slot. Image first, stamp second.
    pub fn store(&self, identity: &ClassIdentity, student_id: &str, image: &[u8]) -> Result<ReferenceStamp> {
        let stamp = ReferenceStamp {
            version: STORAGE_VERSION,
            school_code: identity.school_code.clone(),
            class_name: identity.class_name.clone(),
            student_id: student_id.to_string(),
            sha256: digest(image),
            fetched_at: chrono::Utc::now().timestamp(),
        };

        write_atomic(&self.image_path, image)?;
        let encoded = bincode::serialize(&stamp)
            .map_err(|e| RegistrationError::Storage(format!("Failed to serialize stamp: {}", e)))?;
        write_atomic(&self.stamp_path, &encoded)?;

        tracing::debug!("Stored reference image ({} bytes) at {:?}", image.len(), self.image_path);
        Ok(stamp)
    }

    pub fn read_stamp(&self) -> Result<Option<ReferenceStamp>> {
        let data = match fs::read(&self.stamp_path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stamp = bincode::deserialize(&data)
            .map_err(|e| RegistrationError::Storage(format!("Failed to deserialize stamp: {}", e)))?;
        Ok(Some(stamp))
    }

    /// Read the reference image, but only if the stamp says it was fetched
    /// for this identity and student and the bytes still hash to the stamp.
    pub fn load_verified(&self, identity: &ClassIdentity, student_id: &str) -> Result<Vec<u8>> {
        let missing = |reason: String| RegistrationError::MissingReferenceImage(reason);

        let stamp = match self.read_stamp() {
            Ok(Some(stamp)) => stamp,
            Ok(None) => return Err(missing(format!("no reference image at {}", self.image_path.display()))),
            Err(e) => return Err(missing(format!("unreadable stamp: {}", e))),
        };
        if !stamp.belongs_to(identity, student_id) {
            return Err(missing("reference image belongs to another session".to_string()));
        }

        let image = match fs::read(&self.image_path) {
            Ok(image) => image,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(missing(format!("no reference image at {}", self.image_path.display())));
            }
            Err(e) => return Err(missing(format!("unreadable reference image: {}", e))),
        };
        if digest(&image) != stamp.sha256 {
            return Err(missing("reference image changed since it was fetched".to_string()));
        }

        Ok(image)
    }
}

fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ClassIdentity {
        ClassIdentity::new("123", "1052")
    }

    #[test]
    fn stored_image_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let slot = ReferenceSlot::new(dir.path().join("reference/ref.jpg"));

        let stamp = slot.store(&identity(), "09295", b"jpeg-bytes").unwrap();
        assert_eq!(stamp.student_id, "09295");
        assert_eq!(slot.read_stamp().unwrap(), Some(stamp));
        assert_eq!(slot.load_verified(&identity(), "09295").unwrap(), b"jpeg-bytes");
    }

    #[test]
    fn empty_slot_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let slot = ReferenceSlot::new(dir.path().join("ref.jpg"));

        assert!(slot.read_stamp().unwrap().is_none());
        assert!(matches!(
            slot.load_verified(&identity(), "09295"),
            Err(RegistrationError::MissingReferenceImage(_))
        ));
    }

    #[test]
    fn image_for_another_student_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let slot = ReferenceSlot::new(dir.path().join("ref.jpg"));
        slot.store(&identity(), "11111", b"someone-else").unwrap();

        assert!(matches!(
            slot.load_verified(&identity(), "09295"),
            Err(RegistrationError::MissingReferenceImage(_))
        ));
        assert!(matches!(
            slot.load_verified(&ClassIdentity::new("123", "other"), "11111"),
            Err(RegistrationError::MissingReferenceImage(_))
        ));
    }

    #[test]
    fn image_replaced_without_stamp_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.jpg");
        let slot = ReferenceSlot::new(path.clone());
        slot.store(&identity(), "09295", b"original").unwrap();

        fs::write(&path, b"tampered").unwrap();
        assert!(matches!(
            slot.load_verified(&identity(), "09295"),
            Err(RegistrationError::MissingReferenceImage(_))
        ));
    }
}
