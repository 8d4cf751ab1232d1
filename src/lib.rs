pub mod camera;
pub mod common;
pub mod core;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use crate::common::{Config, DevMode, RegistrationError, Result};
pub use crate::core::token::{decode, encode, ClassIdentity, TokenFormatError};
pub use crate::core::{FaceComparator, GateOutcome, GateParts, GateState, MatchResult, RegistrationGate};
pub use crate::camera::{CameraSource, CaptureSource};
pub use crate::service::{HttpBackend, ImageBackend, ReferenceFetcher};
pub use crate::storage::{FaceSink, FaceStore, ReferenceSlot};
