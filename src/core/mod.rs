pub mod compare;
pub mod detector;
pub mod events;
pub mod gate;
pub mod model;
pub mod recognizer;
pub mod token;

pub use compare::{EmbeddingComparator, FaceComparator, MatchResult};
pub use detector::{FaceBox, FaceDetector};
pub use events::{FetchTicket, Frame, SessionId, WorkerEvent};
pub use gate::{CaptureOutcome, FetchStatus, GateOutcome, GateParts, GateState, Notice, RegistrationGate, Rejection};
pub use recognizer::{cosine_similarity, Embedding, FaceRecognizer};
pub use token::{ClassIdentity, TokenFormatError, TOKEN_KEY};
