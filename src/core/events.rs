use std::fmt;
use crate::service::FetchError;
use crate::storage::reference::ReferenceStamp;

/// Identifies one registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Names one fetch: restarting the fetch bumps the generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub session: SessionId,
    pub generation: u32,
}

/// Encoded image bytes (JPEG or PNG) as they came off the capture source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Results handed from worker threads to the thread that owns the gate.
#[derive(Debug)]
pub enum WorkerEvent {
    Fetched {
        ticket: FetchTicket,
        result: Result<ReferenceStamp, FetchError>,
    },
    Captured {
        session: SessionId,
        seq: u64,
        frame: Option<Frame>,
    },
}
