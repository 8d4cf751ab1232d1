//! The registration gate: decides whether a live capture may be written as
//! the student's registered face.
//!
//! ```text
//! Idle --begin--> AwaitingCapture --commit--> Verifying --+--> Accepted (sink write)
//!                    ^     |                              |
//!                    |     +--(reference missing)--> Error
//!                    +--------(rejected)------------------+
//! ```
//!
//! The gate lives on one control thread. The reference fetch and the camera
//! run on worker threads and hand their results back over a channel; nothing
//! on a worker touches gate state directly. Results are tagged with the
//! session and a fetch generation / capture sequence so late answers from an
//! abandoned request are dropped instead of applied.

use crate::camera::{CaptureSource, CaptureWorker};
use crate::common::{RegistrationError, Result};
use crate::core::compare::{FaceComparator, MatchResult};
use crate::core::events::{FetchTicket, Frame, SessionId, WorkerEvent};
use crate::core::token::{self, ClassIdentity};
use crate::service::{FetchError, FetchHandle, ReferenceFetcher};
use crate::storage::face_store::{FaceSink, Registration};
use crate::storage::reference::ReferenceStamp;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Idle,
    AwaitingCapture,
    Verifying,
    /// Comparison passed. `persisted` is false while the sink write is
    /// still owed.
    Accepted { persisted: bool },
    Error(String),
    Cancelled,
}

impl GateState {
    pub fn name(&self) -> &'static str {
        match self {
            GateState::Idle => "Idle",
            GateState::AwaitingCapture => "AwaitingCapture",
            GateState::Verifying => "Verifying",
            GateState::Accepted { .. } => "Accepted",
            GateState::Error(_) => "Error",
            GateState::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GateState::Accepted { persisted: true } | GateState::Error(_) | GateState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NoMatch,
    InvalidFace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Registered,
    Rejected(Rejection),
}

impl GateOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            GateOutcome::Registered => "Your face has been registered.",
            GateOutcome::Rejected(Rejection::NoMatch) => {
                "Your image does not match the image in the system!"
            }
            GateOutcome::Rejected(Rejection::InvalidFace) => {
                "No usable face was found in the picture. Please take another one."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    NotStarted,
    InFlight,
    Ready(ReferenceStamp),
    Failed(FetchError),
}

/// Something a worker reported that the user should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    ReferenceReady,
    FetchFailed(FetchError),
    FrameCaptured { bytes: usize },
    NoFrame,
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::ReferenceReady => "Reference image received.".to_string(),
            Notice::FetchFailed(e) => e.user_message(),
            Notice::FrameCaptured { .. } => "Picture taken.".to_string(),
            Notice::NoFrame => "The camera returned no picture. Try again.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured { bytes: usize },
    NoFrame,
    TimedOut,
}

/// Everything the gate drives, handed over at construction.
pub struct GateParts {
    pub fetcher: ReferenceFetcher,
    pub capture: Box<dyn CaptureSource>,
    pub comparator: Box<dyn FaceComparator>,
    pub sink: Box<dyn FaceSink>,
}

pub struct RegistrationGate {
    session: SessionId,
    identity: ClassIdentity,
    student_id: String,
    state: GateState,

    fetcher: ReferenceFetcher,
    fetch: Option<FetchHandle>,
    fetch_generation: u32,
    fetch_status: FetchStatus,

    capture_source: Option<Box<dyn CaptureSource>>,
    capture: Option<CaptureWorker>,
    requested_seq: u64,
    applied_seq: u64,
    captured_frame: Option<Frame>,
    reference_image: Option<Vec<u8>>,

    comparator: Box<dyn FaceComparator>,
    sink: Box<dyn FaceSink>,

    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,
    pending: Vec<Notice>,
}

impl RegistrationGate {
    /// Decode the class token and set up an idle session. A bad token means
    /// there is no session at all.
    pub fn new(class_token: &str, student_id: &str, parts: GateParts) -> Result<Self> {
        let identity = token::decode(class_token)?;
        let student_id = student_id.trim();
        if student_id.is_empty() {
            return Err(RegistrationError::Other(anyhow::anyhow!("student id is empty")));
        }

        let session = SessionId::random();
        tracing::info!("Registration session {} for student {} in {}", session, student_id, identity);

        let (events_tx, events_rx) = mpsc::channel();
        Ok(Self {
            session,
            identity,
            student_id: student_id.to_string(),
            state: GateState::Idle,
            fetcher: parts.fetcher,
            fetch: None,
            fetch_generation: 0,
            fetch_status: FetchStatus::NotStarted,
            capture_source: Some(parts.capture),
            capture: None,
            requested_seq: 0,
            applied_seq: 0,
            captured_frame: None,
            reference_image: None,
            comparator: parts.comparator,
            sink: parts.sink,
            events_tx,
            events_rx,
            pending: Vec::new(),
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn identity(&self) -> &ClassIdentity {
        &self.identity
    }

    pub fn student_id(&self) -> &str {
        &self.student_id
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn fetch_status(&self) -> &FetchStatus {
        &self.fetch_status
    }

    pub fn captured_frame(&self) -> Option<&Frame> {
        self.captured_frame.as_ref()
    }

    /// Idle -> AwaitingCapture. Starts the camera worker and the reference
    /// fetch; neither is waited on.
    pub fn begin(&mut self) -> Result<()> {
        self.expect_state(matches!(self.state, GateState::Idle), "begin")?;

        let source = self.capture_source.take().ok_or_else(|| {
            RegistrationError::Camera("capture source already consumed".into())
        })?;
        self.capture = Some(CaptureWorker::spawn(source, self.session, self.events_tx.clone())?);
        self.start_fetch();

        self.state = GateState::AwaitingCapture;
        Ok(())
    }

    /// Start the reference fetch over, e.g. after a `FetchError`. Refused
    /// while the current fetch is still running, so only one fetch per
    /// session ever writes the reference slot.
    pub fn refetch(&mut self) -> Result<()> {
        self.expect_state(self.state == GateState::AwaitingCapture, "refetch")?;
        self.drain_events();
        self.expect_state(self.fetch_status != FetchStatus::InFlight, "refetch while a fetch is running")?;
        self.start_fetch();
        Ok(())
    }

    fn start_fetch(&mut self) {
        if let Some(old) = self.fetch.take() {
            old.cancel();
        }
        self.fetch_generation += 1;
        let ticket = FetchTicket { session: self.session, generation: self.fetch_generation };

        tracing::debug!("Starting reference fetch {} for session {}", ticket.generation, self.session);
        self.fetch = Some(self.fetcher.spawn(ticket, &self.identity, &self.student_id, self.events_tx.clone()));
        self.fetch_status = FetchStatus::InFlight;
    }

    /// Ask the camera worker for a frame. The result arrives through `pump`
    /// or `wait_for_capture`.
    pub fn request_capture(&mut self) -> Result<u64> {
        self.expect_state(self.state == GateState::AwaitingCapture, "capture")?;

        let worker = self.capture.as_ref()
            .ok_or_else(|| RegistrationError::Camera("capture worker not running".into()))?;
        let seq = self.requested_seq + 1;
        if !worker.request(seq) {
            return Err(RegistrationError::Camera("capture worker stopped".into()));
        }
        self.requested_seq = seq;
        Ok(seq)
    }

    /// Apply everything the workers have reported so far.
    pub fn pump(&mut self) -> Vec<Notice> {
        self.drain_events();
        std::mem::take(&mut self.pending)
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            if let Some(notice) = self.apply(event) {
                self.pending.push(notice);
            }
        }
    }

    /// Request a capture and block until its result (or a newer one) has
    /// been applied.
    pub fn capture(&mut self, timeout: Duration) -> Result<CaptureOutcome> {
        self.request_capture()?;
        Ok(self.wait_for_capture(timeout))
    }

    pub fn wait_for_capture(&mut self, timeout: Duration) -> CaptureOutcome {
        let deadline = Instant::now() + timeout;
        while self.applied_seq < self.requested_seq {
            let Some(event) = self.next_event(deadline) else {
                return CaptureOutcome::TimedOut;
            };
            if let Some(notice) = self.apply(event) {
                match notice {
                    Notice::FrameCaptured { .. } | Notice::NoFrame => {}
                    other => self.pending.push(other),
                }
            }
        }

        match &self.captured_frame {
            Some(frame) => CaptureOutcome::Captured { bytes: frame.len() },
            None => CaptureOutcome::NoFrame,
        }
    }

    /// Block until the current fetch reports or the timeout passes.
    pub fn wait_for_fetch(&mut self, timeout: Duration) -> &FetchStatus {
        let deadline = Instant::now() + timeout;
        while self.fetch_status == FetchStatus::InFlight {
            let Some(event) = self.next_event(deadline) else {
                break;
            };
            if let Some(notice) = self.apply(event) {
                self.pending.push(notice);
            }
        }
        &self.fetch_status
    }

    fn next_event(&self, deadline: Instant) -> Option<WorkerEvent> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.events_rx.recv_timeout(remaining) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn apply(&mut self, event: WorkerEvent) -> Option<Notice> {
        match event {
            WorkerEvent::Fetched { ticket, result } => {
                let current = self.fetch.as_ref().map(|h| h.ticket());
                if ticket.session != self.session || current != Some(ticket) {
                    tracing::debug!("Ignoring stale fetch result (generation {})", ticket.generation);
                    return None;
                }
                match result {
                    Ok(stamp) => {
                        self.fetch_status = FetchStatus::Ready(stamp);
                        Some(Notice::ReferenceReady)
                    }
                    Err(e) => {
                        tracing::warn!("Reference fetch failed: {}", e);
                        self.fetch_status = FetchStatus::Failed(e.clone());
                        Some(Notice::FetchFailed(e))
                    }
                }
            }
            WorkerEvent::Captured { session, seq, frame } => {
                if session != self.session || seq <= self.applied_seq {
                    tracing::debug!("Ignoring stale capture result (seq {})", seq);
                    return None;
                }
                self.applied_seq = seq;
                if self.state != GateState::AwaitingCapture {
                    return None;
                }
                // Newest result wins, even an empty one
                self.captured_frame = frame;
                match &self.captured_frame {
                    Some(frame) => Some(Notice::FrameCaptured { bytes: frame.len() }),
                    None => Some(Notice::NoFrame),
                }
            }
        }
    }

    /// The user pressed "add face".
    pub fn commit(&mut self) -> Result<GateOutcome> {
        self.drain_events();

        if self.state == (GateState::Accepted { persisted: false }) {
            return Err(RegistrationError::InvalidState {
                state: self.state.name(),
                action: "commit (use retry_persist)",
            });
        }
        self.expect_state(self.state == GateState::AwaitingCapture, "commit")?;

        let frame = self.captured_frame.clone().ok_or(RegistrationError::NoCaptureAvailable)?;

        let reference = match self.fetcher.slot().load_verified(&self.identity, &self.student_id) {
            Ok(reference) => reference,
            Err(e) => {
                tracing::error!("Cannot verify session {}: {}", self.session, e);
                self.fail(e.to_string());
                return Err(e);
            }
        };
        self.reference_image = Some(reference);
        self.state = GateState::Verifying;

        let reference = self.reference_image.as_deref().unwrap_or_default();
        let result = match self.comparator.compare(frame.as_bytes(), reference) {
            Ok(result) => result,
            Err(e @ RegistrationError::ReferenceUnusable(_)) => {
                // Retaking the picture cannot help; the student may refetch
                tracing::warn!("Reference image for session {} is unusable: {}", self.session, e);
                self.reference_image = None;
                self.state = GateState::AwaitingCapture;
                return Err(e);
            }
            Err(e) => {
                tracing::warn!("Face comparison failed: {}", e);
                MatchResult::INVALID
            }
        };
        tracing::info!("Comparison for session {}: {:?}", self.session, result);

        match result {
            MatchResult { is_valid_face: true, is_match: true } => {
                self.state = GateState::Accepted { persisted: false };
                self.persist()?;
                Ok(GateOutcome::Registered)
            }
            MatchResult { is_valid_face: true, is_match: false } => {
                self.state = GateState::AwaitingCapture;
                Ok(GateOutcome::Rejected(Rejection::NoMatch))
            }
            MatchResult { is_valid_face: false, .. } => {
                self.state = GateState::AwaitingCapture;
                Ok(GateOutcome::Rejected(Rejection::InvalidFace))
            }
        }
    }

    /// Try the sink write again after a `Persistence` error.
    pub fn retry_persist(&mut self) -> Result<GateOutcome> {
        self.expect_state(self.state == (GateState::Accepted { persisted: false }), "retry_persist")?;
        self.persist()?;
        Ok(GateOutcome::Registered)
    }

    fn persist(&mut self) -> Result<()> {
        let frame = self.captured_frame.as_ref().ok_or(RegistrationError::NoCaptureAvailable)?;
        let registration = Registration { identity: &self.identity, student_id: &self.student_id };

        if let Err(e) = self.sink.commit(&registration, frame.as_bytes()) {
            tracing::error!("Failed to save registered face: {}", e);
            return Err(RegistrationError::Persistence(e));
        }

        self.state = GateState::Accepted { persisted: true };
        self.teardown();
        tracing::info!("Session {} registered", self.session);
        Ok(())
    }

    /// Close the session. In-flight work is left to finish on its own.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        tracing::info!("Session {} cancelled", self.session);
        self.state = GateState::Cancelled;
        self.teardown();
    }

    fn fail(&mut self, reason: String) {
        self.state = GateState::Error(reason);
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(mut worker) = self.capture.take() {
            worker.stop();
        }
        if let Some(fetch) = self.fetch.take() {
            fetch.cancel();
        }
        self.captured_frame = None;
        self.reference_image = None;
    }

    fn expect_state(&self, ok: bool, action: &'static str) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(RegistrationError::InvalidState { state: self.state.name(), action })
        }
    }
}

impl Drop for RegistrationGate {
    fn drop(&mut self) {
        if let Some(fetch) = self.fetch.take() {
            fetch.cancel();
        }
    }
}
