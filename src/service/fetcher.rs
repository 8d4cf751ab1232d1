use crate::core::events::{FetchTicket, WorkerEvent};
use crate::core::token::ClassIdentity;
use crate::service::client::{FetchError, ImageBackend};
use crate::service::protocol::ImageRequest;
use crate::storage::reference::{ReferenceSlot, ReferenceStamp};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Pulls the reference image off the backend on a background thread and
/// parks it in the reference slot.
#[derive(Clone)]
pub struct ReferenceFetcher {
    backend: Arc<dyn ImageBackend>,
    slot: ReferenceSlot,
}

pub struct FetchHandle {
    ticket: FetchTicket,
    cancelled: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FetchHandle {
    pub fn ticket(&self) -> FetchTicket {
        self.ticket
    }

    /// Abandon the fetch. A request already on the wire is not interrupted,
    /// but its result is neither stored nor reported. Never waits.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl ReferenceFetcher {
    pub fn new(backend: Arc<dyn ImageBackend>, slot: ReferenceSlot) -> Self {
        Self { backend, slot }
    }

    pub fn slot(&self) -> &ReferenceSlot {
        &self.slot
    }

    pub fn spawn(
        &self,
        ticket: FetchTicket,
        identity: &ClassIdentity,
        student_id: &str,
        events: Sender<WorkerEvent>,
    ) -> FetchHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker = self.clone();
        let identity = identity.clone();
        let student_id = student_id.to_string();
        let flag = Arc::clone(&cancelled);
        let failure_events = events.clone();

        let spawned = thread::Builder::new()
            .name(format!("reference-fetch-{}", ticket.generation))
            .spawn(move || {
                let result = worker.fetch_and_store(&identity, &student_id, &flag);
                if flag.load(Ordering::Acquire) {
                    tracing::debug!("Fetch {} for session {} finished after cancel; not reporting",
                                    ticket.generation, ticket.session);
                    return;
                }
                // Receiver gone means the session was dropped
                let _ = events.send(WorkerEvent::Fetched { ticket, result });
            });

        let thread = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!("Could not start fetch worker: {}", e);
                let _ = failure_events.send(WorkerEvent::Fetched {
                    ticket,
                    result: Err(FetchError::Transport(format!("could not start fetch worker: {}", e))),
                });
                None
            }
        };

        FetchHandle { ticket, cancelled, thread }
    }

    /// Blocking fetch + store. Everything that goes wrong comes back as a
    /// `FetchError`, including a panicking backend. Nothing is stored once
    /// `cancelled` is set.
    pub fn fetch_and_store(
        &self,
        identity: &ClassIdentity,
        student_id: &str,
        cancelled: &AtomicBool,
    ) -> Result<ReferenceStamp, FetchError> {
        let request = ImageRequest {
            school_code: identity.school_code.clone(),
            class_name: identity.class_name.clone(),
            national_code: student_id.to_string(),
        };

        let fetched = panic::catch_unwind(AssertUnwindSafe(|| self.backend.fetch_image(&request)))
            .unwrap_or_else(|_| Err(FetchError::Transport("image backend panicked".to_string())));

        let image = match fetched {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!("Reference fetch for student {} failed: {}", student_id, e);
                return Err(e);
            }
        };

        tracing::info!("Received reference image ({} bytes) for student {}", image.len(), student_id);
        if cancelled.load(Ordering::Acquire) {
            tracing::debug!("Fetch for student {} was abandoned; not storing", student_id);
            return Err(FetchError::Cancelled);
        }
        self.slot
            .store(identity, student_id, &image)
            .map_err(|e| FetchError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::SessionId;
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StaticBackend {
        reply: Result<Vec<u8>, FetchError>,
        seen: Mutex<Vec<ImageRequest>>,
    }

    impl ImageBackend for StaticBackend {
        fn fetch_image(&self, request: &ImageRequest) -> Result<Vec<u8>, FetchError> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply.clone()
        }
    }

    struct PanickingBackend;

    /// Blocks until the test hands it a reply.
    struct HeldBackend(Mutex<mpsc::Receiver<Result<Vec<u8>, FetchError>>>);

    impl ImageBackend for HeldBackend {
        fn fetch_image(&self, _request: &ImageRequest) -> Result<Vec<u8>, FetchError> {
            self.0.lock().unwrap().recv().unwrap_or_else(|_| Err(FetchError::Transport("closed".into())))
        }
    }

    impl ImageBackend for PanickingBackend {
        fn fetch_image(&self, _request: &ImageRequest) -> Result<Vec<u8>, FetchError> {
            panic!("backend exploded");
        }
    }

    fn ticket() -> FetchTicket {
        FetchTicket { session: SessionId::random(), generation: 1 }
    }

    #[test]
    fn reports_stored_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StaticBackend { reply: Ok(b"img".to_vec()), seen: Mutex::new(Vec::new()) });
        let fetcher = ReferenceFetcher::new(backend.clone(), ReferenceSlot::new(dir.path().join("ref.jpg")));
        let (tx, rx) = mpsc::channel();
        let identity = ClassIdentity::new("123", "1052");

        let t = ticket();
        fetcher.spawn(t, &identity, "09295", tx);

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerEvent::Fetched { ticket, result } => {
                assert_eq!(ticket, t);
                assert_eq!(result.unwrap().student_id, "09295");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0].national_code, "09295");
        assert_eq!(seen[0].class_name, "1052");
        assert_eq!(fetcher.slot().load_verified(&identity, "09295").unwrap(), b"img");
    }

    #[test]
    fn reports_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FetchError::Backend { status: 404, message: "Student not found".into() };
        let backend = Arc::new(StaticBackend { reply: Err(err.clone()), seen: Mutex::new(Vec::new()) });
        let fetcher = ReferenceFetcher::new(backend, ReferenceSlot::new(dir.path().join("ref.jpg")));

        let result = fetcher.fetch_and_store(&ClassIdentity::new("123", "1052"), "09295", &AtomicBool::new(false));
        assert_eq!(result.unwrap_err(), err);
        assert!(!dir.path().join("ref.jpg").exists());
    }

    #[test]
    fn panicking_backend_becomes_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ReferenceFetcher::new(Arc::new(PanickingBackend), ReferenceSlot::new(dir.path().join("ref.jpg")));

        let result = fetcher.fetch_and_store(&ClassIdentity::new("123", "1052"), "09295", &AtomicBool::new(false));
        assert!(matches!(result, Err(FetchError::Transport(_))));
    }

    #[test]
    fn abandoned_fetch_leaves_slot_alone() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StaticBackend { reply: Ok(b"late".to_vec()), seen: Mutex::new(Vec::new()) });
        let fetcher = ReferenceFetcher::new(backend, ReferenceSlot::new(dir.path().join("ref.jpg")));
        let identity = ClassIdentity::new("123", "1052");

        let result = fetcher.fetch_and_store(&identity, "09295", &AtomicBool::new(true));
        assert_eq!(result.unwrap_err(), FetchError::Cancelled);
        assert!(fetcher.slot().read_stamp().unwrap().is_none());
        assert!(!dir.path().join("ref.jpg").exists());
    }

    #[test]
    fn cancelled_spawn_does_not_report() {
        let dir = tempfile::tempdir().unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<Result<Vec<u8>, FetchError>>();
        let backend = Arc::new(HeldBackend(Mutex::new(gate_rx)));
        let fetcher = ReferenceFetcher::new(backend, ReferenceSlot::new(dir.path().join("ref.jpg")));
        let (tx, rx) = mpsc::channel();
        let identity = ClassIdentity::new("123", "1052");

        let handle = fetcher.spawn(ticket(), &identity, "09295", tx);
        handle.cancel();
        gate_tx.send(Ok(b"late".to_vec())).unwrap();
        while !handle.is_finished() {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(rx.try_recv().is_err());
        assert!(!dir.path().join("ref.jpg").exists());
    }
}
