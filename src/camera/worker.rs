use crate::camera::CaptureSource;
use crate::common::Result;
use crate::core::events::{SessionId, WorkerEvent};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// Owns the capture source on its own thread so blocking device reads never
/// stall the thread driving the gate.
pub struct CaptureWorker {
    requests: Option<Sender<u64>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    pub fn spawn(source: Box<dyn CaptureSource>, session: SessionId, events: Sender<WorkerEvent>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(format!("capture-{}", session))
            .spawn(move || run(source, session, rx, events))?;

        Ok(Self { requests: Some(tx), thread: Some(thread) })
    }

    /// Queue a capture. Returns false once the worker is gone.
    pub fn request(&self, seq: u64) -> bool {
        match &self.requests {
            Some(tx) => tx.send(seq).is_ok(),
            None => false,
        }
    }

    /// Close the request queue. A read already in progress finishes on its
    /// own; this does not wait for it.
    pub fn stop(&mut self) {
        self.requests = None;
        self.thread = None;
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut source: Box<dyn CaptureSource>, session: SessionId, requests: Receiver<u64>, events: Sender<WorkerEvent>) {
    tracing::debug!("Capture worker for session {} started", session);

    while let Ok(mut seq) = requests.recv() {
        // Only the newest request matters
        while let Ok(newer) = requests.try_recv() {
            seq = newer;
        }

        let frame = panic::catch_unwind(AssertUnwindSafe(|| source.capture_once()))
            .unwrap_or_else(|_| {
                tracing::error!("Capture source panicked");
                None
            });

        if events.send(WorkerEvent::Captured { session, seq, frame }).is_err() {
            break;
        }
    }

    tracing::debug!("Capture worker for session {} stopped", session);
}
