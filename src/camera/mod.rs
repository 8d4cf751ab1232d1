pub mod v4l2;
pub mod worker;

pub use v4l2::{Camera, CameraSource};
pub use worker::CaptureWorker;

use crate::core::events::Frame;

/// Hands out the most recent frame on request. `None` just means nothing
/// was available this time; callers ask again.
pub trait CaptureSource: Send {
    fn capture_once(&mut self) -> Option<Frame>;
}
