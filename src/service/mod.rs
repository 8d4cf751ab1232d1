pub mod client;
pub mod fetcher;
pub mod protocol;

pub use client::{FetchError, HttpBackend, ImageBackend};
pub use fetcher::{FetchHandle, ReferenceFetcher};
