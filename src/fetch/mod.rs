//! Concurrent model fetch from a content-addressed gateway.
//!
//! A top-level content address resolves to a manifest naming sibling blobs;
//! blobs download in parallel over one pooled HTTP session, each verified
//! against its descriptor hash and renamed into place only after
//! verification. Post-processing extracts bundled archives and relocates
//! the assembled artifact into the storage directory.

mod blob;
pub mod constants;
mod error;
mod manifest;
mod orchestrator;
mod progress;

pub use blob::{FetchOptions, download_blob};
pub use error::FetchError;
pub use manifest::{BlobDescriptor, Manifest, fetch_manifest};
pub use orchestrator::{ModelFetcher, concurrency_limit};
pub use progress::ProgressTracker;
