//! Offline-first sync engine: durable queue drain, photo upload choreography,
//! and conflict adoption on the client side.

pub mod backoff;
pub mod client;
pub mod connectivity;
pub mod photos;
pub mod processor;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use client::{MealSyncClient, NewPhoto, SyncRequestError};
pub use connectivity::{ConnectivityObserver, ConnectivitySignal};
pub use photos::{HttpPhotoUploader, PhotoUploadError, PhotoUploader, UploadedPhoto};
pub use processor::{DrainReport, SyncQueueProcessor};
pub use transport::{HttpTransport, MutationOutcome, MutationTransport, TransportError};
