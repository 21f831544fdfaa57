//! Resumable provider-to-provider file moves.
//!
//! [`TransferService`] validates a request, records a job and queues it;
//! [`TransferEngine`] is the queue handler that does the work, anchored in a
//! [`TransferManifest`] on local disk.

mod engine;
mod manifest;
mod service;

pub use engine::{TransferEngine, transfer_cancel_key, transfer_progress};
pub use manifest::{CompletedPart, MultipartState, TransferDir, TransferManifest};
pub use service::TransferService;
