//! Document workflows: upload, the background pipeline and lifecycle operations.
//!
//! This module coordinates document lifecycle operations:
//! - Upload with checksum deduplication
//! - Background pipeline runs (fetch, parse, vectorize, finalize)
//! - Worker pool and startup recovery of the task ledger
//! - Cancellation management
//! - Read, delete, re-vectorize and download

mod cancellation;
mod crud;
mod processing;
mod upload;
mod workers;

pub(crate) use cancellation::RunToken;
pub use crud::Download;
pub use upload::UploadRequest;
pub use workers::RecoveryReport;
