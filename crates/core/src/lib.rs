//! Shared domain types for the transcoding worker fleet: the `Job` model,
//! the error taxonomy lower layers classify into (spec.md §7), DID
//! normalization helpers (spec.md §4.2), and the worker's timeout
//! constants (spec.md §5).

pub mod did;
pub mod error;
pub mod job;
pub mod timeouts;

pub use did::{canonicalize_did, compare_dids, did_core, DidComparison};
pub use error::{classify_claim_error, classify_finish_error, ErrorKind, RawHttpError};
pub use job::{CachedResult, Job, JobMetadata, JobStatus, Origin, RetryRecord};
