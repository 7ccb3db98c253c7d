//! C4 Gateway Client — the stateless HTTP adapter to the Gateway's job
//! dispatch API (spec.md §4.1).

mod client;
mod dto;
mod error;
mod probe;

pub use client::GatewayClient;
pub use dto::{FinishOutcome, GatewayJobDto, InputDto, JobStatusDto, MetadataDto, StorageMetadataDto};
pub use error::{classify_transport, GatewayError};
pub use probe::connectivity_probe;
