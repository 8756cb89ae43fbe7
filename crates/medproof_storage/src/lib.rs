#![forbid(unsafe_code)]

pub mod audit;
mod journal;
pub mod store;

pub use audit::AuditTrail;
pub use store::{MedStore, StorageError};
