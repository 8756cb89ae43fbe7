#![forbid(unsafe_code)]

pub mod audit;
pub mod common;
pub mod consent;
pub mod ids;
pub mod ledger;
pub mod record;

pub use common::{ContractViolation, SchemaVersion, UnixTimeMs, Validate};
