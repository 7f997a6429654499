//! Approval gate, stock ledger, stock transfers and document numbering on top of sled.

pub mod approval;
pub mod authz;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod sequence;
pub mod services;
pub mod store;
pub mod telemetry;
pub mod time;
pub mod transfer;
pub mod utils;

pub use error::{CoreError, ErrorKind};
pub use services::Services;
