//! Client coordination protocol.
//!
//! The transport-agnostic operations producers and workers use (`acquire`,
//! `report_observed_throttle`, `status_snapshot`) plus the administrative
//! operations, all on [`AdmissionController`].

mod controller;
mod types;

pub use controller::AdmissionController;
pub use types::{AcquireRequest, ClassStatus, StatusSnapshot};
