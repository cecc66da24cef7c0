//! Resumable, auditable bulk transfer and secure erase driven by rsync.
//!
//! [`core::JobManager`] sequences the steps of a job, [`core::ProcessRunner`]
//! drives the external tools, and [`core::EventLog`] records every step
//! transition as a JSON line so an interrupted job can find where it stopped.

pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod logging;

pub use error::{JobError, Result};
