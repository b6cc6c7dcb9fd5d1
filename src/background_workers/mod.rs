//! Background worker lifecycle management.
//!
//! A [`WorkerManager`] owns a fixed set of [`Worker`]s, runs each on its own
//! tokio task and coordinates a single cooperative shutdown. The concrete
//! workers (currently only the booking expiry checker) live in [`workers`].

mod error;
mod manager;
mod worker;
pub mod workers;

pub use error::WorkerError;
pub use manager::{ManagerState, WorkerInfo, WorkerManager};
pub use worker::Worker;
pub use workers::{BookingExpiryChecker, CheckResult, CycleError, ResultStream};

use std::any::Any;

/// Best-effort extraction of a panic payload message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
