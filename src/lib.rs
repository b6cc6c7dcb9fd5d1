//! Booking Server Library
//!
//! Background worker subsystem of the booking backend: the worker manager,
//! the booking expiry checker and the booking persistence they rely on.

pub mod background_workers;
pub mod booking_store;
pub mod config;
pub mod metrics;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use background_workers::{
    BookingExpiryChecker, CheckResult, CycleError, Worker, WorkerError, WorkerManager,
};
pub use booking_store::{BookingStore, SqliteBookingStore};
