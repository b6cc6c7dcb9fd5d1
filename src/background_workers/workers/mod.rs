//! Concrete background workers.

pub mod booking_expiry;

pub use booking_expiry::{BookingExpiryChecker, CheckResult, CycleError, ResultStream};
