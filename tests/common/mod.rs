//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestBookingDb, days_from_today};
//! use booking_server::booking_store::BookingStatus;
//!
//! #[tokio::test]
//! async fn test_pending_booking() {
//!     let db = TestBookingDb::new();
//!     let id = db.insert(BookingStatus::Pending, days_from_today(-1));
//! }
//! ```

mod constants;
mod fixtures;

pub use constants::*;
pub use fixtures::{days_from_today, wait_until, TestBookingDb};
