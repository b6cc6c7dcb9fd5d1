mod models;
mod schema;
mod sqlite_booking_store;

pub use models::*;
pub use schema::BOOKING_VERSIONED_SCHEMAS;
pub use sqlite_booking_store::SqliteBookingStore;

use anyhow::Result;
use chrono::NaiveDate;
use std::time::Duration;

/// Persistence operations on bookings.
///
/// Implementations must be safe for concurrent use by several workers.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait BookingStore: Send + Sync {
    /// Atomically moves every `pending` booking whose start date is strictly
    /// before `today` to `expired`, returning the affected ids.
    ///
    /// This is a single conditional bulk update, so concurrent callers never
    /// expire the same booking twice. `timeout` bounds how long the store may
    /// wait on locks held by other writers.
    fn expire_stale_pending_bookings(
        &self,
        today: NaiveDate,
        timeout: Duration,
    ) -> Result<Vec<BookingId>>;

    fn insert_booking(&self, booking: NewBooking) -> Result<BookingId>;
    fn get_booking(&self, id: BookingId) -> Result<Option<Booking>>;
    fn count_bookings_with_status(&self, status: BookingStatus) -> Result<usize>;

    /// Aborts the store operation currently running, if any, so it fails and
    /// rolls back instead of committing. A no-op while the store is idle.
    ///
    /// Operations of other callers sharing the store may be aborted as well.
    fn interrupt(&self);
}
