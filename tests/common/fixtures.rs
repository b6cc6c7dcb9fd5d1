//! Test fixture creation for the booking database

use super::constants::*;
use booking_server::booking_store::{BookingId, BookingStatus, NewBooking, SqliteBookingStore};
use booking_server::BookingStore;
use chrono::{Days, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A booking database in a temporary directory, removed on drop.
pub struct TestBookingDb {
    pub store: Arc<SqliteBookingStore>,
    _dir: TempDir,
}

impl TestBookingDb {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = SqliteBookingStore::new(dir.path().join("bookings.db")).unwrap();
        Self {
            store: Arc::new(store),
            _dir: dir,
        }
    }

    pub fn store(&self) -> Arc<dyn BookingStore> {
        self.store.clone()
    }

    /// Inserts a two-night booking starting on `start_date`.
    pub fn insert(&self, status: BookingStatus, start_date: NaiveDate) -> BookingId {
        self.store
            .insert_booking(NewBooking {
                user_id: TEST_USER_ID,
                property_id: TEST_PROPERTY_ID,
                start_date,
                end_date: start_date + Days::new(2),
                guests: 2,
                status,
            })
            .unwrap()
    }

    pub fn status_of(&self, id: BookingId) -> BookingStatus {
        self.store.get_booking(id).unwrap().unwrap().status
    }
}

/// Today's date (UTC) shifted by `offset` days.
pub fn days_from_today(offset: i64) -> NaiveDate {
    let today = Utc::now().date_naive();
    let days = Days::new(offset.unsigned_abs());
    if offset < 0 {
        today - days
    } else {
        today + days
    }
}

/// Polls `condition` until it holds, panicking after [`TEST_TIMEOUT`].
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", TEST_TIMEOUT);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
