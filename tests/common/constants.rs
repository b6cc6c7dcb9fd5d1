//! Shared constants for end-to-end tests

use std::time::Duration;

/// Guest booking every test reservation
pub const TEST_USER_ID: i64 = 1;

/// Property every test reservation is made on
pub const TEST_PROPERTY_ID: i64 = 10;

/// Interval long enough that only the immediate check runs during a test
pub const LONG_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Generous bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);
