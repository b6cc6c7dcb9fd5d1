//! SQLite schema definitions for the booking database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Bookings
// =============================================================================

/// Dates are stored as `YYYY-MM-DD` text so they compare lexicographically.
const BOOKINGS_TABLE_V1: Table = Table {
    name: "bookings",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true), // rowid alias
        sqlite_column!("user_id", &SqlType::Integer, non_null = true),
        sqlite_column!("property_id", &SqlType::Integer, non_null = true),
        sqlite_column!("start_date", &SqlType::Text, non_null = true),
        sqlite_column!("end_date", &SqlType::Text, non_null = true),
        sqlite_column!("guests", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "status",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'pending'")
        ),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_bookings_status_start_date", "status, start_date"),
        ("idx_bookings_property_id", "property_id"),
    ],
};

// =============================================================================
// Versioned Schema Definition
// =============================================================================

pub const BOOKING_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[BOOKINGS_TABLE_V1],
    migration: None,
}];
