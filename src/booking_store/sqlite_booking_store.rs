use super::models::{Booking, BookingId, BookingStatus, NewBooking};
use super::schema::BOOKING_VERSIONED_SCHEMAS;
use super::BookingStore;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, types::Type, Connection, InterruptHandle, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct SqliteBookingStore {
    conn: Arc<Mutex<Connection>>,
    interrupt_handle: InterruptHandle,
}

impl SqliteBookingStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let mut conn = Connection::open(path).context("Failed to open booking database")?;

        let latest_schema = BOOKING_VERSIONED_SCHEMAS
            .last()
            .context("No booking schema defined")?;

        if is_new_db {
            info!("Creating new booking database at {:?}", path);
            latest_schema.create(&conn)?;
        } else {
            let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
            let db_version = raw_version - BASE_DB_VERSION as i64;

            if db_version < 1 {
                anyhow::bail!(
                    "Booking database version {} is invalid (expected >= 1)",
                    db_version
                );
            }

            let version_index = BOOKING_VERSIONED_SCHEMAS
                .iter()
                .position(|s| s.version == db_version as usize)
                .with_context(|| format!("Unknown booking database version {}", db_version))?;
            BOOKING_VERSIONED_SCHEMAS[version_index]
                .validate(&conn)
                .with_context(|| {
                    format!(
                        "Booking database schema validation failed for version {}",
                        db_version
                    )
                })?;

            if (db_version as usize) < latest_schema.version {
                info!(
                    "Migrating booking database from version {} to {}",
                    db_version, latest_schema.version
                );
                Self::migrate(&mut conn, db_version as usize)?;
            }
        }

        Ok(Self {
            interrupt_handle: conn.get_interrupt_handle(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &mut Connection, from_version: usize) -> Result<()> {
        let tx = conn.transaction()?;
        let mut latest_from = from_version;
        for schema in BOOKING_VERSIONED_SCHEMAS
            .iter()
            .filter(|s| s.version > from_version)
        {
            if let Some(migration_fn) = schema.migration {
                migration_fn(&tx).with_context(|| {
                    format!("Failed to run migration to version {}", schema.version)
                })?;
            }
            latest_from = schema.version;
        }
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest_from),
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Booking database connection lock poisoned"))
    }

    fn format_date(date: &NaiveDate) -> String {
        date.format(DATE_FORMAT).to_string()
    }

    fn row_to_booking(row: &rusqlite::Row) -> rusqlite::Result<Booking> {
        let parse_date = |column: &str| -> rusqlite::Result<NaiveDate> {
            let raw: String = row.get(column)?;
            NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
            })
        };

        let status_str: String = row.get("status")?;
        let status = BookingStatus::parse(&status_str).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(0, format!("status={}", status_str), Type::Text)
        })?;

        let created_at_str: String = row.get("created_at")?;
        let created_at = DateTime::parse_from_rfc3339(&created_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(Booking {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            property_id: row.get("property_id")?,
            start_date: parse_date("start_date")?,
            end_date: parse_date("end_date")?,
            guests: row.get("guests")?,
            status,
            created_at,
        })
    }
}

impl BookingStore for SqliteBookingStore {
    fn expire_stale_pending_bookings(
        &self,
        today: NaiveDate,
        timeout: Duration,
    ) -> Result<Vec<BookingId>> {
        let conn = self.lock()?;
        conn.busy_timeout(timeout)?;

        let mut stmt = conn.prepare(
            "UPDATE bookings
             SET status = ?1
             WHERE status = ?2
               AND start_date < ?3
             RETURNING id",
        )?;
        let mut expired_ids = stmt
            .query_map(
                params![
                    BookingStatus::Expired.as_str(),
                    BookingStatus::Pending.as_str(),
                    Self::format_date(&today)
                ],
                |row| row.get::<_, BookingId>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to expire stale pending bookings")?;

        // RETURNING yields rows in no particular order
        expired_ids.sort_unstable();
        debug!(
            "Expired {} pending bookings starting before {}",
            expired_ids.len(),
            today
        );
        Ok(expired_ids)
    }

    fn insert_booking(&self, booking: NewBooking) -> Result<BookingId> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO bookings (user_id, property_id, start_date, end_date, guests, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                booking.user_id,
                booking.property_id,
                Self::format_date(&booking.start_date),
                Self::format_date(&booking.end_date),
                booking.guests,
                booking.status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_booking(&self, id: BookingId) -> Result<Option<Booking>> {
        let conn = self.lock()?;
        let booking = conn
            .query_row(
                "SELECT * FROM bookings WHERE id = ?1",
                params![id],
                Self::row_to_booking,
            )
            .optional()?;
        Ok(booking)
    }

    fn count_bookings_with_status(&self, status: BookingStatus) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bookings WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn interrupt(&self) {
        debug!("Interrupting running booking database operation");
        self.interrupt_handle.interrupt();
    }
}
