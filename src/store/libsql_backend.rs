//! libSQL backend: `RecordStore` and `ConversationStateStore` on one database.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Row, params};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::conversation::state::ConversationState;
use crate::conversation::store::{ConversationStateStore, StatePatch};
use crate::error::{CommitError, DatabaseError};
use crate::store::memory::demo_catalog;
use crate::store::migrations;
use crate::store::traits::{
    CarRecord, CommitRequest, RecordStore, SearchCriteria, new_confirmation_id,
};

/// Idle time after which a stored conversation reads as absent.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(30 * 60);

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    state_ttl: Duration,
    /// Serializes read-modify-write sequences (state updates, commits).
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            state_ttl: DEFAULT_STATE_TTL,
            write_lock: Mutex::new(()),
        })
    }

    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    /// Insert the demo catalogue when the `cars` table is empty.
    /// Returns the number of rows inserted.
    pub async fn seed_demo_catalog(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT COUNT(*) FROM cars", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("seed_demo_catalog: {e}")))?;
        let existing: i64 = match rows.next().await {
            Ok(Some(row)) => row.get(0).unwrap_or(0),
            Ok(None) => 0,
            Err(e) => return Err(DatabaseError::Query(format!("seed_demo_catalog: {e}"))),
        };
        if existing > 0 {
            debug!(existing, "Catalogue already seeded");
            return Ok(0);
        }

        let cars = demo_catalog();
        for car in &cars {
            self.insert_car(car).await?;
        }
        info!(count = cars.len(), "Seeded demo catalogue");
        Ok(cars.len())
    }

    pub async fn insert_car(&self, car: &CarRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO cars (id, brand, model, variant, car_type, year, fuel_type, transmission, mileage_km, price, color, registration_number, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    car.id,
                    car.brand.clone(),
                    car.model.clone(),
                    car.variant.clone(),
                    car.car_type.clone(),
                    car.year as i64,
                    car.fuel_type.clone(),
                    car.transmission.clone(),
                    car.mileage_km,
                    car.price.to_string(),
                    car.color.clone(),
                    car.registration_number.clone(),
                    car.status.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_car: {e}")))?;
        Ok(())
    }

    /// Read back the confirmation id stored for an idempotency key.
    async fn confirmation_for(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT id FROM {table} WHERE idempotency_key = ?1"),
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("confirmation_for: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row.get::<String>(0)
                    .map_err(|e| DatabaseError::Query(format!("confirmation_for row: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("confirmation_for: {e}"))),
        }
    }

    async fn insert_booking(&self, request: &CommitRequest, id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = timestamp(Utc::now());
        let key = request.idempotency_key().to_string();
        match request {
            CommitRequest::TestDrive(b) => conn
                .execute(
                    "INSERT INTO test_drive_bookings (id, idempotency_key, user_id, car_id, car_label, customer_name, phone, has_license, preferred_date, preferred_time, location, address, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        id,
                        key,
                        b.user_id.clone(),
                        b.car_id,
                        b.car_label.clone(),
                        b.customer_name.clone(),
                        b.phone.clone(),
                        b.has_license as i64,
                        b.preferred_date.clone(),
                        b.preferred_time.clone(),
                        b.location.as_str(),
                        b.address.clone(),
                        now,
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("insert test drive: {e}")))?,
            CommitRequest::Service(b) => conn
                .execute(
                    "INSERT INTO service_bookings (id, idempotency_key, user_id, customer_name, phone, make, model, year, registration_number, service_type, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        id,
                        key,
                        b.user_id.clone(),
                        b.customer_name.clone(),
                        b.phone.clone(),
                        b.make.clone(),
                        b.model.clone(),
                        b.year as i64,
                        b.registration_number.clone(),
                        b.service_type.clone(),
                        now,
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("insert service booking: {e}")))?,
        };
        Ok(())
    }

    /// Number of stored bookings of each kind, as (test drives, services).
    pub async fn booking_counts(&self) -> Result<(i64, i64), DatabaseError> {
        let mut counts = [0i64; 2];
        for (i, table) in ["test_drive_bookings", "service_bookings"].iter().enumerate() {
            let mut rows = self
                .conn()
                .query(&format!("SELECT COUNT(*) FROM {table}"), ())
                .await
                .map_err(|e| DatabaseError::Query(format!("booking_counts: {e}")))?;
            if let Ok(Some(row)) = rows.next().await {
                counts[i] = row.get(0).unwrap_or(0);
            }
        }
        Ok((counts[0], counts[1]))
    }

    async fn read_state(&self, user_id: &str) -> Result<Option<ConversationState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT state FROM conversation_states WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_state: {e}")))?;
        let json: String = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("get_state row: {e}")))?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_state: {e}"))),
        };
        let state: ConversationState = serde_json::from_str(&json)
            .map_err(|e| DatabaseError::Serialization(format!("conversation state: {e}")))?;
        if state.is_stale(self.state_ttl, Utc::now()) {
            debug!(user_id = %user_id, flow = %state.flow, "Dropping stale conversation");
            self.delete_state(user_id).await?;
            return Ok(None);
        }
        Ok(Some(state))
    }

    async fn write_state(&self, state: &ConversationState) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(state)
            .map_err(|e| DatabaseError::Serialization(format!("conversation state: {e}")))?;
        self.conn()
            .execute(
                "INSERT INTO conversation_states (user_id, flow, step, state, last_activity) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET flow = excluded.flow, step = excluded.step, state = excluded.state, last_activity = excluded.last_activity",
                params![
                    state.user_id.clone(),
                    state.flow.as_str(),
                    state.step.as_str(),
                    json,
                    timestamp(state.last_activity),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_state: {e}")))?;
        Ok(())
    }

    async fn delete_state(&self, user_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM conversation_states WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_state: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

const CAR_COLUMNS: &str = "id, brand, model, variant, car_type, year, fuel_type, transmission, mileage_km, price, color, registration_number, status";

fn row_to_car(row: &Row) -> Result<CarRecord, libsql::Error> {
    let price: String = row.get(9)?;
    Ok(CarRecord {
        id: row.get(0)?,
        brand: row.get(1)?,
        model: row.get(2)?,
        variant: row.get(3)?,
        car_type: row.get(4)?,
        year: row.get::<i64>(5)? as i32,
        fuel_type: row.get(6)?,
        transmission: row.get(7)?,
        mileage_km: row.get(8)?,
        price: price.parse().unwrap_or_default(),
        color: row.get(10)?,
        registration_number: row.get(11)?,
        status: row.get(12)?,
    })
}

/// Timestamps are stored with a fixed width so they compare as text.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ── RecordStore ─────────────────────────────────────────────────────

#[async_trait]
impl RecordStore for LibSqlBackend {
    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<CarRecord>, DatabaseError> {
        let max_price = criteria.max_price.and_then(|p| p.to_f64());
        let limit = if criteria.limit == 0 { -1 } else { criteria.limit as i64 };
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CAR_COLUMNS} FROM cars WHERE status = 'available'
                     AND (?1 IS NULL OR lower(brand) = lower(?1))
                     AND (?2 IS NULL OR lower(model) = lower(?2))
                     AND (?3 IS NULL OR lower(car_type) = lower(?3))
                     AND (?4 IS NULL OR CAST(price AS REAL) <= ?4)
                     ORDER BY CAST(price AS REAL) ASC, id ASC LIMIT ?5"
                ),
                params![
                    criteria.brand.clone(),
                    criteria.model.clone(),
                    criteria.car_type.clone(),
                    max_price,
                    limit,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("search: {e}")))?;

        let mut cars = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => cars.push(
                    row_to_car(&row).map_err(|e| DatabaseError::Query(format!("search row parse: {e}")))?,
                ),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("search: {e}"))),
            }
        }
        debug!(found = cars.len(), "Catalogue search");
        Ok(cars)
    }

    async fn average_price(
        &self,
        brand: &str,
        model: &str,
    ) -> Result<Option<Decimal>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT price FROM cars WHERE lower(brand) = lower(?1) AND lower(model) = lower(?2)",
                params![brand, model],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("average_price: {e}")))?;

        let mut prices = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let price: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("average_price row: {e}")))?;
                    if let Ok(p) = price.parse::<Decimal>() {
                        prices.push(p);
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("average_price: {e}"))),
            }
        }
        if prices.is_empty() {
            return Ok(None);
        }
        let total: Decimal = prices.iter().copied().sum();
        Ok(Some(total / Decimal::from(prices.len())))
    }

    async fn brands(&self) -> Result<Vec<String>, DatabaseError> {
        distinct_column(self.conn(), "brand").await
    }

    async fn car_types(&self) -> Result<Vec<String>, DatabaseError> {
        distinct_column(self.conn(), "car_type").await
    }

    async fn commit(&self, request: &CommitRequest) -> Result<String, CommitError> {
        let table = match request {
            CommitRequest::TestDrive(_) => "test_drive_bookings",
            CommitRequest::Service(_) => "service_bookings",
        };
        let key = request.idempotency_key().to_string();

        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.confirmation_for(table, &key).await? {
            debug!(idempotency_key = %key, confirmation_id = %existing, "Commit already recorded");
            return Ok(existing);
        }
        let id = new_confirmation_id(request.confirmation_prefix());
        self.insert_booking(request, &id).await?;
        info!(confirmation_id = %id, table, "Booking stored");
        Ok(id)
    }
}

async fn distinct_column(conn: &Connection, column: &str) -> Result<Vec<String>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT DISTINCT {column} FROM cars ORDER BY {column}"),
            (),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("distinct {column}: {e}")))?;
    let mut values = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => values.push(
                row.get::<String>(0)
                    .map_err(|e| DatabaseError::Query(format!("distinct {column} row: {e}")))?,
            ),
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("distinct {column}: {e}"))),
        }
    }
    Ok(values)
}

// ── ConversationStateStore ──────────────────────────────────────────

#[async_trait]
impl ConversationStateStore for LibSqlBackend {
    async fn get(&self, user_id: &str) -> Result<Option<ConversationState>, DatabaseError> {
        self.read_state(user_id).await
    }

    async fn set(&self, user_id: &str, mut state: ConversationState) -> Result<(), DatabaseError> {
        state.user_id = user_id.to_string();
        state.touch();
        let _guard = self.write_lock.lock().await;
        self.write_state(&state).await
    }

    async fn update(
        &self,
        user_id: &str,
        patch: StatePatch,
    ) -> Result<Option<ConversationState>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut state) = self.read_state(user_id).await? else {
            return Ok(None);
        };
        patch.apply(&mut state);
        self.write_state(&state).await?;
        Ok(Some(state))
    }

    async fn clear(&self, user_id: &str) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.delete_state(user_id).await
    }

    async fn purge_stale(&self) -> Result<usize, DatabaseError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.state_ttl)
                .map_err(|e| DatabaseError::Query(format!("purge_stale ttl: {e}")))?;
        let _guard = self.write_lock.lock().await;
        let removed = self
            .conn()
            .execute(
                "DELETE FROM conversation_states WHERE last_activity < ?1",
                params![timestamp(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_stale: {e}")))?;
        Ok(removed as usize)
    }
}
