use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use shared::*;
use thiserror::Error;
use uuid::Uuid;
use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

const NO_OVERLAP_CONSTRAINT: &str = "bookings_no_overlap";
const IDEMPOTENCY_KEY_CONSTRAINT: &str = "bookings_idempotency_key_key";

diesel::sql_function!(fn lower(x: diesel::sql_types::Text) -> diesel::sql_types::Text);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("interval overlaps an active booking")]
    Overlap,
    #[error("idempotency key already used")]
    DuplicateKey,
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match &err {
            DieselError::DatabaseError(_, info)
                if info.constraint_name() == Some(NO_OVERLAP_CONSTRAINT) =>
            {
                StoreError::Overlap
            }
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)
                if info.constraint_name() == Some(IDEMPOTENCY_KEY_CONSTRAINT) =>
            {
                StoreError::DuplicateKey
            }
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _) => {
                StoreError::Unavailable("connection closed".to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn insert(&self, booking: &Booking) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Booking>, StoreError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Booking>, StoreError>;

    /// Moves a booking to `cancelled`. Returns `false` if it was already cancelled
    /// or does not exist.
    async fn mark_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Matching bookings ordered by `start_time`, then `created_at`.
    async fn list(&self, filter: &BookingFilter) -> Result<Vec<Booking>, StoreError>;

    async fn list_active(&self, after: DateTime<Utc>) -> Result<Vec<Booking>, StoreError>;
}

#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    async fn get_service(&self, id: Uuid) -> Result<Option<ServiceInfo>, StoreError>;
}

pub struct PgBookingStore {
    pool: DbPool,
}

impl PgBookingStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(
        &self,
    ) -> Result<diesel_async::pooled_connection::bb8::PooledConnection<'_, AsyncPgConnection>, StoreError>
    {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

fn decode_one(row: DbBooking) -> Result<Booking, StoreError> {
    Booking::try_from(row).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn decode(rows: Vec<DbBooking>) -> Result<Vec<Booking>, StoreError> {
    rows.into_iter().map(decode_one).collect()
}

/// Emails compare by equality ignoring case; `%` and `_` are not wildcards here.
fn filtered(filter: &BookingFilter) -> bookings::BoxedQuery<'static, Pg> {
    let mut query = bookings::table.into_boxed();
    if let Some(professional_id) = filter.professional_id {
        query = query.filter(bookings::professional_id.eq(professional_id));
    }
    if let Some(status) = filter.status {
        query = query.filter(bookings::status.eq(status.as_str()));
    }
    if let Some(email) = &filter.client_email {
        query = query.filter(lower(bookings::client_email).eq(lower(email.clone())));
    }
    if let Some(from) = filter.from {
        query = query.filter(bookings::start_time.ge(from));
    }
    if let Some(to) = filter.to {
        query = query.filter(bookings::start_time.lt(to));
    }

    query.order((bookings::start_time.asc(), bookings::created_at.asc()))
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn insert(&self, booking: &Booking) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let row = DbBooking::from(booking.clone());

        diesel::insert_into(bookings::table)
            .values(&row)
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.conn().await?;

        let row = bookings::table
            .filter(bookings::id.eq(id))
            .first::<DbBooking>(&mut conn)
            .await
            .optional()?;

        row.map(decode_one).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.conn().await?;

        let row = bookings::table
            .filter(bookings::idempotency_key.eq(key))
            .first::<DbBooking>(&mut conn)
            .await
            .optional()?;

        row.map(decode_one).transpose()
    }

    async fn mark_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;

        let updated = diesel::update(
            bookings::table
                .filter(bookings::id.eq(id))
                .filter(bookings::status.ne(BookingStatus::Cancelled.as_str())),
        )
        .set((
            bookings::status.eq(BookingStatus::Cancelled.as_str()),
            bookings::updated_at.eq(at),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated == 1)
    }

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<Booking>, StoreError> {
        let mut conn = self.conn().await?;

        let mut query = bookings::table.into_boxed();
        if let Some(professional_id) = filter.professional_id {
            query = query.filter(bookings::professional_id.eq(professional_id));
        }
        if let Some(status) = filter.status {
            query = query.filter(bookings::status.eq(status.as_str()));
        }
        if let Some(email) = &filter.client_email {
            query = query.filter(bookings::client_email.ilike(email.clone()));
        }
        if let Some(from) = filter.from {
            query = query.filter(bookings::start_time.ge(from));
        }
        if let Some(to) = filter.to {
            query = query.filter(bookings::start_time.lt(to));
        }

        let rows = query
            .order((bookings::start_time.asc(), bookings::created_at.asc()))
            .load::<DbBooking>(&mut conn)
            .await?;

        decode(rows)
    }

    async fn list_active(&self, after: DateTime<Utc>) -> Result<Vec<Booking>, StoreError> {
        let mut conn = self.conn().await?;

        let rows = bookings::table
            .filter(bookings::status.ne(BookingStatus::Cancelled.as_str()))
            .filter(bookings::end_time.gt(after))
            .order(bookings::start_time.asc())
            .load::<DbBooking>(&mut conn)
            .await?;

        decode(rows)
    }
}

pub struct PgServiceCatalog {
    pool: DbPool,
}

impl PgServiceCatalog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ServiceCatalog for PgServiceCatalog {
    async fn get_service(&self, id: Uuid) -> Result<Option<ServiceInfo>, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let row = services::table
            .filter(services::id.eq(id))
            .filter(services::active.eq(true))
            .first::<DbService>(&mut conn)
            .await
            .optional()?;

        Ok(row.map(ServiceInfo::from))
    }
}
