use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::*;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::bookings)]
pub struct DbBooking {
    pub id: Uuid,
    pub reservation_id: Uuid,
    pub professional_id: Uuid,
    pub service_id: Uuid,
    pub client_name: String,
    pub client_email: String,
    pub client_phone: Option<String>,
    pub notes: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub price: bigdecimal::BigDecimal,
    pub status: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
pub struct DbService {
    pub id: Uuid,
    pub name: String,
    pub duration_minutes: i32,
    pub price: bigdecimal::BigDecimal,
    pub active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<Booking> for DbBooking {
    fn from(booking: Booking) -> Self {
        Self {
            id: booking.id,
            reservation_id: booking.reservation_id,
            professional_id: booking.professional_id,
            service_id: booking.service_id,
            client_name: booking.client_name,
            client_email: booking.client_email,
            client_phone: booking.client_phone,
            notes: booking.notes,
            start_time: booking.start_time,
            end_time: booking.end_time,
            duration_minutes: booking.duration_minutes,
            price: booking.price,
            status: booking.status.as_str().to_string(),
            idempotency_key: booking.idempotency_key,
            created_at: booking.created_at,
            updated_at: booking.updated_at,
        }
    }
}

impl TryFrom<DbBooking> for Booking {
    type Error = anyhow::Error;

    fn try_from(row: DbBooking) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<BookingStatus>()
            .map_err(|e| anyhow::anyhow!("booking {}: {}", row.id, e))?;

        Ok(Self {
            id: row.id,
            reservation_id: row.reservation_id,
            professional_id: row.professional_id,
            service_id: row.service_id,
            client_name: row.client_name,
            client_email: row.client_email,
            client_phone: row.client_phone,
            notes: row.notes,
            start_time: row.start_time,
            end_time: row.end_time,
            duration_minutes: row.duration_minutes,
            price: row.price,
            status,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<DbService> for ServiceInfo {
    fn from(row: DbService) -> Self {
        Self {
            id: row.id,
            name: row.name,
            duration_minutes: row.duration_minutes,
            price: row.price,
        }
    }
}
