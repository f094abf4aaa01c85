use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the booking still holds its slot.
    pub fn is_active(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
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
    pub price: BigDecimal,
    pub status: BookingStatus,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Builds a confirmed booking from a request, copying duration and price
    /// from the resolved service.
    pub fn confirmed(
        reservation_id: Uuid,
        request: CreateBookingRequest,
        service: &ServiceInfo,
        now: DateTime<Utc>,
    ) -> Self {
        let end_time = request.start_time + Duration::minutes(i64::from(service.duration_minutes));
        Self {
            id: Uuid::new_v4(),
            reservation_id,
            professional_id: request.professional_id,
            service_id: service.id,
            client_name: request.client_name.trim().to_string(),
            client_email: request.client_email.trim().to_string(),
            client_phone: request.client_phone,
            notes: request.notes,
            start_time: request.start_time,
            end_time,
            duration_minutes: service.duration_minutes,
            price: service.price.clone(),
            status: BookingStatus::Confirmed,
            idempotency_key: request.idempotency_key,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBookingRequest {
    pub professional_id: Uuid,
    pub service_id: Uuid,
    pub client_name: String,
    pub client_email: String,
    #[serde(default)]
    pub client_phone: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Snapshot of a salon service as seen at booking time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: Uuid,
    pub name: String,
    pub duration_minutes: i32,
    pub price: BigDecimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookingFilter {
    #[serde(default)]
    pub professional_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<BookingStatus>,
    #[serde(default)]
    pub client_email: Option<String>,
    /// Inclusive lower bound on `start_time`.
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `start_time`.
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

impl BookingFilter {
    pub fn for_professional(professional_id: Uuid) -> Self {
        Self {
            professional_id: Some(professional_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, booking: &Booking) -> bool {
        self.professional_id.map_or(true, |p| booking.professional_id == p)
            && self.status.map_or(true, |s| booking.status == s)
            && self
                .client_email
                .as_deref()
                .map_or(true, |e| booking.client_email.eq_ignore_ascii_case(e))
            && self.from.map_or(true, |from| booking.start_time >= from)
            && self.to.map_or(true, |to| booking.start_time < to)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingNotification {
    pub id: Uuid,
    pub event_type: String,
    pub booking: Booking,
    pub created_at: DateTime<Utc>,
}

impl BookingNotification {
    pub fn confirmed(booking: Booking) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: "BookingConfirmed".to_string(),
            booking,
            created_at: Utc::now(),
        }
    }
}

/// Machine-readable error kind carried in every error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    SlotUnavailable,
    NotFound,
    AlreadyCancelled,
    TooLateToCancel,
    PersistenceError,
    Timeout,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub error: String,
}
