use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::*;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to publish notification: {0}")]
    Publish(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_booking_confirmed(&self, booking: &Booking) -> Result<(), NotificationError>;
}

/// Publishes `BookingConfirmed` events for the email worker.
pub struct KafkaNotificationSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaNotificationSink {
    pub fn new(producer: FutureProducer, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl NotificationSink for KafkaNotificationSink {
    async fn notify_booking_confirmed(&self, booking: &Booking) -> Result<(), NotificationError> {
        let event = BookingNotification::confirmed(booking.clone());
        let json = serde_json::to_string(&event)?;
        let key = booking.id.to_string();
        let record = FutureRecord::to(&self.topic)
            .payload(&json)
            .key(&key);

        self.producer.send(record, Duration::from_secs(5)).await
            .map_err(|(e, _)| NotificationError::Publish(e.to_string()))?;

        Ok(())
    }
}

/// Used when no broker is configured.
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify_booking_confirmed(&self, booking: &Booking) -> Result<(), NotificationError> {
        info!(
            "Booking {} confirmed for {} at {} (notifications disabled)",
            booking.id, booking.client_email, booking.start_time
        );
        Ok(())
    }
}
