use chrono::{DateTime, Duration, Utc};
use shared::*;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use crate::clock::Clock;
use crate::error::BookingError;
use crate::notify::NotificationSink;
use crate::slot_index::SlotIndex;
use crate::store::{BookingStore, ServiceCatalog, StoreError};

const MAX_FREE_SLOT_WINDOW_DAYS: i64 = 14;

#[derive(Debug, Clone, Copy)]
pub struct CancellationPolicy {
    window: Duration,
}

impl CancellationPolicy {
    pub fn hours(hours: i64) -> Self {
        Self {
            window: Duration::hours(hours),
        }
    }

    pub fn window_hours(&self) -> i64 {
        self.window.num_hours()
    }

    /// A booking can be cancelled while at least the whole window is left before it starts.
    pub fn allows(&self, now: DateTime<Utc>, start_time: DateTime<Utc>) -> bool {
        start_time - now >= self.window
    }
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self::hours(24)
    }
}

struct LedgerInner {
    slots: Arc<SlotIndex>,
    store: Arc<dyn BookingStore>,
    catalog: Arc<dyn ServiceCatalog>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationSink>,
    policy: CancellationPolicy,
}

/// Sole writer of booking records.
///
/// Creation and cancellation each run as a spawned task, so a caller that stops
/// waiting (timeout, dropped connection) never leaves a reservation half made or
/// half released. The outcome stays observable through [`BookingLedger::get_booking`].
#[derive(Clone)]
pub struct BookingLedger {
    inner: Arc<LedgerInner>,
}

impl BookingLedger {
    pub fn new(
        store: Arc<dyn BookingStore>,
        catalog: Arc<dyn ServiceCatalog>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn NotificationSink>,
        policy: CancellationPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                slots: Arc::new(SlotIndex::new()),
                store,
                catalog,
                clock,
                notifier,
                policy,
            }),
        }
    }

    pub fn slots(&self) -> &SlotIndex {
        &self.inner.slots
    }

    /// Rebuilds the slot index from bookings that are still active.
    pub async fn restore(&self) -> Result<usize, BookingError> {
        let now = self.inner.clock.now();
        let active = self.inner.store.list_active(now).await?;

        let mut restored = 0;
        for booking in active {
            match self.inner.slots.restore(
                booking.reservation_id,
                booking.professional_id,
                booking.start_time,
                booking.duration_minutes,
                now,
            ) {
                Ok(()) => restored += 1,
                Err(conflict) => warn!(
                    "Booking {} not restored: {}",
                    booking.id, conflict
                ),
            }
        }

        info!("Restored {} reservations into the slot index", restored);
        Ok(restored)
    }

    pub async fn create_booking(&self, request: CreateBookingRequest) -> Result<Booking, BookingError> {
        let ledger = self.clone();
        tokio::spawn(async move { ledger.commit_booking(request).await })
            .await
            .map_err(|e| BookingError::Internal(format!("booking task failed: {}", e)))?
    }

    pub async fn cancel_booking(&self, booking_id: Uuid) -> Result<(), BookingError> {
        let ledger = self.clone();
        tokio::spawn(async move { ledger.commit_cancellation(booking_id).await })
            .await
            .map_err(|e| BookingError::Internal(format!("cancellation task failed: {}", e)))?
    }

    pub async fn get_booking(&self, booking_id: Uuid) -> Result<Booking, BookingError> {
        self.inner
            .store
            .get(booking_id)
            .await?
            .ok_or(BookingError::NotFound {
                entity: "booking",
                id: booking_id,
            })
    }

    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, BookingError> {
        Ok(self.inner.store.list(filter).await?)
    }

    /// Start times in `[from, to)` at which the service would fit for this professional.
    pub async fn free_slots(
        &self,
        professional_id: Uuid,
        service_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step_minutes: i64,
    ) -> Result<Vec<DateTime<Utc>>, BookingError> {
        if step_minutes <= 0 {
            return Err(BookingError::Validation("step_minutes must be positive".to_string()));
        }
        if step_minutes > MAX_FREE_SLOT_WINDOW_DAYS * 24 * 60 {
            return Err(BookingError::Validation(format!(
                "step_minutes must not exceed the {} day search window",
                MAX_FREE_SLOT_WINDOW_DAYS
            )));
        }
        if from >= to {
            return Err(BookingError::Validation("from must be before to".to_string()));
        }
        if to - from > Duration::days(MAX_FREE_SLOT_WINDOW_DAYS) {
            return Err(BookingError::Validation(format!(
                "search window is limited to {} days",
                MAX_FREE_SLOT_WINDOW_DAYS
            )));
        }

        let service = self.resolve_service(service_id).await?;
        let duration = Duration::minutes(i64::from(service.duration_minutes));
        let step = Duration::minutes(step_minutes);
        let now = self.inner.clock.now();
        let taken = self.inner.slots.reservations_for(professional_id);

        let mut free = Vec::new();
        let mut start = from;
        while let Some(end) = start.checked_add_signed(duration) {
            if end > to {
                break;
            }
            if start > now && !taken.iter().any(|r| r.overlaps(start, end)) {
                free.push(start);
            }
            match start.checked_add_signed(step) {
                Some(next) => start = next,
                None => break,
            }
        }
        Ok(free)
    }

    async fn commit_booking(&self, request: CreateBookingRequest) -> Result<Booking, BookingError> {
        validate(&request)?;

        if let Some(existing) = self.find_by_key(&request).await? {
            info!("Booking {} already created for idempotency key", existing.id);
            return Ok(existing);
        }

        let service = self.resolve_service(request.service_id).await?;
        if service.duration_minutes <= 0 {
            return Err(BookingError::Validation(format!(
                "service {} has no bookable duration",
                service.id
            )));
        }

        let now = self.inner.clock.now();
        if request.start_time <= now {
            return Err(BookingError::Validation("start_time must be in the future".to_string()));
        }

        let professional_id = request.professional_id;
        let start_time = request.start_time;
        let unavailable = BookingError::SlotUnavailable {
            professional_id,
            start_time,
        };

        let pending = match self.inner.slots.reserve_pending(
            professional_id,
            start_time,
            service.duration_minutes,
            now,
        ) {
            Ok(pending) => pending,
            Err(conflict) => {
                if let Some(existing) = self.find_by_key(&request).await? {
                    return Ok(existing);
                }
                info!("Rejected booking: {}", conflict);
                return Err(unavailable);
            }
        };

        let idempotency_key = request.idempotency_key.clone();
        let booking = Booking::confirmed(pending.id(), request, &service, now);

        // A failed insert drops `pending`, which hands the slot back.
        match self.inner.store.insert(&booking).await {
            Ok(()) => {
                pending.commit();
            }
            Err(StoreError::Overlap) => {
                warn!(
                    "Store rejected booking for professional {} at {} as overlapping",
                    professional_id, start_time
                );
                return Err(unavailable);
            }
            Err(StoreError::DuplicateKey) => {
                drop(pending);
                let key = idempotency_key.unwrap_or_default();
                return self
                    .inner
                    .store
                    .find_by_idempotency_key(&key)
                    .await?
                    .ok_or_else(|| BookingError::Persistence("duplicate idempotency key".to_string()));
            }
            Err(e) => {
                error!("Failed to persist booking {}: {}", booking.id, e);
                return Err(e.into());
            }
        }

        info!(
            "Booking {} confirmed for professional {} at {} ({} min)",
            booking.id, booking.professional_id, booking.start_time, booking.duration_minutes
        );
        self.spawn_notification(booking.clone());

        Ok(booking)
    }

    async fn commit_cancellation(&self, booking_id: Uuid) -> Result<(), BookingError> {
        let booking = self.get_booking(booking_id).await?;
        if booking.status == BookingStatus::Cancelled {
            return Err(BookingError::AlreadyCancelled(booking_id));
        }

        let now = self.inner.clock.now();
        if !self.inner.policy.allows(now, booking.start_time) {
            return Err(BookingError::TooLateToCancel {
                booking_id,
                start_time: booking.start_time,
                window_hours: self.inner.policy.window_hours(),
            });
        }

        // Release first; a failed status update puts the reservation back so the
        // index keeps matching the stored booking.
        let released = self.inner.slots.release(booking.reservation_id);
        match self.inner.store.mark_cancelled(booking_id, now).await {
            Ok(true) => {}
            Ok(false) => return Err(BookingError::AlreadyCancelled(booking_id)),
            Err(e) => {
                error!("Failed to cancel booking {}: {}", booking_id, e);
                if released {
                    if let Err(conflict) = self.inner.slots.restore(
                        booking.reservation_id,
                        booking.professional_id,
                        booking.start_time,
                        booking.duration_minutes,
                        now,
                    ) {
                        warn!("Reservation of booking {} not reinstated: {}", booking_id, conflict);
                    }
                }
                return Err(e.into());
            }
        }

        info!("Booking {} cancelled (slot released: {})", booking_id, released);
        Ok(())
    }

    async fn resolve_service(&self, service_id: Uuid) -> Result<ServiceInfo, BookingError> {
        self.inner
            .catalog
            .get_service(service_id)
            .await?
            .ok_or(BookingError::NotFound {
                entity: "service",
                id: service_id,
            })
    }

    async fn find_by_key(&self, request: &CreateBookingRequest) -> Result<Option<Booking>, BookingError> {
        match &request.idempotency_key {
            Some(key) => Ok(self.inner.store.find_by_idempotency_key(key).await?),
            None => Ok(None),
        }
    }

    fn spawn_notification(&self, booking: Booking) {
        let notifier = Arc::clone(&self.inner.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify_booking_confirmed(&booking).await {
                warn!("Confirmation for booking {} not delivered: {}", booking.id, e);
            }
        });
    }
}

fn validate(request: &CreateBookingRequest) -> Result<(), BookingError> {
    if request.client_name.trim().is_empty() {
        return Err(BookingError::Validation("client_name is required".to_string()));
    }
    let email = request.client_email.trim();
    if email.is_empty() {
        return Err(BookingError::Validation("client_email is required".to_string()));
    }
    if !email.contains('@') {
        return Err(BookingError::Validation(format!("invalid client_email: {}", email)));
    }
    if matches!(&request.idempotency_key, Some(key) if key.trim().is_empty()) {
        return Err(BookingError::Validation("idempotency_key must not be blank".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::notify::testing::{FailingSink, RecordingSink};
    use crate::store::memory::{InMemoryBookingStore, InMemoryServiceCatalog};
    use bigdecimal::BigDecimal;
    use chrono::TimeZone;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        ledger: BookingLedger,
        store: Arc<InMemoryBookingStore>,
        catalog: Arc<InMemoryServiceCatalog>,
        clock: Arc<FixedClock>,
        service: ServiceInfo,
        notified: UnboundedReceiver<Uuid>,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 11, 1, 8, 0, 0).unwrap()
    }

    fn tomorrow(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 11, 2, hour, minute, 0).unwrap()
    }

    fn haircut() -> ServiceInfo {
        ServiceInfo {
            id: Uuid::new_v4(),
            name: "Haircut".to_string(),
            duration_minutes: 30,
            price: BigDecimal::from(40),
        }
    }

    fn fixture() -> Fixture {
        let (sink, notified) = RecordingSink::new();
        fixture_with(Arc::new(sink), notified)
    }

    fn fixture_with(notifier: Arc<dyn NotificationSink>, notified: UnboundedReceiver<Uuid>) -> Fixture {
        let service = haircut();
        let store = Arc::new(InMemoryBookingStore::new());
        let catalog = Arc::new(InMemoryServiceCatalog::with([service.clone()]));
        let clock = Arc::new(FixedClock::new(now()));
        let ledger = BookingLedger::new(
            store.clone(),
            catalog.clone(),
            clock.clone(),
            notifier,
            CancellationPolicy::default(),
        );
        Fixture {
            ledger,
            store,
            catalog,
            clock,
            service,
            notified,
        }
    }

    fn request(service: &ServiceInfo, professional_id: Uuid, start_time: DateTime<Utc>) -> CreateBookingRequest {
        CreateBookingRequest {
            professional_id,
            service_id: service.id,
            client_name: "Marta Silva".to_string(),
            client_email: "marta@example.com".to_string(),
            client_phone: None,
            notes: Some("first visit".to_string()),
            start_time,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn overlapping_request_is_rejected_and_adjacent_one_accepted() {
        let f = fixture();
        let pro = Uuid::new_v4();
        f.ledger.create_booking(request(&f.service, pro, tomorrow(10, 0))).await.unwrap();

        let err = f
            .ledger
            .create_booking(request(&f.service, pro, tomorrow(10, 29)))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::SlotUnavailable { professional_id, .. } if professional_id == pro));

        let adjacent = f
            .ledger
            .create_booking(request(&f.service, pro, tomorrow(10, 30)))
            .await
            .unwrap();
        assert_eq!(adjacent.end_time, tomorrow(11, 0));
        assert_eq!(adjacent.status, BookingStatus::Confirmed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_overlapping_requests_admit_one_booking() {
        let f = fixture();
        let pro = Uuid::new_v4();

        let attempts = (0..20u32).map(|i| {
            let ledger = f.ledger.clone();
            let req = request(&f.service, pro, tomorrow(10, i % 5));
            async move { ledger.create_booking(req).await }
        });
        let results = futures::future::join_all(attempts).await;

        let confirmed = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(BookingError::SlotUnavailable { .. })))
            .count();
        assert_eq!(confirmed, 1);
        assert_eq!(rejected, 19);

        let stored = f.ledger.list_bookings(&BookingFilter::for_professional(pro)).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(f.ledger.slots().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_window_is_inclusive_of_exactly_twenty_four_hours() {
        let f = fixture();
        let pro = Uuid::new_v4();
        let t = now();

        let early = f.ledger.create_booking(request(&f.service, pro, t + Duration::hours(25))).await.unwrap();
        let late = f.ledger.create_booking(request(&f.service, pro, t + Duration::hours(23))).await.unwrap();
        let boundary = f.ledger.create_booking(request(&f.service, pro, t + Duration::hours(24))).await.unwrap();

        f.ledger.cancel_booking(early.id).await.unwrap();

        let err = f.ledger.cancel_booking(late.id).await.unwrap_err();
        assert!(matches!(err, BookingError::TooLateToCancel { window_hours: 24, .. }));
        assert_eq!(err.kind(), ErrorKind::TooLateToCancel);
        assert!(f.ledger.slots().contains(late.reservation_id));

        f.ledger.cancel_booking(boundary.id).await.unwrap();

        // One second past the boundary is already too late.
        let pro2 = Uuid::new_v4();
        let tight = f
            .ledger
            .create_booking(request(&f.service, pro2, t + Duration::hours(24)))
            .await
            .unwrap();
        f.clock.advance(Duration::seconds(1));
        assert!(matches!(
            f.ledger.cancel_booking(tight.id).await,
            Err(BookingError::TooLateToCancel { .. })
        ));
    }

    #[tokio::test]
    async fn cancelling_twice_releases_once() {
        let f = fixture();
        let pro = Uuid::new_v4();
        let kept = f.ledger.create_booking(request(&f.service, pro, tomorrow(15, 0))).await.unwrap();
        let booking = f.ledger.create_booking(request(&f.service, pro, tomorrow(10, 0))).await.unwrap();
        assert_eq!(f.ledger.slots().len(), 2);

        f.ledger.cancel_booking(booking.id).await.unwrap();
        assert_eq!(f.ledger.slots().len(), 1);

        let err = f.ledger.cancel_booking(booking.id).await.unwrap_err();
        assert!(matches!(err, BookingError::AlreadyCancelled(id) if id == booking.id));
        assert_eq!(f.ledger.slots().len(), 1);
        assert!(f.ledger.slots().contains(kept.reservation_id));

        let stored = f.ledger.get_booking(booking.id).await.unwrap();
        assert_eq!(stored.status, BookingStatus::Cancelled);
        assert_eq!(stored.updated_at, now());
    }

    #[tokio::test]
    async fn cancelled_slot_reopens() {
        let f = fixture();
        let pro = Uuid::new_v4();
        let first = f.ledger.create_booking(request(&f.service, pro, tomorrow(10, 0))).await.unwrap();
        f.ledger.cancel_booking(first.id).await.unwrap();

        let second = f.ledger.create_booking(request(&f.service, pro, tomorrow(10, 0))).await.unwrap();
        assert_ne!(first.id, second.id);

        let all = f.ledger.list_bookings(&BookingFilter::for_professional(pro)).await.unwrap();
        assert_eq!(all.len(), 2);
        let active = f
            .ledger
            .list_bookings(&BookingFilter {
                status: Some(BookingStatus::Confirmed),
                ..BookingFilter::for_professional(pro)
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
    }

    #[tokio::test]
    async fn listing_is_ordered_by_start_time() {
        let f = fixture();
        for (hour, pro) in [(15, Uuid::new_v4()), (9, Uuid::new_v4()), (12, Uuid::new_v4())] {
            f.ledger.create_booking(request(&f.service, pro, tomorrow(hour, 0))).await.unwrap();
        }

        let starts: Vec<_> = f
            .ledger
            .list_bookings(&BookingFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.start_time)
            .collect();
        assert_eq!(starts, vec![tomorrow(9, 0), tomorrow(12, 0), tomorrow(15, 0)]);
    }

    #[tokio::test]
    async fn invalid_requests_have_no_side_effects() {
        let f = fixture();
        let pro = Uuid::new_v4();

        let mut nameless = request(&f.service, pro, tomorrow(10, 0));
        nameless.client_name = "   ".to_string();
        let mut no_email = request(&f.service, pro, tomorrow(10, 0));
        no_email.client_email = String::new();
        let mut bad_email = request(&f.service, pro, tomorrow(10, 0));
        bad_email.client_email = "marta.example.com".to_string();
        let past = request(&f.service, pro, now() - Duration::minutes(5));
        let at_now = request(&f.service, pro, now());

        for req in [nameless, no_email, bad_email, past, at_now] {
            let err = f.ledger.create_booking(req).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValidationError);
            assert!(!err.is_retryable());
        }
        assert_eq!(f.ledger.slots().len(), 0);
        assert!(f.ledger.list_bookings(&BookingFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let f = fixture();
        let mut req = request(&f.service, Uuid::new_v4(), tomorrow(10, 0));
        req.service_id = Uuid::new_v4();

        let err = f.ledger.create_booking(req).await.unwrap_err();
        assert!(matches!(err, BookingError::NotFound { entity: "service", .. }));
        let err = f.ledger.cancel_booking(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BookingError::NotFound { entity: "booking", .. }));
        assert_eq!(f.ledger.slots().len(), 0);
    }

    #[tokio::test]
    async fn notification_is_sent_once_per_booking() {
        let mut f = fixture();
        let booking = f
            .ledger
            .create_booking(request(&f.service, Uuid::new_v4(), tomorrow(10, 0)))
            .await
            .unwrap();

        let notified = tokio::time::timeout(std::time::Duration::from_secs(1), f.notified.recv())
            .await
            .unwrap();
        assert_eq!(notified, Some(booking.id));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(f.notified.try_recv().is_err());
    }

    #[tokio::test]
    async fn notification_failure_keeps_booking() {
        let (sink, notified) = FailingSink::new();
        let mut f = fixture_with(Arc::new(sink), notified);
        let booking = f
            .ledger
            .create_booking(request(&f.service, Uuid::new_v4(), tomorrow(10, 0)))
            .await
            .unwrap();

        let attempted = tokio::time::timeout(std::time::Duration::from_secs(1), f.notified.recv())
            .await
            .unwrap();
        assert_eq!(attempted, Some(booking.id));
        assert_eq!(f.ledger.get_booking(booking.id).await.unwrap().status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn persistence_failure_releases_reservation() {
        let f = fixture();
        let pro = Uuid::new_v4();
        f.store.fail_writes(true);

        let err = f
            .ledger
            .create_booking(request(&f.service, pro, tomorrow(10, 0)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceError);
        assert!(err.is_retryable());
        assert_eq!(f.ledger.slots().len(), 0);

        f.store.fail_writes(false);
        assert!(f.ledger.create_booking(request(&f.service, pro, tomorrow(10, 0))).await.is_ok());
    }

    #[tokio::test]
    async fn failed_cancellation_converges_on_retry() {
        let f = fixture();
        let booking = f
            .ledger
            .create_booking(request(&f.service, Uuid::new_v4(), tomorrow(10, 0)))
            .await
            .unwrap();

        f.store.fail_writes(true);
        let err = f.ledger.cancel_booking(booking.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceError);
        assert!(f.ledger.slots().contains(booking.reservation_id));
        assert_eq!(f.ledger.get_booking(booking.id).await.unwrap().status, BookingStatus::Confirmed);

        f.store.fail_writes(false);
        f.ledger.cancel_booking(booking.id).await.unwrap();
        assert_eq!(f.ledger.get_booking(booking.id).await.unwrap().status, BookingStatus::Cancelled);
        assert!(!f.ledger.slots().contains(booking.reservation_id));
    }

    #[tokio::test]
    async fn failed_cancellation_keeps_slot_taken() {
        let f = fixture();
        let pro = Uuid::new_v4();
        let booking = f.ledger.create_booking(request(&f.service, pro, tomorrow(10, 0))).await.unwrap();

        f.store.fail_writes(true);
        assert!(f.ledger.cancel_booking(booking.id).await.is_err());
        f.store.fail_writes(false);

        // Inside the window now, so the booking stays and so must its reservation.
        f.clock.set(tomorrow(9, 0));
        assert!(matches!(
            f.ledger.cancel_booking(booking.id).await,
            Err(BookingError::TooLateToCancel { .. })
        ));
        let err = f
            .ledger
            .create_booking(request(&f.service, pro, tomorrow(10, 15)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SlotUnavailable);
        assert_eq!(f.ledger.slots().reservations_for(pro).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cancels_admit_one_success() {
        let f = fixture();
        let booking = f
            .ledger
            .create_booking(request(&f.service, Uuid::new_v4(), tomorrow(10, 0)))
            .await
            .unwrap();

        let attempts = (0..8).map(|_| {
            let ledger = f.ledger.clone();
            async move { ledger.cancel_booking(booking.id).await }
        });
        let results = futures::future::join_all(attempts).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, BookingError::AlreadyCancelled(id) if *id == booking.id)));
        assert_eq!(f.ledger.slots().len(), 0);
        assert_eq!(f.ledger.get_booking(booking.id).await.unwrap().status, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn finished_bookings_leave_the_index() {
        let f = fixture();
        let pro = Uuid::new_v4();
        for hour in 9..17 {
            f.ledger.create_booking(request(&f.service, pro, tomorrow(hour, 0))).await.unwrap();
        }
        assert_eq!(f.ledger.slots().len(), 8);

        f.clock.set(tomorrow(18, 0));
        f.ledger.create_booking(request(&f.service, pro, tomorrow(19, 0))).await.unwrap();

        assert_eq!(f.ledger.slots().len(), 1);
        assert_eq!(f.ledger.list_bookings(&BookingFilter::for_professional(pro)).await.unwrap().len(), 9);
    }

    #[tokio::test]
    async fn caller_timeout_does_not_abandon_reservation() {
        let f = fixture();
        let pro = Uuid::new_v4();
        f.store.delay_inserts(std::time::Duration::from_millis(100));

        let attempt = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            f.ledger.create_booking(request(&f.service, pro, tomorrow(10, 0))),
        )
        .await;
        assert!(attempt.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let stored = f.ledger.list_bookings(&BookingFilter::for_professional(pro)).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(f.ledger.slots().contains(stored[0].reservation_id));
        assert_eq!(f.ledger.slots().len(), 1);
    }

    #[tokio::test]
    async fn repeated_idempotency_key_returns_original_booking() {
        let f = fixture();
        let mut req = request(&f.service, Uuid::new_v4(), tomorrow(10, 0));
        req.idempotency_key = Some("checkout-7f3a".to_string());

        let first = f.ledger.create_booking(req.clone()).await.unwrap();
        let second = f.ledger.create_booking(req).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(f.ledger.slots().len(), 1);
    }

    #[tokio::test]
    async fn booking_keeps_terms_after_service_edit() {
        let f = fixture();
        let booking = f
            .ledger
            .create_booking(request(&f.service, Uuid::new_v4(), tomorrow(10, 0)))
            .await
            .unwrap();

        f.catalog.update(ServiceInfo {
            duration_minutes: 90,
            price: BigDecimal::from(99),
            ..f.service.clone()
        });

        let stored = f.ledger.get_booking(booking.id).await.unwrap();
        assert_eq!(stored.duration_minutes, 30);
        assert_eq!(stored.price, BigDecimal::from(40));
    }

    #[tokio::test]
    async fn store_level_overlap_is_reported_as_unavailable() {
        let f = fixture();
        let pro = Uuid::new_v4();

        // Written by another instance; this ledger's index has never seen it.
        let foreign = Booking::confirmed(Uuid::new_v4(), request(&f.service, pro, tomorrow(10, 0)), &f.service, now());
        f.store.insert(&foreign).await.unwrap();

        let err = f
            .ledger
            .create_booking(request(&f.service, pro, tomorrow(10, 15)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SlotUnavailable);
        assert_eq!(f.ledger.slots().len(), 0);
    }

    #[tokio::test]
    async fn restore_rebuilds_active_reservations() {
        let f = fixture();
        let pro = Uuid::new_v4();

        let active = Booking::confirmed(Uuid::new_v4(), request(&f.service, pro, tomorrow(10, 0)), &f.service, now());
        let mut cancelled = Booking::confirmed(Uuid::new_v4(), request(&f.service, pro, tomorrow(12, 0)), &f.service, now());
        cancelled.status = BookingStatus::Cancelled;
        let finished = Booking::confirmed(
            Uuid::new_v4(),
            request(&f.service, pro, now() - Duration::hours(3)),
            &f.service,
            now(),
        );
        for booking in [&active, &cancelled, &finished] {
            f.store.insert(booking).await.unwrap();
        }

        assert_eq!(f.ledger.restore().await.unwrap(), 1);
        assert!(f.ledger.slots().contains(active.reservation_id));

        let err = f
            .ledger
            .create_booking(request(&f.service, pro, tomorrow(10, 0)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SlotUnavailable);
        assert!(f.ledger.create_booking(request(&f.service, pro, tomorrow(12, 0))).await.is_ok());

        f.ledger.cancel_booking(active.id).await.unwrap();
        assert!(!f.ledger.slots().contains(active.reservation_id));
    }

    #[tokio::test]
    async fn free_slots_skip_reserved_and_past_starts() {
        let f = fixture();
        let pro = Uuid::new_v4();
        f.ledger.create_booking(request(&f.service, pro, tomorrow(10, 0))).await.unwrap();

        let free = f
            .ledger
            .free_slots(pro, f.service.id, tomorrow(9, 0), tomorrow(11, 0), 30)
            .await
            .unwrap();
        assert_eq!(free, vec![tomorrow(9, 0), tomorrow(9, 30), tomorrow(10, 30)]);

        f.clock.set(tomorrow(9, 15));
        let free = f
            .ledger
            .free_slots(pro, f.service.id, tomorrow(9, 0), tomorrow(11, 0), 30)
            .await
            .unwrap();
        assert_eq!(free, vec![tomorrow(9, 30), tomorrow(10, 30)]);

        let err = f
            .ledger
            .free_slots(pro, f.service.id, tomorrow(11, 0), tomorrow(9, 0), 30)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn free_slots_reject_oversized_steps_and_stop_at_the_calendar_end() {
        let f = fixture();
        let pro = Uuid::new_v4();

        for step in [14 * 24 * 60 + 1, 1_000_000_000_000, i64::MAX] {
            let err = f
                .ledger
                .free_slots(pro, f.service.id, tomorrow(9, 0), tomorrow(11, 0), step)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValidationError);
        }

        let whole_window = f
            .ledger
            .free_slots(pro, f.service.id, tomorrow(9, 0), tomorrow(11, 0), 14 * 24 * 60)
            .await
            .unwrap();
        assert_eq!(whole_window, vec![tomorrow(9, 0)]);

        let last = DateTime::<Utc>::MAX_UTC;
        let free = f
            .ledger
            .free_slots(pro, f.service.id, last - Duration::hours(1), last, 30)
            .await
            .unwrap();
        assert_eq!(free.len(), 2);
    }
}
