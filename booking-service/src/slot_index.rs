use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("professional {professional_id} already has reservation {existing} in this interval")]
pub struct SlotConflict {
    pub professional_id: Uuid,
    pub existing: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotReservation {
    pub id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SlotReservation {
    /// Half-open overlap: `[s1, e1)` and `[s2, e2)` share an instant iff `s1 < e2 && s2 < e1`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end
    }
}

/// Active reservations per professional.
///
/// Each professional's reservations sit behind one map entry; the overlap check
/// and the insert both run while that entry's write guard is held, so two
/// reservations for the same professional are always linearized. Reservations
/// that ended before `now` are dropped from the entry on every insert.
#[derive(Default)]
pub struct SlotIndex {
    professionals: DashMap<Uuid, Vec<SlotReservation>>,
    owners: DashMap<Uuid, Uuid>,
}

impl SlotIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_reserve(
        &self,
        professional_id: Uuid,
        start: DateTime<Utc>,
        duration_minutes: i32,
        now: DateTime<Utc>,
    ) -> Result<Uuid, SlotConflict> {
        self.insert(Uuid::new_v4(), professional_id, start, duration_minutes, now)
    }

    /// Like [`SlotIndex::try_reserve`], but the reservation is rolled back when the
    /// returned guard is dropped without being committed.
    pub fn reserve_pending(
        self: &Arc<Self>,
        professional_id: Uuid,
        start: DateTime<Utc>,
        duration_minutes: i32,
        now: DateTime<Utc>,
    ) -> Result<PendingReservation, SlotConflict> {
        let id = self.try_reserve(professional_id, start, duration_minutes, now)?;
        Ok(PendingReservation {
            index: Arc::clone(self),
            id,
            armed: true,
        })
    }

    /// Re-inserts a reservation that was persisted before a restart.
    pub fn restore(
        &self,
        reservation_id: Uuid,
        professional_id: Uuid,
        start: DateTime<Utc>,
        duration_minutes: i32,
        now: DateTime<Utc>,
    ) -> Result<(), SlotConflict> {
        if self.owners.contains_key(&reservation_id) {
            return Ok(());
        }
        self.insert(reservation_id, professional_id, start, duration_minutes, now)
            .map(|_| ())
    }

    /// Removes a reservation. Returns `false` when it was already gone.
    pub fn release(&self, reservation_id: Uuid) -> bool {
        let Some((_, professional_id)) = self.owners.remove(&reservation_id) else {
            debug!("Reservation {} already released", reservation_id);
            return false;
        };

        if let Some(mut slots) = self.professionals.get_mut(&professional_id) {
            slots.retain(|r| r.id != reservation_id);
        }
        self.professionals
            .remove_if(&professional_id, |_, slots| slots.is_empty());

        debug!("Released reservation {} for professional {}", reservation_id, professional_id);
        true
    }

    #[cfg(test)]
    pub fn is_free(&self, professional_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.professionals
            .get(&professional_id)
            .map_or(true, |slots| !slots.iter().any(|r| r.overlaps(start, end)))
    }

    #[cfg(test)]
    pub fn contains(&self, reservation_id: Uuid) -> bool {
        self.owners.contains_key(&reservation_id)
    }

    /// Reservations of one professional ordered by start.
    pub fn reservations_for(&self, professional_id: Uuid) -> Vec<SlotReservation> {
        let mut slots = self
            .professionals
            .get(&professional_id)
            .map(|slots| slots.value().clone())
            .unwrap_or_default();
        slots.sort_by_key(|r| r.start);
        slots
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    fn insert(
        &self,
        id: Uuid,
        professional_id: Uuid,
        start: DateTime<Utc>,
        duration_minutes: i32,
        now: DateTime<Utc>,
    ) -> Result<Uuid, SlotConflict> {
        let end = start + Duration::minutes(i64::from(duration_minutes));
        let mut slots = self.professionals.entry(professional_id).or_default();

        // Lock order is always professionals -> owners.
        slots.retain(|r| {
            let finished = r.end <= now;
            if finished {
                self.owners.remove(&r.id);
            }
            !finished
        });

        if let Some(existing) = slots.iter().find(|r| r.overlaps(start, end)) {
            return Err(SlotConflict {
                professional_id,
                existing: existing.id,
            });
        }

        slots.push(SlotReservation {
            id,
            start,
            end,
        });
        self.owners.insert(id, professional_id);
        Ok(id)
    }
}

/// A reservation that is released on drop unless [`PendingReservation::commit`] is called.
pub struct PendingReservation {
    index: Arc<SlotIndex>,
    id: Uuid,
    armed: bool,
}

impl PendingReservation {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn commit(mut self) -> Uuid {
        self.armed = false;
        self.id
    }
}

impl Drop for PendingReservation {
    fn drop(&mut self) {
        if self.armed {
            self.index.release(self.id);
        }
    }
}
