use chrono::DateTime;
use chrono_tz::Tz;

use crate::event::{Event, EventKind};

/// Opaque locator of a live event. Valid until the slot it points at is
/// released or replaced; do not keep handles across scheduling cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    pub(crate) index: usize,
    pub(crate) kind: EventKind,
    pub(crate) generation: u32,
}

impl EventHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn is_start(&self) -> bool {
        self.kind == EventKind::Start
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    event: Option<Event>,
    generation: u32,
}

/// Fixed-capacity event collection. A slot is live while it holds an event.
#[derive(Debug, Clone)]
pub(crate) struct EventStore<const N: usize> {
    kind: EventKind,
    slots: [Slot; N],
}

impl<const N: usize> EventStore<N> {
    pub(crate) fn new(kind: EventKind) -> Self {
        Self {
            kind,
            slots: std::array::from_fn(|_| Slot::default()),
        }
    }

    pub(crate) fn get(&self, handle: &EventHandle) -> Option<&Event> {
        if handle.kind != self.kind {
            return None;
        }
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.event.as_ref())
    }

    pub(crate) fn live(&self) -> impl Iterator<Item = (usize, &Event)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.event.as_ref().map(|e| (i, e)))
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live().count()
    }

    /// Re-evaluate every live event against `reference`.
    pub(crate) fn refresh(&mut self, reference: DateTime<Tz>) {
        for event in self.slots.iter_mut().filter_map(|slot| slot.event.as_mut()) {
            event.update_reference_time(reference);
        }
    }

    /// Live event with the earliest cached occurrence. Events without an
    /// occurrence are skipped; on ties the lowest index wins.
    pub(crate) fn earliest(&self) -> Option<(usize, DateTime<Tz>)> {
        let mut best: Option<(usize, DateTime<Tz>)> = None;
        for (i, event) in self.live() {
            let Some(next) = event.next_occurrence() else {
                continue;
            };
            if best.map_or(true, |(_, t)| next < t) {
                best = Some((i, next));
            }
        }
        best
    }

    /// Handles of live events whose cached occurrence equals `time`, in
    /// index order.
    pub(crate) fn due_at(&self, time: DateTime<Tz>) -> impl Iterator<Item = EventHandle> + '_ {
        self.slots.iter().enumerate().filter_map(move |(i, slot)| {
            slot.event
                .as_ref()
                .filter(|e| e.next_occurrence() == Some(time))
                .map(|_| EventHandle {
                    index: i,
                    kind: self.kind,
                    generation: slot.generation,
                })
        })
    }

    /// Place `event` in the first free slot. Fails when every slot is live;
    /// a live slot is never overwritten.
    pub(crate) fn allocate(&mut self, event: Event) -> Option<usize> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.event.is_none())?;
        slot.event = Some(event);
        Some(index)
    }

    pub(crate) fn release(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.event = None;
            slot.generation = slot.generation.wrapping_add(1);
        }
    }

    /// Replace every slot, invalidating all outstanding handles.
    pub(crate) fn replace_all(&mut self, events: [Option<Event>; N]) {
        for (slot, event) in self.slots.iter_mut().zip(events) {
            slot.event = event;
            slot.generation = slot.generation.wrapping_add(1);
        }
    }

    pub(crate) fn handle(&self, index: usize) -> Option<EventHandle> {
        let slot = self.slots.get(index)?;
        slot.event.as_ref().map(|_| EventHandle {
            index,
            kind: self.kind,
            generation: slot.generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Recurrence;
    use chrono::{NaiveTime, TimeZone};
    use chrono_tz::Europe::Berlin;

    fn daily(h: u32, m: u32) -> Event {
        Event::start(
            0,
            60,
            Recurrence::Daily {
                time: NaiveTime::from_hms_opt(h, m, 0).unwrap(),
            },
        )
    }

    fn reference() -> DateTime<Tz> {
        Berlin.with_ymd_and_hms(2026, 6, 10, 6, 0, 0).unwrap()
    }

    #[test]
    fn earliest_ignores_free_slots_and_prefers_lowest_index_on_tie() {
        let mut store: EventStore<4> = EventStore::new(EventKind::Start);
        store.allocate(daily(9, 0));
        store.allocate(daily(7, 0));
        store.allocate(daily(7, 0));
        store.release(0);
        store.refresh(reference());

        let (index, time) = store.earliest().unwrap();
        assert_eq!(index, 1);
        assert_eq!(time, Berlin.with_ymd_and_hms(2026, 6, 10, 7, 0, 0).unwrap());
    }

    #[test]
    fn earliest_on_empty_store_is_none() {
        let store: EventStore<4> = EventStore::new(EventKind::Stop);
        assert!(store.earliest().is_none());
    }

    #[test]
    fn allocate_fails_when_full() {
        let mut store: EventStore<2> = EventStore::new(EventKind::Stop);
        assert_eq!(store.allocate(daily(7, 0)), Some(0));
        assert_eq!(store.allocate(daily(8, 0)), Some(1));
        assert_eq!(store.allocate(daily(9, 0)), None);
        assert_eq!(store.live_count(), 2);
    }

    #[test]
    fn released_slot_is_reused_and_old_handle_goes_stale() {
        let mut store: EventStore<2> = EventStore::new(EventKind::Stop);
        store.allocate(daily(7, 0));
        let old = store.handle(0).unwrap();

        store.release(0);
        assert!(store.get(&old).is_none());

        assert_eq!(store.allocate(daily(8, 0)), Some(0));
        assert!(store.get(&old).is_none());
        assert!(store.get(&store.handle(0).unwrap()).is_some());
    }

    #[test]
    fn replace_all_invalidates_handles() {
        let mut store: EventStore<2> = EventStore::new(EventKind::Start);
        store.allocate(daily(7, 0));
        let old = store.handle(0).unwrap();

        store.replace_all([Some(daily(7, 0)), None]);
        assert!(store.get(&old).is_none());
        assert!(store.handle(0).is_some());
        assert!(store.handle(1).is_none());
    }

    #[test]
    fn get_rejects_handle_of_other_collection() {
        let mut store: EventStore<2> = EventStore::new(EventKind::Start);
        store.allocate(daily(7, 0));
        let mut handle = store.handle(0).unwrap();
        handle.kind = EventKind::Stop;
        assert!(store.get(&handle).is_none());
    }

    #[test]
    fn due_at_returns_matches_in_index_order() {
        let mut store: EventStore<4> = EventStore::new(EventKind::Start);
        store.allocate(daily(7, 0));
        store.allocate(daily(8, 0));
        store.allocate(daily(7, 0));
        store.refresh(reference());

        let seven = Berlin.with_ymd_and_hms(2026, 6, 10, 7, 0, 0).unwrap();
        let idx: Vec<usize> = store.due_at(seven).map(|h| h.index()).collect();
        assert_eq!(idx, vec![0, 2]);
    }
}
