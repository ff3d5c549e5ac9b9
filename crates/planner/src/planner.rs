//! The scheduling engine.
//!
//! All mutable scheduling state lives in one [`Plan`] behind a single async
//! mutex. Every acquisition is bounded by the planner's lock timeout; a
//! scheduling cycle holds the guard from search through confirm, so a config
//! reload can never land in the middle of a cycle.
//!
//! ```text
//! next_event_time ──▶ event_handles ──▶ event_data ──▶ (actuate) ──▶ confirm_event
//!                                                                      │
//!                          start event: derive stop event ◀────────────┤
//!                          stop event:  release stop slot ◀────────────┘
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::error::PlannerError;
use crate::event::{add_local_seconds, Event, EventData, EventKind};
use crate::store::{EventHandle, EventStore};
use crate::zone::ZoneConfig;
use crate::{
    DEFAULT_LOCK_TIMEOUT, RECURRING_EVENT_SLOTS, START_EVENT_SLOTS, STOP_EVENT_SLOTS, ZONE_COUNT,
};

// ---------------------------------------------------------------------------
// Collaborator contracts
// ---------------------------------------------------------------------------

/// Validated zones and start events, copied into the plan as a whole.
///
/// Recurring events belong in `events[..RECURRING_EVENT_SLOTS]`, one-shot
/// events in the remaining slots.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub zones: [ZoneConfig; ZONE_COUNT],
    pub events: [Option<Event>; START_EVENT_SLOTS],
}

/// Provider of validated configuration. The planner trusts the snapshot and
/// performs no validation of its own.
pub trait ConfigSource: Send + Sync {
    type Error: fmt::Display;

    fn copy_zones_and_events(&self) -> Result<ConfigSnapshot, Self::Error>;
}

/// Notified after every applied reload, with the plan it was registered on.
/// Runs while the plan lock is held, so it must return quickly.
pub trait UpdateHook: Send {
    fn plan_updated(&self, plan: &Plan);
}

impl<F> UpdateHook for F
where
    F: Fn(&Plan) + Send,
{
    fn plan_updated(&self, plan: &Plan) {
        self(plan)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Applied,
    /// The plan was locked; the update is applied when the lock is released.
    Postponed,
}

// ---------------------------------------------------------------------------
// Plan: the guarded scheduling state
// ---------------------------------------------------------------------------

pub struct Plan {
    tz: Tz,
    zones: [ZoneConfig; ZONE_COUNT],
    start: EventStore<START_EVENT_SLOTS>,
    stop: EventStore<STOP_EVENT_SLOTS>,
    locked: bool,
    update_pending: bool,
    hook: Option<Box<dyn UpdateHook>>,
}

impl Plan {
    fn new(tz: Tz) -> Self {
        Self {
            tz,
            zones: Default::default(),
            start: EventStore::new(EventKind::Start),
            stop: EventStore::new(EventKind::Stop),
            locked: false,
            update_pending: false,
            hook: None,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    // -- Search --------------------------------------------------------------

    /// Time of the earliest upcoming event across start and stop events.
    ///
    /// With `exclude_start_time` the search begins one second after
    /// `start_time`. Every live event's cached occurrence is refreshed
    /// against the search reference, which [`Plan::event_handles`] relies
    /// on. Within one collection the lowest index wins a tie; this ordering
    /// is incidental and not part of the contract.
    pub fn next_event_time(
        &mut self,
        start_time: DateTime<Tz>,
        exclude_start_time: bool,
    ) -> Option<DateTime<Tz>> {
        let mut reference = start_time.with_timezone(&self.tz);
        if exclude_start_time {
            reference = reference + TimeDelta::seconds(1);
        }

        self.start.refresh(reference);
        self.stop.refresh(reference);

        let next_start = self.start.earliest().map(|(_, t)| t);
        let next_stop = self.stop.earliest().map(|(_, t)| t);

        match (next_start, next_stop) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // -- Handle protocol -----------------------------------------------------

    /// Write handles of all live events due exactly at `event_time` into
    /// `dest`, start events first, then stop events. Slots not written are
    /// set to `None`.
    ///
    /// Only meaningful with a time returned by [`Plan::next_event_time`] in
    /// the same cycle; the cached occurrences are not re-evaluated here.
    pub fn event_handles(
        &self,
        event_time: DateTime<Tz>,
        dest: &mut [Option<EventHandle>],
    ) -> Result<usize, PlannerError> {
        let mut due = self
            .start
            .due_at(event_time)
            .chain(self.stop.due_at(event_time));

        dest.fill(None);
        let mut written = 0;
        for (slot, handle) in dest.iter_mut().zip(&mut due) {
            *slot = Some(handle);
            written += 1;
        }

        if due.next().is_some() {
            Err(PlannerError::PartialResult { written })
        } else if written == 0 {
            Err(PlannerError::NotFound)
        } else {
            Ok(written)
        }
    }

    pub fn event_data(&self, handle: EventHandle) -> Result<EventData, PlannerError> {
        self.event(handle)
            .map(Event::data)
            .ok_or(PlannerError::InvalidHandle)
    }

    /// Mark the event behind `handle` as executed.
    ///
    /// A start event derives its stop event. One-shot start events are
    /// released even when no stop slot is free, in which case
    /// `NoStopSlotAvailable` is returned. A stop event releases its slot.
    pub fn confirm_event(&mut self, handle: EventHandle) -> Result<(), PlannerError> {
        let Some(event) = self.event(handle).cloned() else {
            return Err(PlannerError::InvalidHandle);
        };

        match handle.kind {
            EventKind::Start => {
                let derived = self.derive_stop_event(&event);
                // Never fire a one-shot twice, even without a stop event.
                if handle.index >= RECURRING_EVENT_SLOTS {
                    self.start.release(handle.index);
                }
                derived.map(|_| ())
            }
            EventKind::Stop => {
                self.stop.release(handle.index);
                Ok(())
            }
        }
    }

    fn event(&self, handle: EventHandle) -> Option<&Event> {
        match handle.kind {
            EventKind::Start => self.start.get(&handle),
            EventKind::Stop => self.stop.get(&handle),
        }
    }

    fn derive_stop_event(&mut self, start: &Event) -> Result<usize, PlannerError> {
        let Some(start_time) = start.next_occurrence() else {
            warn!(zone = start.zone(), "start event has no resolved occurrence, no stop event added");
            return Err(PlannerError::InvalidArgument(
                "start event has no resolved occurrence".to_string(),
            ));
        };

        let stop_time = add_local_seconds(&start_time, start.duration_secs());
        let mut stop = Event::stop(start.zone(), stop_time.naive_local());
        stop.update_reference_time(start.reference_time().unwrap_or(start_time));

        let Some(slot) = self.stop.allocate(stop) else {
            warn!(
                zone = start.zone(),
                slots = STOP_EVENT_SLOTS,
                "all stop event slots in use, cannot add stop event"
            );
            return Err(PlannerError::NoStopSlotAvailable);
        };

        debug!(
            zone = start.zone(),
            slot,
            start = %start_time,
            stop = %stop_time,
            "stop event added"
        );
        Ok(slot)
    }

    // -- Zones and introspection ---------------------------------------------

    pub fn zone_config(&self, index: usize) -> Result<&ZoneConfig, PlannerError> {
        self.zones.get(index).ok_or_else(|| {
            PlannerError::InvalidArgument(format!(
                "zone index {index} out of range (0..{ZONE_COUNT})"
            ))
        })
    }

    pub fn zones(&self) -> &[ZoneConfig] {
        &self.zones
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn update_pending(&self) -> bool {
        self.update_pending
    }

    pub fn live_start_events(&self) -> usize {
        self.start.live_count()
    }

    /// Stop events waiting to fire, i.e. zones currently watering.
    pub fn active_stop_events(&self) -> usize {
        self.stop.live_count()
    }

    /// All live events with their handles, start events first.
    pub fn events(&self) -> impl Iterator<Item = (EventHandle, &Event)> + '_ {
        let start = self
            .start
            .live()
            .filter_map(|(i, e)| self.start.handle(i).map(|h| (h, e)));
        let stop = self
            .stop
            .live()
            .filter_map(|(i, e)| self.stop.handle(i).map(|h| (h, e)));
        start.chain(stop)
    }

    fn install(&mut self, snapshot: ConfigSnapshot) {
        self.zones = snapshot.zones;
        self.start.replace_all(snapshot.events);
    }

    fn log_planned_events(&mut self, now: DateTime<Tz>) {
        self.start.refresh(now);
        debug!("***** planned events *****");
        for (_, event) in self.start.live() {
            self.log_event_details(event);
        }
        debug!("**************************");
    }

    fn log_event_details(&self, event: &Event) {
        let Some(zone) = self.zones.get(event.zone()) else {
            warn!(zone = event.zone(), "event references unknown zone");
            return;
        };

        let at = event
            .next_occurrence()
            .map(|t| t.format("%d.%m.%Y %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        debug!(
            %at,
            zone = zone.name(),
            duration_secs = event.duration_secs(),
            kind = %event.kind(),
            "event"
        );
        for action in zone.actions(event.kind()) {
            debug!(
                channel = %action.channel,
                state = if action.on { "ON" } else { "OFF" },
                "  channel"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// IrrigationPlanner
// ---------------------------------------------------------------------------

pub struct IrrigationPlanner<S> {
    source: S,
    lock_timeout: Duration,
    plan: Mutex<Plan>,
}

impl<S: ConfigSource> IrrigationPlanner<S> {
    /// Create an empty planner evaluating schedules in `tz`. Nothing is
    /// scheduled until the first [`IrrigationPlanner::on_config_updated`].
    pub fn new(source: S, tz: Tz) -> Self {
        Self {
            source,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            plan: Mutex::new(Plan::new(tz)),
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Acquire the plan for one scheduling cycle.
    pub async fn lock_plan(&self) -> Result<MutexGuard<'_, Plan>, PlannerError> {
        tokio::time::timeout(self.lock_timeout, self.plan.lock())
            .await
            .map_err(|_| PlannerError::Timeout(self.lock_timeout))
    }

    /// Set the config lock. Updates arriving while locked are postponed;
    /// releasing the lock applies a postponed update before returning.
    pub async fn set_lock(&self, locked: bool) -> Result<(), PlannerError> {
        let mut plan = self.lock_plan().await.inspect_err(|e| {
            error!("set_lock: {e}");
        })?;
        self.set_lock_in(&mut plan, locked)
    }

    /// [`IrrigationPlanner::set_lock`] for a caller already holding the plan
    /// from [`IrrigationPlanner::lock_plan`], so a cycle can update the lock
    /// before any reload gets a chance to run.
    pub fn set_lock_in(&self, plan: &mut Plan, locked: bool) -> Result<(), PlannerError> {
        plan.locked = locked;
        if !locked && plan.update_pending {
            info!("config lock released, performing postponed config update");
            plan.update_pending = false;
            self.reload(plan)?;
        }
        Ok(())
    }

    pub async fn config_lock(&self) -> Result<bool, PlannerError> {
        Ok(self.lock_plan().await?.locked)
    }

    /// Called by the config source whenever new validated configuration is
    /// available.
    pub async fn on_config_updated(&self) -> Result<ReloadOutcome, PlannerError> {
        let mut plan = self.lock_plan().await.inspect_err(|e| {
            error!("config update abandoned: {e}");
        })?;

        if plan.locked {
            plan.update_pending = true;
            info!("config update received while locked, postponing");
            return Ok(ReloadOutcome::Postponed);
        }

        info!("config update received");
        self.reload(&mut plan)?;
        Ok(ReloadOutcome::Applied)
    }

    /// Register the single update hook, replacing any previous one.
    pub async fn register_update_hook(
        &self,
        hook: impl UpdateHook + 'static,
    ) -> Result<(), PlannerError> {
        let mut plan = self.lock_plan().await.inspect_err(|e| {
            error!("register_update_hook: {e}");
        })?;
        plan.hook = Some(Box::new(hook));
        Ok(())
    }

    fn reload(&self, plan: &mut Plan) -> Result<(), PlannerError> {
        let snapshot = self.source.copy_zones_and_events().map_err(|e| {
            error!("copying zones and events failed: {e}");
            PlannerError::Source(e.to_string())
        })?;

        plan.install(snapshot);
        plan.log_planned_events(Utc::now().with_timezone(&plan.tz));
        info!(
            start_events = plan.live_start_events(),
            stop_events = plan.active_stop_events(),
            "irrigation plan reloaded"
        );

        let plan: &Plan = plan;
        if let Some(hook) = &plan.hook {
            hook.plan_updated(plan);
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
