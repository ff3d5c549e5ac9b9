//! Scheduling cycle: sleeps until the planner's next event, then actuates
//! every channel of the zones due at that instant.
//!
//! One cycle runs entirely inside a single plan guard:
//!
//! ```text
//! next_event_time ──▶ event_handles ──▶ event_data ──▶ ValveBoard::set ──▶ confirm_event
//!        ▲                                                                      │
//!        └───────────── sleep until next event / woken by plan update ◀─────────┘
//! ```
//!
//! While any stop event is in flight the planner's config lock is held, so a
//! new irrigation document cannot reshuffle zones under a running watering.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use irrigation_planner::{
    ChannelAction, EventHandle, EventKind, IrrigationPlanner, Plan, PlannerError,
    START_EVENT_SLOTS, STOP_EVENT_SLOTS,
};
use rumqttc::{AsyncClient, QoS};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::SettingsManager;
use crate::mqtt::{channel_state_topic, state_payload};
use crate::state::SharedState;
use crate::valve::ValveBoard;

pub type Planner = IrrigationPlanner<SettingsManager>;

/// Large enough for every start and stop event to be due at once.
const HANDLE_BUFFER: usize = START_EVENT_SLOTS + STOP_EVENT_SLOTS;

/// Upper bound on one sleep, so wall-clock adjustments are picked up.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Pause after failing to acquire the plan.
const RETRY_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

/// One channel output applied on behalf of a zone event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Actuation {
    pub(crate) zone: String,
    pub(crate) kind: EventKind,
    pub(crate) action: ChannelAction,
}

#[derive(Debug)]
pub(crate) enum Cycle {
    /// Nothing scheduled at all.
    Idle,
    /// The next event lies in the future.
    Waiting(DateTime<Tz>),
    /// Events due at `at` were actuated and confirmed.
    Processed {
        at: DateTime<Tz>,
        actuations: Vec<Actuation>,
        failures: Vec<String>,
    },
}

/// Search from `reference` and, if the next event is due by `now`, process
/// everything scheduled at that instant.
pub(crate) fn run_cycle(
    plan: &mut Plan,
    reference: DateTime<Tz>,
    exclude_reference: bool,
    now: DateTime<Tz>,
    board: &mut ValveBoard,
) -> Cycle {
    let Some(at) = plan.next_event_time(reference, exclude_reference) else {
        return Cycle::Idle;
    };
    if at > now {
        return Cycle::Waiting(at);
    }

    let mut actuations = Vec::new();
    let mut failures = Vec::new();

    let mut handles: [Option<EventHandle>; HANDLE_BUFFER] = [None; HANDLE_BUFFER];
    match plan.event_handles(at, &mut handles) {
        Ok(_) => {}
        Err(PlannerError::PartialResult { written }) => {
            warn!(written, %at, "more events due than the handle buffer holds");
        }
        Err(e) => {
            debug!(%at, "no handles for due instant: {e}");
            return Cycle::Processed {
                at,
                actuations,
                failures,
            };
        }
    }

    for handle in handles.into_iter().flatten() {
        let data = match plan.event_data(handle) {
            Ok(data) => data,
            Err(e) => {
                error!(slot = handle.index(), kind = %handle.kind(), "event data: {e}");
                failures.push(format!("{} event {}: {e}", handle.kind(), handle.index()));
                continue;
            }
        };

        let (zone, actions) = match plan.zone_config(data.zone) {
            Ok(zone) => (
                zone.name().to_string(),
                zone.actions(data.kind).collect::<Vec<_>>(),
            ),
            Err(e) => {
                error!(zone = data.zone, "zone lookup: {e}");
                failures.push(e.to_string());
                continue;
            }
        };

        info!(
            zone = %zone,
            kind = %data.kind,
            duration_secs = data.duration_secs,
            "executing event"
        );
        for action in actions {
            board.set(action.channel, action.on);
            actuations.push(Actuation {
                zone: zone.clone(),
                kind: data.kind,
                action,
            });
        }

        if let Err(e) = plan.confirm_event(handle) {
            if e == PlannerError::NoStopSlotAvailable {
                warn!(zone = %zone, "no free stop slot, channels stay in start state");
            } else {
                error!(zone = %zone, "confirming {} event failed: {e}", data.kind);
            }
            failures.push(format!("zone '{zone}': confirming {} event failed: {e}", data.kind));
        }
    }

    Cycle::Processed {
        at,
        actuations,
        failures,
    }
}

/// The guarded part of one loop iteration. After a processed instant the
/// config lock follows the pending stop events before the plan is released,
/// so a config update arriving in between is postponed.
pub(crate) fn run_guarded_cycle(
    planner: &Planner,
    plan: &mut Plan,
    reference: DateTime<Tz>,
    exclude_reference: bool,
    now: DateTime<Tz>,
    board: &mut ValveBoard,
) -> Cycle {
    let mut cycle = run_cycle(plan, reference, exclude_reference, now, board);
    if let Cycle::Processed { failures, .. } = &mut cycle {
        let locked = plan.active_stop_events() > 0;
        if let Err(e) = planner.set_lock_in(plan, locked) {
            error!(locked, "scheduler: updating config lock failed: {e}");
            failures.push(format!("updating config lock failed: {e}"));
        }
    }
    cycle
}

/// Move the search reference forward to `candidate` unless that would
/// revisit an instant already processed.
fn advance_reference(
    reference: DateTime<Tz>,
    exclude_reference: bool,
    candidate: DateTime<Tz>,
) -> (DateTime<Tz>, bool) {
    if candidate > reference {
        (candidate, false)
    } else {
        (reference, exclude_reference)
    }
}

/// Reference after a plan-update wake-up: `now`, or the pending event if it
/// is already due.
fn reference_after_wake(
    reference: DateTime<Tz>,
    exclude_reference: bool,
    now: DateTime<Tz>,
    pending: Option<DateTime<Tz>>,
) -> (DateTime<Tz>, bool) {
    let candidate = pending.map_or(now, |at| now.min(at));
    advance_reference(reference, exclude_reference, candidate)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the scheduling loop. Intended to be `tokio::spawn`-ed from main;
/// `wake` is notified by the planner's update hook.
pub async fn run(
    planner: Arc<Planner>,
    mut board: ValveBoard,
    shared: SharedState,
    mqtt: AsyncClient,
    wake: Arc<Notify>,
    tz: Tz,
) {
    let mut reference = Utc::now().with_timezone(&tz);
    let mut exclude_reference = false;

    info!(%tz, "scheduler started");
    shared
        .write()
        .await
        .record_system(format!("scheduler started (time zone {tz})"));

    loop {
        let now = Utc::now().with_timezone(&tz);
        let (cycle, locked) = match planner.lock_plan().await {
            Ok(mut plan) => {
                let cycle = run_guarded_cycle(
                    &planner,
                    &mut plan,
                    reference,
                    exclude_reference,
                    now,
                    &mut board,
                );
                (cycle, plan.is_locked())
            }
            Err(e) => {
                error!("scheduler: {e}");
                shared.write().await.record_error(format!("scheduler: {e}"));
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        match cycle {
            Cycle::Processed {
                at,
                actuations,
                failures,
            } => {
                reference = at;
                exclude_reference = true;
                report(&shared, &mqtt, &actuations, &failures).await;
                shared.write().await.config_locked = locked;
            }
            Cycle::Waiting(at) => {
                shared.write().await.next_event = Some(at.with_timezone(&Utc));
                let wait = (at - now).to_std().unwrap_or_default().min(MAX_SLEEP);
                debug!(next = %at, ?wait, "sleeping until next event");

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = wake.notified() => {
                        debug!("plan updated, rescheduling");
                        let now = Utc::now().with_timezone(&tz);
                        (reference, exclude_reference) =
                            reference_after_wake(reference, exclude_reference, now, Some(at));
                    }
                }
            }
            Cycle::Idle => {
                shared.write().await.next_event = None;
                debug!("nothing scheduled, waiting for a plan update");
                wake.notified().await;
                let now = Utc::now().with_timezone(&tz);
                (reference, exclude_reference) =
                    reference_after_wake(reference, exclude_reference, now, None);
            }
        }
    }
}

/// Publish channel states and record the cycle in the status buffer.
async fn report(
    shared: &SharedState,
    mqtt: &AsyncClient,
    actuations: &[Actuation],
    failures: &[String],
) {
    for a in actuations {
        if let Err(e) = mqtt.try_publish(
            channel_state_topic(a.action.channel),
            QoS::AtLeastOnce,
            true,
            state_payload(a.action.on),
        ) {
            warn!(channel = %a.action.channel, "failed to publish channel state: {e}");
        }
    }

    let mut st = shared.write().await;
    for a in actuations {
        st.record_channel(a.action.channel, a.action.on, &a.zone, a.kind);
    }
    for f in failures {
        st.record_error(f.clone());
    }
}

// ===========================================================================
// Tests
// ===========================================================================
