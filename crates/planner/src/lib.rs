//! Event scheduling engine for an irrigation controller.
//!
//! The planner owns a fixed table of zone definitions and two fixed-capacity
//! event collections: configured *start* events (recurring and one-shot) and
//! runtime-derived *stop* events. A scheduling cycle asks for the next event
//! time, looks up the handles due at that time, reads their data, actuates
//! externally and confirms each handle. Confirming a start event derives the
//! matching stop event.

mod error;
mod event;
mod planner;
mod store;
mod zone;

use std::time::Duration;

pub use error::PlannerError;
pub use event::{Event, EventData, EventKind, Recurrence, Weekdays};
pub use planner::{ConfigSnapshot, ConfigSource, IrrigationPlanner, Plan, ReloadOutcome, UpdateHook};
pub use store::EventHandle;
pub use zone::{ChannelAction, ChannelBinding, ChannelId, ZoneConfig};

/// Number of zone definitions held by the planner.
pub const ZONE_COUNT: usize = 8;

/// Channel bindings per zone.
pub const CHANNELS_PER_ZONE: usize = 4;

/// Maximum zone name length in characters.
pub const ZONE_NAME_MAX: usize = 32;

/// Start slots reserved for recurring events. They occupy the front of the
/// start collection.
pub const RECURRING_EVENT_SLOTS: usize = 16;

/// Start slots reserved for one-shot events, placed after the recurring ones.
pub const ONE_SHOT_EVENT_SLOTS: usize = 8;

pub const START_EVENT_SLOTS: usize = RECURRING_EVENT_SLOTS + ONE_SHOT_EVENT_SLOTS;

pub const STOP_EVENT_SLOTS: usize = 8;

/// Default bound on every plan lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);
