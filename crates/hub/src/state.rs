use chrono::{DateTime, Utc};
use irrigation_planner::{ChannelId, EventKind};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Maximum number of entries retained in the activity ring buffer.
const MAX_ACTIVITY: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub config_locked: bool,
    pub next_event: Option<DateTime<Utc>>,
    pub channels: BTreeMap<u8, ChannelState>,
    pub activity: VecDeque<Activity>,
}

#[derive(Clone, Serialize)]
pub struct ChannelState {
    pub on: bool,
    pub gpio_pin: u8,
    pub last_changed: Option<DateTime<Utc>>,
}

#[derive(Clone, Serialize)]
pub struct Activity {
    pub ts: DateTime<Utc>,
    pub kind: ActivityKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Channel,
    Config,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub config_locked: bool,
    pub next_event: Option<DateTime<Utc>>,
    pub channels: BTreeMap<u8, ChannelState>,
    pub activity: Vec<Activity>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(channel_pins: &[(ChannelId, u8)]) -> Self {
        let channels = channel_pins
            .iter()
            .map(|(channel, pin)| {
                (
                    channel.0,
                    ChannelState {
                        on: false,
                        gpio_pin: *pin,
                        last_changed: None,
                    },
                )
            })
            .collect();

        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            config_locked: false,
            next_event: None,
            channels,
            activity: VecDeque::with_capacity(MAX_ACTIVITY),
        }
    }

    /// Record a channel actuation caused by an event of `zone`.
    pub fn record_channel(&mut self, channel: ChannelId, on: bool, zone: &str, kind: EventKind) {
        if let Some(state) = self.channels.get_mut(&channel.0) {
            state.on = on;
            state.last_changed = Some(Utc::now());
        }

        let state_str = if on { "ON" } else { "OFF" };
        self.push(
            ActivityKind::Channel,
            format!("{channel} set {state_str} ({kind} of zone '{zone}')"),
        );
    }

    pub fn record_config(&mut self, detail: String) {
        self.push(ActivityKind::Config, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push(ActivityKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push(ActivityKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest activity first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            config_locked: self.config_locked,
            next_event: self.next_event,
            channels: self.channels.clone(),
            activity: self.activity.iter().rev().cloned().collect(),
        }
    }

    fn push(&mut self, kind: ActivityKind, detail: String) {
        if self.activity.len() >= MAX_ACTIVITY {
            self.activity.pop_front();
        }
        self.activity.push_back(Activity {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
