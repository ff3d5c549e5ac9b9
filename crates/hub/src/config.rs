//! JSON irrigation document: parsing, validation, and the settings manager
//! that hands validated snapshots to the planner.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDateTime, NaiveTime, Weekday};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

use irrigation_planner::{
    ChannelBinding, ChannelId, ConfigSnapshot, ConfigSource, Event, Recurrence, ZoneConfig,
    CHANNELS_PER_ZONE, ONE_SHOT_EVENT_SLOTS, RECURRING_EVENT_SLOTS, ZONE_COUNT, ZONE_NAME_MAX,
};

// ---------------------------------------------------------------------------
// Document structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IrrigationConfig {
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub events: Vec<EventEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub name: String,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
    pub channel: u8,
    /// Output state while the zone is watering.
    pub start: bool,
    /// Output state once the watering run ends.
    pub stop: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventEntry {
    /// Index into `zones`.
    pub zone: usize,
    /// Watering duration in seconds.
    pub duration: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub schedule: ScheduleEntry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScheduleEntry {
    Daily { time: NaiveTime },
    Weekly { days: Vec<Weekday>, time: NaiveTime },
    Single { at: NaiveDateTime },
}

fn default_enabled() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Highest channel id a zone may reference.
pub const MAX_CHANNEL_ID: u8 = 15;

/// Longest accepted watering run.
const MAX_DURATION_SECS: u32 = 24 * 60 * 60;

/// Bound on waiting for the shadow snapshot.
const SETTINGS_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl IrrigationConfig {
    /// Validate the whole document. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_zones(&mut errors);
        self.validate_events(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "irrigation config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        if self.zones.len() > ZONE_COUNT {
            errors.push(format!(
                "{} zones defined, at most {ZONE_COUNT} supported",
                self.zones.len()
            ));
        }

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.name.trim().is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.name)
                }
            };

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if z.name.chars().count() > ZONE_NAME_MAX {
                errors.push(format!(
                    "{}: name longer than {ZONE_NAME_MAX} characters",
                    ctx()
                ));
            }

            if z.channels.len() > CHANNELS_PER_ZONE {
                errors.push(format!(
                    "{}: {} channels bound, at most {CHANNELS_PER_ZONE} per zone",
                    ctx(),
                    z.channels.len()
                ));
            }

            let mut seen: HashSet<u8> = HashSet::new();
            for c in &z.channels {
                if c.channel > MAX_CHANNEL_ID {
                    errors.push(format!(
                        "{}: channel {} out of range [0, {MAX_CHANNEL_ID}]",
                        ctx(),
                        c.channel
                    ));
                } else if !seen.insert(c.channel) {
                    errors.push(format!(
                        "{}: channel {} bound more than once",
                        ctx(),
                        c.channel
                    ));
                }
            }
        }
    }

    fn validate_events(&self, errors: &mut Vec<String>) {
        let mut recurring = 0usize;
        let mut single = 0usize;

        for (i, e) in self.events.iter().enumerate() {
            let ctx = format!("events[{i}]");

            if e.zone >= self.zones.len() {
                errors.push(format!(
                    "{ctx}: zone {} does not match any defined zone",
                    e.zone
                ));
            }

            if !(1..=MAX_DURATION_SECS).contains(&e.duration) {
                errors.push(format!(
                    "{ctx}: duration {} out of range [1, {MAX_DURATION_SECS}] seconds",
                    e.duration
                ));
            }

            if let ScheduleEntry::Weekly { days, .. } = &e.schedule {
                if days.is_empty() {
                    errors.push(format!("{ctx}: weekly schedule has no days"));
                }
            }

            if e.enabled {
                match e.schedule {
                    ScheduleEntry::Single { .. } => single += 1,
                    _ => recurring += 1,
                }
            }
        }

        if recurring > RECURRING_EVENT_SLOTS {
            errors.push(format!(
                "{recurring} enabled recurring events, at most {RECURRING_EVENT_SLOTS} supported"
            ));
        }
        if single > ONE_SHOT_EVENT_SLOTS {
            errors.push(format!(
                "{single} enabled single events, at most {ONE_SHOT_EVENT_SLOTS} supported"
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    /// Lay the validated document out the way the planner stores it:
    /// recurring events from slot 0, single events after the recurring
    /// region. Disabled events are left out.
    pub fn to_snapshot(&self) -> ConfigSnapshot {
        let mut snapshot = ConfigSnapshot::default();

        for (slot, z) in snapshot.zones.iter_mut().zip(&self.zones) {
            let bindings: Vec<ChannelBinding> = z
                .channels
                .iter()
                .map(|c| ChannelBinding::new(ChannelId(c.channel), c.start, c.stop))
                .collect();
            *slot = ZoneConfig::new(&z.name, &bindings);
        }

        let (single, recurring): (Vec<&EventEntry>, Vec<&EventEntry>) = self
            .events
            .iter()
            .filter(|e| e.enabled)
            .partition(|e| matches!(e.schedule, ScheduleEntry::Single { .. }));

        let (recurring_slots, single_slots) = snapshot.events.split_at_mut(RECURRING_EVENT_SLOTS);
        for (slot, e) in recurring_slots.iter_mut().zip(recurring) {
            *slot = Some(e.to_event());
        }
        for (slot, e) in single_slots.iter_mut().zip(single) {
            *slot = Some(e.to_event());
        }

        snapshot
    }
}

impl EventEntry {
    fn to_event(&self) -> Event {
        let recurrence = match &self.schedule {
            ScheduleEntry::Daily { time } => Recurrence::Daily { time: *time },
            ScheduleEntry::Weekly { days, time } => Recurrence::Weekly {
                days: days.iter().copied().collect(),
                time: *time,
            },
            ScheduleEntry::Single { at } => Recurrence::Once { at: *at },
        };
        Event::start(self.zone, self.duration, recurrence)
    }
}

/// Parse and validate a JSON irrigation document.
pub fn parse(json: &[u8]) -> Result<IrrigationConfig> {
    let config: IrrigationConfig =
        serde_json::from_slice(json).context("failed to parse irrigation config json")?;
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Settings manager
// ---------------------------------------------------------------------------

/// Holds the last accepted configuration as a ready-made planner snapshot.
pub struct SettingsManager {
    shadow: Mutex<ConfigSnapshot>,
}

impl SettingsManager {
    pub fn new() -> Self {
        Self {
            shadow: Mutex::new(ConfigSnapshot::default()),
        }
    }

    /// Validate `json` and replace the shadow snapshot. The previous
    /// snapshot is kept when the document is rejected.
    pub fn update_irrigation_config(&self, json: &[u8]) -> Result<()> {
        let config = parse(json)?;
        let snapshot = config.to_snapshot();

        *self.lock_shadow()? = snapshot;

        info!(
            zones = config.zones.len(),
            events = config.events.iter().filter(|e| e.enabled).count(),
            "irrigation config stored"
        );
        Ok(())
    }

    /// Read the initial document from disk.
    pub fn load(&self, path: &str) -> Result<()> {
        let contents =
            std::fs::read(path).with_context(|| format!("failed to read config: {path}"))?;
        self.update_irrigation_config(&contents)
            .with_context(|| format!("invalid config: {path}"))
    }

    fn lock_shadow(&self) -> Result<parking_lot::MutexGuard<'_, ConfigSnapshot>> {
        self.shadow
            .try_lock_for(SETTINGS_LOCK_TIMEOUT)
            .ok_or_else(|| anyhow!("settings lock not acquired within {SETTINGS_LOCK_TIMEOUT:?}"))
    }
}

impl Default for SettingsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSource for SettingsManager {
    type Error = anyhow::Error;

    fn copy_zones_and_events(&self) -> Result<ConfigSnapshot> {
        Ok(self.lock_shadow()?.clone())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
