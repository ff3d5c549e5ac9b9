use std::fmt;

use crate::event::EventKind;
use crate::{CHANNELS_PER_ZONE, ZONE_NAME_MAX};

/// Identifier of a physical output channel (valve, pump relay, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u8);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// One channel slot of a zone. Disabled slots are ignored for actuation and
/// logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    pub channel: ChannelId,
    pub enabled: bool,
    /// Output state applied when a start event of the zone fires.
    pub start_state: bool,
    /// Output state applied when the derived stop event fires.
    pub stop_state: bool,
}

impl ChannelBinding {
    pub const DISABLED: Self = Self {
        channel: ChannelId(0),
        enabled: false,
        start_state: false,
        stop_state: false,
    };

    pub fn new(channel: ChannelId, start_state: bool, stop_state: bool) -> Self {
        Self {
            channel,
            enabled: true,
            start_state,
            stop_state,
        }
    }
}

impl Default for ChannelBinding {
    fn default() -> Self {
        Self::DISABLED
    }
}

/// A desired output state for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAction {
    pub channel: ChannelId,
    pub on: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneConfig {
    name: String,
    pub channels: [ChannelBinding; CHANNELS_PER_ZONE],
}

impl ZoneConfig {
    /// Build a zone. The name is cut to `ZONE_NAME_MAX` characters and any
    /// bindings beyond `CHANNELS_PER_ZONE` are dropped.
    pub fn new(name: &str, bindings: &[ChannelBinding]) -> Self {
        let mut channels = [ChannelBinding::DISABLED; CHANNELS_PER_ZONE];
        for (slot, binding) in channels.iter_mut().zip(bindings) {
            *slot = *binding;
        }
        Self {
            name: name.chars().take(ZONE_NAME_MAX).collect(),
            channels,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelBinding> + '_ {
        self.channels.iter().filter(|c| c.enabled)
    }

    /// Output states to apply for an event of the given kind on this zone.
    pub fn actions(&self, kind: EventKind) -> impl Iterator<Item = ChannelAction> + '_ {
        self.enabled_channels().map(move |c| ChannelAction {
            channel: c.channel,
            on: match kind {
                EventKind::Start => c.start_state,
                EventKind::Stop => c.stop_state,
            },
        })
    }
}
