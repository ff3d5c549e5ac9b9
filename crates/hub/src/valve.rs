//! Channel outputs via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation only logs state changes.

use anyhow::{bail, Context, Result};
use irrigation_planner::ChannelId;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Parse the channel wiring, e.g. `"17,27,-,22"`. The position in the list
/// is the channel id; `-` or an empty entry leaves that channel unwired.
pub(crate) fn parse_channel_pins(spec: &str) -> Result<Vec<(ChannelId, u8)>> {
    let mut wiring = Vec::new();
    let mut seen_pins: HashSet<u8> = HashSet::new();

    for (i, entry) in spec.split(',').map(str::trim).enumerate() {
        if entry.is_empty() || entry == "-" {
            continue;
        }
        let channel = u8::try_from(i).context("too many channels in CHANNEL_PINS")?;
        let pin: u8 = entry
            .parse()
            .with_context(|| format!("channel {channel}: '{entry}' is not a GPIO pin number"))?;
        if !VALID_GPIO_PINS.contains(&pin) {
            bail!("channel {channel}: gpio {pin} is not a valid BCM GPIO pin (allowed: 2-27)");
        }
        if !seen_pins.insert(pin) {
            bail!("channel {channel}: gpio {pin} is already used by another channel");
        }
        wiring.push((ChannelId(channel), pin));
    }

    Ok(wiring)
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Real GPIO board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct ValveBoard {
    pins: HashMap<ChannelId, OutputPin>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl ValveBoard {
    pub(crate) fn new(channel_pins: &[(ChannelId, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (channel, pin_num) in channel_pins {
            let mut pin = gpio.get(*pin_num)?.into_output();

            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.insert(*channel, pin);
        }

        info!(channels = pins.len(), active_low, "gpio board initialised");
        Ok(Self { pins, active_low })
    }

    pub(crate) fn set(&mut self, channel: ChannelId, on: bool) {
        let Some(pin) = self.pins.get_mut(&channel) else {
            warn!(%channel, "channel is not wired, ignoring");
            return;
        };
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(%channel, state = on_off(on), "channel set");
    }

    pub(crate) fn all_off(&mut self) {
        let channels: Vec<ChannelId> = self.pins.keys().copied().collect();
        for channel in channels {
            self.set(channel, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Mock board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct ValveBoard {
    pub(super) channels: HashMap<ChannelId, bool>,
}

#[cfg(not(feature = "gpio"))]
impl ValveBoard {
    pub(crate) fn new(channel_pins: &[(ChannelId, u8)], _active_low: bool) -> Result<Self> {
        let mut channels = HashMap::new();
        for (channel, pin_num) in channel_pins {
            info!(%channel, gpio = pin_num, "[mock-gpio] registered channel (not wired)");
            channels.insert(*channel, false);
        }
        info!("[mock-gpio] board initialised (no hardware)");
        Ok(Self { channels })
    }

    pub(crate) fn set(&mut self, channel: ChannelId, on: bool) {
        if let Some(state) = self.channels.get_mut(&channel) {
            *state = on;
            info!(%channel, state = on_off(on), "[mock-gpio] channel set");
        } else {
            warn!(%channel, "[mock-gpio] channel is not wired, ignoring");
        }
    }

    pub(crate) fn all_off(&mut self) {
        let channels: Vec<ChannelId> = self.channels.keys().copied().collect();
        for channel in channels {
            self.set(channel, false);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
