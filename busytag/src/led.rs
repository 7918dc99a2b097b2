//! LED color, zone mask and pattern step types.
//!
//! These are pure value types. The engine performs no brightness scaling:
//! an [`Rgb`] goes on the wire exactly as given.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// An RGB color, 0-255 per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Rgb {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
}

impl Rgb {
    /// All channels off.
    pub const OFF: Self = Self::new(0, 0, 0);

    /// Create a color from its channels.
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `RRGGBB`, with or without a leading `#`.
    pub fn from_hex(s: &str) -> Result<Self> {
        let hex = s
            .trim()
            .trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(Error::InvalidArgument(format!(
                "color '{s}' is not in RRGGBB form"
            )));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| Error::InvalidArgument(format!("color '{s}' is not valid hex")))
        };
        Ok(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }

    /// Upper-case `RRGGBB` form used on the wire.
    pub fn to_hex(self) -> String {
        format!("{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.to_hex())
    }
}

impl FromStr for Rgb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Selection of LED zones, 1-127.
///
/// The device has up to 7 independently addressable zones. Which bit drives
/// which zone is device specific, so the mask is only range checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
pub struct LedMask(u8);

impl LedMask {
    /// Every zone.
    pub const ALL: Self = Self(127);

    /// Smallest valid mask.
    pub const MIN: u8 = 1;

    /// Largest valid mask.
    pub const MAX: u8 = 127;

    /// Validate a raw mask.
    pub fn new(bits: u8) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&bits) {
            Ok(Self(bits))
        } else {
            Err(Error::InvalidArgument(format!(
                "LED mask {bits} out of range {}-{}",
                Self::MIN,
                Self::MAX
            )))
        }
    }

    /// Raw mask value.
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl Default for LedMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl TryFrom<u8> for LedMask {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self> {
        Self::new(bits)
    }
}

impl From<LedMask> for u8 {
    fn from(mask: LedMask) -> Self {
        mask.0
    }
}

/// One step of a custom LED pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternStep {
    /// Zones lit by this step.
    pub leds: LedMask,
    /// Target color.
    pub color: Rgb,
    /// How long the step lasts.
    pub duration: Duration,
    /// Fade into the color instead of switching instantly.
    pub transition: bool,
}

impl PatternStep {
    /// A step on all zones.
    pub fn new(color: Rgb, duration: Duration, transition: bool) -> Self {
        Self {
            leds: LedMask::ALL,
            color,
            duration,
            transition,
        }
    }

    /// Restrict the step to some zones.
    #[must_use]
    pub fn with_leds(mut self, leds: LedMask) -> Self {
        self.leds = leds;
        self
    }

    /// Wire form: `<mask>,<RRGGBB>,<duration ms>,<transition>`.
    pub fn encode(&self) -> String {
        format!(
            "{},{},{},{}",
            self.leds.bits(),
            self.color.to_hex(),
            self.duration.as_millis(),
            u8::from(self.transition)
        )
    }
}
