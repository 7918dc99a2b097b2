//! Color names, color parsing and the built-in pattern catalog.

use crate::config::{Config, PatternConfig, PatternStepConfig};
use busytag::{MAX_BRIGHTNESS, Rgb};

/// Named colors accepted by `busytag color`.
pub(crate) const NAMED_COLORS: &[(&str, Rgb)] = &[
    ("red", Rgb::new(255, 0, 0)),
    ("green", Rgb::new(0, 255, 0)),
    ("blue", Rgb::new(0, 0, 255)),
    ("yellow", Rgb::new(255, 255, 0)),
    ("cyan", Rgb::new(0, 255, 255)),
    ("magenta", Rgb::new(255, 0, 255)),
    ("white", Rgb::new(255, 255, 255)),
    ("off", Rgb::OFF),
];

/// Parse a color given as a name, `RRGGBB` / `#RRGGBB`, or `r,g,b`.
pub(crate) fn parse_color(input: &str) -> Result<Rgb, String> {
    let input = input.trim();

    if input.contains(',') {
        let channels: Vec<&str> = input.split(',').collect();
        if channels.len() != 3 {
            return Err(format!(
                "Invalid color '{input}'. Expected 'r,g,b' (e.g., '255,0,0')"
            ));
        }
        let channel = |s: &str| {
            s.trim()
                .parse::<u8>()
                .map_err(|_| format!("Invalid color channel '{}': expected 0-255", s.trim()))
        };
        return Ok(Rgb::new(
            channel(channels[0])?,
            channel(channels[1])?,
            channel(channels[2])?,
        ));
    }

    if let Some((_, rgb)) = NAMED_COLORS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(input))
    {
        return Ok(*rgb);
    }

    Rgb::from_hex(input).map_err(|_| {
        let names: Vec<&str> = NAMED_COLORS
            .iter()
            .map(|(name, _)| *name)
            .collect();
        format!(
            "Unknown color '{input}'. Use RRGGBB, r,g,b or one of: {}",
            names.join(", ")
        )
    })
}

/// Scale every channel by `brightness` percent (truncating).
pub(crate) fn scale(color: Rgb, brightness: u8) -> Rgb {
    let brightness = u16::from(brightness.min(MAX_BRIGHTNESS));
    let channel =
        |c: u8| u8::try_from(u16::from(c) * brightness / u16::from(MAX_BRIGHTNESS)).unwrap_or(u8::MAX);
    Rgb::new(channel(color.r), channel(color.g), channel(color.b))
}

fn step(color: &str, duration_ms: u64, transition: bool) -> PatternStepConfig {
    PatternStepConfig {
        color: color.to_string(),
        duration_ms,
        transition,
        leds: None,
    }
}

fn flashes(name: &str, color: &str) -> PatternConfig {
    PatternConfig {
        name: name.to_string(),
        steps: vec![
            step(color, 100, false),
            step("000000", 100, false),
            step(color, 100, false),
            step("000000", 700, false),
        ],
    }
}

/// Patterns available without any configuration.
pub(crate) fn builtin_patterns() -> Vec<PatternConfig> {
    vec![
        PatternConfig {
            name: "police".to_string(),
            steps: vec![
                step("FF0000", 150, false),
                step("000000", 50, false),
                step("0000FF", 150, false),
                step("000000", 50, false),
            ],
        },
        flashes("red-flashes", "FF0000"),
        flashes("green-flashes", "00FF00"),
        flashes("blue-flashes", "0000FF"),
        flashes("yellow-flashes", "FFFF00"),
        flashes("white-flashes", "FFFFFF"),
        PatternConfig {
            name: "breathe".to_string(),
            steps: vec![step("FFFFFF", 1500, true), step("000000", 1500, true)],
        },
        PatternConfig {
            name: "rainbow".to_string(),
            steps: vec![
                step("FF0000", 800, true),
                step("FFFF00", 800, true),
                step("00FF00", 800, true),
                step("00FFFF", 800, true),
                step("0000FF", 800, true),
                step("FF00FF", 800, true),
            ],
        },
    ]
}

/// The full catalog: built-ins, with configured patterns overriding by name.
pub(crate) fn pattern_catalog(config: &Config) -> Vec<PatternConfig> {
    let mut catalog: Vec<PatternConfig> = builtin_patterns()
        .into_iter()
        .filter(|p| config.pattern(&p.name).is_none())
        .collect();
    catalog.extend(config.patterns.iter().cloned());
    catalog
}

/// Look up a pattern by name, ignoring case.
pub(crate) fn find_pattern(config: &Config, name: &str) -> Option<PatternConfig> {
    pattern_catalog(config)
        .into_iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
}
