//! BusyTag AT-style wire protocol.
//!
//! ## Framing
//!
//! ```text
//! host   -> AT+<CMD>[=<args>]\r\n  [raw payload]
//! device -> [+<TAG>:<value>\r\n]*  [raw segment]  OK\r\n | ERROR[:<reason>]\r\n
//! ```
//!
//! Lines the device pushes on its own (`+SP:`, `+FUS:`, `+WIS:`) may appear
//! at any point, including in the middle of another command's response.

use crate::error::{Error, Result};
use crate::led::{LedMask, PatternStep, Rgb};

/// Longest file name the device accepts.
pub const MAX_FILENAME_LEN: usize = 40;

/// Terminal line for success.
pub const OK: &str = "OK";

/// Terminal line for failure (optionally followed by `:<reason>`).
pub const ERROR: &str = "ERROR";

/// Response and push tags.
pub mod tag {
    /// Device name.
    pub const DEVICE_NAME: &str = "+DN:";
    /// Manufacturer.
    pub const MANUFACTURER: &str = "+MN:";
    /// Unique id.
    pub const DEVICE_ID: &str = "+ID:";
    /// Firmware version.
    pub const FIRMWARE: &str = "+FV:";
    /// Display brightness.
    pub const BRIGHTNESS: &str = "+DB:";
    /// File list entry.
    pub const FILE: &str = "+FL:";
    /// Free storage.
    pub const FREE_STORAGE: &str = "+FSS:";
    /// Total storage.
    pub const TOTAL_STORAGE: &str = "+TSS:";
    /// Picture currently shown (response and push).
    pub const SHOWING: &str = "+SP:";
    /// Upload chunk acknowledgement.
    pub const UPLOAD_ACK: &str = "+UC:";
    /// Download size announcement.
    pub const DOWNLOAD_SIZE: &str = "+GF:";
    /// Download segment header.
    pub const DOWNLOAD_CHUNK: &str = "+GC:";
    /// Firmware update progress push.
    pub const FIRMWARE_STATUS: &str = "+FUS:";
    /// Storage write activity push.
    pub const WRITING: &str = "+WIS:";
}

/// One request to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    line: String,
    payload: Option<Vec<u8>>,
}

impl Request {
    /// A plain command line.
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            payload: None,
        }
    }

    /// A command line followed by raw bytes.
    pub fn with_payload(line: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            line: line.into(),
            payload: Some(payload),
        }
    }

    /// The request line, without terminator.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Raw bytes sent after the line, if any.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload
            .as_deref()
    }

    /// The command part of the line (before `=`), for logs and errors.
    pub fn command(&self) -> &str {
        self.line
            .split('=')
            .next()
            .unwrap_or(&self.line)
    }

    /// `AT+GDN`
    pub fn device_name() -> Self {
        Self::new("AT+GDN")
    }

    /// `AT+GMN`
    pub fn manufacturer() -> Self {
        Self::new("AT+GMN")
    }

    /// `AT+GID`
    pub fn device_id() -> Self {
        Self::new("AT+GID")
    }

    /// `AT+GFV`
    pub fn firmware_version() -> Self {
        Self::new("AT+GFV")
    }

    /// `AT+SC=<mask>,<RRGGBB>`
    pub fn set_color(color: Rgb, leds: LedMask) -> Self {
        Self::new(format!("AT+SC={},{}", leds.bits(), color.to_hex()))
    }

    /// `AT+CP=<loop>,<priority>,<n>;<step>;...`
    pub fn custom_pattern(steps: &[PatternStep], looping: bool, priority: bool) -> Self {
        let mut line = format!(
            "AT+CP={},{},{}",
            u8::from(looping),
            u8::from(priority),
            steps.len()
        );
        for step in steps {
            line.push(';');
            line.push_str(&step.encode());
        }
        Self::new(line)
    }

    /// `AT+GDB`
    pub fn get_brightness() -> Self {
        Self::new("AT+GDB")
    }

    /// `AT+SDB=<level>`
    pub fn set_brightness(level: u8) -> Self {
        Self::new(format!("AT+SDB={level}"))
    }

    /// `AT+GFL`
    pub fn list_files() -> Self {
        Self::new("AT+GFL")
    }

    /// `AT+DF=<name>`
    pub fn delete_file(name: &str) -> Self {
        Self::new(format!("AT+DF={name}"))
    }

    /// `AT+GFSS`
    pub fn free_storage() -> Self {
        Self::new("AT+GFSS")
    }

    /// `AT+GTSS`
    pub fn total_storage() -> Self {
        Self::new("AT+GTSS")
    }

    /// `AT+SP=<name>`
    pub fn show_picture(name: &str) -> Self {
        Self::new(format!("AT+SP={name}"))
    }

    /// `AT+GSP`
    pub fn current_picture() -> Self {
        Self::new("AT+GSP")
    }

    /// `AT+RST`
    pub fn restart() -> Self {
        Self::new("AT+RST")
    }

    /// `AT+FD`
    pub fn format_disk() -> Self {
        Self::new("AT+FD")
    }

    /// `AT+AFSS`
    pub fn activate_storage_scan() -> Self {
        Self::new("AT+AFSS")
    }

    /// `AT+UF=<name>,<size>`
    pub fn begin_upload(name: &str, size: u64) -> Self {
        Self::new(format!("AT+UF={name},{size}"))
    }

    /// `AT+UC=<len>` plus the chunk bytes.
    pub fn upload_chunk(chunk: Vec<u8>) -> Self {
        Self::with_payload(format!("AT+UC={}", chunk.len()), chunk)
    }

    /// `AT+UE`
    pub fn finish_upload() -> Self {
        Self::new("AT+UE")
    }

    /// `AT+UA`
    pub fn abort_upload() -> Self {
        Self::new("AT+UA")
    }

    /// `AT+GF=<name>`
    pub fn begin_download(name: &str) -> Self {
        Self::new(format!("AT+GF={name}"))
    }

    /// `AT+GC`
    pub fn download_chunk() -> Self {
        Self::new("AT+GC")
    }

    /// `AT+GA`
    pub fn abort_download() -> Self {
        Self::new("AT+GA")
    }
}

/// How a response line relates to the command in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// Part of the response.
    Data,
    /// Part of the response, followed by this many raw bytes.
    DataWithBytes(usize),
    /// Terminal success.
    Complete,
    /// Terminal failure with optional reason.
    Failed(Option<String>),
    /// Not part of this response.
    Foreign,
}

/// Recognizes the lines belonging to one command's response.
pub trait ResponseMatcher: Send + Sync {
    /// Classify one received line.
    fn classify(&self, line: &str) -> LineKind;
}

/// Standard matcher: optional data lines with one tag, then `OK`/`ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expect {
    tag: Option<&'static str>,
    binary: bool,
}

impl Expect {
    /// Only a terminal acknowledgement.
    pub const fn ack() -> Self {
        Self {
            tag: None,
            binary: false,
        }
    }

    /// Data lines starting with `tag`, then a terminal line.
    pub const fn data(tag: &'static str) -> Self {
        Self {
            tag: Some(tag),
            binary: false,
        }
    }

    /// A `tag<len>` line followed by `len` raw bytes, then a terminal line.
    pub const fn binary(tag: &'static str) -> Self {
        Self {
            tag: Some(tag),
            binary: true,
        }
    }
}

impl ResponseMatcher for Expect {
    fn classify(&self, line: &str) -> LineKind {
        if let Some(kind) = classify_terminal(line) {
            return kind;
        }
        match self.tag {
            Some(tag) if line.starts_with(tag) => {
                if !self.binary {
                    return LineKind::Data;
                }
                line[tag.len()..]
                    .trim()
                    .parse()
                    .map_or(LineKind::Foreign, LineKind::DataWithBytes)
            },
            _ => LineKind::Foreign,
        }
    }
}

fn classify_terminal(line: &str) -> Option<LineKind> {
    if line == OK {
        return Some(LineKind::Complete);
    }
    let rest = line.strip_prefix(ERROR)?;
    if rest.is_empty() {
        Some(LineKind::Failed(None))
    } else {
        rest.strip_prefix(':')
            .map(|reason| LineKind::Failed(Some(reason.trim().to_string())))
    }
}

/// A line the device sent without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum Unsolicited {
    /// The device switched to showing this file.
    NowDisplaying(String),
    /// Firmware flashing progress in percent.
    FirmwareProgress(f32),
    /// The device started (`true`) or stopped writing to storage.
    WritingInStorage(bool),
}

impl Unsolicited {
    /// Recognize a pushed line.
    pub fn parse(line: &str) -> Option<Self> {
        if let Some(name) = line.strip_prefix(tag::SHOWING) {
            return Some(Self::NowDisplaying(name.trim().to_string()));
        }
        if let Some(value) = line.strip_prefix(tag::FIRMWARE_STATUS) {
            return value
                .trim()
                .parse::<f32>()
                .ok()
                .map(|p| Self::FirmwareProgress(p.clamp(0.0, 100.0)));
        }
        if let Some(value) = line.strip_prefix(tag::WRITING) {
            return match value.trim() {
                "1" => Some(Self::WritingInStorage(true)),
                "0" => Some(Self::WritingInStorage(false)),
                _ => None,
            };
        }
        None
    }
}

/// Lines and raw bytes collected for one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Data lines, terminal line excluded.
    pub lines: Vec<String>,
    /// Raw bytes that followed binary data lines.
    pub data: Vec<u8>,
}

impl Response {
    /// Value of the first line carrying `tag`.
    pub fn field(&self, tag: &str) -> Option<&str> {
        self.fields(tag)
            .next()
    }

    /// Values of every line carrying `tag`.
    pub fn fields<'a>(&'a self, tag: &str) -> impl Iterator<Item = &'a str> {
        self.lines
            .iter()
            .filter_map(move |l| l.strip_prefix(tag))
            .map(str::trim)
    }

    /// Value of the first line carrying `tag`, or a protocol violation.
    pub fn require(&self, tag: &str) -> Result<&str> {
        self.field(tag)
            .ok_or_else(|| Error::ProtocolViolation(format!("response lacks {tag} line")))
    }

    /// Numeric value of the first line carrying `tag`.
    pub fn require_u64(&self, tag: &str) -> Result<u64> {
        let value = self.require(tag)?;
        value
            .parse()
            .map_err(|_| Error::ProtocolViolation(format!("{tag} value '{value}' is not a number")))
    }
}

/// Parse the value of a `+FL:` line: `<name>,<size>`.
///
/// The size follows the last comma so names may themselves contain commas.
pub fn parse_file_entry(value: &str) -> Result<(String, u64)> {
    let (name, size) = value
        .rsplit_once(',')
        .ok_or_else(|| Error::ProtocolViolation(format!("malformed file entry '{value}'")))?;
    let size = size
        .trim()
        .parse()
        .map_err(|_| Error::ProtocolViolation(format!("malformed file size in '{value}'")))?;
    Ok((name.to_string(), size))
}

/// Check a file name before it goes on the wire.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("file name is empty".into()));
    }
    let len = name
        .chars()
        .count();
    if len > MAX_FILENAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "file name '{name}' is {len} characters, limit is {MAX_FILENAME_LEN}"
        )));
    }
    if name
        .chars()
        .any(char::is_control)
    {
        return Err(Error::InvalidArgument(format!(
            "file name '{}' contains control characters",
            name.escape_debug()
        )));
    }
    Ok(())
}

/// Whether a file name looks like a firmware image.
///
/// The engine never acts on this; it is a hint for callers deciding whether
/// to follow an upload with [`Request::activate_storage_scan`].
pub fn is_firmware_name(name: &str) -> bool {
    std::path::Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("bin"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_request_lines() {
        assert_eq!(Request::device_name().line(), "AT+GDN");
        assert_eq!(
            Request::set_color(Rgb::new(255, 0, 0), LedMask::ALL).line(),
            "AT+SC=127,FF0000"
        );
        assert_eq!(Request::set_brightness(75).line(), "AT+SDB=75");
        assert_eq!(Request::begin_upload("cat.png", 1234).line(), "AT+UF=cat.png,1234");
        assert_eq!(Request::delete_file("a.gif").command(), "AT+DF");
    }

    #[test]
    fn test_upload_chunk_carries_payload() {
        let req = Request::upload_chunk(vec![1, 2, 3]);
        assert_eq!(req.line(), "AT+UC=3");
        assert_eq!(req.payload(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_custom_pattern_line() {
        let steps = [
            PatternStep::new(Rgb::new(255, 0, 0), Duration::from_millis(100), false),
            PatternStep::new(Rgb::new(0, 0, 255), Duration::from_millis(300), true),
        ];
        assert_eq!(
            Request::custom_pattern(&steps, true, false).line(),
            "AT+CP=1,0,2;127,FF0000,100,0;127,0000FF,300,1"
        );
    }

    #[test]
    fn test_expect_classification() {
        let ack = Expect::ack();
        assert_eq!(ack.classify("OK"), LineKind::Complete);
        assert_eq!(ack.classify("ERROR"), LineKind::Failed(None));
        assert_eq!(
            ack.classify("ERROR:NO_SPACE"),
            LineKind::Failed(Some("NO_SPACE".into()))
        );
        assert_eq!(ack.classify("+DN:busytag-1"), LineKind::Foreign);
        assert_eq!(ack.classify("ERRORS"), LineKind::Foreign);

        let data = Expect::data(tag::DEVICE_NAME);
        assert_eq!(data.classify("+DN:busytag-1"), LineKind::Data);

        let bin = Expect::binary(tag::DOWNLOAD_CHUNK);
        assert_eq!(bin.classify("+GC:512"), LineKind::DataWithBytes(512));
        assert_eq!(bin.classify("+GC:x"), LineKind::Foreign);
    }

    #[test]
    fn test_unsolicited_parse() {
        assert_eq!(
            Unsolicited::parse("+SP:coffee.gif"),
            Some(Unsolicited::NowDisplaying("coffee.gif".into()))
        );
        assert_eq!(
            Unsolicited::parse("+FUS:42.5"),
            Some(Unsolicited::FirmwareProgress(42.5))
        );
        assert_eq!(
            Unsolicited::parse("+WIS:1"),
            Some(Unsolicited::WritingInStorage(true))
        );
        assert_eq!(Unsolicited::parse("+WIS:maybe"), None);
        assert_eq!(Unsolicited::parse("OK"), None);
    }

    #[test]
    fn test_response_fields() {
        let resp = Response {
            lines: vec!["+FL:a.png,10".into(), "+FL:b,c.gif,20".into()],
            data: Vec::new(),
        };
        let entries: Vec<_> = resp
            .fields(tag::FILE)
            .map(|v| parse_file_entry(v).unwrap())
            .collect();
        assert_eq!(entries, vec![("a.png".into(), 10), ("b,c.gif".into(), 20)]);
        assert!(resp.require(tag::FREE_STORAGE).is_err());
    }

    #[test]
    fn test_require_u64_rejects_garbage() {
        let resp = Response {
            lines: vec!["+FSS:lots".into()],
            data: Vec::new(),
        };
        assert!(matches!(
            resp.require_u64(tag::FREE_STORAGE),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("photo.png").is_ok());
        assert!(validate_file_name(&"a".repeat(MAX_FILENAME_LEN)).is_ok());
        assert!(validate_file_name(&"a".repeat(MAX_FILENAME_LEN + 1)).is_err());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("bad\r\nname").is_err());
    }

    #[test]
    fn test_is_firmware_name() {
        assert!(is_firmware_name("fw_2.1.bin"));
        assert!(is_firmware_name("FW.BIN"));
        assert!(!is_firmware_name("bin.png"));
    }
}
