//! Line classification for the reader's text protocol.
//!
//! Every line the device prints is turned into a [`ProtocolEvent`] by
//! [`decode`]. Card frames are recognised by their prefix; everything else is
//! matched against [`LINE_RULES`], an ordered table where the first matching
//! substring wins.

/// Prefix of a card frame: `START_CARD-<uuid>_CARRIED-<data>`
pub const CARD_FRAME_MARKER: &str = "START_CARD-";

/// Separator between the uuid and the carried data in a card frame
pub const CARRIED_DELIMITER: &str = "_CARRIED-";

/// Command that switches the device into write mode
pub const ENTER_WRITE_MODE: &str = "START_WRITE";

/// Card data the device reports for a card with nothing written on it
pub const EMPTY_DATA_SENTINEL: &str = "EMPTY";

/// Why a line decoded to [`ProtocolEvent::Noise`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoiseKind {
    /// The line matched no rule
    Unrecognized,
    /// The line had the card marker but split into `segments` parts instead of two
    MalformedFrame { segments: usize },
}

/// A decoded line from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    CardRead { uuid: String, data: String },
    WriteSucceeded,
    WriteFailed { reason: String },
    /// The device finished a write cycle and went back to reading
    ReadModeReturned,
    DeviceReset,
    Noise { raw_line: String, kind: NoiseKind },
}

/// Kind of event a substring rule produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    WriteSucceeded,
    WriteFailed,
    ReadModeReturned,
    DeviceReset,
}

/// Substring rules, evaluated top to bottom. Write outcomes come before the
/// reset markers: a line carrying both is a write outcome.
pub const LINE_RULES: &[(&str, RuleKind)] = &[
    ("Data written successfully", RuleKind::WriteSucceeded),
    ("Failed to write", RuleKind::WriteFailed),
    ("Authentication failed", RuleKind::WriteFailed),
    ("Write operation failed", RuleKind::WriteFailed),
    ("Returning to read mode", RuleKind::ReadModeReturned),
    ("ets", RuleKind::DeviceReset),
    ("rst:", RuleKind::DeviceReset),
];

/// Classify one line received from the device
pub fn decode(raw_line: &str) -> ProtocolEvent {
    if let Some(frame) = raw_line.strip_prefix(CARD_FRAME_MARKER) {
        return decode_card_frame(raw_line, frame);
    }

    match LINE_RULES
        .iter()
        .find(|(needle, _)| raw_line.contains(needle))
    {
        Some((phrase, RuleKind::WriteFailed)) => ProtocolEvent::WriteFailed {
            reason: (*phrase).to_string(),
        },
        Some((_, RuleKind::WriteSucceeded)) => ProtocolEvent::WriteSucceeded,
        Some((_, RuleKind::ReadModeReturned)) => ProtocolEvent::ReadModeReturned,
        Some((_, RuleKind::DeviceReset)) => ProtocolEvent::DeviceReset,
        None => ProtocolEvent::Noise {
            raw_line: raw_line.to_string(),
            kind: NoiseKind::Unrecognized,
        },
    }
}

fn decode_card_frame(raw_line: &str, frame: &str) -> ProtocolEvent {
    let segments: Vec<&str> = frame.split(CARRIED_DELIMITER).collect();
    match segments.as_slice() {
        [uuid, data] => ProtocolEvent::CardRead {
            uuid: (*uuid).to_string(),
            data: (*data).to_string(),
        },
        _ => ProtocolEvent::Noise {
            raw_line: raw_line.to_string(),
            kind: NoiseKind::MalformedFrame {
                segments: segments.len(),
            },
        },
    }
}

/// Build the wire form of a card frame
pub fn encode_card_frame(uuid: &str, data: &str) -> String {
    format!("{CARD_FRAME_MARKER}{uuid}{CARRIED_DELIMITER}{data}")
}

impl ProtocolEvent {
    /// Whether this event ends a write session
    pub fn is_write_terminal(&self) -> bool {
        matches!(
            self,
            ProtocolEvent::WriteSucceeded
                | ProtocolEvent::WriteFailed { .. }
                | ProtocolEvent::ReadModeReturned
                | ProtocolEvent::DeviceReset
        )
    }

    /// One-line human readable description for diagnostic output
    pub fn describe(&self) -> String {
        match self {
            ProtocolEvent::CardRead { uuid, data } => format!("Card {uuid} (data: {data})"),
            ProtocolEvent::WriteSucceeded => "Write succeeded".to_string(),
            ProtocolEvent::WriteFailed { reason } => format!("Write failed: {reason}"),
            ProtocolEvent::ReadModeReturned => "Device returned to read mode".to_string(),
            ProtocolEvent::DeviceReset => {
                "Device reset detected (power or communication problem?)".to_string()
            }
            ProtocolEvent::Noise {
                raw_line,
                kind: NoiseKind::MalformedFrame { segments },
            } => format!("Invalid card format ({segments} segments): {raw_line}"),
            ProtocolEvent::Noise { raw_line, .. } => raw_line.clone(),
        }
    }
}
