//! Line protocol spoken between clients and the simulator.
//!
//! Clients send `control on`, `control off` or `request`; the server answers
//! with `status <temp> <ON|OFF> <timestamp>` or `error`.

use crate::simulation::{Mode, Snapshot};
use arrayvec::ArrayString;
use core::fmt::Write as _;
use static_assertions::const_assert;
use std::str::FromStr;
use thiserror::Error;

/// Longest inbound line accepted, terminator excluded.
pub const MAX_LINE_LEN: usize = 512;

// "status " + f64::MAX with six decimals + " OFF " + u64::MAX
const MAX_STATUS_LEN: usize = 7 + 317 + 5 + 20;
const_assert!(MAX_STATUS_LEN <= MAX_LINE_LEN);

pub const ERROR_REPLY: &str = "error";
const STATUS_PREFIX: &str = "status";

pub type StatusLine = ArrayString<MAX_LINE_LEN>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("line of {0} bytes exceeds the line limit")]
    MessageTooLarge(usize),
    #[error("malformed status line: {0}")]
    MalformedStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Control(Mode),
    Status,
}

impl Request {
    pub fn as_wire(self) -> &'static str {
        match self {
            Request::Control(Mode::Heating) => "control on",
            Request::Control(Mode::Cooling) => "control off",
            Request::Status => "request",
        }
    }
}

impl FromStr for Request {
    type Err = ProtocolError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let line = strip_terminator(raw);
        if line.len() > MAX_LINE_LEN {
            return Err(ProtocolError::MessageTooLarge(line.len()));
        }
        match normalize_line(line).as_str() {
            "control on" => Ok(Request::Control(Mode::Heating)),
            "control off" => Ok(Request::Control(Mode::Cooling)),
            "request" => Ok(Request::Status),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

fn strip_terminator(raw: &str) -> &str {
    raw.split(['\r', '\n']).next().unwrap_or_default()
}

/// Strips the line terminator and surrounding whitespace and lowercases.
pub fn normalize_line(raw: &str) -> String {
    strip_terminator(raw).trim().to_ascii_lowercase()
}

pub fn format_status(snapshot: &Snapshot) -> Result<StatusLine, ProtocolError> {
    let mut line = StatusLine::new();
    write!(
        line,
        "{} {:.6} {} {}",
        STATUS_PREFIX,
        snapshot.water_temp_c,
        snapshot.mode.as_wire(),
        snapshot.timestamp_ns
    )
    .map_err(|_| ProtocolError::MessageTooLarge(MAX_LINE_LEN + 1))?;
    Ok(line)
}

/// Parses a `status` line back into the snapshot it describes.
pub fn parse_status(line: &str) -> Result<Snapshot, ProtocolError> {
    let malformed = || ProtocolError::MalformedStatus(line.trim_end().to_string());

    let mut fields = line.split_whitespace();
    if fields.next() != Some(STATUS_PREFIX) {
        return Err(malformed());
    }
    let water_temp_c = fields
        .next()
        .and_then(|t| t.parse::<f64>().ok())
        .ok_or_else(malformed)?;
    let mode = fields.next().and_then(Mode::from_wire).ok_or_else(malformed)?;
    let timestamp_ns = fields
        .next()
        .and_then(|t| t.parse::<u64>().ok())
        .ok_or_else(malformed)?;
    if fields.next().is_some() {
        return Err(malformed());
    }

    Ok(Snapshot {
        mode,
        water_temp_c,
        timestamp_ns,
    })
}
