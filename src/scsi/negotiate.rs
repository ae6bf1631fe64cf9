//! Two-phase retrieval of responses that describe their own length.
//!
//! Many commands (MODE SENSE, GET CONFIGURATION, READ TOC, READ DISC
//! STRUCTURE, VPD pages, ...) return a header whose first bytes hold the size
//! of the whole response. The command is issued once with a small buffer to
//! read that header, then once more with the buffer sized to what the device
//! advertised.

use std::time::Duration;

use tracing::debug;

use super::command::CommandRequest;
use super::device::ScsiDevice;
use super::error::{EncodingError, ScsiError};
use super::retry::ProbeKind;
use super::{Status, Transport};

/// Where a response keeps its length, and how to turn that value into the
/// total number of bytes to fetch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LengthField {
    /// Byte offset of the length field in the response
    pub offset: usize,
    /// Width of the big-endian length field: 1, 2 or 4 bytes
    pub width: usize,
    /// Added to the field's value to get the total response length
    pub adjustment: usize,
    /// Largest length the command's allocation field can request
    pub maximum: usize,
}

impl LengthField {
    /// The field counts the bytes that follow it.
    pub const fn remaining(offset: usize, width: usize, maximum: usize) -> Self {
        Self {
            offset,
            width,
            adjustment: offset + width,
            maximum,
        }
    }

    /// The field holds the length of the whole response, header included.
    pub const fn total(offset: usize, width: usize, maximum: usize) -> Self {
        Self {
            offset,
            width,
            adjustment: 0,
            maximum,
        }
    }

    /// Bytes needed to read the length field itself.
    pub const fn header_len(&self) -> usize {
        self.offset + self.width
    }

    /// The advertised total length, clamped to [`Self::maximum`]; `None` if
    /// `header` does not reach the field.
    pub fn total_length(&self, header: &[u8]) -> Option<usize> {
        let field = header.get(self.offset..self.offset + self.width)?;
        let value = field.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        Some((value + self.adjustment).min(self.maximum))
    }
}

/// The response retrieved by [`negotiate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub data: Vec<u8>,
    /// Sum of both phases
    pub duration: Duration,
    pub round_trips: u8,
    /// The second phase failed and `data` is the first phase's response
    pub degraded: bool,
}

/// Runs the probe-then-fetch exchange.
///
/// `build` encodes the command for a given allocation length; it is called
/// with `probe_len` first, then with the advertised length. If the second
/// phase fails after the first succeeded, the first response is returned when
/// `allow_degraded` is set and [`ScsiError::NegotiationMismatch`] otherwise.
pub fn negotiate<T: Transport>(
    device: &mut ScsiDevice<T>,
    field: LengthField,
    probe_len: usize,
    kind: ProbeKind,
    allow_degraded: bool,
    build: impl Fn(usize) -> Result<CommandRequest, EncodingError>,
) -> Result<Negotiated, ScsiError> {
    let probe_len = probe_len.max(field.header_len());
    let first = device.execute(build(probe_len)?);
    let mut duration = first.duration;
    let name = first.name;
    let mut header = first.into_data(kind)?;

    let Some(advertised) = field.total_length(&header) else {
        return Ok(Negotiated {
            data: header,
            duration,
            round_trips: 1,
            degraded: false,
        });
    };

    if advertised <= probe_len {
        header.truncate(advertised);
        return Ok(Negotiated {
            data: header,
            duration,
            round_trips: 1,
            degraded: false,
        });
    }

    debug!(command = name, probe_len, advertised, "fetching full response");
    let second = device.execute(build(advertised)?);
    duration += second.duration;
    if second.outcome(kind).is_success() {
        let mut data = second.data;
        data.truncate(advertised);
        return Ok(Negotiated {
            data,
            duration,
            round_trips: 2,
            degraded: false,
        });
    }

    if allow_degraded {
        debug!(command = name, "second phase failed, keeping probe response");
        return Ok(Negotiated {
            data: header,
            duration,
            round_trips: 2,
            degraded: true,
        });
    }
    match second.status {
        Status::Transport(source) => Err(ScsiError::Transport {
            command: name,
            source,
        }),
        _ => Err(ScsiError::NegotiationMismatch {
            command: name,
            sense: second.sense,
        }),
    }
}
