//! Discovery of the "long" sector size: user data plus the ECC and other
//! out-of-band bytes READ LONG returns.
//!
//! Devices rarely advertise this size anywhere. It is found by asking for
//! an absurd length and reading the correction out of the sense data, then
//! by trying the sizes known to be used for the nominal block size, and as
//! a last resort by trying every length in turn.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use super::command;
use super::device::ScsiDevice;
use super::retry::{ProbeKind, ProbeOutcome};
use super::sense::asc;
use super::{DecodedSense, Transport};

/// Length asked for by the first, deliberately oversized, READ LONG.
pub const PROBE_LENGTH: u16 = 0xFFFF;

/// Long sector sizes seen in the wild, by nominal block size, in the order
/// they are tried.
pub fn known_long_sizes(nominal: u32) -> &'static [u16] {
    match nominal {
        512 => &[514, 536, 558, 600, 610, 630],
        1024 => &[1026, 1200],
        2048 => &[2380],
        4096 => &[4760],
        8192 => &[9424],
        _ => &[],
    }
}

/// Which READ LONG form to issue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LongCommand {
    Ten,
    Sixteen,
}

/// How a long block size was found.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Discovery {
    /// The oversized probe itself was accepted
    Probe,
    /// Derived from the INFORMATION field of an ILI sense
    SenseHint,
    /// One of [`known_long_sizes`]
    KnownSize,
    Exhaustive,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LongBlockResult {
    Found { size: u16, via: Discovery },
    /// READ LONG is implemented but no length was accepted yet
    Undetermined,
    Unsupported,
}

impl LongBlockResult {
    pub fn size(&self) -> Option<u16> {
        match self {
            LongBlockResult::Found { size, .. } => Some(*size),
            _ => None,
        }
    }
}

/// One READ LONG trial.
struct Trial {
    outcome: ProbeOutcome<()>,
    sense: Option<DecodedSense>,
}

fn trial<T: Transport>(
    device: &mut ScsiDevice<T>,
    command: LongCommand,
    lba: u64,
    len: u16,
) -> Trial {
    let request = match command {
        LongCommand::Ten => u32::try_from(lba)
            .map_err(|_| super::EncodingError::OutOfRange {
                field: "logical block address",
                value: lba,
                bits: 32,
            })
            .and_then(|lba| command::read_long10(lba, len, false)),
        LongCommand::Sixteen => command::read_long16(lba, len, false),
    };
    let request = match request {
        Ok(request) => request,
        Err(err) => {
            debug!("cannot encode READ LONG: {err}");
            return Trial {
                outcome: ProbeOutcome::Unsupported,
                sense: None,
            };
        }
    };
    let result = device.execute(request);
    Trial {
        outcome: result.outcome(ProbeKind::ReadLong),
        sense: result.sense,
    }
}

fn invalid_opcode(sense: &Option<DecodedSense>) -> bool {
    sense
        .as_ref()
        .is_some_and(|s| s.asc == asc::INVALID_COMMAND_OPERATION_CODE)
}

/// Steps one and two: the oversized probe with its sense hint, then the
/// table of known sizes for `nominal`.
pub fn discover<T: Transport>(
    device: &mut ScsiDevice<T>,
    command: LongCommand,
    lba: u64,
    nominal: u32,
    cancel: &AtomicBool,
) -> LongBlockResult {
    let first = trial(device, command, lba, PROBE_LENGTH);
    match first.outcome {
        ProbeOutcome::Success(()) => {
            return LongBlockResult::Found {
                size: PROBE_LENGTH,
                via: Discovery::Probe,
            };
        }
        ProbeOutcome::DeriveParameter(sense) => {
            if let (true, Some(information)) = (sense.has_length_delta(), sense.information) {
                let candidate = PROBE_LENGTH - (information & 0xFFFF) as u16;
                if candidate != 0 && candidate as u32 != nominal {
                    debug!(candidate, "long block size from sense information");
                    return LongBlockResult::Found {
                        size: candidate,
                        via: Discovery::SenseHint,
                    };
                }
            }
        }
        ProbeOutcome::Unsupported if invalid_opcode(&first.sense) => {
            return LongBlockResult::Unsupported;
        }
        ProbeOutcome::Unsupported => {}
        ProbeOutcome::Retryable(_) | ProbeOutcome::Fatal(_) => {
            return LongBlockResult::Unsupported;
        }
    }

    for &size in known_long_sizes(nominal) {
        if cancel.load(Ordering::Relaxed) {
            return LongBlockResult::Undetermined;
        }
        if trial(device, command, lba, size).outcome.is_success() {
            return LongBlockResult::Found {
                size,
                via: Discovery::KnownSize,
            };
        }
    }
    LongBlockResult::Undetermined
}

/// Step three: every length from just above `nominal` up to the largest the
/// command can express, one device round-trip each.
///
/// This can take tens of thousands of commands; the caller must have the
/// user's authorization before calling it. `cancel` is checked between
/// trials.
pub fn exhaustive_search<T: Transport>(
    device: &mut ScsiDevice<T>,
    command: LongCommand,
    lba: u64,
    nominal: u32,
    cancel: &AtomicBool,
) -> LongBlockResult {
    let Some(Ok(start)) = nominal.checked_add(1).map(u16::try_from) else {
        return LongBlockResult::Undetermined;
    };
    info!(from = start, "searching every READ LONG length");
    for size in start..PROBE_LENGTH {
        if cancel.load(Ordering::Relaxed) {
            return LongBlockResult::Undetermined;
        }
        if size % 1000 == 0 {
            debug!(size, "READ LONG search progress");
        }
        if trial(device, command, lba, size).outcome.is_success() {
            return LongBlockResult::Found {
                size,
                via: Discovery::Exhaustive,
            };
        }
    }
    LongBlockResult::Undetermined
}

/// Runs [`discover`], and [`exhaustive_search`] when that found nothing and
/// `authorize` agrees. `authorize` is only called in that case.
pub fn discover_long_block_size<T: Transport>(
    device: &mut ScsiDevice<T>,
    command: LongCommand,
    lba: u64,
    nominal: u32,
    cancel: &AtomicBool,
    authorize: impl FnOnce() -> bool,
) -> LongBlockResult {
    let result = discover(device, command, lba, nominal, cancel);
    if result == LongBlockResult::Undetermined && authorize() {
        return exhaustive_search(device, command, lba, nominal, cancel);
    }
    result
}
