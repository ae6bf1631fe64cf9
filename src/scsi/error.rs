//! Error types shared by the SCSI command layer.

use super::sense::DecodedSense;

/// A command parameter that does not fit the CDB field it is written into.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("{field} value {value:#x} does not fit in {bits} bits")]
    OutOfRange {
        field: &'static str,
        value: u64,
        bits: u32,
    },
    #[error("{field} at byte {offset} (+{width}) is outside a {len} byte CDB")]
    OutOfBounds {
        field: &'static str,
        offset: usize,
        width: usize,
        len: usize,
    },
    #[error("opcode {0:#04x} does not belong to a standard CDB group")]
    UnknownGroup(u8),
}

/// Communication failure below the SCSI protocol: the command never
/// produced a SCSI status.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("command timed out")]
    Timeout,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport protocol violation: {0}")]
    Protocol(String),
    #[error("device returned status {0:#04x}")]
    UnexpectedStatus(u8),
}

/// A response too short, or otherwise malformed, to decode.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    #[error("{what} response is {got} bytes, needs at least {needed}")]
    Truncated {
        what: &'static str,
        needed: usize,
        got: usize,
    },
}

/// Errors surfaced by the command layer and by the procedures built on it.
#[derive(thiserror::Error, Debug)]
pub enum ScsiError {
    #[error("cannot encode command: {0}")]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Response(#[from] ResponseError),
    #[error("{command} failed: {source}")]
    Transport {
        command: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("{command} rejected by device: {}", describe(.sense))]
    DeviceQualified {
        command: &'static str,
        sense: Option<DecodedSense>,
    },
    #[error(
        "{command} length negotiation failed after a successful probe phase: {}",
        describe(.sense)
    )]
    NegotiationMismatch {
        command: &'static str,
        sense: Option<DecodedSense>,
    },
    #[error("{command} did not become ready after {attempts} attempts")]
    RetriesExhausted { command: &'static str, attempts: u32 },
    #[error("{command} cancelled")]
    Cancelled { command: &'static str },
}

fn describe(sense: &Option<DecodedSense>) -> String {
    match sense {
        Some(sense) => sense.to_string(),
        None => String::from("no usable sense data"),
    }
}
