//! SCSI protocol and format implementation as described in:
//! - SCSI Primary Commands – 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//!   This is an older version of the SCSI specification.
//!   It has enough information to describe almost every command we need to know.
//! - SCSI Block Commands – 2 (SBC-2)
//!   <https://raw.githubusercontent.com/carmark/papers/master/storage/scsi/sbc2r16.pdf>
//!   Commands specific to block devices (READ family, READ LONG, READ CAPACITY).
//! - SCSI Stream Commands - 2 (SSC-2) for tape drives, and
//!   Multi-Media Commands - 5 (MMC-5) for optical drives.
//!
//! Commands are built in the [`command`] module (or from the [`vendor`] table),
//! issued to a device through [`ScsiDevice::execute`], and their sense data
//! is classified by [`retry`].

pub mod command;
pub mod command_descriptor;
pub mod device;
pub mod error;
pub mod long_block;
#[cfg(test)]
pub(crate) mod mock;
pub mod negotiate;
pub mod response;
pub mod retry;
pub mod sense;
pub mod vendor;

use std::time::Duration;

pub use device::{CommandObserver, CommandResult, ScsiDevice, TracingObserver};
pub use error::{EncodingError, ScsiError, TransportError};
pub use retry::{ProbeKind, ProbeOutcome, RetryPolicy};
pub use sense::{DecodedSense, SenseBuffer, SenseKey};

/// Direction of the data phase of a command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Data-In: from the device to the host
    In,
    /// Data-Out: from host to the device
    Out,
    /// No data phase; the data buffer is ignored
    None,
}

/// SCSI status byte, SAM-2 5.3.1
pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;

/// How a single command execution ended.
#[derive(Debug)]
pub enum Status {
    Good,
    /// The device returned sense data describing the problem
    CheckCondition,
    /// The command never completed at the SCSI level
    Transport(TransportError),
}

impl Status {
    pub fn is_good(&self) -> bool {
        matches!(self, Status::Good)
    }
}

/// What a transport hands back for every command it executes.
#[derive(Debug)]
pub struct Execution {
    pub status: Status,
    /// Only meaningful when `status` is [`Status::CheckCondition`]
    pub sense: SenseBuffer,
    pub duration: Duration,
}

/// The raw command passthrough: a platform specific way of sending a CDB and
/// a data buffer to a device handle.
///
/// For [`Direction::Out`] `data` is sent as-is, for [`Direction::In`] it is
/// filled up to its current length, and for [`Direction::None`] it is ignored.
/// Implementations do not retry; a single call is a single command.
pub trait Transport {
    fn execute(
        &mut self,
        cdb: &[u8],
        direction: Direction,
        data: &mut [u8],
        timeout: Duration,
    ) -> Execution;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn execute(
        &mut self,
        cdb: &[u8],
        direction: Direction,
        data: &mut [u8],
        timeout: Duration,
    ) -> Execution {
        (**self).execute(cdb, direction, data, timeout)
    }
}
