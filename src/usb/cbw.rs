//! A USB packet containing a command block wrapper and associated
//! information.

use color_eyre::Result;
use color_eyre::eyre::ensure;

use crate::scsi::Direction;
use crate::scsi::command_descriptor::MAX_CDB_SIZE;

/// Signature that identifies a packet as a CBW.
///
/// This packet contains the below magic number (little endian).
///
/// See USB Mass Storage Class - Bulk Only Transport, section 5
const CBW_SIGNATURE: u32 = 0x43425355;
/// Signature that identifies a packet as a CSW.
///
/// The packet will start with the below magic number (little endian).
const CSW_SIGNATURE: u32 = 0x53425355;

/// A command block wrapper is *always* 31 bytes in size
pub const CBW_SIZE: usize = 31;
/// A command status wrapper is *always* 13 bytes in size
pub const CSW_SIZE: usize = 13;

/// `bmCBWFlags` bit 7: set for Data-In, clear for Data-Out.
///
/// Per the Bulk Only Transport document, the direction is ignored entirely if the data transfer
/// length field is zero.
const FLAG_DATA_IN: u8 = 0x80;

/// The CBW wraps an SCSI command.
///
/// Spec info can be found in the USB Mass Storage Class - Bulk Only Transport document,
/// section 5.1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandBlockWrapper {
    /// `dCBWTag` - "A Command Block Tag sent by the host. The device shall echo
    /// the contents of this field back to the host in the [tag] field of the associated CSW.
    /// The [tag] positvely associates a CSW with the corrosponding CBW"
    ///
    /// See [`TagGenerator`] for tooling.
    pub tag: u32,
    /// `dCBWDataTransferLength` - "The number of bytes that the host expects
    /// to transfer on the Bulk-In or Bulk-Out endpoint (as indicated by the
    /// *Direction* bit) during the execution of this command."
    pub data_transfer_length: u32,
    pub direction: Direction,
    /// `bCBWLUN` - "The device Logical Unit Number (LUN) to which the command block
    /// is being sent."
    pub lun: u8,
    /// `CBWCB` and `bCBWCBLength`: the command block, of which only the
    /// first `command_block_length` bytes are meaningful.
    command: [u8; MAX_CDB_SIZE],
    command_block_length: u8,
}

impl CommandBlockWrapper {
    /// Creates a new [`CommandBlockWrapper`].
    pub fn new(
        cdb: &[u8],
        data_transfer_length: u32,
        direction: Direction,
        lun: u8,
        tag: u32,
    ) -> Result<Self> {
        ensure!(
            (1..=MAX_CDB_SIZE).contains(&cdb.len()),
            "command block must be 1 to 16 bytes, was {}",
            cdb.len()
        );
        ensure!(lun <= 0x0F, "LUN {lun} does not fit in 4 bits");
        let mut command = [0; MAX_CDB_SIZE];
        command[..cdb.len()].copy_from_slice(cdb);
        Ok(Self {
            tag,
            data_transfer_length,
            direction,
            lun,
            command,
            command_block_length: cdb.len() as u8,
        })
    }

    /// The wire form, exactly [`CBW_SIZE`] bytes.
    pub fn to_bytes(&self) -> [u8; CBW_SIZE] {
        let mut buf = [0; CBW_SIZE];
        buf[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        buf[12] = match self.direction {
            Direction::In => FLAG_DATA_IN,
            Direction::Out | Direction::None => 0,
        };
        buf[13] = self.lun;
        buf[14] = self.command_block_length;
        buf[15..31].copy_from_slice(&self.command);
        buf
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

/// A packet containing the status/return value of a command block executed by the USB device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    /// `dCSWTag` - "The device shall set this field to the value received in the *dCBWTag* of
    /// the associated CBW."
    pub tag: u32,
    /// `dCSWDataResidue` - "For Data-In the device shall report in the *dCSWDataResidue* the
    /// difference between the amount of data expected as stated in the *dCBWDataTransferLength*
    /// and the actual amount of relevant data sent by the device."
    pub data_residue: u32,
    /// `bCSWStatus`
    ///
    /// | Value | Description                    |
    /// | ----- | ------------------------------ |
    /// | 0x00  | Command Passed ("good status") |
    /// | 0x01  | Command Failed                 |
    /// | 0x02  | Phase Error                    |
    /// | _     | All other values are reserved  |
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    /// Parses a command status wrapper, validating its size, `signature` and
    /// status byte.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        ensure!(
            buf.len() == CSW_SIZE,
            "command status wrapper must be {CSW_SIZE} bytes, was instead {}",
            buf.len()
        );
        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        ensure!(
            signature == CSW_SIGNATURE,
            "invalid magic number for command status wrapper, should be 0x53425355, is 0x{:X}",
            signature
        );
        let status = match buf[12] {
            0 => CommandStatus::Passed,
            1 => CommandStatus::Failed,
            2 => CommandStatus::PhaseError,
            other => color_eyre::eyre::bail!(
                "the command status field is invalid, should be in 0..=2, was {other}"
            ),
        };
        Ok(Self {
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_residue: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            status,
        })
    }
}

/// Used for generating unique-ish command block tags.
pub struct TagGenerator(u32);

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TagGenerator {
    /// Initialize the tag generator.
    pub fn new() -> TagGenerator {
        // 123 was chosen as a distinct, human-readable pattern to differentiate it from the rest
        // of the packet
        Self(123)
    }

    /// Returns a unique-ish u32 that's different from the previously returned value.
    pub fn tag(&mut self) -> u32 {
        let output = self.0;
        self.0 = self.0.wrapping_add(1);
        output
    }
}
