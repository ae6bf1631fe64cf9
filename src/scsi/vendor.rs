//! Vendor specific read commands.
//!
//! These all follow the same shape: a vendor opcode, a few constant bytes,
//! and an address/length pair packed at vendor specific offsets. They are
//! described as data in [`VENDOR_COMMANDS`] and encoded by one generic
//! [`VendorCommand::build`].
//!
//! Some of these put drives into states their firmware does not expect from
//! a host, so the prober only issues them with the user's consent.

use serde::Serialize;

use super::command::{CommandRequest, transfer_size};
use super::command_descriptor::{CdbFamily, CommandDescriptorBlock};
use super::error::EncodingError;
use super::response::MediaFamily;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Vendor {
    Plextor,
    Nec,
    Pioneer,
    HlDtSt,
    MediaTek,
}

impl Vendor {
    /// Maps the INQUIRY vendor identification to a vendor with a command set.
    pub fn from_inquiry(vendor: &str) -> Option<Vendor> {
        match vendor.trim().to_ascii_uppercase().as_str() {
            "PLEXTOR" => Some(Vendor::Plextor),
            "NEC" => Some(Vendor::Nec),
            "PIONEER" => Some(Vendor::Pioneer),
            "HL-DT-ST" => Some(Vendor::HlDtSt),
            // LITE-ON drives are built on MediaTek chipsets
            "MEDIATEK" | "LITE-ON" | "LITEON" => Some(Vendor::MediaTek),
            _ => None,
        }
    }
}

/// Media a vendor command makes sense for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MediaGate {
    Cd,
    Dvd,
    Any,
}

impl MediaGate {
    pub fn admits(self, media: MediaFamily) -> bool {
        match self {
            MediaGate::Cd => media == MediaFamily::Cd,
            MediaGate::Dvd => media == MediaFamily::Dvd,
            MediaGate::Any => true,
        }
    }
}

/// Size of the data phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transfer {
    /// Bytes per requested block
    PerBlock(u32),
    Fixed(usize),
}

type Pack = fn(&mut CommandDescriptorBlock, u32, u32) -> Result<(), EncodingError>;

pub struct VendorCommand {
    pub vendor: Vendor,
    pub name: &'static str,
    pub opcode: u8,
    pub family: CdbFamily,
    /// `(offset, value)` bytes that never change
    pub fixed: &'static [(usize, u8)],
    /// Writes the address and count parameters
    pub pack: Pack,
    pub transfer: Transfer,
    pub media: MediaGate,
}

impl VendorCommand {
    /// Encodes the command for `blocks` blocks starting at `lba`.
    pub fn build(&self, lba: u32, blocks: u32) -> Result<CommandRequest, EncodingError> {
        let mut cdb = CommandDescriptorBlock::with_family(self.opcode, self.family);
        for &(offset, value) in self.fixed {
            cdb.set_u8(self.name, offset, value)?;
        }
        (self.pack)(&mut cdb, lba, blocks)?;
        let len = match self.transfer {
            Transfer::PerBlock(size) => transfer_size(blocks, size)?,
            Transfer::Fixed(len) => len,
        };
        Ok(CommandRequest::data_in(self.name, cdb, len))
    }

    /// Bytes one block transfers, when the command is block addressed.
    pub fn block_size(&self) -> Option<u32> {
        match self.transfer {
            Transfer::PerBlock(size) => Some(size),
            Transfer::Fixed(_) => None,
        }
    }
}

fn lba_and_count32(
    cdb: &mut CommandDescriptorBlock,
    lba: u32,
    blocks: u32,
) -> Result<(), EncodingError> {
    cdb.set_u32("logical block address", 2, lba)?
        .set_u32("transfer length", 6, blocks)?;
    Ok(())
}

fn lba_and_count24(
    cdb: &mut CommandDescriptorBlock,
    lba: u32,
    blocks: u32,
) -> Result<(), EncodingError> {
    cdb.set_u32("logical block address", 2, lba)?
        .set_be("transfer length", 7, 3, 24, blocks as u64)?;
    Ok(())
}

fn lba_and_count16(
    cdb: &mut CommandDescriptorBlock,
    lba: u32,
    blocks: u32,
) -> Result<(), EncodingError> {
    let blocks = u16::try_from(blocks).map_err(|_| EncodingError::OutOfRange {
        field: "transfer length",
        value: blocks as u64,
        bits: 16,
    })?;
    cdb.set_u32("logical block address", 2, lba)?
        .set_u16("transfer length", 7, blocks)?;
    Ok(())
}

fn hldtst_raw(
    cdb: &mut CommandDescriptorBlock,
    lba: u32,
    blocks: u32,
) -> Result<(), EncodingError> {
    let blocks = u16::try_from(blocks).map_err(|_| EncodingError::OutOfRange {
        field: "transfer length",
        value: blocks as u64,
        bits: 16,
    })?;
    cdb.set_u32("logical block address", 6, lba)?
        .set_u16("transfer length", 10, blocks)?;
    Ok(())
}

/// Byte offset into the drive cache and a byte count.
fn cache_range(
    cdb: &mut CommandDescriptorBlock,
    offset: u32,
    len: u32,
) -> Result<(), EncodingError> {
    cdb.set_u32("cache offset", 2, offset)?
        .set_u32("transfer length", 6, len)?;
    Ok(())
}

const EEPROM_LEN: usize = 256;

fn eeprom(cdb: &mut CommandDescriptorBlock, _: u32, _: u32) -> Result<(), EncodingError> {
    cdb.set_u16("allocation length", 8, EEPROM_LEN as u16)?;
    Ok(())
}

/// READ CD-DA sector: 2352 bytes of audio, no sub-channel.
const CDDA_SECTOR: u32 = 2352;
/// DVD sector as recorded: ID, IED, CPR_MAI, user data and EDC.
const RAW_DVD_SECTOR: u32 = 2064;

pub static VENDOR_COMMANDS: &[VendorCommand] = &[
    VendorCommand {
        vendor: Vendor::Plextor,
        name: "PLEXTOR READ CD-DA",
        opcode: 0xD8,
        family: CdbFamily::X12,
        fixed: &[],
        pack: lba_and_count32,
        transfer: Transfer::PerBlock(CDDA_SECTOR),
        media: MediaGate::Cd,
    },
    VendorCommand {
        vendor: Vendor::Plextor,
        name: "PLEXTOR READ EEPROM",
        opcode: 0xF1,
        family: CdbFamily::X12,
        fixed: &[(1, 0x01)],
        pack: eeprom,
        transfer: Transfer::Fixed(EEPROM_LEN),
        media: MediaGate::Any,
    },
    VendorCommand {
        vendor: Vendor::Nec,
        name: "NEC READ CD-DA",
        opcode: 0xD4,
        family: CdbFamily::X10,
        fixed: &[],
        pack: lba_and_count16,
        transfer: Transfer::PerBlock(CDDA_SECTOR),
        media: MediaGate::Cd,
    },
    VendorCommand {
        vendor: Vendor::Pioneer,
        name: "PIONEER READ CD-DA",
        opcode: 0xD8,
        family: CdbFamily::X12,
        fixed: &[],
        pack: lba_and_count24,
        transfer: Transfer::PerBlock(CDDA_SECTOR),
        media: MediaGate::Cd,
    },
    VendorCommand {
        vendor: Vendor::HlDtSt,
        name: "HL-DT-ST READ RAW DVD",
        opcode: 0xE7,
        family: CdbFamily::X12,
        fixed: &[(1, 0x48), (2, 0x49), (3, 0x54), (4, 0x01)],
        pack: hldtst_raw,
        transfer: Transfer::PerBlock(RAW_DVD_SECTOR),
        media: MediaGate::Dvd,
    },
    VendorCommand {
        vendor: Vendor::MediaTek,
        name: "MEDIATEK READ CACHE",
        opcode: 0xF1,
        family: CdbFamily::X10,
        fixed: &[(1, 0x06)],
        pack: cache_range,
        transfer: Transfer::PerBlock(1),
        media: MediaGate::Any,
    },
];

pub fn commands_for(vendor: Vendor) -> impl Iterator<Item = &'static VendorCommand> {
    VENDOR_COMMANDS.iter().filter(move |c| c.vendor == vendor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(name: &str) -> &'static VendorCommand {
        VENDOR_COMMANDS.iter().find(|c| c.name == name).unwrap()
    }

    #[test]
    fn vendor_from_inquiry() {
        assert_eq!(Vendor::from_inquiry("PLEXTOR "), Some(Vendor::Plextor));
        assert_eq!(Vendor::from_inquiry("HL-DT-ST"), Some(Vendor::HlDtSt));
        assert_eq!(Vendor::from_inquiry("TSSTcorp"), None);
    }

    #[test]
    fn plextor_cdda() {
        let request = command("PLEXTOR READ CD-DA").build(0x1234, 2).unwrap();
        assert_eq!(
            request.cdb.as_slice(),
            &[0xD8, 0, 0, 0, 0x12, 0x34, 0, 0, 0, 2, 0, 0]
        );
        assert_eq!(request.transfer_len(), 2 * 2352);
    }

    #[test]
    fn pioneer_count_is_24_bits() {
        let pioneer = command("PIONEER READ CD-DA");
        let request = pioneer.build(16, 1).unwrap();
        assert_eq!(&request.cdb.as_slice()[6..10], &[0, 0, 0, 1]);
        assert!(pioneer.build(0, 1 << 24).is_err());
    }

    #[test]
    fn nec_rejects_oversized_count() {
        let nec = command("NEC READ CD-DA");
        assert_eq!(nec.build(0, 1).unwrap().cdb.len(), 10);
        assert!(matches!(
            nec.build(0, 0x1_0000),
            Err(EncodingError::OutOfRange { bits: 16, .. })
        ));
    }

    #[test]
    fn hldtst_fixed_bytes() {
        let request = command("HL-DT-ST READ RAW DVD").build(0x30000, 1).unwrap();
        assert_eq!(
            request.cdb.as_slice(),
            &[0xE7, 0x48, 0x49, 0x54, 0x01, 0, 0, 0x03, 0, 0, 0, 1]
        );
        assert_eq!(request.transfer_len(), 2064);
    }

    #[test]
    fn eeprom_has_fixed_length() {
        let request = command("PLEXTOR READ EEPROM").build(0, 0).unwrap();
        assert_eq!(request.transfer_len(), 256);
        assert_eq!(&request.cdb.as_slice()[8..10], &[0x01, 0x00]);
    }

    #[test]
    fn per_vendor_listing() {
        assert_eq!(commands_for(Vendor::Plextor).count(), 2);
        assert!(commands_for(Vendor::Nec).all(|c| c.media == MediaGate::Cd));
        assert!(MediaGate::Dvd.admits(MediaFamily::Dvd));
        assert!(!MediaGate::Cd.admits(MediaFamily::Bd));
    }
}
