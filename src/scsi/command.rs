//! Representations for SCSI commands.
//!
//! Commands are exposed as functions that return a [`CommandRequest`]: an
//! encoded [`CommandDescriptorBlock`] together with the data buffer sized for
//! the transfer, the direction of that transfer and a timeout. Each request
//! is built fresh for a single call.

use std::time::Duration;

use super::Direction;
use super::command_descriptor::{CommandDescriptorBlock, OpCode};
use super::error::EncodingError;

/// Timeout applied by a device to commands that do not carry their own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A serialized command ready to be submitted to a transport
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Human readable command name, reported to observers
    pub name: &'static str,
    pub cdb: CommandDescriptorBlock,
    pub direction: Direction,
    /// Pre-sized transfer buffer. Filled by the device for [`Direction::In`],
    /// sent as-is for [`Direction::Out`], empty otherwise.
    pub data: Vec<u8>,
    /// `None` uses the device wide timeout
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    fn new(
        name: &'static str,
        cdb: CommandDescriptorBlock,
        direction: Direction,
        len: usize,
    ) -> Self {
        Self {
            name,
            cdb,
            direction,
            data: vec![0; len],
            timeout: None,
        }
    }

    fn no_data(name: &'static str, cdb: CommandDescriptorBlock) -> Self {
        Self::new(name, cdb, Direction::None, 0)
    }

    pub(crate) fn data_in(name: &'static str, cdb: CommandDescriptorBlock, len: usize) -> Self {
        Self::new(name, cdb, Direction::In, len)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of bytes the device is expected to move.
    pub fn transfer_len(&self) -> usize {
        self.data.len()
    }
}

/// Total transfer size of `blocks` blocks of `block_size` bytes, rejecting
/// sizes a transport could not express.
pub fn transfer_size(blocks: u32, block_size: u32) -> Result<usize, EncodingError> {
    let total = blocks as u64 * block_size as u64;
    if total > u32::MAX as u64 {
        return Err(EncodingError::OutOfRange {
            field: "transfer size",
            value: total,
            bits: 32,
        });
    }
    Ok(total as usize)
}

/// "The TEST UNIT READY command provides a means to check if the logical unit is ready.
///
/// If the logical unit is able to accept an appropriate medium access command without
/// returning CHECK CONDITION status, this command shall return a GOOD status."
///
/// Defined in SPC2 7.25
pub fn test_unit_ready() -> Result<CommandRequest, EncodingError> {
    Ok(CommandRequest::no_data(
        "TEST UNIT READY",
        CommandDescriptorBlock::new(OpCode::TestUnitReady)?,
    ))
}

/// Length of the standard INQUIRY data every device must provide
/// (SPC-2 table 46).
pub const INQUIRY_MIN_LEN: u16 = 36;

/// "The INQUIRY command requests that information regarding parameters
/// of the target and a component logical unit be sent to the application client."
///
/// `vpd_page` selects a vital product data page (EVPD=1) instead of the
/// standard data. Defined in SPC2 7.3.1 table 45; the allocation length is the
/// 16-bit field of SPC-3.
pub fn inquiry(vpd_page: Option<u8>, allocation_len: u16) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::Inquiry)?;
    if let Some(page) = vpd_page {
        cdb.set_flag("EVPD", 1, 0, true)?.set_u8("page code", 2, page)?;
    }
    cdb.set_u16("allocation length", 3, allocation_len)?;
    Ok(CommandRequest::data_in(
        if vpd_page.is_some() { "INQUIRY (VPD)" } else { "INQUIRY" },
        cdb,
        allocation_len as usize,
    ))
}

/// REQUEST SENSE, SPC-2 7.20. The allocation length is a single byte.
pub fn request_sense(allocation_len: u8) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::RequestSense)?;
    cdb.set_u8("allocation length", 4, allocation_len)?;
    Ok(CommandRequest::data_in("REQUEST SENSE", cdb, allocation_len as usize))
}

/// "The PREVENT ALLOW MEDIUM REMOVAL command requests that the target enable or
/// disable the removal of the medium in the logical unit."
///
/// SPC-2 7.12
pub fn prevent_allow_medium_removal(prevent: bool) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::PreventAllowMediumRemoval)?;
    // See table 78; bit 0 prohibits removal for this initiator
    cdb.set_flag("PREVENT", 4, 0, prevent)?;
    Ok(CommandRequest::no_data("PREVENT ALLOW MEDIUM REMOVAL", cdb))
}

/// Page control field of MODE SENSE, SPC-2 table 66
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageControl {
    Current = 0b00,
    Changeable = 0b01,
    Default = 0b10,
    Saved = 0b11,
}

/// Every mode page
pub const ALL_PAGES: u8 = 0x3F;
/// Every subpage of the requested page(s)
pub const ALL_SUBPAGES: u8 = 0xFF;

/// MODE SENSE(6), SPC-2 7.9
pub fn mode_sense6(
    dbd: bool,
    page_control: PageControl,
    page: u8,
    subpage: u8,
    allocation_len: u8,
) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::ModeSense6)?;
    cdb.set_flag("DBD", 1, 3, dbd)?
        .set_bits("PC", 2, 6, 2, page_control as u8)?
        .set_bits("page code", 2, 0, 6, page)?
        .set_u8("subpage code", 3, subpage)?
        .set_u8("allocation length", 4, allocation_len)?;
    Ok(CommandRequest::data_in("MODE SENSE(6)", cdb, allocation_len as usize))
}

/// MODE SENSE(10), SPC-2 7.10
pub fn mode_sense10(
    llbaa: bool,
    dbd: bool,
    page_control: PageControl,
    page: u8,
    subpage: u8,
    allocation_len: u16,
) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::ModeSense10)?;
    cdb.set_flag("LLBAA", 1, 4, llbaa)?
        .set_flag("DBD", 1, 3, dbd)?
        .set_bits("PC", 2, 6, 2, page_control as u8)?
        .set_bits("page code", 2, 0, 6, page)?
        .set_u8("subpage code", 3, subpage)?
        .set_u16("allocation length", 7, allocation_len)?;
    Ok(CommandRequest::data_in("MODE SENSE(10)", cdb, allocation_len as usize))
}

/// "The `READ CAPACITY` command provides a means for the application client
/// to request information regarding the capacity of the block device."
///
/// SBC-2 5.1.10. Returns 8 bytes: last LBA and block length.
pub fn read_capacity10() -> Result<CommandRequest, EncodingError> {
    Ok(CommandRequest::data_in(
        "READ CAPACITY(10)",
        CommandDescriptorBlock::new(OpCode::ReadCapacity)?,
        8,
    ))
}

/// READ CAPACITY(16), SBC-3 5.11, a SERVICE ACTION IN(16) with service action 10h.
pub fn read_capacity16() -> Result<CommandRequest, EncodingError> {
    const ALLOCATION: u32 = 32;
    let mut cdb = CommandDescriptorBlock::new(OpCode::ServiceActionIn16)?;
    cdb.set_bits("service action", 1, 0, 5, 0x10)?
        .set_u32("allocation length", 10, ALLOCATION)?;
    Ok(CommandRequest::data_in("READ CAPACITY(16)", cdb, ALLOCATION as usize))
}

/// READ(6), SBC-2 5.1.4.
///
/// The LBA is 21 bits wide. A transfer length of 256 blocks is encoded as
/// zero, as the standard prescribes; anything outside 1..=256 is rejected.
pub fn read6(lba: u32, blocks: u16, block_size: u32) -> Result<CommandRequest, EncodingError> {
    if !(1..=256).contains(&blocks) {
        return Err(EncodingError::OutOfRange {
            field: "transfer length",
            value: blocks as u64,
            bits: 8,
        });
    }
    let mut cdb = CommandDescriptorBlock::new(OpCode::Read6)?;
    cdb.set_be("logical block address", 1, 3, 21, lba as u64)?
        .set_u8("transfer length", 4, (blocks % 256) as u8)?;
    Ok(CommandRequest::data_in(
        "READ(6)",
        cdb,
        transfer_size(blocks as u32, block_size)?,
    ))
}

/// READ(6) of a sequential-access device, SSC-2 7.2.
///
/// In variable block mode (`fixed` false) `transfer_len` is a byte count and
/// a block of a different size is reported with ILI and the difference in
/// the sense INFORMATION field; `sili` suppresses that report.
pub fn read_stream(
    sili: bool,
    fixed: bool,
    transfer_len: u32,
    block_size: u32,
) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::Read6)?;
    cdb.set_flag("SILI", 1, 1, sili)?
        .set_flag("FIXED", 1, 0, fixed)?
        .set_be("transfer length", 2, 3, 24, transfer_len as u64)?;
    let len = if fixed {
        transfer_size(transfer_len, block_size)?
    } else {
        transfer_len as usize
    };
    Ok(CommandRequest::data_in("READ(6) sequential", cdb, len))
}

/// READ(10), SBC-2 5.1.6
pub fn read10(
    lba: u32,
    blocks: u16,
    block_size: u32,
    fua: bool,
) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::Read10)?;
    cdb.set_flag("FUA", 1, 3, fua)?
        .set_u32("logical block address", 2, lba)?
        .set_u16("transfer length", 7, blocks)?;
    Ok(CommandRequest::data_in(
        "READ(10)",
        cdb,
        transfer_size(blocks as u32, block_size)?,
    ))
}

/// READ(12), SBC-2 5.1.7
pub fn read12(
    lba: u32,
    blocks: u32,
    block_size: u32,
    fua: bool,
) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::Read12)?;
    cdb.set_flag("FUA", 1, 3, fua)?
        .set_u32("logical block address", 2, lba)?
        .set_u32("transfer length", 6, blocks)?;
    Ok(CommandRequest::data_in(
        "READ(12)",
        cdb,
        transfer_size(blocks, block_size)?,
    ))
}

/// READ(16), SBC-2 5.1.8
pub fn read16(
    lba: u64,
    blocks: u32,
    block_size: u32,
    fua: bool,
) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::Read16)?;
    cdb.set_flag("FUA", 1, 3, fua)?
        .set_u64("logical block address", 2, lba)?
        .set_u32("transfer length", 10, blocks)?;
    Ok(CommandRequest::data_in(
        "READ(16)",
        cdb,
        transfer_size(blocks, block_size)?,
    ))
}

/// READ LONG(10), SBC-2 5.1.9. `byte_len` is a byte count, not a block count.
pub fn read_long10(
    lba: u32,
    byte_len: u16,
    correct: bool,
) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::ReadLong10)?;
    cdb.set_flag("CORRCT", 1, 1, correct)?
        .set_u32("logical block address", 2, lba)?
        .set_u16("byte transfer length", 7, byte_len)?;
    Ok(CommandRequest::data_in("READ LONG(10)", cdb, byte_len as usize))
}

/// READ LONG(16), SBC-3, a SERVICE ACTION IN(16) with service action 11h.
pub fn read_long16(
    lba: u64,
    byte_len: u16,
    correct: bool,
) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::ServiceActionIn16)?;
    cdb.set_bits("service action", 1, 0, 5, 0x11)?
        .set_u64("logical block address", 2, lba)?
        .set_u16("byte transfer length", 12, byte_len)?
        .set_flag("CORRCT", 14, 0, correct)?;
    Ok(CommandRequest::data_in("READ LONG(16)", cdb, byte_len as usize))
}

/// Expected sector type field of READ CD, MMC-5 table 360
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SectorType {
    AllTypes = 0b000,
    CdDa = 0b001,
    Mode1 = 0b010,
    Mode2Formless = 0b011,
    Mode2Form1 = 0b100,
    Mode2Form2 = 0b101,
}

/// Byte 9 and 10 combinations of READ CD that the prober exercises, each with
/// the number of bytes a single sector transfers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum ReadCdFormat {
    /// user data only, 2048 bytes for a mode 1 sector
    UserData,
    /// mode 2 formless user data, 2336 bytes
    Mode2,
    /// sync + all headers + user data + EDC/ECC, 2352 bytes
    Raw,
    /// raw sector followed by formatted Q sub-channel, 2368 bytes
    RawWithQ,
    /// raw sector followed by raw P-W sub-channel, 2448 bytes
    RawWithSubchannel,
    /// raw sector followed by C2 error pointers and block error byte, 2646 bytes
    RawWithC2,
}

impl ReadCdFormat {
    pub const ALL: [ReadCdFormat; 6] = [
        ReadCdFormat::UserData,
        ReadCdFormat::Mode2,
        ReadCdFormat::Raw,
        ReadCdFormat::RawWithQ,
        ReadCdFormat::RawWithSubchannel,
        ReadCdFormat::RawWithC2,
    ];

    pub const fn sector_size(self) -> u32 {
        match self {
            ReadCdFormat::UserData => 2048,
            ReadCdFormat::Mode2 => 2336,
            ReadCdFormat::Raw => 2352,
            ReadCdFormat::RawWithQ => 2368,
            ReadCdFormat::RawWithSubchannel => 2448,
            ReadCdFormat::RawWithC2 => 2646,
        }
    }

    fn sector_type(self) -> SectorType {
        match self {
            ReadCdFormat::UserData => SectorType::Mode1,
            ReadCdFormat::Mode2 => SectorType::Mode2Formless,
            _ => SectorType::AllTypes,
        }
    }

    /// (SYNC, header codes, user data, EDC/ECC, C2 error codes, sub-channel)
    fn selection(self) -> (bool, u8, bool, bool, u8, u8) {
        match self {
            ReadCdFormat::UserData | ReadCdFormat::Mode2 => (false, 0b00, true, false, 0b00, 0b000),
            ReadCdFormat::Raw => (true, 0b11, true, true, 0b00, 0b000),
            ReadCdFormat::RawWithQ => (true, 0b11, true, true, 0b00, 0b010),
            ReadCdFormat::RawWithSubchannel => (true, 0b11, true, true, 0b00, 0b001),
            ReadCdFormat::RawWithC2 => (true, 0b11, true, true, 0b10, 0b000),
        }
    }
}

/// READ CD, MMC-5 6.19. The transfer length field is 24 bits wide.
pub fn read_cd(
    lba: u32,
    blocks: u32,
    format: ReadCdFormat,
) -> Result<CommandRequest, EncodingError> {
    let (sync, headers, user_data, edc_ecc, c2, subchannel) = format.selection();
    let mut cdb = CommandDescriptorBlock::new(OpCode::ReadCd)?;
    cdb.set_bits("expected sector type", 1, 2, 3, format.sector_type() as u8)?
        .set_u32("starting logical block address", 2, lba)?
        .set_be("transfer length", 6, 3, 24, blocks as u64)?
        .set_flag("SYNC", 9, 7, sync)?
        .set_bits("header codes", 9, 5, 2, headers)?
        .set_flag("user data", 9, 4, user_data)?
        .set_flag("EDC/ECC", 9, 3, edc_ecc)?
        .set_bits("C2 error codes", 9, 1, 2, c2)?
        .set_bits("sub-channel selection", 10, 0, 3, subchannel)?;
    Ok(CommandRequest::data_in(
        "READ CD",
        cdb,
        transfer_size(blocks, format.sector_size())?,
    ))
}

/// Format field of READ TOC/PMA/ATIP, MMC-5 table 478
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum TocFormat {
    Toc = 0x0,
    SessionInfo = 0x1,
    FullToc = 0x2,
    Pma = 0x3,
    Atip = 0x4,
    CdText = 0x5,
}

/// READ TOC/PMA/ATIP, MMC-5 6.33
pub fn read_toc(
    msf: bool,
    format: TocFormat,
    track_session: u8,
    allocation_len: u16,
) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::ReadTocPmaAtip)?;
    cdb.set_flag("MSF", 1, 1, msf)?
        .set_bits("format", 2, 0, 4, format as u8)?
        .set_u8("track/session number", 6, track_session)?
        .set_u16("allocation length", 7, allocation_len)?;
    Ok(CommandRequest::data_in("READ TOC/PMA/ATIP", cdb, allocation_len as usize))
}

/// Media type field of READ DISC STRUCTURE
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum StructureMedia {
    Dvd = 0x0,
    Bd = 0x1,
}

/// READ DISC STRUCTURE, MMC-5 6.29
pub fn read_disc_structure(
    media: StructureMedia,
    address: u32,
    layer: u8,
    format: u8,
    agid: u8,
    allocation_len: u16,
) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::ReadDiscStructure)?;
    cdb.set_bits("media type", 1, 0, 4, media as u8)?
        .set_u32("address", 2, address)?
        .set_u8("layer number", 6, layer)?
        .set_u8("format", 7, format)?
        .set_u16("allocation length", 8, allocation_len)?
        .set_bits("AGID", 10, 6, 2, agid)?;
    Ok(CommandRequest::data_in(
        "READ DISC STRUCTURE",
        cdb,
        allocation_len as usize,
    ))
}

/// RT field of GET CONFIGURATION, MMC-5 table 87
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestType {
    All = 0b00,
    Current = 0b01,
    One = 0b10,
}

/// GET CONFIGURATION, MMC-5 6.6
pub fn get_configuration(
    request_type: RequestType,
    starting_feature: u16,
    allocation_len: u16,
) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::GetConfiguration)?;
    cdb.set_bits("RT", 1, 0, 2, request_type as u8)?
        .set_u16("starting feature number", 2, starting_feature)?
        .set_u16("allocation length", 7, allocation_len)?;
    Ok(CommandRequest::data_in("GET CONFIGURATION", cdb, allocation_len as usize))
}

/// READ BLOCK LIMITS, SSC-2 7.7. Always returns 6 bytes.
pub fn read_block_limits() -> Result<CommandRequest, EncodingError> {
    Ok(CommandRequest::data_in(
        "READ BLOCK LIMITS",
        CommandDescriptorBlock::new(OpCode::ReadBlockLimits)?,
        6,
    ))
}

/// REPORT DENSITY SUPPORT, SSC-2 7.8
pub fn report_density_support(
    medium_type: bool,
    current_media: bool,
    allocation_len: u16,
) -> Result<CommandRequest, EncodingError> {
    let mut cdb = CommandDescriptorBlock::new(OpCode::ReportDensitySupport)?;
    cdb.set_flag("MEDIUM TYPE", 1, 1, medium_type)?
        .set_flag("MEDIA", 1, 0, current_media)?
        .set_u16("allocation length", 7, allocation_len)?;
    Ok(CommandRequest::data_in(
        "REPORT DENSITY SUPPORT",
        cdb,
        allocation_len as usize,
    ))
}

/// READ POSITION, SSC-2 7.5, short form (20 bytes of response).
pub fn read_position() -> Result<CommandRequest, EncodingError> {
    Ok(CommandRequest::data_in(
        "READ POSITION",
        CommandDescriptorBlock::new(OpCode::ReadPosition)?,
        20,
    ))
}
