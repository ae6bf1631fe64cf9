//! Underlying structures that commands are issued in

use super::error::EncodingError;

/// Operation codes for a Command Descriptor Block, specifying what operation you want
/// to do as described in 7.1 of SPC-2, SBC-2, SSC-2 and MMC-5.
///
/// This enum is not complete, and is intended to grow
/// as needed
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum OpCode {
    /// SPC-2 7.25
    TestUnitReady = 0x00,
    /// SPC-2 7.20
    RequestSense = 0x03,
    /// SSC-2 7.7
    ReadBlockLimits = 0x05,
    /// SBC-2 5.1.4
    Read6 = 0x08,
    /// SPC-2 7.3
    Inquiry = 0x12,
    /// SPC-2 7.9
    ModeSense6 = 0x1A,
    /// SPC-2 7.12
    PreventAllowMediumRemoval = 0x1E,
    /// SBC-2 5.1.10, table 27
    ReadCapacity = 0x25,
    /// SBC-2 5.1.6
    Read10 = 0x28,
    /// SSC-2 7.5
    ReadPosition = 0x34,
    /// SBC-2 5.1.9
    ReadLong10 = 0x3E,
    /// MMC-5 6.33
    ReadTocPmaAtip = 0x43,
    /// SSC-2 7.8
    ReportDensitySupport = 0x44,
    /// MMC-5 6.6
    GetConfiguration = 0x46,
    /// SPC-2 7.10
    ModeSense10 = 0x5A,
    /// SBC-2 5.1.8
    Read16 = 0x88,
    /// SBC-3 service action in: READ CAPACITY(16) / READ LONG(16)
    ServiceActionIn16 = 0x9E,
    /// SBC-2 5.1.7
    Read12 = 0xA8,
    /// MMC-5 6.29
    ReadDiscStructure = 0xAD,
    /// MMC-5 6.19
    ReadCd = 0xBE,
}

/// The fixed CDB lengths defined by SPC-2 4.3.2.
///
/// The top three bits of an operation code form its "group code", which
/// determines the length of the CDB for every standard command. Groups 6 and 7
/// are vendor specific, so their length has to be spelled out by whoever
/// defines the command.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CdbFamily {
    /// Table 1, typical CDB for 6 byte commands
    X6,
    /// Table 2, typical CDB for 10 byte commands
    X10,
    /// Table 3, typical CDB for 12 byte commands
    X12,
    /// Table 4, typical CDB for 16 byte commands
    X16,
}

impl CdbFamily {
    pub const fn len(self) -> usize {
        match self {
            CdbFamily::X6 => 6,
            CdbFamily::X10 => 10,
            CdbFamily::X12 => 12,
            CdbFamily::X16 => 16,
        }
    }

    /// Resolves the family from the group code of a standard opcode.
    pub fn for_opcode(opcode: u8) -> Result<CdbFamily, EncodingError> {
        match opcode >> 5 {
            0 => Ok(CdbFamily::X6),
            1 | 2 => Ok(CdbFamily::X10),
            4 => Ok(CdbFamily::X16),
            5 => Ok(CdbFamily::X12),
            _ => Err(EncodingError::UnknownGroup(opcode)),
        }
    }
}

/// "A command is communicated by sending a command descriptor block
/// to the device ...."
///
/// An owned CDB whose length is fixed by its [`CdbFamily`] when it is created.
/// Fields are only ever written through the methods below, which check both
/// the byte range and the value range of the field being written, so a
/// builder can never produce a block of the wrong length or silently drop
/// high bits of a parameter.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandDescriptorBlock {
    bytes: [u8; MAX_CDB_SIZE],
    family: CdbFamily,
}

/// The largest CDB any supported transport carries.
pub const MAX_CDB_SIZE: usize = 16;

impl CommandDescriptorBlock {
    /// Creates a zeroed block for a standard opcode, sized by its group code.
    pub fn new(operation_code: OpCode) -> Result<Self, EncodingError> {
        let family = CdbFamily::for_opcode(operation_code as u8)?;
        Ok(Self::with_family(operation_code as u8, family))
    }

    /// Creates a zeroed block with an explicit length, for vendor specific
    /// opcodes whose group code does not imply one.
    pub fn with_family(operation_code: u8, family: CdbFamily) -> Self {
        let mut bytes = [0; MAX_CDB_SIZE];
        bytes[0] = operation_code;
        Self { bytes, family }
    }

    pub fn family(&self) -> CdbFamily {
        self.family
    }

    pub fn len(&self) -> usize {
        self.family.len()
    }

    pub fn operation_code(&self) -> u8 {
        self.bytes[0]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }

    fn check_bounds(
        &self,
        field: &'static str,
        offset: usize,
        width: usize,
    ) -> Result<(), EncodingError> {
        if offset == 0 || offset + width > self.len() {
            return Err(EncodingError::OutOfBounds {
                field,
                offset,
                width,
                len: self.len(),
            });
        }
        Ok(())
    }

    /// Writes `value` big-endian into `width` bytes starting at `offset`,
    /// rejecting values that need more than `bits` bits.
    ///
    /// Bits of the first byte above `bits` are left untouched, which is how
    /// the 21-bit LBA of a 6 byte CDB shares its first byte with other fields.
    pub fn set_be(
        &mut self,
        field: &'static str,
        offset: usize,
        width: usize,
        bits: u32,
        value: u64,
    ) -> Result<&mut Self, EncodingError> {
        self.check_bounds(field, offset, width)?;
        if bits < 64 && value >> bits != 0 {
            return Err(EncodingError::OutOfRange { field, value, bits });
        }
        for (i, byte) in self.bytes[offset..offset + width].iter_mut().enumerate() {
            let shift = 8 * (width - 1 - i);
            let chunk = (value >> shift) as u8;
            // only the bits belonging to this field are replaced
            let field_bits = (bits as usize).saturating_sub(shift).min(8);
            let mask = if field_bits >= 8 {
                0xFF
            } else {
                ((1u16 << field_bits) - 1) as u8
            };
            *byte = (*byte & !mask) | (chunk & mask);
        }
        Ok(self)
    }

    /// Writes a whole byte.
    pub fn set_u8(
        &mut self,
        field: &'static str,
        offset: usize,
        value: u8,
    ) -> Result<&mut Self, EncodingError> {
        self.set_be(field, offset, 1, 8, value as u64)
    }

    pub fn set_u16(
        &mut self,
        field: &'static str,
        offset: usize,
        value: u16,
    ) -> Result<&mut Self, EncodingError> {
        self.set_be(field, offset, 2, 16, value as u64)
    }

    pub fn set_u32(
        &mut self,
        field: &'static str,
        offset: usize,
        value: u32,
    ) -> Result<&mut Self, EncodingError> {
        self.set_be(field, offset, 4, 32, value as u64)
    }

    pub fn set_u64(
        &mut self,
        field: &'static str,
        offset: usize,
        value: u64,
    ) -> Result<&mut Self, EncodingError> {
        self.set_be(field, offset, 8, 64, value)
    }

    /// ORs a `width`-bit `value` into byte `offset` at bit position `shift`.
    ///
    /// Bits outside the field are never cleared; writing the same field
    /// twice with different values is a caller bug and is not detected.
    pub fn set_bits(
        &mut self,
        field: &'static str,
        offset: usize,
        shift: u32,
        width: u32,
        value: u8,
    ) -> Result<&mut Self, EncodingError> {
        self.check_bounds(field, offset, 1)?;
        if shift + width > 8 || (value as u32) >> width != 0 {
            return Err(EncodingError::OutOfRange {
                field,
                value: value as u64,
                bits: width,
            });
        }
        self.bytes[offset] |= value << shift;
        Ok(self)
    }

    /// Sets a single bit when `flag` is true.
    pub fn set_flag(
        &mut self,
        field: &'static str,
        offset: usize,
        bit: u32,
        flag: bool,
    ) -> Result<&mut Self, EncodingError> {
        self.set_bits(field, offset, bit, 1, flag as u8)
    }
}

impl std::fmt::Debug for CommandDescriptorBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CDB{:?}[", self.family)?;
        for (i, byte) in self.as_slice().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        write!(f, "]")
    }
}
