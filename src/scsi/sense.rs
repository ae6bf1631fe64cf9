//! Sense data: the error/status buffer a device returns alongside
//! CHECK CONDITION.
//!
//! Both formats of SPC-4 4.5 are understood:
//! - fixed format (response codes 70h/71h), 4.5.3
//! - descriptor format (response codes 72h/73h), 4.5.2
//!
//! Decoding is a pure byte-to-struct transform; deciding what to do with a
//! sense lives in [`super::retry`].

use std::fmt;

/// Capacity of a sense buffer for autosense on a normal command.
pub const SHORT_SENSE_LEN: usize = 64;
/// Largest allocation length a REQUEST SENSE can ask for.
pub const REQUEST_SENSE_LEN: usize = 252;

/// Raw sense bytes as returned by a transport.
///
/// The capacity is fixed at [`REQUEST_SENSE_LEN`]; `len` is however many of
/// those bytes the transport actually filled.
#[derive(Clone, PartialEq, Eq)]
pub struct SenseBuffer {
    bytes: [u8; REQUEST_SENSE_LEN],
    len: usize,
}

impl SenseBuffer {
    pub const fn empty() -> Self {
        Self {
            bytes: [0; REQUEST_SENSE_LEN],
            len: 0,
        }
    }

    /// Copies up to [`REQUEST_SENSE_LEN`] bytes out of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buffer = Self::empty();
        let len = data.len().min(REQUEST_SENSE_LEN);
        buffer.bytes[..len].copy_from_slice(&data[..len]);
        buffer.len = len;
        buffer
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The sense format announced by the response code, if any.
    pub fn format(&self) -> Option<SenseFormat> {
        match self.as_slice().first()? & 0x7F {
            0x70 | 0x71 => Some(SenseFormat::Fixed),
            0x72 | 0x73 => Some(SenseFormat::Descriptor),
            _ => None,
        }
    }

    /// Decodes the buffer in whichever format its response code announces.
    pub fn decode(&self) -> Option<DecodedSense> {
        decode(self.as_slice(), self.format()?)
    }
}

impl Default for SenseBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for SenseBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SenseBuffer").field(&self.as_slice()).finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SenseFormat {
    Fixed,
    Descriptor,
}

/// Sense key descriptions, as seen in SPC-4, 4.5.6, table 43
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SenseKey {
    /// No Sense: successful command, or CHECK CONDITION only because one of
    /// FILEMARK/EOM/ILI bits was set
    NoSense,
    /// Recovered Error: command completed with some recovery action performed
    RecoveredError,
    /// Not Ready: the logical unit is not accessible
    NotReady,
    /// Medium Error: usually unrecoverable errors caused by damaged media
    MediumError,
    /// Hardware Error: unrecoverable non-medium failure
    HardwareError,
    /// Illegal Request: invalid LUN/opcode/parameter
    IllegalRequest,
    /// Unit Attention: removable medium change, logical unit reset etc.
    UnitAttention,
    /// Data Protect: read/write prohibited on protected blocks
    DataProtect,
    /// Blank Check: blank medium or end-of-data encountered while reading
    BlankCheck,
    VendorSpecific,
    CopyAborted,
    /// Aborted Command: the client may be able to recover by trying again
    AbortedCommand,
    Reserved,
    /// Volume Overflow: buffered device reached end-of-partition
    VolumeOverflow,
    /// Miscompare: source data did not match the data read from the medium
    Miscompare,
    Completed,
}

impl From<u8> for SenseKey {
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => SenseKey::NoSense,
            0x1 => SenseKey::RecoveredError,
            0x2 => SenseKey::NotReady,
            0x3 => SenseKey::MediumError,
            0x4 => SenseKey::HardwareError,
            0x5 => SenseKey::IllegalRequest,
            0x6 => SenseKey::UnitAttention,
            0x7 => SenseKey::DataProtect,
            0x8 => SenseKey::BlankCheck,
            0x9 => SenseKey::VendorSpecific,
            0xA => SenseKey::CopyAborted,
            0xB => SenseKey::AbortedCommand,
            0xC => SenseKey::Reserved,
            0xD => SenseKey::VolumeOverflow,
            0xE => SenseKey::Miscompare,
            _ => SenseKey::Completed,
        }
    }
}

impl SenseKey {
    pub fn description(self) -> &'static str {
        match self {
            SenseKey::NoSense => "No Sense",
            SenseKey::RecoveredError => "Recovered Error",
            SenseKey::NotReady => "Not Ready",
            SenseKey::MediumError => "Medium Error",
            SenseKey::HardwareError => "Hardware Error",
            SenseKey::IllegalRequest => "Illegal Request",
            SenseKey::UnitAttention => "Unit Attention",
            SenseKey::DataProtect => "Data Protect",
            SenseKey::BlankCheck => "Blank Check",
            SenseKey::VendorSpecific => "Vendor specific",
            SenseKey::CopyAborted => "Copy Aborted",
            SenseKey::AbortedCommand => "Aborted Command",
            SenseKey::Reserved => "Reserved",
            SenseKey::VolumeOverflow => "Volume Overflow",
            SenseKey::Miscompare => "Miscompare",
            SenseKey::Completed => "Completed",
        }
    }
}

/// Additional sense codes the probing logic branches on.
pub mod asc {
    pub const NO_ADDITIONAL_INFORMATION: u8 = 0x00;
    pub const NOT_READY: u8 = 0x04;
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const MEDIUM_MAY_HAVE_CHANGED: u8 = 0x28;
    pub const POWER_ON_RESET: u8 = 0x29;
    pub const INCOMPATIBLE_MEDIUM: u8 = 0x30;
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;

    /// ASCQ of [`NOT_READY`]: "logical unit is in process of becoming ready"
    pub const BECOMING_READY: u8 = 0x01;
}

fn asc_description(asc: u8, ascq: u8) -> Option<&'static str> {
    Some(match (asc, ascq) {
        (0x00, 0x00) => "no additional sense information",
        (0x00, 0x01) => "filemark detected",
        (0x00, 0x02) => "end-of-partition/medium detected",
        (0x00, 0x05) => "end-of-data detected",
        (0x04, 0x00) => "logical unit not ready, cause not reportable",
        (0x04, 0x01) => "logical unit is in process of becoming ready",
        (0x04, 0x02) => "logical unit not ready, initializing command required",
        (0x11, 0x00) => "unrecovered read error",
        (0x20, 0x00) => "invalid command operation code",
        (0x21, 0x00) => "logical block address out of range",
        (0x24, 0x00) => "invalid field in CDB",
        (0x28, 0x00) => "not ready to ready change, medium may have changed",
        (0x29, 0x00) => "power on, reset, or bus device reset occurred",
        (0x30, 0x00) => "incompatible medium installed",
        (0x30, 0x02) => "cannot read medium, incompatible format",
        (0x3A, 0x00) => "medium not present",
        (0x3A, 0x01) => "medium not present, tray closed",
        (0x3A, 0x02) => "medium not present, tray open",
        (0x64, 0x00) => "illegal mode for this track",
        (0x6F, 0x00) => "copy protection key exchange failure",
        _ => return None,
    })
}

/// The fields of a sense buffer the probing logic cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedSense {
    /// false for deferred errors (response codes 71h/73h)
    pub current: bool,
    pub key: SenseKey,
    /// Additional Sense Code
    pub asc: u8,
    /// Additional Sense Code Qualifier
    pub ascq: u8,
    pub information_valid: bool,
    /// INFORMATION field, only present when its VALID bit was set
    pub information: Option<u32>,
    /// COMMAND-SPECIFIC INFORMATION field, when the device returned one
    pub command_specific: Option<u32>,
    /// Incorrect Length Indicator; used by READ LONG and by SSC READ
    pub incorrect_length: bool,
    /// Used in SSC-2 READ and SPACE commands
    pub filemark: bool,
    /// End of Medium; used in SSC-2 READ, SPACE, and WRITE commands
    pub end_of_medium: bool,
}

impl DecodedSense {
    /// Returns tuple `(asc, ascq)`
    pub fn asc_ascq(&self) -> (u8, u8) {
        (self.asc, self.ascq)
    }

    /// True when `information` carries a length delta for the failed transfer.
    pub fn has_length_delta(&self) -> bool {
        self.incorrect_length && self.information_valid && self.information.is_some()
    }
}

impl fmt::Display for DecodedSense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self.key.description();
        if self.asc == 0 && self.ascq == 0 {
            write!(f, "{key}")?;
        } else {
            match asc_description(self.asc, self.ascq) {
                Some(text) => write!(f, "{key}, {text}")?,
                None => write!(f, "{key}, ASC={:02X}h, ASCQ={:02X}h", self.asc, self.ascq)?,
            }
        }
        if let Some(info) = self.information {
            write!(f, " (information {info:#x})")?;
        }
        Ok(())
    }
}

/// Parses `data` as sense data of the given format.
///
/// Returns `None` if the response code does not match `format`, or if the
/// buffer is too short to hold the key and additional sense codes.
pub fn decode(data: &[u8], format: SenseFormat) -> Option<DecodedSense> {
    let response_code = data.first()? & 0x7F;
    match (format, response_code) {
        (SenseFormat::Fixed, 0x70 | 0x71) => decode_fixed(data),
        (SenseFormat::Descriptor, 0x72 | 0x73) => decode_descriptor(data),
        _ => None,
    }
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn decode_fixed(data: &[u8]) -> Option<DecodedSense> {
    if data.len() < 14 {
        return None;
    }
    let information_valid = data[0] & 0b1000_0000 != 0;
    // data[7] is Additional Sense Length, starting from data[8]
    let additional = data[7] as usize;
    let command_specific = if additional >= 4 {
        Some(be32(&data[8..12]))
    } else {
        None
    };

    Some(DecodedSense {
        current: data[0] & 0x7F == 0x70,
        key: SenseKey::from(data[2]),
        asc: if additional >= 5 { data[12] } else { 0 },
        ascq: if additional >= 6 { data[13] } else { 0 },
        information_valid,
        information: information_valid.then(|| be32(&data[3..7])),
        command_specific,
        incorrect_length: data[2] & 0b0010_0000 != 0,
        filemark: data[2] & 0b1000_0000 != 0,
        end_of_medium: data[2] & 0b0100_0000 != 0,
    })
}

/// Descriptor types of SPC-4 table 29 this decoder looks into.
const INFORMATION_DESCRIPTOR: u8 = 0x00;
const COMMAND_SPECIFIC_DESCRIPTOR: u8 = 0x01;
const STREAM_COMMANDS_DESCRIPTOR: u8 = 0x04;
const BLOCK_COMMANDS_DESCRIPTOR: u8 = 0x05;

fn decode_descriptor(data: &[u8]) -> Option<DecodedSense> {
    if data.len() < 8 {
        return None;
    }
    let mut sense = DecodedSense {
        current: data[0] & 0x7F == 0x72,
        key: SenseKey::from(data[1]),
        asc: data[2],
        ascq: data[3],
        information_valid: false,
        information: None,
        command_specific: None,
        incorrect_length: false,
        filemark: false,
        end_of_medium: false,
    };

    // devices are allowed to claim more descriptors than the buffer holds
    let end = (8 + data[7] as usize).min(data.len());
    let mut offset = 8;
    while offset + 2 <= end {
        let code = data[offset];
        let len = data[offset + 1] as usize;
        let Some(body) = data.get(offset + 2..offset + 2 + len) else {
            break;
        };
        match code {
            INFORMATION_DESCRIPTOR | COMMAND_SPECIFIC_DESCRIPTOR if body.len() >= 10 => {
                let value = u64::from_be_bytes([
                    body[2], body[3], body[4], body[5], body[6], body[7], body[8], body[9],
                ]);
                if code == INFORMATION_DESCRIPTOR {
                    sense.information_valid = body[0] & 0b1000_0000 != 0;
                    if sense.information_valid {
                        sense.information = u32::try_from(value).ok();
                    }
                } else {
                    sense.command_specific = u32::try_from(value).ok();
                }
            }
            STREAM_COMMANDS_DESCRIPTOR if body.len() >= 2 => {
                sense.filemark = body[1] & 0b1000_0000 != 0;
                sense.end_of_medium = body[1] & 0b0100_0000 != 0;
                sense.incorrect_length = body[1] & 0b0010_0000 != 0;
            }
            BLOCK_COMMANDS_DESCRIPTOR if body.len() >= 2 => {
                sense.incorrect_length = body[1] & 0b0010_0000 != 0;
            }
            _ => {}
        }
        offset += 2 + len;
    }

    Some(sense)
}

/// Builds fixed format sense bytes, used to script devices in tests.
#[cfg(test)]
pub(crate) fn fixed_sense(
    key: u8,
    asc: u8,
    ascq: u8,
    information: Option<u32>,
    ili: bool,
) -> Vec<u8> {
    let mut buf = vec![0u8; 18];
    buf[0] = 0x70 | if information.is_some() { 0x80 } else { 0 };
    buf[2] = key | if ili { 0b0010_0000 } else { 0 };
    if let Some(info) = information {
        buf[3..7].copy_from_slice(&info.to_be_bytes());
    }
    buf[7] = 10;
    buf[12] = asc;
    buf[13] = ascq;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_sense_fields() {
        let raw = fixed_sense(0x05, 0x24, 0x00, Some(0x0000_0003), true);
        let sense = decode(&raw, SenseFormat::Fixed).expect("valid sense");
        assert_eq!(sense.key, SenseKey::IllegalRequest);
        assert_eq!(sense.asc_ascq(), (0x24, 0x00));
        assert_eq!(sense.information, Some(3));
        assert!(sense.information_valid);
        assert!(sense.incorrect_length);
        assert!(sense.has_length_delta());
        assert!(sense.current);
    }

    #[test]
    fn information_ignored_without_valid_bit() {
        let mut raw = fixed_sense(0x02, 0x3A, 0x00, None, false);
        raw[3..7].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let sense = decode(&raw, SenseFormat::Fixed).unwrap();
        assert!(!sense.information_valid);
        assert_eq!(sense.information, None);
        assert_eq!(sense.key, SenseKey::NotReady);
    }

    #[test]
    fn wrong_response_code_is_rejected() {
        let raw = fixed_sense(0x05, 0x20, 0x00, None, false);
        assert!(decode(&raw, SenseFormat::Descriptor).is_none());
        let mut garbage = raw.clone();
        garbage[0] = 0x12;
        assert!(decode(&garbage, SenseFormat::Fixed).is_none());
        assert!(SenseBuffer::from_slice(&garbage).decode().is_none());
        assert!(decode(&raw[..10], SenseFormat::Fixed).is_none());
        assert!(SenseBuffer::empty().decode().is_none());
    }

    #[test]
    fn descriptor_sense_with_information_and_ili() {
        let mut raw = vec![0x72, 0x05, 0x24, 0x00, 0, 0, 0, 0];
        // information descriptor, VALID set, value 0x10
        raw.extend([0x00, 0x0A, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0x10]);
        // block commands descriptor with ILI
        raw.extend([0x05, 0x02, 0x00, 0b0010_0000]);
        raw[7] = (raw.len() - 8) as u8;
        let sense = SenseBuffer::from_slice(&raw).decode().unwrap();
        assert_eq!(sense.key, SenseKey::IllegalRequest);
        assert_eq!(sense.information, Some(0x10));
        assert!(sense.has_length_delta());
    }

    #[test]
    fn truncated_descriptor_list_does_not_panic() {
        let raw = [0x72, 0x02, 0x04, 0x01, 0, 0, 0, 40, 0x00, 0x0A, 0x80];
        let sense = decode(&raw, SenseFormat::Descriptor).unwrap();
        assert_eq!(sense.asc_ascq(), (0x04, 0x01));
        assert_eq!(sense.information, None);
    }

    #[test]
    fn display_names_key_and_code() {
        let sense =
            decode(&fixed_sense(0x02, 0x3A, 0x00, None, false), SenseFormat::Fixed).unwrap();
        assert_eq!(sense.to_string(), "Not Ready, medium not present");
    }
}
