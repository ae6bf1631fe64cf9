//! The capability report a probe run produces.
//!
//! Everything here is plain data: no durations or other values that change
//! between runs against the same device.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::scsi::command::{ReadCdFormat, StructureMedia};
use crate::scsi::response::{BlockLimits, Inquiry, MediaFamily, PeripheralType, TocHeader};

/// The device classes that get a class specific probe.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DeviceClass {
    DirectAccess,
    SequentialAccess,
    Multimedia,
}

impl DeviceClass {
    pub fn from_peripheral_type(kind: PeripheralType) -> Option<Self> {
        match kind {
            PeripheralType::DirectAccess
            | PeripheralType::SimplifiedDirectAccess
            | PeripheralType::OpticalMemory => Some(DeviceClass::DirectAccess),
            PeripheralType::SequentialAccess => Some(DeviceClass::SequentialAccess),
            PeripheralType::Multimedia => Some(DeviceClass::Multimedia),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GeneralSection {
    pub inquiry: Option<Inquiry>,
    pub class: Option<DeviceClass>,
    pub vpd_pages: Vec<u8>,
    pub serial_number: Option<String>,
    /// Raw Device Identification page (83h)
    pub device_identification: Option<Vec<u8>>,
}

/// Which MODE SENSE forms the device accepted, and what the first one said.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ModeSenseSection {
    pub ten: bool,
    pub six: bool,
    /// Only the single-call, page 0 form of MODE SENSE(6) worked
    pub legacy: bool,
    pub medium_type: Option<u8>,
    pub device_specific: Option<u8>,
    pub block_length: Option<u32>,
    pub density_code: Option<u8>,
    pub pages: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MultimediaSection {
    pub get_configuration: bool,
    pub current_profile: Option<u16>,
    pub features: Vec<u16>,
    /// MM capabilities mode page (2Ah) was returned
    pub capabilities_page: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SequentialSection {
    pub block_limits: Option<BlockLimits>,
    /// Primary density codes from REPORT DENSITY SUPPORT
    pub densities: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DirectAccessSection {
    pub removable: bool,
}

/// One way of reading sectors that the device accepted.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ReadVariant {
    Read6,
    Read10,
    Read12,
    Read16,
    ReadLong10,
    ReadLong16,
    ReadCd(ReadCdFormat),
    /// READ(6) on a sequential-access device
    SequentialRead,
    ReadPosition,
    Vendor(&'static str),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StructureRead {
    pub media: StructureMedia,
    pub format: u8,
}

/// Results for one inserted medium.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MediaTest {
    pub label: String,
    /// The device became ready and reported a usable geometry
    pub recognized: bool,
    pub media: Option<MediaFamily>,
    pub block_size: Option<u32>,
    pub blocks: Option<u64>,
    pub long_block_size: Option<u16>,
    /// CD media only
    pub toc: Option<TocHeader>,
    pub supported_read_variants: BTreeSet<ReadVariant>,
    pub supported_structure_reads: BTreeSet<StructureRead>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CapabilityReport {
    pub general: GeneralSection,
    pub mode_sense: ModeSenseSection,
    pub multimedia: Option<MultimediaSection>,
    pub sequential: Option<SequentialSection>,
    pub direct_access: Option<DirectAccessSection>,
    pub media_tests: Vec<MediaTest>,
}
