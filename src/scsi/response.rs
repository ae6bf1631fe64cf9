//! Representations for responses to SCSI commands.
//!
//! Only the fields the prober branches on are decoded; everything else stays
//! in the raw bytes kept alongside.

use serde::Serialize;

use super::error::ResponseError;

fn need(what: &'static str, buf: &[u8], needed: usize) -> Result<(), ResponseError> {
    if buf.len() < needed {
        return Err(ResponseError::Truncated {
            what,
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

fn be(buf: &[u8]) -> u64 {
    buf.iter().fold(0, |acc, b| (acc << 8) | *b as u64)
}

/// Printable ASCII with the space padding removed.
fn ascii(buf: &[u8]) -> String {
    buf.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect::<String>()
        .trim()
        .to_string()
}

/// PERIPHERAL DEVICE TYPE, SPC-2 table 48
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum PeripheralType {
    DirectAccess,
    SequentialAccess,
    Printer,
    Processor,
    WriteOnce,
    Multimedia,
    OpticalMemory,
    MediumChanger,
    StorageArray,
    Enclosure,
    SimplifiedDirectAccess,
    OpticalCard,
    Other(u8),
}

impl From<u8> for PeripheralType {
    fn from(value: u8) -> Self {
        match value & 0x1F {
            0x00 => PeripheralType::DirectAccess,
            0x01 => PeripheralType::SequentialAccess,
            0x02 => PeripheralType::Printer,
            0x03 => PeripheralType::Processor,
            0x04 => PeripheralType::WriteOnce,
            0x05 => PeripheralType::Multimedia,
            0x07 => PeripheralType::OpticalMemory,
            0x08 => PeripheralType::MediumChanger,
            0x0C => PeripheralType::StorageArray,
            0x0D => PeripheralType::Enclosure,
            0x0E => PeripheralType::SimplifiedDirectAccess,
            0x0F => PeripheralType::OpticalCard,
            other => PeripheralType::Other(other),
        }
    }
}

/// Standard INQUIRY data, SPC-2 7.3.2
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Inquiry {
    /// The PERIPHERAL QUALIFIER field describes the current state of the
    /// device. 0 means a device of the reported type is connected to this
    /// logical unit, which does not mean it is ready for access.
    pub peripheral_qualifier: u8,
    pub peripheral_type: PeripheralType,
    /// RMB, the medium is removable
    pub removable: bool,
    /// Claimed standard: 0 none, 2 SCSI-2, 3 SPC, 4 SPC-2, 5 SPC-3, ...
    pub version: u8,
    pub response_data_format: u8,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl Inquiry {
    pub fn parse(buf: &[u8]) -> Result<Self, ResponseError> {
        need("INQUIRY", buf, 36)?;
        Ok(Self {
            peripheral_qualifier: buf[0] >> 5,
            peripheral_type: PeripheralType::from(buf[0]),
            removable: buf[1] & 0x80 != 0,
            version: buf[2],
            response_data_format: buf[3] & 0x0F,
            vendor: ascii(&buf[8..16]),
            product: ascii(&buf[16..32]),
            revision: ascii(&buf[32..36]),
        })
    }
}

/// Page codes listed in the Supported VPD Pages page (00h).
pub fn supported_vpd_pages(buf: &[u8]) -> Result<Vec<u8>, ResponseError> {
    need("supported VPD pages", buf, 4)?;
    let len = buf[3] as usize;
    need("supported VPD pages", buf, 4 + len)?;
    Ok(buf[4..4 + len].to_vec())
}

/// PRODUCT SERIAL NUMBER of the Unit Serial Number page (80h).
pub fn unit_serial_number(buf: &[u8]) -> Result<String, ResponseError> {
    need("unit serial number", buf, 4)?;
    let len = buf[3] as usize;
    need("unit serial number", buf, 4 + len)?;
    Ok(ascii(&buf[4..4 + len]))
}

/// READ CAPACITY(10) and (16) data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub last_lba: u64,
    pub block_size: u32,
}

impl Capacity {
    pub fn parse10(buf: &[u8]) -> Result<Self, ResponseError> {
        need("READ CAPACITY(10)", buf, 8)?;
        Ok(Self {
            last_lba: be(&buf[0..4]),
            block_size: be(&buf[4..8]) as u32,
        })
    }

    pub fn parse16(buf: &[u8]) -> Result<Self, ResponseError> {
        need("READ CAPACITY(16)", buf, 12)?;
        Ok(Self {
            last_lba: be(&buf[0..8]),
            block_size: be(&buf[8..12]) as u32,
        })
    }

    /// READ CAPACITY(10) answers FFFFFFFFh when the device is too large for
    /// it and READ CAPACITY(16) has to be used.
    pub fn needs_sixteen(&self) -> bool {
        self.last_lba == u32::MAX as u64
    }

    pub fn blocks(&self) -> u64 {
        self.last_lba.saturating_add(1)
    }
}

/// READ BLOCK LIMITS data, SSC-2 7.7
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockLimits {
    pub granularity: u8,
    pub max_block_len: u32,
    pub min_block_len: u16,
}

impl BlockLimits {
    pub fn parse(buf: &[u8]) -> Result<Self, ResponseError> {
        need("READ BLOCK LIMITS", buf, 6)?;
        Ok(Self {
            granularity: buf[0] & 0x1F,
            max_block_len: be(&buf[1..4]) as u32,
            min_block_len: be(&buf[4..6]) as u16,
        })
    }

    /// Fixed block mode: minimum and maximum are equal
    pub fn fixed(&self) -> Option<u32> {
        (self.max_block_len == self.min_block_len as u32).then_some(self.max_block_len)
    }
}

/// The mode parameter header and the first block descriptor, if any.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModeHeader {
    pub medium_type: u8,
    pub device_specific: u8,
    /// Total header plus block descriptor length; mode pages start here
    pub pages_offset: usize,
    pub block_length: Option<u32>,
    pub density_code: Option<u8>,
}

impl ModeHeader {
    /// MODE SENSE(6) header, SPC-2 8.3.3
    pub fn parse6(buf: &[u8]) -> Result<Self, ResponseError> {
        need("MODE SENSE(6) header", buf, 4)?;
        Self::with_descriptor(buf, buf[1], buf[2], 4, buf[3] as usize)
    }

    /// MODE SENSE(10) header
    pub fn parse10(buf: &[u8]) -> Result<Self, ResponseError> {
        need("MODE SENSE(10) header", buf, 8)?;
        Self::with_descriptor(buf, buf[2], buf[3], 8, be(&buf[6..8]) as usize)
    }

    fn with_descriptor(
        buf: &[u8],
        medium_type: u8,
        device_specific: u8,
        header_len: usize,
        descriptor_len: usize,
    ) -> Result<Self, ResponseError> {
        let (block_length, density_code) = if descriptor_len >= 8 {
            need("mode block descriptor", buf, header_len + 8)?;
            let d = &buf[header_len..header_len + 8];
            (Some(be(&d[5..8]) as u32), Some(d[0]))
        } else {
            (None, None)
        };
        Ok(Self {
            medium_type,
            device_specific,
            pages_offset: header_len + descriptor_len,
            block_length,
            density_code,
        })
    }
}

/// Page codes present in a MODE SENSE response, in order.
pub fn mode_pages(buf: &[u8], header: &ModeHeader) -> Vec<u8> {
    let mut pages = Vec::new();
    let mut offset = header.pages_offset;
    while offset + 2 <= buf.len() {
        let code = buf[offset] & 0x3F;
        let subpage = buf[offset] & 0x40 != 0;
        let len = if subpage {
            match buf.get(offset + 2..offset + 4) {
                Some(l) => 4 + be(l) as usize,
                None => break,
            }
        } else {
            2 + buf[offset + 1] as usize
        };
        pages.push(code);
        offset += len;
    }
    pages
}

/// Broad media family from a MMC profile number, MMC-5 table 91
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum MediaFamily {
    Cd,
    Dvd,
    Bd,
    HdDvd,
    Other,
}

impl MediaFamily {
    pub fn from_profile(profile: u16) -> Self {
        match profile {
            0x0008..=0x000A => MediaFamily::Cd,
            0x0010..=0x002B => MediaFamily::Dvd,
            0x0040..=0x0043 => MediaFamily::Bd,
            0x0050..=0x005A => MediaFamily::HdDvd,
            _ => MediaFamily::Other,
        }
    }
}

/// GET CONFIGURATION header and the feature codes that follow, MMC-5 5.2
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Configuration {
    pub current_profile: u16,
    pub features: Vec<u16>,
}

impl Configuration {
    pub fn parse(buf: &[u8]) -> Result<Self, ResponseError> {
        need("GET CONFIGURATION", buf, 8)?;
        let end = (be(&buf[0..4]) as usize + 4).min(buf.len());
        let mut features = Vec::new();
        let mut offset = 8;
        while offset + 4 <= end {
            features.push(be(&buf[offset..offset + 2]) as u16);
            offset += 4 + buf[offset + 3] as usize;
        }
        Ok(Self {
            current_profile: be(&buf[6..8]) as u16,
            features,
        })
    }

    pub fn media(&self) -> MediaFamily {
        MediaFamily::from_profile(self.current_profile)
    }
}

/// READ TOC format 0000b header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TocHeader {
    pub first_track: u8,
    pub last_track: u8,
    /// Control nibble of the first track descriptor; bit 2 marks data tracks
    pub first_track_control: Option<u8>,
}

impl TocHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, ResponseError> {
        need("READ TOC", buf, 4)?;
        Ok(Self {
            first_track: buf[2],
            last_track: buf[3],
            first_track_control: buf.get(5).map(|b| b & 0x0F),
        })
    }

    pub fn first_track_is_data(&self) -> bool {
        self.first_track_control.is_some_and(|c| c & 0x04 != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inquiry_data() -> Vec<u8> {
        let mut buf = vec![0x05, 0x80, 0x05, 0x32, 31, 0, 0, 0];
        buf.extend_from_slice(b"PLEXTOR ");
        buf.extend_from_slice(b"DVDR   PX-760A  ");
        buf.extend_from_slice(b"1.07");
        buf
    }

    #[test]
    fn inquiry() {
        let inquiry = Inquiry::parse(&inquiry_data()).unwrap();
        assert_eq!(inquiry.peripheral_qualifier, 0);
        assert_eq!(inquiry.peripheral_type, PeripheralType::Multimedia);
        assert!(inquiry.removable);
        assert_eq!(inquiry.vendor, "PLEXTOR");
        assert_eq!(inquiry.product, "DVDR   PX-760A");
        assert_eq!(inquiry.revision, "1.07");
    }

    #[test]
    fn truncated_inquiry() {
        let err = Inquiry::parse(&inquiry_data()[..20]).expect_err("short buffer");
        assert!(err.to_string().contains("INQUIRY"));
    }

    #[test]
    fn capacity() {
        let cap = Capacity::parse10(&[0, 0x03, 0x0F, 0xFF, 0, 0, 0x08, 0]).unwrap();
        assert_eq!(cap.block_size, 2048);
        assert_eq!(cap.blocks(), 0x31000);
        assert!(Capacity::parse10(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 2, 0]).unwrap().needs_sixteen());
    }

    #[test]
    fn mode_header_with_block_descriptor() {
        let mut buf = vec![0, 0x1E, 0, 0, 0, 0, 0, 8];
        buf.extend_from_slice(&[0x44, 0, 0, 0, 0, 0, 0x02, 0x00]);
        buf.extend_from_slice(&[0x01, 0x0A, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        buf.extend_from_slice(&[0x2A, 0x02, 0, 0]);
        let header = ModeHeader::parse10(&buf).unwrap();
        assert_eq!(header.block_length, Some(512));
        assert_eq!(header.density_code, Some(0x44));
        assert_eq!(header.pages_offset, 16);
        assert_eq!(mode_pages(&buf, &header), vec![0x01, 0x2A]);
    }

    #[test]
    fn configuration_features() {
        let buf = [
            0, 0, 0, 20, 0, 0, 0x00, 0x10, // header, DVD-ROM current
            0x00, 0x00, 0x03, 0x04, 0x00, 0x10, 0x01, 0x00, // profile list
            0x00, 0x1E, 0x08, 0x00, // CD read
            0x00, 0x1F, 0x08, 0x00, // DVD read
        ];
        let config = Configuration::parse(&buf).unwrap();
        assert_eq!(config.current_profile, 0x10);
        assert_eq!(config.media(), MediaFamily::Dvd);
        assert_eq!(config.features, vec![0x0000, 0x001E, 0x001F]);
    }

    #[test]
    fn block_limits() {
        let limits = BlockLimits::parse(&[0, 0, 0x02, 0, 0x02, 0]).unwrap();
        assert_eq!(limits.fixed(), Some(512));
    }

    #[test]
    fn vpd_pages() {
        assert_eq!(
            supported_vpd_pages(&[0x05, 0, 0, 3, 0, 0x80, 0x83]).unwrap(),
            vec![0, 0x80, 0x83]
        );
        assert_eq!(
            unit_serial_number(&[0x05, 0x80, 0, 5, b' ', b'A', b'B', b'1', b' ']).unwrap(),
            "AB1"
        );
    }
}
