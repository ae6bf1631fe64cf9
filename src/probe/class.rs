//! Probes that only make sense for one class of device, run once before any
//! medium is tested.

use tracing::debug;

use super::report::{DirectAccessSection, MultimediaSection, SequentialSection};
use super::{CapabilityProbe, DeviceClass, UserInteraction, alloc16};
use crate::scsi::command::{self, RequestType};
use crate::scsi::negotiate::LengthField;
use crate::scsi::response::{BlockLimits, Configuration};
use crate::scsi::{ProbeKind, Transport};

/// Some drives fail GET CONFIGURATION with allocation lengths close to
/// 64 KiB.
const CONFIGURATION_MAX: usize = 65530;

/// MM capabilities and mechanical status page
const CAPABILITIES_PAGE: u8 = 0x2A;

/// REPORT DENSITY SUPPORT descriptor length, SSC-2 7.8.2
const DENSITY_DESCRIPTOR_LEN: usize = 52;

impl<T: Transport, U: UserInteraction> CapabilityProbe<T, U> {
    pub(super) fn class_specific(&mut self, class: DeviceClass) {
        match class {
            DeviceClass::Multimedia => self.multimedia(),
            DeviceClass::SequentialAccess => self.sequential(),
            DeviceClass::DirectAccess => {
                let removable = self
                    .report
                    .general
                    .inquiry
                    .as_ref()
                    .is_some_and(|i| i.removable);
                self.report.direct_access = Some(DirectAccessSection { removable });
            }
        }
    }

    fn multimedia(&mut self) {
        let mut section = MultimediaSection {
            capabilities_page: self.report.mode_sense.pages.contains(&CAPABILITIES_PAGE),
            ..MultimediaSection::default()
        };
        let configuration = self.negotiate(
            LengthField::remaining(0, 4, CONFIGURATION_MAX),
            8,
            ProbeKind::Optional,
            |len| command::get_configuration(RequestType::All, 0, alloc16(len)),
        );
        match configuration.map(|n| Configuration::parse(&n.data)) {
            Ok(Ok(configuration)) => {
                section.get_configuration = true;
                section.current_profile = Some(configuration.current_profile);
                section.features = configuration.features;
            }
            Ok(Err(err)) => debug!("{err}"),
            Err(err) => debug!("{err}"),
        }
        self.report.multimedia = Some(section);
    }

    fn sequential(&mut self) {
        let block_limits = self
            .try_command(command::read_block_limits(), ProbeKind::Optional)
            .and_then(|data| BlockLimits::parse(&data).ok());
        let densities: Vec<u8> = self
            .negotiate(LengthField::remaining(0, 2, 0xFFFF), 4, ProbeKind::Optional, |len| {
                command::report_density_support(false, false, alloc16(len))
            })
            .map(|n| {
                n.data
                    .get(4..)
                    .unwrap_or_default()
                    .chunks_exact(DENSITY_DESCRIPTOR_LEN)
                    .map(|descriptor| descriptor[0])
                    .collect()
            })
            .unwrap_or_default();
        self.report.sequential = Some(SequentialSection {
            block_limits,
            densities,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{config, inquiry_data, standard_inquiry};
    use super::super::Unattended;
    use super::*;
    use crate::scsi::ScsiDevice;
    use crate::scsi::mock::{MockTransport, Reply};

    #[test]
    fn tape_drive_limits_and_densities() {
        let mut densities = vec![0, 0, 0, 0];
        for code in [0x58u8, 0x5A] {
            let mut descriptor = vec![0; DENSITY_DESCRIPTOR_LEN];
            descriptor[0] = code;
            densities.extend(descriptor);
        }
        let len = (densities.len() - 2) as u16;
        densities[0..2].copy_from_slice(&len.to_be_bytes());

        let mock = MockTransport::new()
            .on(0x12, standard_inquiry(inquiry_data(0x01, b"TAPEVEND")))
            .on(0x05, |_| Reply::data(vec![0, 0x01, 0x00, 0x00, 0x00, 0x01]))
            .on(0x44, move |call| {
                Reply::data(densities[..call.data_len.min(densities.len())].to_vec())
            });
        let (report, device) = CapabilityProbe::new(ScsiDevice::new(mock), Unattended, config())
            .run()
            .unwrap();
        let sequential = report.sequential.unwrap();
        assert_eq!(
            sequential.block_limits,
            Some(BlockLimits {
                granularity: 0,
                max_block_len: 0x10000,
                min_block_len: 1
            })
        );
        assert_eq!(sequential.densities, vec![0x58, 0x5A]);
        assert_eq!(device.transport().calls_to(0x44).len(), 2);
    }

    #[test]
    fn multimedia_without_get_configuration() {
        let mock = MockTransport::new().on(0x12, standard_inquiry(inquiry_data(0x05, b"OLDDRIVE")));
        let (report, _) = CapabilityProbe::new(ScsiDevice::new(mock), Unattended, config())
            .run()
            .unwrap();
        let multimedia = report.multimedia.unwrap();
        assert!(!multimedia.get_configuration);
        assert_eq!(multimedia.current_profile, None);
    }

    #[test]
    fn fixed_disk_section() {
        let mut data = inquiry_data(0x00, b"DISKVEND");
        data[1] = 0;
        let mock = MockTransport::new().on(0x12, standard_inquiry(data));
        let (report, _) = CapabilityProbe::new(ScsiDevice::new(mock), Unattended, config())
            .run()
            .unwrap();
        assert_eq!(report.direct_access, Some(DirectAccessSection { removable: false }));
    }
}
