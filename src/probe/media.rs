//! The per-medium battery of read probes.

use tracing::{debug, info, warn};

use super::report::{MediaTest, ReadVariant, StructureRead};
use super::{CapabilityProbe, DeviceClass, UserInteraction, alloc16, authorize};
use crate::scsi::command::{
    self, CommandRequest, ReadCdFormat, RequestType, StructureMedia, TocFormat,
};
use crate::scsi::long_block::{self, LongBlockResult, LongCommand};
use crate::scsi::negotiate::LengthField;
use crate::scsi::response::{Capacity, Configuration, MediaFamily, TocHeader};
use crate::scsi::vendor::{self, Vendor};
use crate::scsi::{EncodingError, ProbeKind, ProbeOutcome, Transport};

/// Variable block mode read size for tapes; larger blocks are reported as
/// unknown.
const TAPE_PROBE_LEN: u32 = 0x1_0000;

/// Larger logical blocks from READ CAPACITY are treated as a garbled
/// response rather than allocated for.
const MAX_BLOCK_SIZE: u32 = 0x1_0000;

/// READ DISC STRUCTURE formats tried per media type.
fn structure_formats(media: MediaFamily) -> &'static [(StructureMedia, u8)] {
    match media {
        // physical format, copyright, disc manufacturing information
        MediaFamily::Dvd | MediaFamily::HdDvd => &[
            (StructureMedia::Dvd, 0x00),
            (StructureMedia::Dvd, 0x01),
            (StructureMedia::Dvd, 0x04),
        ],
        // disc information, PAC list
        MediaFamily::Bd => &[(StructureMedia::Bd, 0x00), (StructureMedia::Bd, 0x30)],
        MediaFamily::Cd | MediaFamily::Other => &[],
    }
}

impl<T: Transport, U: UserInteraction> CapabilityProbe<T, U> {
    /// One [`MediaTest`] per confirmed insertion. Devices with a fixed
    /// medium are tested exactly once, without asking.
    pub(super) fn media_loop(&mut self, class: DeviceClass) {
        let removable = match class {
            DeviceClass::DirectAccess => {
                self.report.direct_access.as_ref().is_some_and(|d| d.removable)
            }
            DeviceClass::Multimedia | DeviceClass::SequentialAccess => true,
        };
        loop {
            if self.cancelled() {
                break;
            }
            let cycle = self.report.media_tests.len() + 1;
            let label = if removable {
                if !self
                    .interaction
                    .confirm("Insert a medium to test, then confirm. Decline to finish")
                {
                    break;
                }
                let label = self.interaction.read_line("Label for this medium");
                if label.is_empty() {
                    format!("medium {cycle}")
                } else {
                    label
                }
            } else if cycle > 1 {
                break;
            } else {
                String::from("fixed medium")
            };

            let test = self.test_medium(class, label, removable);
            if !test.recognized {
                self.interaction
                    .notify(&format!("{}: medium not ready or not recognized", test.label));
            }
            info!(label = %test.label, recognized = test.recognized, "medium tested");
            self.report.media_tests.push(test);
        }
    }

    fn test_medium(&mut self, class: DeviceClass, label: String, removable: bool) -> MediaTest {
        let mut test = MediaTest {
            label,
            ..MediaTest::default()
        };
        if !self.wait_ready() {
            return test;
        }
        // keep the medium in place while the battery runs
        let locked = removable
            && self
                .try_command(command::prevent_allow_medium_removal(true), ProbeKind::Optional)
                .is_some();
        match class {
            DeviceClass::SequentialAccess => self.sequential_medium(&mut test),
            DeviceClass::DirectAccess | DeviceClass::Multimedia => {
                self.block_medium(class, &mut test)
            }
        }
        if locked
            && self
                .try_command(command::prevent_allow_medium_removal(false), ProbeKind::Optional)
                .is_none()
        {
            warn!("could not unlock the medium");
        }
        test
    }

    /// TEST UNIT READY under the configured retry policy.
    fn wait_ready(&mut self) -> bool {
        let Ok(request) = command::test_unit_ready() else {
            return false;
        };
        let device = &mut self.device;
        let outcome = self.config.retry.run(&self.config.cancel, |_| {
            device.execute(request.clone()).outcome(ProbeKind::Mandatory)
        });
        match outcome {
            ProbeOutcome::Success(()) => true,
            outcome => {
                warn!(?outcome, "unit did not become ready");
                false
            }
        }
    }

    /// A read with the long timeout; true if the device accepted it.
    fn try_read(&mut self, request: Result<CommandRequest, EncodingError>) -> bool {
        let long_timeout = self.config.long_timeout;
        self.try_command(request.map(|r| r.with_timeout(long_timeout)), ProbeKind::Optional)
            .is_some()
    }

    fn capacity(&mut self) -> Option<Capacity> {
        let ten = self
            .try_command(command::read_capacity10(), ProbeKind::Mandatory)
            .and_then(|data| Capacity::parse10(&data).ok());
        match ten {
            Some(capacity) if !capacity.needs_sixteen() => Some(capacity),
            _ => self
                .try_command(command::read_capacity16(), ProbeKind::Optional)
                .and_then(|data| Capacity::parse16(&data).ok()),
        }
    }

    fn block_medium(&mut self, class: DeviceClass, test: &mut MediaTest) {
        let Some(capacity) = self
            .capacity()
            .filter(|c| (1..=MAX_BLOCK_SIZE).contains(&c.block_size))
        else {
            return;
        };
        test.recognized = true;
        test.block_size = Some(capacity.block_size);
        test.blocks = Some(capacity.blocks());
        let block_size = capacity.block_size;

        if class == DeviceClass::Multimedia {
            test.media = self
                .try_command(
                    command::get_configuration(RequestType::Current, 0, 8),
                    ProbeKind::Optional,
                )
                .and_then(|data| Configuration::parse(&data).ok())
                .map(|c| c.media());
        }

        let reads = [
            (ReadVariant::Read6, command::read6(0, 1, block_size)),
            (ReadVariant::Read10, command::read10(0, 1, block_size, false)),
            (ReadVariant::Read12, command::read12(0, 1, block_size, false)),
            (ReadVariant::Read16, command::read16(0, 1, block_size, false)),
        ];
        for (variant, request) in reads {
            if self.try_read(request) {
                test.supported_read_variants.insert(variant);
            }
        }

        if class == DeviceClass::Multimedia {
            // without a profile the medium may still be a CD
            if matches!(test.media, None | Some(MediaFamily::Cd)) {
                test.toc = self
                    .negotiate(LengthField::remaining(0, 2, 0xFFFF), 4, ProbeKind::Optional, |len| {
                        command::read_toc(false, TocFormat::Toc, 0, alloc16(len))
                    })
                    .ok()
                    .and_then(|n| TocHeader::parse(&n.data).ok());
                for format in ReadCdFormat::ALL {
                    if self.try_read(command::read_cd(0, 1, format)) {
                        test.supported_read_variants.insert(ReadVariant::ReadCd(format));
                    }
                }
            }
            if let Some(media) = test.media {
                self.structure_reads(media, test);
            }
        }

        self.long_block(block_size, test);
        self.vendor_reads(test);
    }

    fn structure_reads(&mut self, media: MediaFamily, test: &mut MediaTest) {
        for &(structure, format) in structure_formats(media) {
            let read = self.negotiate(
                LengthField::remaining(0, 2, 0xFFFF),
                4,
                ProbeKind::Optional,
                |len| command::read_disc_structure(structure, 0, 0, format, 0, alloc16(len)),
            );
            if read.is_ok() {
                test.supported_structure_reads.insert(StructureRead {
                    media: structure,
                    format,
                });
            }
        }
    }

    fn long_block(&mut self, nominal: u32, test: &mut MediaTest) {
        let exhaustive = self.config.exhaustive_long_search;
        let cancel = self.config.cancel.clone();
        let prompt = "The long sector size is still unknown. Try every READ LONG length? \
                      This can take tens of thousands of commands";

        let mut variant = ReadVariant::ReadLong10;
        let mut result = long_block::discover_long_block_size(
            &mut self.device,
            LongCommand::Ten,
            0,
            nominal,
            &cancel,
            || authorize(exhaustive, &mut self.interaction, prompt),
        );
        if result == LongBlockResult::Unsupported {
            variant = ReadVariant::ReadLong16;
            result = long_block::discover_long_block_size(
                &mut self.device,
                LongCommand::Sixteen,
                0,
                nominal,
                &cancel,
                || authorize(exhaustive, &mut self.interaction, prompt),
            );
        }
        debug!(?result, "long block discovery");
        if let LongBlockResult::Found { size, .. } = result {
            test.long_block_size = Some(size);
            test.supported_read_variants.insert(variant);
        }
    }

    fn vendor_consent(&mut self, vendor: Vendor) -> bool {
        if let Some(&consent) = self.vendor_consent.get(&vendor) {
            return consent;
        }
        let prompt = format!(
            "Drive looks like a {vendor:?} drive. Try its vendor commands? \
             They can leave the drive in a state that needs a power cycle"
        );
        let consent = authorize(self.config.vendor_commands, &mut self.interaction, &prompt);
        self.vendor_consent.insert(vendor, consent);
        consent
    }

    fn vendor_reads(&mut self, test: &mut MediaTest) {
        let Some(vendor) = self
            .report
            .general
            .inquiry
            .as_ref()
            .and_then(|i| Vendor::from_inquiry(&i.vendor))
        else {
            return;
        };
        if !self.vendor_consent(vendor) {
            return;
        }
        let media = test.media.unwrap_or(MediaFamily::Other);
        for vendor_command in vendor::commands_for(vendor) {
            if !vendor_command.media.admits(media) {
                continue;
            }
            if self.try_read(vendor_command.build(0, 1)) {
                test.supported_read_variants
                    .insert(ReadVariant::Vendor(vendor_command.name));
            }
        }
    }

    fn sequential_medium(&mut self, test: &mut MediaTest) {
        if self
            .try_command(command::read_position(), ProbeKind::Optional)
            .is_some()
        {
            test.recognized = true;
            test.supported_read_variants.insert(ReadVariant::ReadPosition);
        }

        let fixed = self.report.mode_sense.block_length.filter(|&len| len > 0).or_else(|| {
            self.report
                .sequential
                .as_ref()
                .and_then(|s| s.block_limits)
                .and_then(|limits| limits.fixed())
        });
        let request = match fixed {
            Some(block_size) => command::read_stream(false, true, 1, block_size),
            None => command::read_stream(false, false, TAPE_PROBE_LEN, 0),
        };
        let Ok(request) = request.map(|r| r.with_timeout(self.config.long_timeout)) else {
            return;
        };
        let result = self.device.execute(request);
        if !result.outcome(ProbeKind::Optional).is_success() {
            return;
        }
        test.recognized = true;
        test.supported_read_variants.insert(ReadVariant::SequentialRead);
        test.block_size = match (fixed, &result.sense) {
            (Some(block_size), _) => Some(block_size),
            // a shorter block: the residue is requested minus actual. A
            // negative residue (larger block) reads as a huge u32 and is
            // rejected by the subtraction.
            (None, Some(sense)) if sense.has_length_delta() => sense
                .information
                .and_then(|residue| TAPE_PROBE_LEN.checked_sub(residue))
                .filter(|&size| size > 0),
            // stopped at a filemark or the end of data before reading a block
            (None, Some(sense)) if sense.filemark || sense.end_of_medium => None,
            (None, _) => Some(TAPE_PROBE_LEN),
        };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::super::interaction::scripted::Scripted;
    use super::super::tests::{config, inquiry_data, standard_inquiry};
    use super::super::{Authorization, ProbeConfig};
    use super::*;
    use crate::scsi::ScsiDevice;
    use crate::scsi::mock::{Call, MockTransport, Reply};
    use crate::scsi::sense::fixed_sense;

    fn cd_drive(vendor: &[u8; 8]) -> MockTransport {
        MockTransport::new()
            .on(0x12, standard_inquiry(inquiry_data(0x05, vendor)))
            .on(0x46, |_| Reply::data(vec![0, 0, 0, 4, 0, 0, 0x00, 0x08]))
            .on(0x00, |_| Reply::good())
            .on(0x25, |_| Reply::data(vec![0, 0x04, 0, 0, 0, 0, 0x08, 0]))
            .on(0xBE, |call| {
                // audio disc: only raw reads
                if call.cdb[9] & 0x80 != 0 {
                    Reply::data(vec![0; call.data_len])
                } else {
                    Reply::sense(fixed_sense(0x05, 0x64, 0x00, None, false))
                }
            })
            .on(0xD8, |call| Reply::data(vec![0; call.data_len]))
    }

    fn run(
        mock: MockTransport,
        answers: &[bool],
        config: ProbeConfig,
    ) -> (MediaTest, MockTransport, Vec<String>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let interaction = Scripted::new(answers, &[], events.clone());
        let (mut report, device) = CapabilityProbe::new(ScsiDevice::new(mock), interaction, config)
            .run()
            .unwrap();
        let events = events.lock().unwrap().clone();
        (report.media_tests.remove(0), device.into_transport(), events)
    }

    #[test]
    fn cd_read_variants() {
        let (test, _, _) = run(cd_drive(b"GENERIC "), &[true, false], config());
        assert_eq!(test.label, "medium 1");
        assert_eq!(test.media, Some(MediaFamily::Cd));
        let raw: Vec<_> = test
            .supported_read_variants
            .iter()
            .filter_map(|v| match v {
                ReadVariant::ReadCd(format) => Some(*format),
                _ => None,
            })
            .collect();
        assert_eq!(
            raw,
            vec![
                ReadCdFormat::Raw,
                ReadCdFormat::RawWithQ,
                ReadCdFormat::RawWithSubchannel,
                ReadCdFormat::RawWithC2
            ]
        );
        assert_eq!(test.long_block_size, None);
    }

    #[test]
    fn vendor_commands_need_consent() {
        let ask = ProbeConfig {
            vendor_commands: Authorization::Ask,
            ..config()
        };
        let (test, mock, events) = run(cd_drive(b"PLEXTOR "), &[true, false, false], ask.clone());
        assert!(mock.calls_to(0xD8).is_empty());
        assert!(
            !test
                .supported_read_variants
                .contains(&ReadVariant::Vendor("PLEXTOR READ CD-DA"))
        );
        assert!(events.iter().any(|e| e.contains("Plextor")));

        let (test, mock, _) = run(cd_drive(b"PLEXTOR "), &[true, true, false], ask);
        assert_eq!(mock.calls_to(0xD8).len(), 1);
        assert!(
            test.supported_read_variants
                .contains(&ReadVariant::Vendor("PLEXTOR READ CD-DA"))
        );
    }

    #[test]
    fn vendor_consent_is_asked_once_per_run() {
        let ask = ProbeConfig {
            vendor_commands: Authorization::Ask,
            ..config()
        };
        let events = Arc::new(Mutex::new(Vec::new()));
        // insert, vendor yes, insert, finish
        let interaction = Scripted::new(&[true, true, true, false], &[], events.clone());
        let device = ScsiDevice::new(cd_drive(b"PLEXTOR "));
        let (report, _) = CapabilityProbe::new(device, interaction, ask).run().unwrap();
        assert_eq!(report.media_tests.len(), 2);
        let asked = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.contains("vendor commands"))
            .count();
        assert_eq!(asked, 1);
    }

    #[test]
    fn medium_locked_during_test() {
        let mock = cd_drive(b"GENERIC ")
            .on(0x1E, |_| Reply::good())
            .on(0x43, |call| {
                let toc = [0, 0x0A, 1, 1, 0, 0x14, 1, 0, 0, 0, 0, 0];
                Reply::data(toc[..call.data_len.min(toc.len())].to_vec())
            });
        let (test, mock, _) = run(mock, &[true, false], config());
        let toc = test.toc.unwrap();
        assert_eq!((toc.first_track, toc.last_track), (1, 1));
        assert!(toc.first_track_is_data());

        let locks: Vec<u8> = mock.calls_to(0x1E).iter().map(|c| c.cdb[4]).collect();
        assert_eq!(locks, vec![1, 0]);
        let opcodes: Vec<u8> = mock.calls().iter().map(|c| c.opcode()).collect();
        let lock = opcodes.iter().position(|&op| op == 0x1E).unwrap();
        let unlock = opcodes.iter().rposition(|&op| op == 0x1E).unwrap();
        assert!(opcodes[lock..unlock].contains(&0xBE));
    }

    #[test]
    fn read_long_sixteen_fallback() {
        let mock = cd_drive(b"GENERIC ")
            .on(0x46, |_| Reply::data(vec![0, 0, 0, 4, 0, 0, 0x00, 0x10]))
            .on(0x9E, |call| {
                if call.cdb[1] & 0x1F == 0x11 && call.field(12, 14) == 2380 {
                    Reply::data(vec![0; 2380])
                } else {
                    Reply::illegal_request()
                }
            });
        let (test, mock, _) = run(mock, &[true, false], config());
        assert_eq!(test.long_block_size, Some(2380));
        assert!(test.supported_read_variants.contains(&ReadVariant::ReadLong16));
        assert!(!test.supported_read_variants.contains(&ReadVariant::ReadLong10));
        assert_eq!(mock.calls_to(0x3E).len(), 1);
    }

    #[test]
    fn dvd_structure_reads() {
        let mock = cd_drive(b"GENERIC ")
            .on(0x46, |_| Reply::data(vec![0, 0, 0, 4, 0, 0, 0x00, 0x10]))
            .on(0xAD, |call| {
                if call.cdb[7] == 0x00 {
                    Reply::data(vec![0, 6, 0, 0, 0, 0, 0, 0])
                } else {
                    Reply::illegal_request()
                }
            });
        let (test, _, _) = run(mock, &[true, false], config());
        assert_eq!(
            test.supported_structure_reads.into_iter().collect::<Vec<_>>(),
            vec![StructureRead {
                media: StructureMedia::Dvd,
                format: 0
            }]
        );
        // READ CD is not tried on DVD media
        assert!(
            !test
                .supported_read_variants
                .iter()
                .any(|v| matches!(v, ReadVariant::ReadCd(_)))
        );
    }

    #[test]
    fn failed_capacity_is_recorded_not_fatal() {
        let mock = cd_drive(b"GENERIC ")
            .on(0x25, |_| Reply::sense(fixed_sense(0x03, 0x11, 0x00, None, false)));
        let (test, _, _) = run(mock, &[true, false], config());
        assert!(!test.recognized);
        assert_eq!(test.block_size, None);
    }

    #[test]
    fn implausible_block_size_is_not_read() {
        let mock = cd_drive(b"GENERIC ")
            .on(0x25, |_| Reply::data(vec![0, 0x04, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]))
            .on(0x28, |call| Reply::data(vec![0; call.data_len]));
        let (test, mock, _) = run(mock, &[true, false], config());
        assert!(!test.recognized);
        assert_eq!(test.block_size, None);
        assert!(mock.calls_to(0x28).is_empty());
        assert!(mock.calls_to(0x3E).is_empty());
    }

    fn tape_drive(read: impl FnMut(&Call) -> Reply + Send + 'static) -> MockTransport {
        MockTransport::new()
            .on(0x12, standard_inquiry(inquiry_data(0x01, b"TAPEVEND")))
            .on(0x00, |_| Reply::good())
            .on(0x34, |_| Reply::data(vec![0; 20]))
            .on(0x08, read)
    }

    #[test]
    fn tape_residue_beyond_request_is_unknown() {
        for residue in [0x2_0000, TAPE_PROBE_LEN, 0xFFFF_FE00] {
            let mock = tape_drive(move |_| {
                Reply::sense(fixed_sense(0x00, 0x00, 0x00, Some(residue), true))
            });
            let (test, _, _) = run(mock, &[true, false], config());
            assert!(test.recognized);
            assert_eq!(test.block_size, None, "residue {residue:#x}");
        }
    }

    #[test]
    fn tape_stopped_at_filemark_has_no_block_size() {
        let mut filemark = fixed_sense(0x00, 0x00, 0x01, None, false);
        filemark[2] |= 0x80;
        let mut end_of_medium = fixed_sense(0x00, 0x00, 0x02, None, false);
        end_of_medium[2] |= 0x40;
        for sense in [filemark, end_of_medium] {
            let mock = tape_drive(move |_| Reply::sense(sense.clone()));
            let (test, _, _) = run(mock, &[true, false], config());
            assert!(test.supported_read_variants.contains(&ReadVariant::SequentialRead));
            assert_eq!(test.block_size, None);
        }
    }

    #[test]
    fn tape_block_size_from_ili() {
        let mock = MockTransport::new()
            .on(0x12, standard_inquiry(inquiry_data(0x01, b"TAPEVEND")))
            .on(0x00, |_| Reply::good())
            .on(0x34, |_| Reply::data(vec![0; 20]))
            .on(0x08, |_| {
                Reply::sense(fixed_sense(0x00, 0x00, 0x00, Some(TAPE_PROBE_LEN - 512), true))
            });
        let (test, _, _) = run(mock, &[true, false], config());
        assert!(test.recognized);
        assert_eq!(test.block_size, Some(512));
        assert!(test.supported_read_variants.contains(&ReadVariant::SequentialRead));
        assert!(test.supported_read_variants.contains(&ReadVariant::ReadPosition));
    }
}
