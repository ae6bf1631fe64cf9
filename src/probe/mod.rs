//! Discovering what a device actually implements by trying it.
//!
//! [`CapabilityProbe`] walks a fixed sequence of states, issuing commands and
//! recording which ones the device accepts. A command the device rejects is
//! recorded as unsupported and the run moves on; only a transport failure
//! on the initial INQUIRY ends the run early.

mod class;
pub mod config;
pub mod interaction;
mod media;
pub mod report;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::scsi::command::{self, ALL_PAGES, CommandRequest, INQUIRY_MIN_LEN, PageControl};
use crate::scsi::negotiate::{self, LengthField, Negotiated};
use crate::scsi::response::{self, Inquiry, ModeHeader};
use crate::scsi::vendor::Vendor;
use crate::scsi::{EncodingError, ProbeKind, ScsiDevice, ScsiError, Transport};

pub use config::{Authorization, ProbeConfig};
pub use interaction::{ConsoleInteraction, Unattended, UserInteraction};
pub use report::{CapabilityReport, DeviceClass, MediaTest, ReadVariant, StructureRead};

/// Where a [`CapabilityProbe`] is in its run. States are only ever visited
/// in this order, and each at most once.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Init,
    GeneralInquiry,
    ModeSense,
    ClassSpecificProbe(DeviceClass),
    PerMediaLoop(DeviceClass),
    Done,
}

impl State {
    fn rank(self) -> u8 {
        match self {
            State::Init => 0,
            State::GeneralInquiry => 1,
            State::ModeSense => 2,
            State::ClassSpecificProbe(_) => 3,
            State::PerMediaLoop(_) => 4,
            State::Done => 5,
        }
    }
}

/// Allocation fields are 8 or 16 bits wide; lengths are already clamped to
/// the field's maximum by the negotiator.
fn alloc16(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

fn alloc8(len: usize) -> u8 {
    u8::try_from(len).unwrap_or(u8::MAX)
}

pub struct CapabilityProbe<T, U> {
    device: ScsiDevice<T>,
    interaction: U,
    config: ProbeConfig,
    report: CapabilityReport,
    state: State,
    vendor_consent: BTreeMap<Vendor, bool>,
}

impl<T: Transport, U: UserInteraction> CapabilityProbe<T, U> {
    pub fn new(mut device: ScsiDevice<T>, interaction: U, config: ProbeConfig) -> Self {
        device.set_timeout(config.timeout);
        Self {
            device,
            interaction,
            config,
            report: CapabilityReport::default(),
            state: State::Init,
            vendor_consent: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Runs every remaining state and hands back the report and the device.
    #[tracing::instrument(skip_all)]
    pub fn run(mut self) -> Result<(CapabilityReport, ScsiDevice<T>), ScsiError> {
        while self.state != State::Done {
            self.step()?;
        }
        Ok((self.report, self.device))
    }

    /// Does the work of the current state and moves to the next one.
    pub fn step(&mut self) -> Result<State, ScsiError> {
        let next = if self.cancelled() {
            State::Done
        } else {
            match self.state {
                State::Init => State::GeneralInquiry,
                State::GeneralInquiry => {
                    self.general_inquiry()?;
                    State::ModeSense
                }
                State::ModeSense => {
                    self.mode_sense();
                    match self.report.general.class {
                        Some(class) => State::ClassSpecificProbe(class),
                        None => State::Done,
                    }
                }
                State::ClassSpecificProbe(class) => {
                    self.class_specific(class);
                    State::PerMediaLoop(class)
                }
                State::PerMediaLoop(class) => {
                    self.media_loop(class);
                    State::Done
                }
                State::Done => State::Done,
            }
        };
        if next.rank() > self.state.rank() {
            info!(state = ?next, "probe state");
            self.state = next;
        }
        Ok(self.state)
    }

    fn cancelled(&self) -> bool {
        self.config.cancel.load(Ordering::Relaxed)
    }

    /// Issues a single command, returning its data if it succeeded.
    fn try_command(
        &mut self,
        request: Result<CommandRequest, EncodingError>,
        kind: ProbeKind,
    ) -> Option<Vec<u8>> {
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                debug!("command not issued: {err}");
                return None;
            }
        };
        match self.device.execute(request).into_data(kind) {
            Ok(data) => Some(data),
            Err(err) => {
                debug!("{err}");
                None
            }
        }
    }

    fn negotiate(
        &mut self,
        field: LengthField,
        probe_len: usize,
        kind: ProbeKind,
        build: impl Fn(usize) -> Result<CommandRequest, EncodingError>,
    ) -> Result<Negotiated, ScsiError> {
        negotiate::negotiate(&mut self.device, field, probe_len, kind, false, build)
    }

    fn general_inquiry(&mut self) -> Result<(), ScsiError> {
        let standard = negotiate::negotiate(
            &mut self.device,
            LengthField::remaining(4, 1, 0xFF),
            INQUIRY_MIN_LEN as usize,
            ProbeKind::Mandatory,
            true,
            |len| command::inquiry(None, alloc16(len)),
        );
        let inquiry = match standard {
            Ok(negotiated) => match Inquiry::parse(&negotiated.data) {
                Ok(inquiry) => Some(inquiry),
                Err(err) => {
                    warn!("{err}");
                    None
                }
            },
            Err(err @ ScsiError::Transport { .. }) => return Err(err),
            Err(err) => {
                warn!("{err}");
                None
            }
        };

        let general = &mut self.report.general;
        if let Some(inquiry) = &inquiry {
            info!(
                vendor = %inquiry.vendor,
                product = %inquiry.product,
                revision = %inquiry.revision,
                kind = ?inquiry.peripheral_type,
                "inquiry"
            );
            if inquiry.peripheral_qualifier == 0 {
                general.class = DeviceClass::from_peripheral_type(inquiry.peripheral_type);
            }
        }
        general.inquiry = inquiry;

        let pages = self
            .negotiate(LengthField::remaining(2, 2, 0xFFFF), 4, ProbeKind::Optional, |len| {
                command::inquiry(Some(0x00), alloc16(len))
            })
            .ok()
            .and_then(|n| response::supported_vpd_pages(&n.data).ok())
            .unwrap_or_default();
        if pages.contains(&0x80) {
            self.report.general.serial_number = self
                .negotiate(LengthField::remaining(2, 2, 0xFFFF), 4, ProbeKind::Optional, |len| {
                    command::inquiry(Some(0x80), alloc16(len))
                })
                .ok()
                .and_then(|n| response::unit_serial_number(&n.data).ok());
        }
        if pages.contains(&0x83) {
            self.report.general.device_identification = self
                .negotiate(LengthField::remaining(2, 2, 0xFFFF), 4, ProbeKind::Optional, |len| {
                    command::inquiry(Some(0x83), alloc16(len))
                })
                .ok()
                .map(|n| n.data);
        }
        self.report.general.vpd_pages = pages;
        Ok(())
    }

    /// MODE SENSE(10), then (6), then the page 0 form of (6) that predates
    /// both the all-pages request and length negotiation.
    fn mode_sense(&mut self) {
        let ten = self.negotiate(
            LengthField::remaining(0, 2, 0xFFFF),
            8,
            ProbeKind::Optional,
            |len| {
                let len = alloc16(len);
                command::mode_sense10(false, false, PageControl::Current, ALL_PAGES, 0, len)
            },
        );
        if let Ok(negotiated) = ten {
            if let Ok(header) = ModeHeader::parse10(&negotiated.data) {
                self.report.mode_sense.ten = true;
                self.record_mode(&negotiated.data, header);
                return;
            }
        }

        let six = self.negotiate(LengthField::remaining(0, 1, 0xFF), 4, ProbeKind::Optional, |len| {
            command::mode_sense6(false, PageControl::Current, ALL_PAGES, 0, alloc8(len))
        });
        if let Ok(negotiated) = six {
            if let Ok(header) = ModeHeader::parse6(&negotiated.data) {
                self.report.mode_sense.six = true;
                self.record_mode(&negotiated.data, header);
                return;
            }
        }

        let legacy = self.try_command(
            command::mode_sense6(false, PageControl::Current, 0x00, 0, 0xFF),
            ProbeKind::Optional,
        );
        if let Some(data) = legacy {
            if let Ok(header) = ModeHeader::parse6(&data) {
                self.report.mode_sense.legacy = true;
                self.record_mode(&data, header);
                return;
            }
        }
        debug!("device accepts no form of MODE SENSE");
    }

    fn record_mode(&mut self, data: &[u8], header: ModeHeader) {
        let mode = &mut self.report.mode_sense;
        mode.medium_type = Some(header.medium_type);
        mode.device_specific = Some(header.device_specific);
        mode.block_length = header.block_length;
        mode.density_code = header.density_code;
        mode.pages = response::mode_pages(data, &header);
    }
}

fn authorize(
    authorization: Authorization,
    interaction: &mut impl UserInteraction,
    prompt: &str,
) -> bool {
    match authorization {
        Authorization::Never => false,
        Authorization::Always => true,
        Authorization::Ask => interaction.confirm(prompt),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicBool};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::interaction::scripted::Scripted;
    use super::*;
    use crate::scsi::RetryPolicy;
    use crate::scsi::mock::{Call, MockTransport, Reply};
    use crate::scsi::response::{MediaFamily, PeripheralType};
    use crate::scsi::sense::fixed_sense;

    pub(super) fn inquiry_data(kind: u8, vendor: &[u8; 8]) -> Vec<u8> {
        let mut buf = vec![kind, 0x80, 0x05, 0x02, 31, 0, 0, 0];
        buf.extend_from_slice(vendor);
        buf.extend_from_slice(b"TEST DRIVE      ");
        buf.extend_from_slice(b"1.00");
        buf
    }

    pub(super) fn standard_inquiry(data: Vec<u8>) -> impl FnMut(&Call) -> Reply + Send + 'static {
        move |call| {
            if call.cdb[1] & 0x01 == 0 {
                Reply::data(data.clone())
            } else {
                Reply::illegal_request()
            }
        }
    }

    pub(super) fn config() -> ProbeConfig {
        ProbeConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                delay: Duration::ZERO,
            },
            exhaustive_long_search: Authorization::Never,
            vendor_commands: Authorization::Never,
            ..ProbeConfig::default()
        }
    }

    /// A DVD drive that accepts MODE SENSE(10) and READ(10), reports 2048
    /// byte blocks and accepts READ LONG of exactly 2380 bytes.
    fn dvd_drive() -> MockTransport {
        MockTransport::new()
            .on(0x12, standard_inquiry(inquiry_data(0x05, b"GENERIC ")))
            .on(0x5A, |_| Reply::data(vec![0, 6, 0, 0, 0, 0, 0, 0]))
            .on(0x46, |_| Reply::data(vec![0, 0, 0, 4, 0, 0, 0x00, 0x10]))
            .on(0x00, |_| Reply::good())
            .on(0x25, |_| Reply::data(vec![0, 0, 0x10, 0, 0, 0, 0x08, 0]))
            .on(0x28, |_| Reply::data(vec![0; 2048]))
            .on(0x3E, |call| {
                if call.field(7, 9) == 2380 {
                    Reply::data(vec![0; 2380])
                } else {
                    Reply::illegal_request()
                }
            })
    }

    fn one_medium(events: Arc<Mutex<Vec<String>>>) -> Scripted {
        Scripted::new(&[true, false], &["DVD-ROM"], events)
    }

    fn probe_dvd() -> CapabilityReport {
        let events = Arc::new(Mutex::new(Vec::new()));
        let probe =
            CapabilityProbe::new(ScsiDevice::new(dvd_drive()), one_medium(events), config());
        probe.run().unwrap().0
    }

    #[test]
    fn multimedia_device_end_to_end() {
        let report = probe_dvd();
        assert_eq!(report.general.class, Some(DeviceClass::Multimedia));
        assert_eq!(
            report.general.inquiry.as_ref().map(|i| i.peripheral_type),
            Some(PeripheralType::Multimedia)
        );
        assert!(report.mode_sense.ten);
        assert!(!report.mode_sense.six);
        let multimedia = report.multimedia.as_ref().unwrap();
        assert!(multimedia.get_configuration);
        assert_eq!(multimedia.current_profile, Some(0x10));

        assert_eq!(report.media_tests.len(), 1);
        let test = &report.media_tests[0];
        assert_eq!(test.label, "DVD-ROM");
        assert!(test.recognized);
        assert_eq!(test.media, Some(MediaFamily::Dvd));
        assert_eq!(test.block_size, Some(2048));
        assert_eq!(test.blocks, Some(0x1001));
        assert_eq!(test.long_block_size, Some(2380));
        assert!(test.supported_read_variants.contains(&ReadVariant::Read10));
        assert!(test.supported_read_variants.contains(&ReadVariant::ReadLong10));
        assert!(!test.supported_read_variants.contains(&ReadVariant::Read12));
        assert!(test.supported_structure_reads.is_empty());
    }

    #[test]
    fn identical_devices_give_identical_reports() {
        assert_eq!(probe_dvd(), probe_dvd());
    }

    #[test]
    fn states_advance_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut probe =
            CapabilityProbe::new(ScsiDevice::new(dvd_drive()), one_medium(events), config());
        let mut states = vec![probe.state()];
        while probe.state() != State::Done {
            states.push(probe.step().unwrap());
        }
        assert_eq!(
            states,
            vec![
                State::Init,
                State::GeneralInquiry,
                State::ModeSense,
                State::ClassSpecificProbe(DeviceClass::Multimedia),
                State::PerMediaLoop(DeviceClass::Multimedia),
                State::Done,
            ]
        );
        assert_eq!(probe.step().unwrap(), State::Done);
    }

    #[test]
    fn transport_failure_on_inquiry_aborts() {
        let mock = MockTransport::new().on(0x12, |_| Reply::transport_failure());
        let probe = CapabilityProbe::new(ScsiDevice::new(mock), Unattended, config());
        let err = probe.run().err().expect("inquiry transport failure");
        assert!(matches!(err, ScsiError::Transport { command: "INQUIRY", .. }));
    }

    #[test]
    fn rejected_inquiry_does_not_abort() {
        let mock = MockTransport::new().on(0x12, |_| Reply::illegal_request());
        let probe = CapabilityProbe::new(ScsiDevice::new(mock), Unattended, config());
        let (report, _) = probe.run().unwrap();
        assert_eq!(report.general.inquiry, None);
        assert!(report.media_tests.is_empty());
    }

    #[test]
    fn mode_sense_falls_back_to_six_then_legacy() {
        let mock = MockTransport::new()
            .on(0x12, standard_inquiry(inquiry_data(0x00, b"GENERIC ")))
            .on(0x1A, |_| Reply::data(vec![3, 0, 0, 0]));
        let (report, device) = CapabilityProbe::new(ScsiDevice::new(mock), Unattended, config())
            .run()
            .unwrap();
        assert!(!report.mode_sense.ten && report.mode_sense.six && !report.mode_sense.legacy);
        assert_eq!(device.transport().calls_to(0x5A).len(), 1);

        // only page 0 with a full allocation length is understood
        let mock = MockTransport::new()
            .on(0x12, standard_inquiry(inquiry_data(0x00, b"GENERIC ")))
            .on(0x1A, |call| {
                if call.cdb[2] & 0x3F == 0 && call.cdb[4] == 0xFF {
                    Reply::data(vec![3, 0, 0, 0])
                } else {
                    Reply::illegal_request()
                }
            });
        let (report, _) = CapabilityProbe::new(ScsiDevice::new(mock), Unattended, config())
            .run()
            .unwrap();
        assert!(report.mode_sense.legacy && !report.mode_sense.six);
    }

    #[test]
    fn prompts_never_interleave_with_ready_retries() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::new(AtomicU32::new(0));
        let log = events.clone();
        let counter = attempts.clone();
        let mock = dvd_drive().on(0x00, move |_| {
            log.lock().unwrap().push("TEST UNIT READY".to_string());
            if counter.fetch_add(1, Ordering::Relaxed) < 2 {
                Reply::sense(fixed_sense(0x02, 0x04, 0x01, None, false))
            } else {
                Reply::good()
            }
        });
        let probe =
            CapabilityProbe::new(ScsiDevice::new(mock), one_medium(events.clone()), config());
        let (report, _) = probe.run().unwrap();
        assert!(report.media_tests[0].recognized);

        let events = events.lock().unwrap();
        let ready: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| *e == "TEST UNIT READY")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(ready.len(), 3);
        assert_eq!(ready[2] - ready[0], 2);
        assert!(events[ready[0] - 1].starts_with("read:"));
    }

    #[test]
    fn medium_that_never_becomes_ready() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mock =
            dvd_drive().on(0x00, |_| Reply::sense(fixed_sense(0x02, 0x3A, 0x00, None, false)));
        let probe =
            CapabilityProbe::new(ScsiDevice::new(mock), one_medium(events.clone()), config());
        let (report, device) = probe.run().unwrap();
        assert!(!report.media_tests[0].recognized);
        assert_eq!(device.transport().calls_to(0x00).len(), 3);
        assert_eq!(device.transport().calls_to(0x25).len(), 0);
        assert!(
            events
                .lock()
                .unwrap()
                .iter()
                .any(|e| e.starts_with("notify:"))
        );
    }

    #[test]
    fn cancellation_ends_the_run() {
        let cancel = Arc::new(AtomicBool::new(true));
        let config = ProbeConfig {
            cancel,
            ..config()
        };
        let (report, device) =
            CapabilityProbe::new(ScsiDevice::new(dvd_drive()), Unattended, config)
                .run()
                .unwrap();
        assert_eq!(report, CapabilityReport::default());
        assert!(device.transport().calls().is_empty());
    }
}
