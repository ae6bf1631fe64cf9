//! Interactions with USB mass storage devices

mod cbw;

// Flash drives and USB optical/tape enclosures use the mass storage class (0x08),
// SCSI transparent command set subclass (0x06), and the bulk-only transport
// protocol (0x50), declared in the interface descriptor.
//
// Bulk-only transport means two bulk endpoints, one OUT and one IN. The host sends a
// 31-byte command block wrapper (CBW), optionally sends or receives data depending on
// the command, and then reads a 13-byte command status wrapper (CSW). A couple of
// class requests (get max LUN and bulk-only reset) go over the control endpoint.
//
// https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/

use std::time::{Duration, Instant};

use color_eyre::Result;
use color_eyre::eyre::{OptionExt, eyre};
use nusb::descriptors::TransferType;
use nusb::transfer::{
    Bulk, Completion, ControlIn, ControlOut, ControlType, Direction as UsbDirection, In, Out,
    Recipient, TransferError,
};
use nusb::{Device, DeviceInfo, Endpoint, Interface, MaybeFuture, list_devices};
use tracing::{debug, warn};

use crate::scsi::command;
use crate::scsi::sense::REQUEST_SENSE_LEN;
use crate::scsi::{Direction, Execution, SenseBuffer, Status, Transport, TransportError};
use cbw::{CSW_SIZE, CommandBlockWrapper, CommandStatus, CommandStatusWrapper, TagGenerator};

/// https://www.usb.org/defined-class-codes
const MASS_STORAGE_USB_CLASS: u8 = 0x08;
const SCSI_TRANSPARENT_SUBCLASS: u8 = 0x06;
const BULK_ONLY_PROTOCOL: u8 = 0x50;

/// Control requests on the default endpoint
const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);
/// How long to wait for cancelled transfers to drain after a timeout
const CANCEL_GRACE: Duration = Duration::from_millis(200);

/// Returns a list of every USB storage device currently connected to the host machine
pub async fn enumerate_usb_storage_devices() -> Result<impl Iterator<Item = DeviceInfo>> {
    let all_usb_devices = list_devices().await?;

    // Each USB device typically exposes one or more *interfaces* as a
    // way to interact with specific functionality of the device.
    let usb_storage_devices = all_usb_devices.filter(|dev| {
        debug!("scanning usb device: {:#?}", dev);
        dev.class() == MASS_STORAGE_USB_CLASS
            || dev
                .interfaces()
                .any(|interface| interface.class() == MASS_STORAGE_USB_CLASS)
    });
    Ok(usb_storage_devices)
}

/// A claimed bulk-only mass storage interface, talking to one logical unit.
pub struct UsbDrive {
    interface: Interface,
    interface_number: u8,
    bulk_out: Endpoint<Bulk, Out>,
    bulk_in: Endpoint<Bulk, In>,
    lun: u8,
    tags: TagGenerator,
}

/// As described by  the USB Mass Storage Class - Bulk Only Transport spec,
/// section 3.2.
///
/// LUN stands for Logical Unit Number, and it's a number
/// used as a unique identifier for a storage device or logical volume.
///
/// <https://en.wikipedia.org/wiki/Logical_unit_number>
fn max_lun_request(interface_number: u8) -> ControlIn {
    ControlIn {
        control_type: ControlType::Class,
        recipient: Recipient::Interface,
        request: 0xfe,
        value: 0,
        index: interface_number as u16,
        length: 1,
    }
}

/// Bulk-Only Mass Storage Reset, section 3.1
fn reset_request(interface_number: u8) -> ControlOut<'static> {
    ControlOut {
        control_type: ControlType::Class,
        recipient: Recipient::Interface,
        request: 0xff,
        value: 0,
        index: interface_number as u16,
        data: &[],
    }
}

/// Opens the provided USB mass storage device.
///
/// This initialization sequence follows the order
/// described here: <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>,
///
/// where the author obtained it with a USB hardware signal analyzer and reverse engineering
/// the implementations on macos, windows, and linux
#[tracing::instrument]
pub async fn open_usb_device(device_info: DeviceInfo) -> Result<UsbDrive> {
    let interface_number = device_info
        .interfaces()
        .find(|i| {
            i.class() == MASS_STORAGE_USB_CLASS
                && i.subclass() == SCSI_TRANSPARENT_SUBCLASS
                && i.protocol() == BULK_ONLY_PROTOCOL
        })
        .map(|i| i.interface_number())
        .ok_or_eyre("device has no bulk-only SCSI interface")?;

    // 1. Claim the USB device to read and write to it
    debug!("opening device");
    let device: Device = device_info.open().await?;
    let (in_address, out_address) = bulk_endpoints(&device, interface_number)?;
    let interface: Interface = device.claim_interface(interface_number).await?;

    // 2. Request the maximum LUN. Single LUN devices may stall this request.
    let max_lun = match interface
        .control_in(max_lun_request(interface_number), CONTROL_TIMEOUT)
        .await
    {
        Ok(data) => data.first().copied().unwrap_or(0),
        Err(err) => {
            debug!("GET MAX LUN failed ({err}), assuming a single LUN");
            0
        }
    };
    if max_lun > 0 {
        warn!(max_lun, "device has several logical units, only LUN 0 is probed");
    }

    let bulk_out = interface.endpoint::<Bulk, Out>(out_address)?;
    let bulk_in = interface.endpoint::<Bulk, In>(in_address)?;
    Ok(UsbDrive {
        interface,
        interface_number,
        bulk_out,
        bulk_in,
        lun: 0,
        tags: TagGenerator::new(),
    })
}

/// Finds the (IN, OUT) bulk endpoint addresses of the interface's default
/// alternate setting.
fn bulk_endpoints(device: &Device, interface_number: u8) -> Result<(u8, u8)> {
    let configuration = device.active_configuration()?;
    let setting = configuration
        .interface_alt_settings()
        .find(|alt| alt.interface_number() == interface_number && alt.alternate_setting() == 0)
        .ok_or_else(|| eyre!("interface {interface_number} has no descriptor"))?;
    let mut bulk_in = None;
    let mut bulk_out = None;
    for endpoint in setting.endpoints() {
        if endpoint.transfer_type() != TransferType::Bulk {
            continue;
        }
        match endpoint.direction() {
            UsbDirection::In => bulk_in = bulk_in.or(Some(endpoint.address())),
            UsbDirection::Out => bulk_out = bulk_out.or(Some(endpoint.address())),
        }
    }
    match (bulk_in, bulk_out) {
        (Some(i), Some(o)) => Ok((i, o)),
        _ => Err(eyre!("interface {interface_number} lacks a bulk IN/OUT endpoint pair")),
    }
}

fn transfer_error(err: TransferError) -> TransportError {
    match err {
        TransferError::Disconnected => TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "device disconnected",
        )),
        other => TransportError::Protocol(other.to_string()),
    }
}

impl UsbDrive {
    /// One bulk-only transaction: CBW, optional data phase, CSW.
    fn transaction(
        &mut self,
        cdb: &[u8],
        direction: Direction,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<CommandStatus, TransportError> {
        let tag = self.tags.tag();
        let transfer_len = match direction {
            Direction::None => 0,
            Direction::In | Direction::Out => data.len(),
        };
        let cbw = CommandBlockWrapper::new(cdb, transfer_len as u32, direction, self.lun, tag)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.write(&cbw.to_bytes(), timeout)?;

        match direction {
            Direction::In if !data.is_empty() => self.read_data(data, timeout)?,
            Direction::Out if !data.is_empty() => {
                if let Err(err) = self.write(data, timeout) {
                    self.recover_out(&err)?;
                }
            }
            _ => {}
        }

        let csw = self.read_status(timeout)?;
        if csw.tag != tag {
            self.reset_recovery();
            return Err(TransportError::Protocol(format!(
                "status tag {:#x} does not match command tag {tag:#x}",
                csw.tag
            )));
        }
        if csw.data_residue != 0 {
            debug!(residue = csw.data_residue, "short data phase");
        }
        Ok(csw.status)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let mut buffer = self.bulk_out.allocate(data.len());
        buffer.extend_from_slice(data);
        self.bulk_out.submit(buffer);
        let completion = match self.bulk_out.wait_next_complete(timeout) {
            Some(completion) => completion,
            None => {
                self.bulk_out.cancel_all();
                let _ = self.bulk_out.wait_next_complete(CANCEL_GRACE);
                return Err(TransportError::Timeout);
            }
        };
        completion.status.map_err(transfer_error)
    }

    /// A stalled Data-Out phase is cleared and followed by the CSW as usual.
    fn recover_out(&mut self, err: &TransportError) -> Result<(), TransportError> {
        debug!("data-out phase failed: {err}");
        self.bulk_out
            .clear_halt()
            .wait()
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    fn read(&mut self, len: usize, timeout: Duration) -> Result<Completion, TransportError> {
        // IN requests must be a whole number of packets
        let packet = self.bulk_in.max_packet_size().max(1);
        let requested = len.next_multiple_of(packet);
        let mut buffer = self.bulk_in.allocate(requested);
        buffer.set_requested_len(requested);
        self.bulk_in.submit(buffer);
        match self.bulk_in.wait_next_complete(timeout) {
            Some(completion) => Ok(completion),
            None => {
                self.bulk_in.cancel_all();
                let _ = self.bulk_in.wait_next_complete(CANCEL_GRACE);
                Err(TransportError::Timeout)
            }
        }
    }

    fn read_data(&mut self, data: &mut [u8], timeout: Duration) -> Result<(), TransportError> {
        let completion = self.read(data.len(), timeout)?;
        match completion.status {
            Ok(()) => {
                let received = &completion.buffer[..];
                let n = received.len().min(data.len());
                data[..n].copy_from_slice(&received[..n]);
                Ok(())
            }
            // The device ended the data phase early; the CSW still follows
            Err(TransferError::Stall) => self.clear_in_halt(),
            Err(err) => Err(transfer_error(err)),
        }
    }

    fn read_status(&mut self, timeout: Duration) -> Result<CommandStatusWrapper, TransportError> {
        let mut completion = self.read(CSW_SIZE, timeout)?;
        // A stall on the status phase is cleared and retried once, section 6.7.2
        if let Err(TransferError::Stall) = completion.status {
            self.clear_in_halt()?;
            completion = self.read(CSW_SIZE, timeout)?;
        }
        completion.status.map_err(transfer_error)?;
        CommandStatusWrapper::from_bytes(&completion.buffer[..]).map_err(|e| {
            self.reset_recovery();
            TransportError::Protocol(e.to_string())
        })
    }

    fn clear_in_halt(&mut self) -> Result<(), TransportError> {
        self.bulk_in
            .clear_halt()
            .wait()
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    /// Reset recovery, section 5.3.4: bulk-only reset, then clear both halts.
    fn reset_recovery(&mut self) {
        warn!("resetting bulk-only interface");
        if let Err(err) = self
            .interface
            .control_out(reset_request(self.interface_number), CONTROL_TIMEOUT)
            .wait()
        {
            warn!("bulk-only reset failed: {err}");
        }
        if let Err(err) = self.clear_in_halt() {
            warn!("clearing bulk IN halt failed: {err}");
        }
        if let Err(err) = self.bulk_out.clear_halt().wait() {
            warn!("clearing bulk OUT halt failed: {err}");
        }
    }

    /// Fetches the sense data of the command that just failed.
    fn request_sense(&mut self, timeout: Duration) -> Result<SenseBuffer, TransportError> {
        let request = command::request_sense(REQUEST_SENSE_LEN as u8)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let mut sense = vec![0; REQUEST_SENSE_LEN];
        match self.transaction(request.cdb.as_slice(), Direction::In, &mut sense, timeout)? {
            CommandStatus::Passed => Ok(SenseBuffer::from_slice(&sense)),
            status => Err(TransportError::Protocol(format!(
                "REQUEST SENSE ended with {status:?}"
            ))),
        }
    }
}

impl Transport for UsbDrive {
    fn execute(
        &mut self,
        cdb: &[u8],
        direction: Direction,
        data: &mut [u8],
        timeout: Duration,
    ) -> Execution {
        let start = Instant::now();
        let (status, sense) = match self.transaction(cdb, direction, data, timeout) {
            Ok(CommandStatus::Passed) => (Status::Good, SenseBuffer::empty()),
            Ok(CommandStatus::Failed) => match self.request_sense(timeout) {
                Ok(sense) => (Status::CheckCondition, sense),
                Err(err) => (Status::Transport(err), SenseBuffer::empty()),
            },
            Ok(CommandStatus::PhaseError) => {
                self.reset_recovery();
                (
                    Status::Transport(TransportError::Protocol("phase error".to_string())),
                    SenseBuffer::empty(),
                )
            }
            Err(err) => (Status::Transport(err), SenseBuffer::empty()),
        };
        Execution {
            status,
            sense,
            duration: start.elapsed(),
        }
    }
}
