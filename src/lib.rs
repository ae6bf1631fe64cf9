//! Capability discovery for SCSI devices.
//!
//! [`scsi`] encodes commands, decodes sense data and classifies outcomes,
//! [`probe`] drives a device through the discovery state machine, and
//! [`usb`] provides a bulk-only USB transport to run it against.

pub mod probe;
pub mod scsi;
pub mod usb;
