//! Issuing commands to a device over a [`Transport`].

use std::time::Duration;

use tracing::debug;

use super::command::{CommandRequest, DEFAULT_TIMEOUT};
use super::error::ScsiError;
use super::retry::{ProbeKind, ProbeOutcome, classify};
use super::sense::{DecodedSense, SenseBuffer};
use super::{Status, Transport};

/// Notified once for every command handed to the transport.
pub trait CommandObserver {
    fn on_command_executed(&mut self, name: &str, duration: Duration, status: &Status);
}

/// Default observer: one `debug` event per command.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl CommandObserver for TracingObserver {
    fn on_command_executed(&mut self, name: &str, duration: Duration, status: &Status) {
        match status {
            Status::Good => debug!(command = name, ?duration, "good"),
            Status::CheckCondition => debug!(command = name, ?duration, "check condition"),
            Status::Transport(err) => debug!(command = name, ?duration, "transport failure: {err}"),
        }
    }
}

/// The owned result of a single command.
#[derive(Debug)]
pub struct CommandResult {
    pub name: &'static str,
    /// The request's data buffer after the transfer
    pub data: Vec<u8>,
    pub status: Status,
    /// Decoded sense; only present for CHECK CONDITION
    pub sense: Option<DecodedSense>,
    pub raw_sense: SenseBuffer,
    pub duration: Duration,
}

impl CommandResult {
    pub fn outcome(&self, kind: ProbeKind) -> ProbeOutcome<()> {
        classify(&self.status, self.sense.as_ref(), kind)
    }

    /// Returns the data if `kind` classifies the result as a success,
    /// otherwise the matching error.
    pub fn into_data(self, kind: ProbeKind) -> Result<Vec<u8>, ScsiError> {
        if self.outcome(kind).is_success() {
            return Ok(self.data);
        }
        match self.status {
            Status::Transport(source) => Err(ScsiError::Transport {
                command: self.name,
                source,
            }),
            _ => Err(ScsiError::DeviceQualified {
                command: self.name,
                sense: self.sense,
            }),
        }
    }
}

/// An abstraction over a device reachable through some [`Transport`].
///
/// The device is exclusively owned: every command goes through `&mut self`,
/// and nothing is issued concurrently.
pub struct ScsiDevice<T> {
    transport: T,
    observer: Box<dyn CommandObserver + Send>,
    timeout: Duration,
}

impl<T: Transport> ScsiDevice<T> {
    pub fn new(transport: T) -> Self {
        Self::with_observer(transport, Box::new(TracingObserver))
    }

    pub fn with_observer(transport: T, observer: Box<dyn CommandObserver + Send>) -> Self {
        Self {
            transport,
            observer,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Replaces the default command timeout. Requests built with an explicit
    /// timeout keep it.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Issues a command to the device and waits for it to complete.
    ///
    /// Sense data is decoded only when the device reported CHECK CONDITION.
    pub fn execute(&mut self, request: CommandRequest) -> CommandResult {
        let CommandRequest {
            name,
            cdb,
            direction,
            mut data,
            timeout,
        } = request;
        let timeout = timeout.unwrap_or(self.timeout);
        let execution = self
            .transport
            .execute(cdb.as_slice(), direction, &mut data, timeout);
        self.observer
            .on_command_executed(name, execution.duration, &execution.status);

        let sense = match execution.status {
            Status::CheckCondition => execution.sense.decode(),
            _ => None,
        };
        CommandResult {
            name,
            data,
            status: execution.status,
            sense,
            raw_sense: execution.sense,
            duration: execution.duration,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }
}
