//! A scripted transport for tests.
//!
//! Handlers are keyed by opcode and see the full CDB, so a single handler can
//! answer differently depending on the fields a command was built with.
//! Opcodes without a handler fail like a device that does not implement
//! them: ILLEGAL REQUEST, invalid command operation code.

use std::collections::HashMap;
use std::time::Duration;

use super::sense::{SenseBuffer, fixed_sense};
use super::{Direction, Execution, Status, Transport, TransportError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub cdb: Vec<u8>,
    pub direction: Direction,
    pub data_len: usize,
    pub timeout: Duration,
}

impl Call {
    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }

    /// Big-endian value of `cdb[start..end]`.
    pub fn field(&self, start: usize, end: usize) -> u64 {
        self.cdb[start..end]
            .iter()
            .fold(0, |acc, b| (acc << 8) | *b as u64)
    }
}

pub enum ReplyStatus {
    Good,
    CheckCondition,
    TransportFailure,
}

pub struct Reply {
    pub status: ReplyStatus,
    pub data: Vec<u8>,
    pub sense: Vec<u8>,
}

impl Reply {
    pub fn good() -> Self {
        Self::data(Vec::new())
    }

    pub fn data(data: Vec<u8>) -> Self {
        Self {
            status: ReplyStatus::Good,
            data,
            sense: Vec::new(),
        }
    }

    pub fn sense(sense: Vec<u8>) -> Self {
        Self {
            status: ReplyStatus::CheckCondition,
            data: Vec::new(),
            sense,
        }
    }

    pub fn illegal_request() -> Self {
        Self::sense(fixed_sense(0x05, 0x24, 0x00, None, false))
    }

    pub fn invalid_opcode() -> Self {
        Self::sense(fixed_sense(0x05, 0x20, 0x00, None, false))
    }

    pub fn transport_failure() -> Self {
        Self {
            status: ReplyStatus::TransportFailure,
            data: Vec::new(),
            sense: Vec::new(),
        }
    }
}

type Handler = Box<dyn FnMut(&Call) -> Reply + Send>;

#[derive(Default)]
pub struct MockTransport {
    handlers: HashMap<u8, Handler>,
    calls: Vec<Call>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, opcode: u8, handler: impl FnMut(&Call) -> Reply + Send + 'static) -> Self {
        self.handlers.insert(opcode, Box::new(handler));
        self
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn calls_to(&self, opcode: u8) -> Vec<&Call> {
        self.calls.iter().filter(|c| c.opcode() == opcode).collect()
    }
}

impl Transport for MockTransport {
    fn execute(
        &mut self,
        cdb: &[u8],
        direction: Direction,
        data: &mut [u8],
        timeout: Duration,
    ) -> Execution {
        let call = Call {
            cdb: cdb.to_vec(),
            direction,
            data_len: data.len(),
            timeout,
        };
        let reply = match self.handlers.get_mut(&cdb[0]) {
            Some(handler) => handler(&call),
            None => Reply::invalid_opcode(),
        };
        self.calls.push(call);

        let status = match reply.status {
            ReplyStatus::Good => {
                let len = reply.data.len().min(data.len());
                data[..len].copy_from_slice(&reply.data[..len]);
                Status::Good
            }
            ReplyStatus::CheckCondition => Status::CheckCondition,
            ReplyStatus::TransportFailure => Status::Transport(TransportError::Timeout),
        };
        Execution {
            status,
            sense: SenseBuffer::from_slice(&reply.sense),
            duration: Duration::from_millis(1),
        }
    }
}
