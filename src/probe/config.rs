use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::scsi::RetryPolicy;

/// Whether an expensive or risky step may run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Authorization {
    Never,
    /// Ask the user each time the step would run
    #[default]
    Ask,
    Always,
}

/// Knobs for a [`super::CapabilityProbe`] run.
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    /// Timeout for ordinary commands
    pub timeout: Duration,
    /// Timeout for commands that may spin up the medium or read many sectors
    pub long_timeout: Duration,
    /// Waiting for a unit to become ready
    pub retry: RetryPolicy,
    /// The linear READ LONG search, one command per candidate length
    pub exhaustive_long_search: Authorization,
    /// Vendor specific commands, decided once per vendor
    pub vendor_commands: Authorization,
    /// Set to stop at the next retry or search boundary
    pub cancel: Arc<AtomicBool>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            long_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            exhaustive_long_search: Authorization::Ask,
            vendor_commands: Authorization::Ask,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}
