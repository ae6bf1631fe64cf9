//! Classification of command results, and the bounded retry loop used for
//! transient "not ready" conditions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

use super::Status;
use super::sense::{DecodedSense, SenseKey, asc};

/// What the caller intends to do with a command, which changes how a
/// failure is read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProbeKind {
    /// The run needs this answer; an unexplained failure is fatal to the probe
    Mandatory,
    /// Trying whether the device implements something
    Optional,
    /// READ LONG trials, where "invalid field" carries the right length
    ReadLong,
}

/// Transient conditions worth waiting out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetryReason {
    /// ASC 3Ah
    MediumNotPresent,
    /// ASC 04h ASCQ 01h
    BecomingReady,
    /// ASC 28h
    MediumMayHaveChanged,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FatalCode {
    /// The transport failed to deliver the command
    Transport,
    /// CHECK CONDITION with sense data that could not be decoded
    MissingSense,
    Sense {
        key: SenseKey,
        asc: u8,
        ascq: u8,
    },
    RetriesExhausted {
        reason: RetryReason,
        attempts: u32,
    },
    Cancelled,
}

/// The classification of a single command result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome<T> {
    Success(T),
    Unsupported,
    Retryable(RetryReason),
    /// The command is implemented but a parameter was wrong; the sense
    /// describes how
    DeriveParameter(DecodedSense),
    Fatal(FatalCode),
}

impl<T> ProbeOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ProbeOutcome<U> {
        match self {
            ProbeOutcome::Success(value) => ProbeOutcome::Success(f(value)),
            ProbeOutcome::Unsupported => ProbeOutcome::Unsupported,
            ProbeOutcome::Retryable(reason) => ProbeOutcome::Retryable(reason),
            ProbeOutcome::DeriveParameter(sense) => ProbeOutcome::DeriveParameter(sense),
            ProbeOutcome::Fatal(code) => ProbeOutcome::Fatal(code),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            ProbeOutcome::Success(value) => Some(value),
            _ => None,
        }
    }
}

/// Maps a transport status and its (already decoded) sense to an outcome.
///
/// `sense` must only be `Some` when `status` is CHECK CONDITION.
pub fn classify(
    status: &Status,
    sense: Option<&DecodedSense>,
    kind: ProbeKind,
) -> ProbeOutcome<()> {
    let sense = match status {
        Status::Transport(_) => return ProbeOutcome::Fatal(FatalCode::Transport),
        Status::Good => return ProbeOutcome::Success(()),
        Status::CheckCondition => sense,
    };
    let Some(sense) = sense else {
        return match kind {
            ProbeKind::Mandatory => ProbeOutcome::Fatal(FatalCode::MissingSense),
            _ => ProbeOutcome::Unsupported,
        };
    };

    if kind == ProbeKind::ReadLong {
        let invalid_field = sense.asc_ascq() == (asc::INVALID_FIELD_IN_CDB, 0x00);
        let length_hint = sense.has_length_delta()
            && matches!(sense.key, SenseKey::IllegalRequest | SenseKey::NoSense);
        if invalid_field || length_hint {
            return ProbeOutcome::DeriveParameter(sense.clone());
        }
    }

    match sense.asc_ascq() {
        (asc::MEDIUM_NOT_PRESENT, _) => {
            return ProbeOutcome::Retryable(RetryReason::MediumNotPresent);
        }
        (asc::NOT_READY, asc::BECOMING_READY) => {
            return ProbeOutcome::Retryable(RetryReason::BecomingReady);
        }
        (asc::MEDIUM_MAY_HAVE_CHANGED, _) => {
            return ProbeOutcome::Retryable(RetryReason::MediumMayHaveChanged);
        }
        _ => {}
    }

    match sense.key {
        SenseKey::NoSense if sense.asc == asc::NO_ADDITIONAL_INFORMATION => {
            return ProbeOutcome::Success(());
        }
        SenseKey::RecoveredError => return ProbeOutcome::Success(()),
        _ => {}
    }

    match kind {
        ProbeKind::Mandatory => ProbeOutcome::Fatal(FatalCode::Sense {
            key: sense.key,
            asc: sense.asc,
            ascq: sense.ascq,
        }),
        ProbeKind::Optional | ProbeKind::ReadLong => ProbeOutcome::Unsupported,
    }
}

/// Bounded retries with a fixed delay between attempts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Calls `attempt` until it returns something other than
    /// [`ProbeOutcome::Retryable`], at most `max_attempts` times.
    ///
    /// `cancel` is checked before every attempt, never while one is running.
    /// Running out of attempts yields [`FatalCode::RetriesExhausted`].
    pub fn run<T>(
        &self,
        cancel: &AtomicBool,
        mut attempt: impl FnMut(u32) -> ProbeOutcome<T>,
    ) -> ProbeOutcome<T> {
        let attempts = self.max_attempts.max(1);
        let mut last = RetryReason::BecomingReady;
        for n in 1..=attempts {
            if cancel.load(Ordering::Relaxed) {
                return ProbeOutcome::Fatal(FatalCode::Cancelled);
            }
            match attempt(n) {
                ProbeOutcome::Retryable(reason) => {
                    debug!(attempt = n, ?reason, "device not ready, retrying");
                    last = reason;
                    if n < attempts && !self.delay.is_zero() {
                        std::thread::sleep(self.delay);
                    }
                }
                outcome => return outcome,
            }
        }
        ProbeOutcome::Fatal(FatalCode::RetriesExhausted {
            reason: last,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::sense::{SenseFormat, decode, fixed_sense};
    use crate::scsi::TransportError;

    fn sense(key: u8, asc: u8, ascq: u8) -> DecodedSense {
        decode(&fixed_sense(key, asc, ascq, None, false), SenseFormat::Fixed).unwrap()
    }

    fn check(sense: &DecodedSense, kind: ProbeKind) -> ProbeOutcome<()> {
        classify(&Status::CheckCondition, Some(sense), kind)
    }

    #[test]
    fn transport_errors_are_fatal() {
        let status = Status::Transport(TransportError::Timeout);
        assert_eq!(
            classify(&status, None, ProbeKind::Optional),
            ProbeOutcome::Fatal(FatalCode::Transport)
        );
    }

    #[test]
    fn good_status_ignores_sense() {
        let stale = sense(0x05, 0x24, 0x00);
        assert!(classify(&Status::Good, Some(&stale), ProbeKind::Mandatory).is_success());
    }

    #[test]
    fn not_ready_conditions_are_retryable() {
        assert_eq!(
            check(&sense(0x02, 0x3A, 0x00), ProbeKind::Mandatory),
            ProbeOutcome::Retryable(RetryReason::MediumNotPresent)
        );
        assert_eq!(
            check(&sense(0x02, 0x04, 0x01), ProbeKind::Optional),
            ProbeOutcome::Retryable(RetryReason::BecomingReady)
        );
        assert_eq!(
            check(&sense(0x06, 0x28, 0x00), ProbeKind::Optional),
            ProbeOutcome::Retryable(RetryReason::MediumMayHaveChanged)
        );
        // not ready, cause not reportable, is not transient
        assert_eq!(check(&sense(0x02, 0x04, 0x00), ProbeKind::Optional), ProbeOutcome::Unsupported);
    }

    #[test]
    fn no_sense_completes() {
        assert!(check(&sense(0x00, 0x00, 0x00), ProbeKind::Mandatory).is_success());
        assert!(check(&sense(0x01, 0x17, 0x01), ProbeKind::Mandatory).is_success());
    }

    #[test]
    fn invalid_field_during_read_long_derives() {
        let s = sense(0x05, 0x24, 0x00);
        assert!(matches!(check(&s, ProbeKind::ReadLong), ProbeOutcome::DeriveParameter(_)));
        assert_eq!(check(&s, ProbeKind::Optional), ProbeOutcome::Unsupported);
        assert_eq!(
            check(&s, ProbeKind::Mandatory),
            ProbeOutcome::Fatal(FatalCode::Sense {
                key: SenseKey::IllegalRequest,
                asc: 0x24,
                ascq: 0
            })
        );
    }

    #[test]
    fn ili_with_no_sense_derives_during_read_long() {
        let raw = fixed_sense(0x00, 0x00, 0x00, Some(3), true);
        let s = decode(&raw, SenseFormat::Fixed).unwrap();
        assert!(matches!(check(&s, ProbeKind::ReadLong), ProbeOutcome::DeriveParameter(_)));
        assert!(check(&s, ProbeKind::Optional).is_success());
    }

    #[test]
    fn undecodable_sense() {
        assert_eq!(
            classify(&Status::CheckCondition, None, ProbeKind::Mandatory),
            ProbeOutcome::Fatal(FatalCode::MissingSense)
        );
        assert_eq!(
            classify(&Status::CheckCondition, None, ProbeKind::Optional),
            ProbeOutcome::Unsupported
        );
    }

    #[test]
    fn medium_not_present_retries_to_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 5,
            delay: Duration::ZERO,
        };
        let s = sense(0x02, 0x3A, 0x00);
        let mut calls = 0;
        let outcome = policy.run(&AtomicBool::new(false), |_| {
            calls += 1;
            check(&s, ProbeKind::Mandatory)
        });
        assert_eq!(calls, 5);
        assert_eq!(
            outcome,
            ProbeOutcome::Fatal(FatalCode::RetriesExhausted {
                reason: RetryReason::MediumNotPresent,
                attempts: 5
            })
        );
    }

    #[test]
    fn retry_stops_at_first_settled_outcome() {
        let policy = RetryPolicy {
            max_attempts: 10,
            delay: Duration::ZERO,
        };
        let s = sense(0x02, 0x04, 0x01);
        let outcome = policy.run(&AtomicBool::new(false), |n| {
            if n < 3 {
                check(&s, ProbeKind::Mandatory).map(|_| n)
            } else {
                ProbeOutcome::Success(n)
            }
        });
        assert_eq!(outcome, ProbeOutcome::Success(3));
    }

    #[test]
    fn cancellation_is_checked_between_attempts() {
        let policy = RetryPolicy {
            max_attempts: 10,
            delay: Duration::ZERO,
        };
        let cancel = AtomicBool::new(false);
        let s = sense(0x02, 0x3A, 0x00);
        let mut calls = 0;
        let outcome = policy.run(&cancel, |_| {
            calls += 1;
            if calls == 2 {
                cancel.store(true, Ordering::Relaxed);
            }
            check(&s, ProbeKind::Mandatory)
        });
        assert_eq!(calls, 2);
        assert_eq!(outcome, ProbeOutcome::Fatal(FatalCode::Cancelled));
    }
}
