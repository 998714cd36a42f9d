//! Per-registration circuit breaker.
//!
//! Pure transition functions over [`CircuitState`]. Terminal delivery
//! outcomes move a registration between ACTIVE, FAILING and DISABLED;
//! operators move it in and out of PAUSED. Nothing here touches storage:
//! the store reads a state, applies a transition and writes the result back
//! in one transaction.

use serde::{Deserialize, Serialize};

use crate::models::{DeliveryOutcome, RegistrationStatus};
use crate::traits::LedgerError;

/// Consecutive failures after which an ACTIVE registration is marked FAILING.
pub const FAILING_THRESHOLD: u32 = 3;

/// Runtime circuit state of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub status: RegistrationStatus,
    /// Status to restore on resume; only set while PAUSED.
    #[serde(default)]
    pub paused_from: Option<RegistrationStatus>,
    pub is_active: bool,
    pub consecutive_failures: u32,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            status: RegistrationStatus::Active,
            paused_from: None,
            is_active: true,
            consecutive_failures: 0,
        }
    }
}

impl CircuitState {
    /// ACTIVE and FAILING registrations still receive traffic.
    pub fn accepts_deliveries(&self) -> bool {
        self.is_active
            && matches!(
                self.status,
                RegistrationStatus::Active | RegistrationStatus::Failing
            )
    }
}

/// Status a failure count maps to, before pause is taken into account.
fn status_for_failures(
    current: RegistrationStatus,
    consecutive_failures: u32,
    disable_after_failures: u32,
) -> RegistrationStatus {
    if current == RegistrationStatus::Disabled || consecutive_failures >= disable_after_failures {
        RegistrationStatus::Disabled
    } else if consecutive_failures >= FAILING_THRESHOLD {
        RegistrationStatus::Failing
    } else {
        current
    }
}

/// Apply one terminal delivery outcome.
///
/// An outcome can land on a PAUSED registration when the attempt was already
/// on the wire at pause time. Counters still move; the derived status goes to
/// `paused_from` so resume restores it, except that reaching the disable
/// threshold disables outright.
pub fn on_outcome(
    state: CircuitState,
    outcome: &DeliveryOutcome,
    disable_after_failures: u32,
) -> CircuitState {
    let mut next = state;
    match outcome {
        DeliveryOutcome::Success { .. } => {
            next.consecutive_failures = 0;
            match next.status {
                RegistrationStatus::Failing => next.status = RegistrationStatus::Active,
                RegistrationStatus::Paused => {
                    if next.paused_from == Some(RegistrationStatus::Failing) {
                        next.paused_from = Some(RegistrationStatus::Active);
                    }
                }
                RegistrationStatus::Active | RegistrationStatus::Disabled => {}
            }
        }
        DeliveryOutcome::Failure { .. } => {
            next.consecutive_failures = next.consecutive_failures.saturating_add(1);
            if next.status == RegistrationStatus::Paused {
                let underlying = next.paused_from.unwrap_or(RegistrationStatus::Active);
                let derived = status_for_failures(
                    underlying,
                    next.consecutive_failures,
                    disable_after_failures,
                );
                if derived == RegistrationStatus::Disabled {
                    next.status = RegistrationStatus::Disabled;
                    next.paused_from = None;
                } else {
                    next.paused_from = Some(derived);
                }
            } else {
                next.status = status_for_failures(
                    next.status,
                    next.consecutive_failures,
                    disable_after_failures,
                );
            }
        }
    }

    if next.status == RegistrationStatus::Disabled {
        next.is_active = false;
    }

    if next.status != state.status {
        tracing::warn!(
            from = %state.status,
            to = %next.status,
            consecutive_failures = next.consecutive_failures,
            "Registration circuit transition"
        );
    }
    next
}

/// Operator pause. Counters are untouched.
pub fn pause(state: CircuitState) -> Result<CircuitState, LedgerError> {
    match state.status {
        RegistrationStatus::Paused => Ok(state),
        RegistrationStatus::Disabled => Err(LedgerError::InvalidStateTransition),
        previous => Ok(CircuitState {
            status: RegistrationStatus::Paused,
            paused_from: Some(previous),
            ..state
        }),
    }
}

/// Operator resume: back to whatever status the registration was paused from.
pub fn resume(state: CircuitState) -> Result<CircuitState, LedgerError> {
    match state.status {
        RegistrationStatus::Paused => Ok(CircuitState {
            status: state.paused_from.unwrap_or(RegistrationStatus::Active),
            paused_from: None,
            ..state
        }),
        RegistrationStatus::Active | RegistrationStatus::Failing => Ok(state),
        RegistrationStatus::Disabled => Err(LedgerError::InvalidStateTransition),
    }
}

/// Operator disable from any state.
pub fn disable(state: CircuitState) -> CircuitState {
    CircuitState {
        status: RegistrationStatus::Disabled,
        paused_from: None,
        is_active: false,
        ..state
    }
}

/// Operator re-enable. The only way out of DISABLED; starts a fresh failure run.
pub fn enable() -> CircuitState {
    CircuitState::default()
}
