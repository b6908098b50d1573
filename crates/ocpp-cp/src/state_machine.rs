//! # State Machine for Connector Status Management
//!
//! One finite-state machine per connector over the operational states of
//! OCPP 1.6J, with an independent fault overlay. While a fault is active the
//! reported status is `Faulted`, but the operational state underneath keeps
//! tracking events so it can be reported again once the fault clears.

use ocpp_types::v16j::{AvailabilityType, ChargePointErrorCode, ChargePointStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Operational state of a connector, independent of faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
}

impl ConnectorStatus {
    pub const ALL: [ConnectorStatus; 8] = [
        ConnectorStatus::Available,
        ConnectorStatus::Preparing,
        ConnectorStatus::Charging,
        ConnectorStatus::SuspendedEV,
        ConnectorStatus::SuspendedEVSE,
        ConnectorStatus::Finishing,
        ConnectorStatus::Reserved,
        ConnectorStatus::Unavailable,
    ];
}

impl From<ConnectorStatus> for ChargePointStatus {
    fn from(status: ConnectorStatus) -> Self {
        match status {
            ConnectorStatus::Available => ChargePointStatus::Available,
            ConnectorStatus::Preparing => ChargePointStatus::Preparing,
            ConnectorStatus::Charging => ChargePointStatus::Charging,
            ConnectorStatus::SuspendedEV => ChargePointStatus::SuspendedEV,
            ConnectorStatus::SuspendedEVSE => ChargePointStatus::SuspendedEVSE,
            ConnectorStatus::Finishing => ChargePointStatus::Finishing,
            ConnectorStatus::Reserved => ChargePointStatus::Reserved,
            ConnectorStatus::Unavailable => ChargePointStatus::Unavailable,
        }
    }
}

impl TryFrom<ChargePointStatus> for ConnectorStatus {
    type Error = ChargePointStatus;

    /// `Faulted` is an overlay, not an operational state
    fn try_from(status: ChargePointStatus) -> Result<Self, Self::Error> {
        match status {
            ChargePointStatus::Available => Ok(ConnectorStatus::Available),
            ChargePointStatus::Preparing => Ok(ConnectorStatus::Preparing),
            ChargePointStatus::Charging => Ok(ConnectorStatus::Charging),
            ChargePointStatus::SuspendedEV => Ok(ConnectorStatus::SuspendedEV),
            ChargePointStatus::SuspendedEVSE => Ok(ConnectorStatus::SuspendedEVSE),
            ChargePointStatus::Finishing => Ok(ConnectorStatus::Finishing),
            ChargePointStatus::Reserved => Ok(ConnectorStatus::Reserved),
            ChargePointStatus::Unavailable => Ok(ConnectorStatus::Unavailable),
            ChargePointStatus::Faulted => Err(status),
        }
    }
}

/// Initial state of a connector from its persisted availability
impl From<AvailabilityType> for ConnectorStatus {
    fn from(availability: AvailabilityType) -> Self {
        match availability {
            AvailabilityType::Operative => ConnectorStatus::Available,
            AvailabilityType::Inoperative => ConnectorStatus::Unavailable,
        }
    }
}

impl std::fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", ChargePointStatus::from(*self))
    }
}

/// Events reported by hardware and session logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusEvent {
    BecomeAvailable,
    UsageInitiated,
    StartCharging,
    PauseChargingEV,
    PauseChargingEVSE,
    ReserveConnector,
    TransactionStoppedAndUserActionRequired,
    ChangeAvailabilityToUnavailable,
}

impl StatusEvent {
    pub const ALL: [StatusEvent; 8] = [
        StatusEvent::BecomeAvailable,
        StatusEvent::UsageInitiated,
        StatusEvent::StartCharging,
        StatusEvent::PauseChargingEV,
        StatusEvent::PauseChargingEVSE,
        StatusEvent::ReserveConnector,
        StatusEvent::TransactionStoppedAndUserActionRequired,
        StatusEvent::ChangeAvailabilityToUnavailable,
    ];
}

/// Transitions used only to leave the fault overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryEvent {
    ReturnToAvailable,
    ReturnToPreparing,
    ReturnToCharging,
    ReturnToSuspendedEV,
    ReturnToSuspendedEVSE,
    ReturnToFinishing,
    ReturnToReserved,
    ReturnToUnavailable,
}

impl RecoveryEvent {
    fn for_state(state: ConnectorStatus) -> Self {
        match state {
            ConnectorStatus::Available => RecoveryEvent::ReturnToAvailable,
            ConnectorStatus::Preparing => RecoveryEvent::ReturnToPreparing,
            ConnectorStatus::Charging => RecoveryEvent::ReturnToCharging,
            ConnectorStatus::SuspendedEV => RecoveryEvent::ReturnToSuspendedEV,
            ConnectorStatus::SuspendedEVSE => RecoveryEvent::ReturnToSuspendedEVSE,
            ConnectorStatus::Finishing => RecoveryEvent::ReturnToFinishing,
            ConnectorStatus::Reserved => RecoveryEvent::ReturnToReserved,
            ConnectorStatus::Unavailable => RecoveryEvent::ReturnToUnavailable,
        }
    }

    fn target(self) -> ConnectorStatus {
        match self {
            RecoveryEvent::ReturnToAvailable => ConnectorStatus::Available,
            RecoveryEvent::ReturnToPreparing => ConnectorStatus::Preparing,
            RecoveryEvent::ReturnToCharging => ConnectorStatus::Charging,
            RecoveryEvent::ReturnToSuspendedEV => ConnectorStatus::SuspendedEV,
            RecoveryEvent::ReturnToSuspendedEVSE => ConnectorStatus::SuspendedEVSE,
            RecoveryEvent::ReturnToFinishing => ConnectorStatus::Finishing,
            RecoveryEvent::ReturnToReserved => ConnectorStatus::Reserved,
            RecoveryEvent::ReturnToUnavailable => ConnectorStatus::Unavailable,
        }
    }
}

/// What caused a recorded transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionTrigger {
    Event(StatusEvent),
    Fault(ChargePointErrorCode),
    FaultCleared(ChargePointErrorCode),
}

/// State transition result
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    /// Reported status before
    pub from_status: ChargePointStatus,
    /// Reported status after
    pub to_status: ChargePointStatus,
    /// What triggered the transition
    pub trigger: TransitionTrigger,
    /// Whether the transition was applied
    pub success: bool,
}

/// Invoked with the newly reported status on every applied transition
pub type StatusCallback = Box<dyn Fn(ChargePointStatus, Option<ChargePointErrorCode>) + Send + Sync>;

/// State machine for one connector
pub struct ConnectorStateMachine {
    /// Operational state, preserved while faulted
    current_state: ConnectorStatus,
    /// Active fault, if any
    active_error: Option<ChargePointErrorCode>,
    /// State transition history
    transition_history: Vec<StateTransition>,
    /// Maximum history size
    max_history_size: usize,
    on_status_changed: StatusCallback,
}

impl std::fmt::Debug for ConnectorStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorStateMachine")
            .field("current_state", &self.current_state)
            .field("active_error", &self.active_error)
            .field("history_len", &self.transition_history.len())
            .finish()
    }
}

impl ConnectorStateMachine {
    /// Create a new state machine. Construction does not invoke the callback.
    pub fn new(initial_state: ConnectorStatus, on_status_changed: StatusCallback) -> Self {
        Self {
            current_state: initial_state,
            active_error: None,
            transition_history: Vec::new(),
            max_history_size: 100,
            on_status_changed,
        }
    }

    /// The static transition table
    pub fn next_state(state: ConnectorStatus, event: StatusEvent) -> Option<ConnectorStatus> {
        use ConnectorStatus::*;
        use StatusEvent::*;

        match (state, event) {
            (Available, UsageInitiated) => Some(Preparing),
            (Available, StartCharging) => Some(Charging),
            (Available, PauseChargingEV) => Some(SuspendedEV),
            (Available, PauseChargingEVSE) => Some(SuspendedEVSE),
            (Available, ReserveConnector) => Some(Reserved),
            (Available, ChangeAvailabilityToUnavailable) => Some(Unavailable),

            (Preparing, BecomeAvailable) => Some(Available),
            (Preparing, StartCharging) => Some(Charging),
            (Preparing, PauseChargingEV) => Some(SuspendedEV),
            (Preparing, PauseChargingEVSE) => Some(SuspendedEVSE),
            (Preparing, TransactionStoppedAndUserActionRequired) => Some(Finishing),

            (Charging, BecomeAvailable) => Some(Available),
            (Charging, PauseChargingEV) => Some(SuspendedEV),
            (Charging, PauseChargingEVSE) => Some(SuspendedEVSE),
            (Charging, TransactionStoppedAndUserActionRequired) => Some(Finishing),
            (Charging, ChangeAvailabilityToUnavailable) => Some(Unavailable),

            (SuspendedEV, BecomeAvailable) => Some(Available),
            (SuspendedEV, StartCharging) => Some(Charging),
            (SuspendedEV, PauseChargingEVSE) => Some(SuspendedEVSE),
            (SuspendedEV, TransactionStoppedAndUserActionRequired) => Some(Finishing),
            (SuspendedEV, ChangeAvailabilityToUnavailable) => Some(Unavailable),

            (SuspendedEVSE, BecomeAvailable) => Some(Available),
            (SuspendedEVSE, StartCharging) => Some(Charging),
            (SuspendedEVSE, PauseChargingEV) => Some(SuspendedEV),
            (SuspendedEVSE, TransactionStoppedAndUserActionRequired) => Some(Finishing),
            (SuspendedEVSE, ChangeAvailabilityToUnavailable) => Some(Unavailable),

            (Finishing, BecomeAvailable) => Some(Available),
            (Finishing, UsageInitiated) => Some(Preparing),
            (Finishing, ChangeAvailabilityToUnavailable) => Some(Unavailable),

            (Reserved, BecomeAvailable) => Some(Available),
            (Reserved, UsageInitiated) => Some(Preparing),
            (Reserved, ChangeAvailabilityToUnavailable) => Some(Unavailable),

            (Unavailable, BecomeAvailable) => Some(Available),
            (Unavailable, UsageInitiated) => Some(Preparing),
            (Unavailable, StartCharging) => Some(Charging),
            (Unavailable, PauseChargingEV) => Some(SuspendedEV),
            (Unavailable, PauseChargingEVSE) => Some(SuspendedEVSE),

            _ => None,
        }
    }

    /// Apply `event`. Returns false, leaving the state unchanged, if the
    /// table has no transition for it.
    ///
    /// While faulted the underlying state still moves, but nothing is
    /// reported until the fault clears.
    pub fn handle_event(&mut self, event: StatusEvent) -> bool {
        let from_status = self.get_state();
        let Some(to_state) = Self::next_state(self.current_state, event) else {
            warn!(
                "Invalid state transition: {} with event {:?}",
                self.current_state, event
            );
            self.add_to_history(StateTransition {
                from_status,
                to_status: from_status,
                trigger: TransitionTrigger::Event(event),
                success: false,
            });
            return false;
        };

        let from_state = self.current_state;
        self.current_state = to_state;
        let to_status = self.get_state();
        self.add_to_history(StateTransition {
            from_status,
            to_status,
            trigger: TransitionTrigger::Event(event),
            success: true,
        });

        if self.active_error.is_some() {
            debug!(
                "Faulted connector moved {} -> {} underneath (event: {:?})",
                from_state, to_state, event
            );
        } else {
            info!(
                "State transition: {} -> {} (event: {:?})",
                from_state, to_state, event
            );
            (self.on_status_changed)(to_status, None);
        }
        true
    }

    /// Raise a fault. The operational state is kept underneath.
    ///
    /// `NoError` and the already active code are rejected. A different code
    /// replaces the active one and is reported again.
    pub fn handle_fault(&mut self, error_code: ChargePointErrorCode) -> bool {
        if error_code == ChargePointErrorCode::NoError {
            warn!("Ignoring fault with error code NoError");
            return false;
        }
        if self.active_error == Some(error_code) {
            debug!("Fault {} already active", error_code);
            return false;
        }

        let from_status = self.get_state();
        self.active_error = Some(error_code);
        self.add_to_history(StateTransition {
            from_status,
            to_status: ChargePointStatus::Faulted,
            trigger: TransitionTrigger::Fault(error_code),
            success: true,
        });

        warn!(
            "Fault {} raised, reporting Faulted over {}",
            error_code, self.current_state
        );
        (self.on_status_changed)(ChargePointStatus::Faulted, Some(error_code));
        true
    }

    /// Clear a fault. Only the active code clears it; on success the
    /// preserved operational state is reported again.
    pub fn handle_error(&mut self, error_code: ChargePointErrorCode) -> bool {
        if self.active_error != Some(error_code) {
            debug!(
                "Not clearing {}: active fault is {:?}",
                error_code, self.active_error
            );
            return false;
        }

        self.active_error = None;
        let recovery = RecoveryEvent::for_state(self.current_state);
        let to_status = ChargePointStatus::from(recovery.target());
        self.add_to_history(StateTransition {
            from_status: ChargePointStatus::Faulted,
            to_status,
            trigger: TransitionTrigger::FaultCleared(error_code),
            success: true,
        });

        info!("Fault {} cleared ({:?})", error_code, recovery);
        (self.on_status_changed)(to_status, None);
        true
    }

    /// Reported status: `Faulted` while a fault is active, else the operational state
    pub fn get_state(&self) -> ChargePointStatus {
        if self.active_error.is_some() {
            ChargePointStatus::Faulted
        } else {
            self.current_state.into()
        }
    }

    pub fn underlying_state(&self) -> ConnectorStatus {
        self.current_state
    }

    pub fn is_faulted(&self) -> bool {
        self.active_error.is_some()
    }

    pub fn active_error_code(&self) -> Option<ChargePointErrorCode> {
        self.active_error
    }

    /// Report the current status again without changing anything
    pub fn notify_current(&self) {
        (self.on_status_changed)(self.get_state(), self.active_error);
    }

    /// Add transition to history
    fn add_to_history(&mut self, transition: StateTransition) {
        if self.transition_history.len() >= self.max_history_size {
            self.transition_history.remove(0);
        }
        self.transition_history.push(transition);
    }

    /// Get transition history
    pub fn transition_history(&self) -> &[StateTransition] {
        &self.transition_history
    }

    /// Get last transition
    pub fn last_transition(&self) -> Option<&StateTransition> {
        self.transition_history.last()
    }
}
