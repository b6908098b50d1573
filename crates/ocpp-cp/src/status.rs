//! # Status Registry
//!
//! Owns one [`ConnectorStateMachine`] per connector, `0..=N`, where connector
//! `0` stands for the charge point as a whole. All machines sit behind one
//! mutex; status changes are reported through a single callback registered at
//! construction.

use crate::error::{ChargePointError, ChargePointResult};
use crate::state_machine::{ConnectorStateMachine, ConnectorStatus, StatusEvent};
use ocpp_types::v16j::{AvailabilityType, ChargePointErrorCode, ChargePointStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Receives `(connector_id, error_code, status)` on every state or fault transition.
///
/// Runs while the registry lock is held and must not call back into the
/// registry. Hand the change off instead, see [`crate::notifier::StatusNotifier`].
pub type OnStatusChanged =
    Arc<dyn Fn(u32, Option<ChargePointErrorCode>, ChargePointStatus) + Send + Sync>;

pub struct StatusRegistry {
    connectors: Mutex<Vec<ConnectorStateMachine>>,
    number_of_connectors: u32,
    on_status_changed: OnStatusChanged,
}

impl StatusRegistry {
    /// Create a registry with connectors `0..=number_of_connectors`, all Available
    pub fn new(number_of_connectors: u32, on_status_changed: OnStatusChanged) -> Self {
        let statuses = (0..=number_of_connectors)
            .map(|id| (id, ConnectorStatus::Available))
            .collect::<BTreeMap<_, _>>();
        let connectors = Self::build(&statuses, &on_status_changed);
        Self {
            connectors: Mutex::new(connectors),
            number_of_connectors,
            on_status_changed,
        }
    }

    /// Create a registry from explicit initial statuses, one per connector `0..=N`
    pub fn with_statuses(
        statuses: &BTreeMap<u32, ConnectorStatus>,
        on_status_changed: OnStatusChanged,
    ) -> ChargePointResult<Self> {
        let number_of_connectors = Self::check_complete(statuses)?;
        let connectors = Self::build(statuses, &on_status_changed);
        Ok(Self {
            connectors: Mutex::new(connectors),
            number_of_connectors,
            on_status_changed,
        })
    }

    /// Highest id must equal the entry count minus one, so ids are exactly 0..=N
    fn check_complete(statuses: &BTreeMap<u32, ConnectorStatus>) -> ChargePointResult<u32> {
        let Some((&max_id, _)) = statuses.last_key_value() else {
            return Err(ChargePointError::configuration(
                "status map must contain at least connector 0",
            ));
        };
        if max_id as usize + 1 != statuses.len() {
            return Err(ChargePointError::configuration(format!(
                "status map must cover connectors 0..={} exactly",
                max_id
            )));
        }
        Ok(max_id)
    }

    fn build(
        statuses: &BTreeMap<u32, ConnectorStatus>,
        on_status_changed: &OnStatusChanged,
    ) -> Vec<ConnectorStateMachine> {
        statuses
            .iter()
            .map(|(&connector_id, &initial)| {
                let callback = on_status_changed.clone();
                ConnectorStateMachine::new(
                    initial,
                    Box::new(move |status, error_code| callback(connector_id, error_code, status)),
                )
            })
            .collect()
    }

    pub fn connector_count(&self) -> u32 {
        self.number_of_connectors
    }

    /// Route an event to one connector. False for unknown connectors and
    /// illegal transitions.
    pub async fn submit_event(&self, connector_id: u32, event: StatusEvent) -> bool {
        let mut connectors = self.connectors.lock().await;
        match connectors.get_mut(connector_id as usize) {
            Some(machine) => machine.handle_event(event),
            None => {
                warn!("Event {:?} for unknown connector {}", event, connector_id);
                false
            }
        }
    }

    pub async fn submit_fault(&self, connector_id: u32, error_code: ChargePointErrorCode) -> bool {
        let mut connectors = self.connectors.lock().await;
        match connectors.get_mut(connector_id as usize) {
            Some(machine) => machine.handle_fault(error_code),
            None => {
                warn!("Fault {} for unknown connector {}", error_code, connector_id);
                false
            }
        }
    }

    pub async fn submit_error(&self, connector_id: u32, error_code: ChargePointErrorCode) -> bool {
        let mut connectors = self.connectors.lock().await;
        match connectors.get_mut(connector_id as usize) {
            Some(machine) => machine.handle_error(error_code),
            None => {
                warn!(
                    "Error clear {} for unknown connector {}",
                    error_code, connector_id
                );
                false
            }
        }
    }

    /// Rebuild every connector from `status_map` and report each new status.
    ///
    /// The map must hold exactly one entry per connector `0..=N`. Active
    /// faults are dropped.
    pub async fn reset(&self, status_map: &BTreeMap<u32, ConnectorStatus>) -> ChargePointResult<()> {
        let max_id = Self::check_complete(status_map)?;
        if max_id != self.number_of_connectors {
            return Err(ChargePointError::invalid_connector(
                max_id,
                format!("expected connectors 0..={}", self.number_of_connectors),
            ));
        }

        let mut connectors = self.connectors.lock().await;
        *connectors = Self::build(status_map, &self.on_status_changed);
        info!("Status registry reset for {} connectors", connectors.len());
        for machine in connectors.iter() {
            machine.notify_current();
        }
        Ok(())
    }

    /// Restart every connector from its persisted availability: Operative
    /// connectors come up Available, Inoperative ones Unavailable
    pub async fn reset_availability(
        &self,
        availability: &BTreeMap<u32, AvailabilityType>,
    ) -> ChargePointResult<()> {
        let statuses = availability
            .iter()
            .map(|(&id, &availability)| (id, ConnectorStatus::from(availability)))
            .collect::<BTreeMap<_, _>>();
        self.reset(&statuses).await
    }

    /// Reported status of one connector
    pub async fn get_state(&self, connector_id: u32) -> Option<ChargePointStatus> {
        self.connectors
            .lock()
            .await
            .get(connector_id as usize)
            .map(ConnectorStateMachine::get_state)
    }

    /// Active fault of one connector
    pub async fn active_error(&self, connector_id: u32) -> Option<ChargePointErrorCode> {
        self.connectors
            .lock()
            .await
            .get(connector_id as usize)
            .and_then(ConnectorStateMachine::active_error_code)
    }

    /// Reported status of every connector, indexed by connector id
    pub async fn snapshot(&self) -> Vec<ChargePointStatus> {
        self.connectors
            .lock()
            .await
            .iter()
            .map(ConnectorStateMachine::get_state)
            .collect()
    }

    /// Report the current status of a connector again, or of all connectors
    /// when `connector_id` is `None`
    pub async fn trigger_status_notification(&self, connector_id: Option<u32>) -> ChargePointResult<()> {
        let connectors = self.connectors.lock().await;
        match connector_id {
            Some(id) => {
                let machine = connectors.get(id as usize).ok_or_else(|| {
                    ChargePointError::invalid_connector(id, "no such connector")
                })?;
                machine.notify_current();
            }
            None => connectors.iter().for_each(ConnectorStateMachine::notify_current),
        }
        Ok(())
    }
}

impl std::fmt::Debug for StatusRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusRegistry")
            .field("number_of_connectors", &self.number_of_connectors)
            .finish()
    }
}
