//! # Status Notifier
//!
//! Turns status registry callbacks into StatusNotification calls. The
//! callback only pushes into a channel, so nothing re-enters the registry
//! while its lock is held; a separate task does the enqueueing.

use crate::message_queue::MessageQueue;
use crate::status::OnStatusChanged;
use chrono::{DateTime, Utc};
use ocpp_types::v16j::{ChargePointErrorCode, ChargePointStatus, StatusNotificationRequest};
use ocpp_types::{Call, MessageKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One reported status change
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub connector_id: u32,
    pub error_code: Option<ChargePointErrorCode>,
    pub status: ChargePointStatus,
    pub timestamp: DateTime<Utc>,
}

impl StatusChange {
    pub fn to_request(&self) -> StatusNotificationRequest {
        StatusNotificationRequest {
            connector_id: self.connector_id,
            error_code: self.error_code.unwrap_or(ChargePointErrorCode::NoError),
            info: None,
            status: self.status,
            timestamp: Some(self.timestamp),
            vendor_error_code: None,
        }
    }
}

pub struct StatusNotifier;

impl StatusNotifier {
    /// A registry callback that forwards every change into the returned receiver
    pub fn channel() -> (OnStatusChanged, mpsc::UnboundedReceiver<StatusChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: OnStatusChanged = Arc::new(move |connector_id, error_code, status| {
            let change = StatusChange {
                connector_id,
                error_code,
                status,
                timestamp: Utc::now(),
            };
            if tx.send(change).is_err() {
                debug!("Status notifier gone, dropping change for connector {}", connector_id);
            }
        });
        (callback, rx)
    }

    /// Enqueue a StatusNotification for every change until the channel
    /// closes or the queue shuts down
    pub fn spawn(queue: MessageQueue, mut changes: mpsc::UnboundedReceiver<StatusChange>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Status notifier started");
            while let Some(change) = changes.recv().await {
                if queue.is_shutdown().await {
                    break;
                }
                let call = match Call::new(MessageKind::StatusNotification, change.to_request()) {
                    Ok(call) => call,
                    Err(e) => {
                        error!("Cannot encode status notification: {}", e);
                        continue;
                    }
                };
                debug!(
                    "Connector {} now {} ({:?})",
                    change.connector_id, change.status, change.error_code
                );
                match queue.enqueue(call, false).await {
                    Ok(handle) => {
                        tokio::spawn(async move {
                            let unique_id = handle.unique_id().to_string();
                            if let Err(e) = handle.await {
                                warn!("StatusNotification {} failed: {}", unique_id, e);
                            }
                        });
                    }
                    Err(e) => error!("Cannot enqueue status notification: {}", e),
                }
            }
            info!("Status notifier stopped");
        })
    }
}
