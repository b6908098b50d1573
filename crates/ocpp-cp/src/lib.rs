//! # OCPP Charge Point Engine
//!
//! The protocol core of a charge point:
//! - an outbound message queue with correlation, retries, transaction
//!   ordering and a boot stall
//! - per-connector status state machines with a fault overlay
//! - the glue that turns status changes into StatusNotification calls
//!
//! Framing, sockets and payload schemas are supplied by the caller through
//! the [`Transport`] trait and the `ocpp-types` crate.

pub mod config;
pub mod error;
pub mod logging;
pub mod message_queue;
pub mod notifier;
pub mod persistence;
pub mod state_machine;
pub mod status;
pub mod transport;

pub use config::{EngineConfig, QueueConfig, RetryBackoff};
pub use error::{ChargePointError, ChargePointResult};
pub use message_queue::{CallHandle, CallOutcome, ControlMessage, CorrelationTable, MessageQueue};
pub use notifier::{StatusChange, StatusNotifier};
pub use persistence::{InMemoryStore, JsonFileStore, StoredMessage, TransactionMessageStore};
pub use state_machine::{ConnectorStateMachine, ConnectorStatus, StatusEvent};
pub use status::{OnStatusChanged, StatusRegistry};
pub use transport::{ChannelTransport, ConnectionState, Transport};

use ocpp_types::{Call, CallResponse};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Queue, status registry and their background tasks, wired together
pub struct ChargePointEngine {
    /// Configuration
    config: EngineConfig,
    /// Outbound message queue
    queue: MessageQueue,
    /// Connector status machines
    registry: Arc<StatusRegistry>,
    /// Queue drain task
    worker: JoinHandle<()>,
    /// StatusNotification task
    notifier: JoinHandle<()>,
}

impl ChargePointEngine {
    /// Validate `config` and start the engine on `transport`
    pub async fn start(config: EngineConfig, transport: Arc<dyn Transport>) -> ChargePointResult<Self> {
        config::validate_config(&config)?;
        let queue = MessageQueue::new(transport, config.queue.clone());
        Ok(Self::assemble(config, queue))
    }

    /// Like [`ChargePointEngine::start`], but transaction messages left in
    /// `store` by an earlier run are re-queued before anything else
    pub async fn start_with_store(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn TransactionMessageStore>,
    ) -> ChargePointResult<Self> {
        config::validate_config(&config)?;
        let queue = MessageQueue::with_store(transport, config.queue.clone(), store);
        if config.queue.persist_transaction_messages {
            queue.restore().await?;
        }
        Ok(Self::assemble(config, queue))
    }

    fn assemble(config: EngineConfig, queue: MessageQueue) -> Self {
        info!(
            "Starting charge point engine with {} connectors",
            config.connectors.number_of_connectors
        );
        let (on_status_changed, changes) = StatusNotifier::channel();
        let registry = Arc::new(StatusRegistry::new(
            config.connectors.number_of_connectors,
            on_status_changed,
        ));
        let worker = queue.spawn_worker();
        let notifier = StatusNotifier::spawn(queue.clone(), changes);

        Self {
            config,
            queue,
            registry,
            worker,
            notifier,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.registry
    }

    /// Originate an outbound call
    pub async fn send(&self, call: Call, is_transaction_related: bool) -> ChargePointResult<CallHandle> {
        self.queue.enqueue(call, is_transaction_related).await
    }

    /// Feed an inbound CALLRESULT or CALLERROR
    pub async fn receive(&self, response: CallResponse) -> bool {
        self.queue.receive(response).await
    }

    /// Resume the queue once the transport has (re)connected, after the
    /// configured reconnect delay
    pub async fn transport_ready(&self) {
        let delay = self.queue.config().await.delay_on_reconnect();
        self.queue.resume(delay).await;
        self.queue.notify_ready();
    }

    /// Pause the queue while the transport is down
    pub async fn transport_lost(&self) {
        self.queue.pause().await;
    }

    /// Resolve everything pending with `Shutdown` and stop both tasks
    pub async fn shutdown(self) {
        info!("Stopping charge point engine");
        self.queue.shutdown().await;
        if let Err(e) = self.worker.await {
            error!("Message queue worker ended abnormally: {}", e);
        }
        self.notifier.abort();
        let _ = self.notifier.await;
    }
}
