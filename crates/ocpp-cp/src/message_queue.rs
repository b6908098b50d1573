//! # Message Queue
//!
//! Turns outbound calls into correlated, retried and ordered sends, and
//! matches inbound responses back to the caller that originated them.
//!
//! Two streams share one correlation table:
//! - transaction-related calls, sent strictly one at a time in enqueue order;
//! - all other calls, FIFO among themselves, up to a configured number in flight.
//!
//! While a session-opening call (BootNotification) is outstanding or has not
//! been accepted, it is the only call that may be sent.
//!
//! While paused (offline) nothing is sent and normal calls are refused unless
//! `queue_all_messages` is set. Above `queues_total_size_threshold` pending
//! calls, the oldest normal calls are dropped first, then every second
//! MeterValues call of the transaction stream.

use crate::config::QueueConfig;
use crate::error::{ChargePointError, ChargePointResult};
use crate::persistence::{StoredMessage, TransactionMessageStore};
use crate::transport::Transport;
use ocpp_types::{Call, CallErrorCode, CallResponse, MessageKind};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Retry deadline used when `now + delay` is not representable
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Terminal outcome of one call: the response payload or the reason it failed
pub type CallOutcome = ChargePointResult<Value>;

/// An outbound call plus its delivery metadata
#[derive(Debug)]
pub struct ControlMessage {
    /// The call as it goes on the wire. Retransmissions reuse it unchanged.
    pub call: Call,
    /// Retransmissions so far
    pub attempts: u32,
    /// Member of the strictly ordered transaction stream
    pub is_transaction_related: bool,
    /// Holds back all other traffic until accepted
    pub stall_until_ack: bool,
    in_flight: bool,
    not_before: Option<Instant>,
    generation: u64,
    timer: Option<AbortHandle>,
    responder: Option<oneshot::Sender<CallOutcome>>,
}

impl ControlMessage {
    /// Wrap a call. Kinds that are transaction-related by nature are always
    /// placed in the transaction stream.
    pub fn new(call: Call, is_transaction_related: bool) -> Self {
        let is_transaction_related = is_transaction_related || call.kind.is_transaction_related();
        let stall_until_ack = call.kind.is_session_opening();
        Self {
            call,
            attempts: 0,
            is_transaction_related,
            stall_until_ack,
            in_flight: false,
            not_before: None,
            generation: 0,
            timer: None,
            responder: None,
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.call.unique_id
    }

    /// Sent and awaiting a response or timeout
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Sent at least once, so later transaction calls must stay behind it
    fn has_been_sent(&self) -> bool {
        self.in_flight || self.attempts > 0
    }

    /// May be discarded when the queue overflows
    fn is_droppable_normal(&self) -> bool {
        !self.is_transaction_related && !self.in_flight && !self.stall_until_ack
    }

    fn is_due(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn to_stored(&self) -> StoredMessage {
        StoredMessage {
            call: self.call.clone(),
            attempts: self.attempts,
        }
    }
}

/// Pending calls keyed by unique id, iterated in enqueue order
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: HashMap<String, ControlMessage>,
    order: VecDeque<String>,
}

impl CorrelationTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.entries.contains_key(unique_id)
    }

    pub fn get(&self, unique_id: &str) -> Option<&ControlMessage> {
        self.entries.get(unique_id)
    }

    fn get_mut(&mut self, unique_id: &str) -> Option<&mut ControlMessage> {
        self.entries.get_mut(unique_id)
    }

    fn push_back(&mut self, message: ControlMessage) -> ChargePointResult<()> {
        let id = message.unique_id().to_string();
        if self.entries.contains_key(&id) {
            return Err(ChargePointError::DuplicateUniqueId(id));
        }
        self.order.push_back(id.clone());
        self.entries.insert(id, message);
        Ok(())
    }

    fn insert_at(&mut self, index: usize, message: ControlMessage) -> ChargePointResult<()> {
        let id = message.unique_id().to_string();
        if self.entries.contains_key(&id) {
            return Err(ChargePointError::DuplicateUniqueId(id));
        }
        self.order.insert(index.min(self.order.len()), id.clone());
        self.entries.insert(id, message);
        Ok(())
    }

    /// Where restored transaction calls go: right behind the last
    /// transaction call that has already been sent, otherwise at the front
    fn restore_position(&self) -> usize {
        self.order
            .iter()
            .rposition(|id| {
                self.entries
                    .get(id)
                    .is_some_and(|m| m.is_transaction_related && m.has_been_sent())
            })
            .map_or(0, |index| index + 1)
    }

    /// Every second MeterValues call of the transaction stream, never the
    /// last two entries and never one in flight
    fn update_messages_to_drop(&self) -> Vec<String> {
        let stream: Vec<&ControlMessage> =
            self.iter().filter(|m| m.is_transaction_related).collect();
        let mut victims = Vec::new();
        let mut remove_next = true;
        for (index, message) in stream.iter().enumerate() {
            let remaining = stream.len() - index - 1;
            if remove_next
                && message.call.kind == MessageKind::MeterValues
                && !message.in_flight
                && remaining > 1
            {
                victims.push(message.unique_id().to_string());
                remove_next = false;
            } else {
                remove_next = true;
            }
        }
        victims
    }

    fn remove(&mut self, unique_id: &str) -> Option<ControlMessage> {
        let message = self.entries.remove(unique_id)?;
        self.order.retain(|id| id != unique_id);
        Some(message)
    }

    /// Entries in enqueue order
    pub fn iter(&self) -> impl Iterator<Item = &ControlMessage> + '_ {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    fn drain(&mut self) -> Vec<ControlMessage> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }
}

struct QueueState {
    table: CorrelationTable,
    config: QueueConfig,
    stalled: bool,
    shutdown: bool,
    next_generation: u64,
    paused: bool,
    resuming: bool,
    pause_resume_ctr: u64,
    resume_timer: Option<AbortHandle>,
    /// StopTransaction unique id -> transaction id to send it with
    stopped_transaction_ids: HashMap<String, i32>,
    /// StartTransaction unique id -> MeterValues queued before its id was known
    meter_values_by_start: HashMap<String, Vec<String>>,
}

impl QueueState {
    /// Ids of the entries to hand to the transport now, in send order
    fn select_sendable(&self, now: Instant) -> Vec<String> {
        let mut selected = Vec::new();

        if self.stalled {
            let opening_in_flight = self
                .table
                .iter()
                .any(|m| m.stall_until_ack && m.in_flight);
            if !opening_in_flight {
                if let Some(opening) = self
                    .table
                    .iter()
                    .find(|m| m.stall_until_ack && m.is_due(now))
                {
                    selected.push(opening.unique_id().to_string());
                }
            }
            return selected;
        }

        // Only the head of the transaction stream is ever eligible
        if let Some(head) = self.table.iter().find(|m| m.is_transaction_related) {
            if !head.in_flight && head.is_due(now) {
                selected.push(head.unique_id().to_string());
            }
        }

        let mut in_flight = self
            .table
            .iter()
            .filter(|m| !m.is_transaction_related && m.in_flight)
            .count();
        for message in self
            .table
            .iter()
            .filter(|m| !m.is_transaction_related && !m.in_flight)
        {
            if in_flight >= self.config.normal_in_flight_limit || !message.is_due(now) {
                break;
            }
            selected.push(message.unique_id().to_string());
            in_flight += 1;
        }

        selected
    }

    /// Earliest future retry deadline, if any entry is waiting for one
    fn next_deadline(&self, now: Instant) -> Option<Instant> {
        self.table
            .iter()
            .filter(|m| !m.in_flight)
            .filter_map(|m| m.not_before)
            .filter(|at| *at > now)
            .min()
    }

    fn persistence_enabled(&self) -> bool {
        self.config.persist_transaction_messages
    }
}

/// Awaitable terminal outcome of an enqueued call
#[derive(Debug)]
pub struct CallHandle {
    unique_id: String,
    rx: oneshot::Receiver<CallOutcome>,
    outcome: Option<CallOutcome>,
}

impl CallHandle {
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// The outcome if it has already been delivered. Repeated calls return
    /// the same outcome, and awaiting the handle afterwards still yields it.
    pub fn try_result(&mut self) -> Option<CallOutcome> {
        if self.outcome.is_none() {
            let outcome = match self.rx.try_recv() {
                Ok(outcome) => outcome,
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => Err(ChargePointError::Shutdown),
            };
            self.outcome = Some(outcome);
        }
        self.outcome.clone()
    }
}

impl Future for CallHandle {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.outcome.take() {
            return Poll::Ready(outcome);
        }
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ChargePointError::Shutdown)))
    }
}

enum RetryCause {
    Timeout,
    CallError(CallErrorCode, String),
}

struct QueueInner {
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn TransactionMessageStore>>,
    state: Mutex<QueueState>,
    pump_lock: Mutex<()>,
    wake: Notify,
}

/// Outbound message queue. Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl MessageQueue {
    pub fn new(transport: Arc<dyn Transport>, config: QueueConfig) -> Self {
        Self::build(transport, config, None)
    }

    /// Create a queue that records transaction-related calls in `store`
    pub fn with_store(
        transport: Arc<dyn Transport>,
        config: QueueConfig,
        store: Arc<dyn TransactionMessageStore>,
    ) -> Self {
        Self::build(transport, config, Some(store))
    }

    fn build(
        transport: Arc<dyn Transport>,
        config: QueueConfig,
        store: Option<Arc<dyn TransactionMessageStore>>,
    ) -> Self {
        let stalled = config.start_stalled;
        let paused = config.start_offline;
        Self {
            inner: Arc::new(QueueInner {
                transport,
                store,
                state: Mutex::new(QueueState {
                    table: CorrelationTable::default(),
                    config,
                    stalled,
                    shutdown: false,
                    next_generation: 0,
                    paused,
                    resuming: false,
                    pause_resume_ctr: 0,
                    resume_timer: None,
                    stopped_transaction_ids: HashMap::new(),
                    meter_values_by_start: HashMap::new(),
                }),
                pump_lock: Mutex::new(()),
                wake: Notify::new(),
            }),
        }
    }

    /// Queue a call for delivery.
    ///
    /// After shutdown the returned handle is already resolved with
    /// `Shutdown`, and while paused a normal call is resolved with `Offline`
    /// unless `queue_all_messages` is set. A unique id that is still pending
    /// is rejected.
    pub async fn enqueue(
        &self,
        call: Call,
        is_transaction_related: bool,
    ) -> ChargePointResult<CallHandle> {
        let (tx, rx) = oneshot::channel();
        let handle = CallHandle {
            unique_id: call.unique_id.clone(),
            rx,
            outcome: None,
        };

        let mut state = self.inner.state.lock().await;
        if state.shutdown {
            debug!("Rejecting {} ({}): queue shut down", call.kind, call.unique_id);
            let _ = tx.send(Err(ChargePointError::Shutdown));
            return Ok(handle);
        }
        if state.table.contains(&call.unique_id) {
            return Err(ChargePointError::DuplicateUniqueId(call.unique_id));
        }

        let mut message = ControlMessage::new(call, is_transaction_related);
        if state.paused
            && !state.resuming
            && !state.config.queue_all_messages
            && !message.is_transaction_related
            && !message.stall_until_ack
        {
            debug!(
                "Refusing {} ({}): queue paused",
                message.call.kind,
                message.unique_id()
            );
            let _ = tx.send(Err(ChargePointError::Offline));
            return Ok(handle);
        }
        message.responder = Some(tx);

        if message.stall_until_ack && !state.stalled {
            info!(
                "Stalling outbound traffic until {} is accepted",
                message.unique_id()
            );
            state.stalled = true;
        }

        let stored = (message.is_transaction_related && state.persistence_enabled())
            .then(|| message.to_stored());

        debug!(
            "Enqueued {} ({}), transaction related: {}",
            message.call.kind,
            message.unique_id(),
            message.is_transaction_related
        );
        state.table.push_back(message)?;

        if let Some(stored) = stored {
            self.persist(stored).await;
        }
        self.enforce_size_threshold(&mut state).await;

        drop(state);
        self.inner.wake.notify_one();
        Ok(handle)
    }

    /// Hand every eligible call to the transport. Returns how many were sent.
    pub async fn pump(&self) -> ChargePointResult<usize> {
        let _pump = self.inner.pump_lock.lock().await;

        let batch = {
            let mut state = self.inner.state.lock().await;
            if state.shutdown {
                return Err(ChargePointError::Shutdown);
            }
            if state.paused {
                debug!("Queue paused, deferring {} calls", state.table.len());
                return Err(ChargePointError::NotReady);
            }
            if !self.inner.transport.is_ready() {
                debug!("Transport not ready, deferring {} calls", state.table.len());
                return Err(ChargePointError::NotReady);
            }

            let ids = state.select_sendable(Instant::now());
            let timeout = state.config.message_timeout();
            let persist = state.persistence_enabled();
            let mut batch = Vec::with_capacity(ids.len());
            let mut updated = Vec::new();
            for id in ids {
                state.next_generation += 1;
                let generation = state.next_generation;
                let substitute = state.stopped_transaction_ids.remove(&id);
                if let Some(message) = state.table.get_mut(&id) {
                    if let Some(transaction_id) = substitute {
                        debug!("Sending {} with transaction id {}", id, transaction_id);
                        set_transaction_id(&mut message.call.payload, transaction_id);
                        if message.is_transaction_related && persist {
                            updated.push(message.to_stored());
                        }
                    }
                    message.in_flight = true;
                    message.not_before = None;
                    message.generation = generation;
                    message.cancel_timer();
                    message.timer = Some(self.arm_timeout(id, generation, timeout));
                    batch.push((message.call.clone(), message.attempts));
                }
            }
            for stored in updated {
                self.persist(stored).await;
            }
            batch
        };

        for (call, attempts) in &batch {
            if *attempts == 0 {
                info!("Sending {} ({})", call.kind, call.unique_id);
            } else {
                info!(
                    "Retransmitting {} ({}), retry {}",
                    call.kind, call.unique_id, attempts
                );
            }
            if let Err(e) = self.inner.transport.send(call).await {
                warn!("Transport failed to send {}: {}", call.unique_id, e);
            }
        }

        Ok(batch.len())
    }

    fn arm_timeout(&self, unique_id: String, generation: u64, timeout: Duration) -> AbortHandle {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            queue.expire(&unique_id, generation).await;
        })
        .abort_handle()
    }

    /// Timer expiry for one particular send of an entry
    async fn expire(&self, unique_id: &str, generation: u64) {
        let mut state = self.inner.state.lock().await;
        match state.table.get_mut(unique_id) {
            Some(message) if message.in_flight && message.generation == generation => {
                // Running inside this timer: drop the handle, do not abort ourselves
                message.timer = None;
            }
            _ => return,
        }
        warn!("No response to {} within timeout", unique_id);
        self.retry_or_fail(&mut state, unique_id, RetryCause::Timeout)
            .await;
    }

    /// The current send of `unique_id` got no response.
    ///
    /// Schedules a retransmission while attempts remain, otherwise resolves
    /// the call with `CmdTimeout`. Returns false for unknown ids.
    pub async fn on_timeout(&self, unique_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        self.retry_or_fail(&mut state, unique_id, RetryCause::Timeout)
            .await
    }

    async fn retry_or_fail(
        &self,
        state: &mut QueueState,
        unique_id: &str,
        cause: RetryCause,
    ) -> bool {
        let max_attempts = state.config.max_attempts;
        let persist = state.persistence_enabled();

        let Some(message) = state.table.get_mut(unique_id) else {
            debug!("Timeout for unknown call {}", unique_id);
            return false;
        };

        if message.attempts < max_attempts {
            message.attempts += 1;
            message.in_flight = false;
            message.cancel_timer();
            let delay = state.config.retry_delay(message.attempts);
            message.not_before = Some(deadline_after(delay));
            info!(
                "Scheduling retry {}/{} of {} ({}) in {:?}",
                message.attempts, max_attempts, message.call.kind, unique_id, delay
            );

            let stored = (message.is_transaction_related && persist).then(|| message.to_stored());
            if let Some(stored) = stored {
                self.persist(stored).await;
            }
            self.inner.wake.notify_one();
            return true;
        }

        let Some(message) = state.table.remove(unique_id) else {
            return false;
        };
        let outcome = match cause {
            RetryCause::Timeout => ChargePointError::timeout(unique_id, message.attempts),
            RetryCause::CallError(code, description) => {
                ChargePointError::call_error(code, description)
            }
        };
        self.finish(state, message, Err(outcome)).await;
        true
    }

    /// Deliver the response for a pending call.
    ///
    /// Returns false if nothing is pending under `unique_id`, e.g. a late
    /// response to a call that already timed out.
    pub async fn notify_response(&self, unique_id: &str, result: CallOutcome) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(message) = state.table.remove(unique_id) else {
            debug!("Ignoring response for unknown call {}", unique_id);
            return false;
        };
        self.finish(&mut state, message, result).await;
        true
    }

    /// Deliver a CALLERROR for a pending call.
    ///
    /// Schema violations fail the call at once. InternalError and
    /// GenericError are retried like a timeout. Anything else fails the call.
    pub async fn notify_error(
        &self,
        unique_id: &str,
        code: CallErrorCode,
        description: impl Into<String>,
    ) -> bool {
        let description = description.into();
        let mut state = self.inner.state.lock().await;
        if !state.table.contains(unique_id) {
            debug!("Ignoring call error for unknown call {}", unique_id);
            return false;
        }

        warn!("Call {} answered with {}: {}", unique_id, code, description);
        if code.is_transient() {
            return self
                .retry_or_fail(
                    &mut state,
                    unique_id,
                    RetryCause::CallError(code, description),
                )
                .await;
        }

        let Some(message) = state.table.remove(unique_id) else {
            return false;
        };
        let outcome = Err(ChargePointError::from_call_error(code, description));
        self.finish(&mut state, message, outcome).await;
        true
    }

    /// Route an inbound CALLRESULT or CALLERROR frame
    pub async fn receive(&self, response: CallResponse) -> bool {
        match response {
            CallResponse::Result(result) => {
                self.notify_response(&result.unique_id, Ok(result.payload))
                    .await
            }
            CallResponse::Error(error) => {
                self.notify_error(&error.unique_id, error.error_code, error.error_description)
                    .await
            }
        }
    }

    async fn finish(&self, state: &mut QueueState, mut message: ControlMessage, outcome: CallOutcome) {
        message.cancel_timer();
        state.stopped_transaction_ids.remove(message.unique_id());

        if message.stall_until_ack {
            match &outcome {
                Ok(payload) if is_accepted(payload) => {
                    if state.stalled {
                        info!("{} accepted, releasing stalled traffic", message.unique_id());
                    }
                    state.stalled = false;
                }
                Ok(payload) => warn!(
                    "{} not accepted ({}), traffic stays stalled",
                    message.unique_id(),
                    payload
                ),
                Err(e) => warn!(
                    "{} failed ({}), traffic stays stalled",
                    message.unique_id(),
                    e
                ),
            }
        }

        if message.is_transaction_related && state.persistence_enabled() {
            self.unpersist(message.unique_id()).await;
        }

        match &outcome {
            Ok(_) => debug!("Call {} completed", message.unique_id()),
            Err(e) => warn!("Call {} failed: {}", message.unique_id(), e),
        }

        match message.responder.take() {
            Some(responder) => {
                let _ = responder.send(outcome);
            }
            None => info!(
                "Restored call {} ({}) resolved: {:?}",
                message.call.kind,
                message.unique_id(),
                outcome
            ),
        }

        self.inner.wake.notify_one();
    }

    async fn persist(&self, message: StoredMessage) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.insert(message).await {
                error!("Failed to store transaction message: {}", e);
            }
        }
    }

    async fn unpersist(&self, unique_id: &str) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.remove(unique_id).await {
                error!("Failed to remove stored message {}: {}", unique_id, e);
            }
        }
    }

    /// Resolve every pending call with `Shutdown` and stop draining.
    /// Stored transaction messages are kept for the next start.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        if state.shutdown {
            return;
        }
        state.shutdown = true;

        let pending = state.table.drain();
        info!("Message queue shutting down, {} calls pending", pending.len());
        for mut message in pending {
            message.cancel_timer();
            if let Some(responder) = message.responder.take() {
                let _ = responder.send(Err(ChargePointError::Shutdown));
            }
        }

        drop(state);
        self.inner.wake.notify_one();
    }

    /// Re-queue stored transaction messages ahead of all other traffic, but
    /// behind a transaction call that has already been sent
    pub async fn restore(&self) -> ChargePointResult<usize> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };
        let stored = store.load_all().await?;

        let mut state = self.inner.state.lock().await;
        if state.shutdown {
            return Err(ChargePointError::Shutdown);
        }

        let mut position = state.table.restore_position();
        let mut restored = 0;
        for message in stored {
            if state.table.contains(&message.call.unique_id) {
                continue;
            }
            let mut control = ControlMessage::new(message.call, true);
            control.attempts = message.attempts;
            state.table.insert_at(position, control)?;
            position += 1;
            restored += 1;
        }

        if restored > 0 {
            info!("Restored {} transaction messages", restored);
            drop(state);
            self.inner.wake.notify_one();
        }
        Ok(restored)
    }

    /// Apply new retry and timeout settings. Affects future sends only.
    pub async fn update_config(&self, config: QueueConfig) {
        let mut state = self.inner.state.lock().await;
        debug!("Updating queue configuration: {:?}", config);
        state.config = config;
        self.enforce_size_threshold(&mut state).await;
        drop(state);
        self.inner.wake.notify_one();
    }

    pub async fn config(&self) -> QueueConfig {
        self.inner.state.lock().await.config.clone()
    }

    /// Drop calls until at most `queues_total_size_threshold` are pending:
    /// the oldest normal calls first, then transaction updates
    async fn enforce_size_threshold(&self, state: &mut QueueState) {
        let threshold = state.config.queues_total_size_threshold;
        if state.table.len() <= threshold {
            return;
        }
        let transaction_count = state
            .table
            .iter()
            .filter(|m| m.is_transaction_related)
            .count();
        warn!(
            "Queue size exceeds threshold ({}) with {} transaction and {} normal calls pending",
            threshold,
            transaction_count,
            state.table.len() - transaction_count
        );

        let batch = (threshold / 10).max(1);
        while state.table.len() > threshold {
            let victims: Vec<String> = state
                .table
                .iter()
                .filter(|m| m.is_droppable_normal())
                .take(batch)
                .map(|m| m.unique_id().to_string())
                .collect();
            if victims.is_empty() {
                break;
            }
            warn!("Dropping {} calls from the normal queue", victims.len());
            for id in victims {
                self.drop_call(state, &id).await;
            }
        }

        while state.table.len() > threshold {
            let victims = state.table.update_messages_to_drop();
            if victims.is_empty() {
                warn!("No further transaction update calls to drop");
                break;
            }
            warn!("Dropping {} transaction update calls", victims.len());
            for id in victims {
                self.drop_call(state, &id).await;
            }
        }
    }

    async fn drop_call(&self, state: &mut QueueState, unique_id: &str) {
        if let Some(message) = state.table.remove(unique_id) {
            let outcome = Err(ChargePointError::Dropped(unique_id.to_string()));
            self.finish(state, message, outcome).await;
        }
    }

    /// Stop sending, e.g. because the connection was lost
    pub async fn pause(&self) {
        let mut state = self.inner.state.lock().await;
        state.pause_resume_ctr += 1;
        if let Some(timer) = state.resume_timer.take() {
            timer.abort();
        }
        state.paused = true;
        state.resuming = false;
        info!("Message queue paused");
    }

    /// Resume sending after a pause.
    ///
    /// Waits `delay_on_reconnect` first, unless this is the first resume of
    /// a queue that started offline. A `pause` during the delay cancels it.
    pub async fn resume(&self, delay_on_reconnect: Duration) {
        let mut state = self.inner.state.lock().await;
        if !state.paused {
            return;
        }
        state.pause_resume_ctr += 1;
        let expected = state.pause_resume_ctr;
        if let Some(timer) = state.resume_timer.take() {
            timer.abort();
        }

        if expected > 1 && !delay_on_reconnect.is_zero() {
            info!("Resuming message queue in {:?}", delay_on_reconnect);
            state.resuming = true;
            let queue = self.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay_on_reconnect).await;
                let mut state = queue.inner.state.lock().await;
                if state.pause_resume_ctr == expected {
                    // Running inside this timer: drop the handle, do not abort ourselves
                    state.resume_timer = None;
                    queue.resume_now(&mut state, expected);
                }
            });
            state.resume_timer = Some(timer.abort_handle());
        } else {
            self.resume_now(&mut state, expected);
        }
    }

    fn resume_now(&self, state: &mut QueueState, expected: u64) {
        if state.pause_resume_ctr != expected {
            return;
        }
        state.paused = false;
        state.resuming = false;
        info!("Message queue resumed");
        self.inner.wake.notify_one();
    }

    pub async fn is_paused(&self) -> bool {
        self.inner.state.lock().await.paused
    }

    /// Whether a transaction call carrying `transaction_id` is pending
    pub async fn contains_transaction_messages(&self, transaction_id: i32) -> bool {
        self.inner
            .state
            .lock()
            .await
            .table
            .iter()
            .any(|m| m.is_transaction_related && carries_transaction_id(&m.call, transaction_id))
    }

    /// Whether a StopTransaction for `transaction_id` is pending
    pub async fn contains_stop_transaction_message(&self, transaction_id: i32) -> bool {
        self.inner
            .state
            .lock()
            .await
            .table
            .iter()
            .any(|m| {
                m.call.kind == MessageKind::StopTransaction
                    && carries_transaction_id(&m.call, transaction_id)
            })
    }

    /// Send the queued StopTransaction `stop_message_id` with
    /// `transaction_id`, for a transaction stopped before its id was known
    pub async fn add_stopped_transaction_id(&self, stop_message_id: impl Into<String>, transaction_id: i32) {
        let stop_message_id = stop_message_id.into();
        debug!(
            "Transaction id {} recorded for {}",
            transaction_id, stop_message_id
        );
        self.inner
            .state
            .lock()
            .await
            .stopped_transaction_ids
            .insert(stop_message_id, transaction_id);
    }

    /// Record a MeterValues call queued before the StartTransaction
    /// `start_message_id` was answered
    pub async fn add_meter_value_message_id(
        &self,
        start_message_id: impl Into<String>,
        meter_value_message_id: impl Into<String>,
    ) {
        self.inner
            .state
            .lock()
            .await
            .meter_values_by_start
            .entry(start_message_id.into())
            .or_default()
            .push(meter_value_message_id.into());
    }

    /// Fill in `transaction_id` on the MeterValues calls recorded for
    /// `start_message_id`
    pub async fn notify_start_transaction_handled(&self, start_message_id: &str, transaction_id: i32) {
        let mut state = self.inner.state.lock().await;
        let persist = state.persistence_enabled();
        let Some(meter_value_ids) = state.meter_values_by_start.remove(start_message_id) else {
            return;
        };

        let mut updated = Vec::new();
        for id in &meter_value_ids {
            if let Some(message) = state.table.get_mut(id) {
                debug!("Adding transaction id {} to {}", transaction_id, id);
                set_transaction_id(&mut message.call.payload, transaction_id);
                if message.is_transaction_related && persist {
                    updated.push(message.to_stored());
                }
            }
        }
        for stored in updated {
            self.persist(stored).await;
        }

        drop(state);
        self.inner.wake.notify_one();
    }

    /// Wake the worker, e.g. once the transport has connected
    pub fn notify_ready(&self) {
        self.inner.wake.notify_one();
    }

    /// Run `pump` until shutdown, sleeping until the next wake-up or retry deadline
    pub fn spawn_worker(&self) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move { queue.run().await })
    }

    async fn run(&self) {
        info!("Message queue worker started");
        loop {
            match self.pump().await {
                Ok(_) | Err(ChargePointError::NotReady) => {}
                Err(ChargePointError::Shutdown) => break,
                Err(e) => error!("Message queue pump failed: {}", e),
            }

            let deadline = {
                let state = self.inner.state.lock().await;
                if state.shutdown {
                    break;
                }
                state.next_deadline(Instant::now())
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.inner.wake.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => self.inner.wake.notified().await,
            }
        }
        info!("Message queue worker stopped");
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.state.lock().await.table.len()
    }

    /// Unique ids currently awaiting a response, in enqueue order
    pub async fn in_flight_ids(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .await
            .table
            .iter()
            .filter(|m| m.in_flight)
            .map(|m| m.unique_id().to_string())
            .collect()
    }

    pub async fn is_transaction_queue_empty(&self) -> bool {
        !self
            .inner
            .state
            .lock()
            .await
            .table
            .iter()
            .any(|m| m.is_transaction_related)
    }

    pub async fn is_stalled(&self) -> bool {
        self.inner.state.lock().await.stalled
    }

    pub async fn is_shutdown(&self) -> bool {
        self.inner.state.lock().await.shutdown
    }

    /// Whether a call of `kind` is pending
    pub async fn contains_kind(&self, kind: MessageKind) -> bool {
        self.inner
            .state
            .lock()
            .await
            .table
            .iter()
            .any(|m| m.call.kind == kind)
    }
}

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

fn carries_transaction_id(call: &Call, transaction_id: i32) -> bool {
    call.payload.get("transactionId").and_then(Value::as_i64) == Some(i64::from(transaction_id))
}

fn set_transaction_id(payload: &mut Value, transaction_id: i32) {
    if let Some(fields) = payload.as_object_mut() {
        fields.insert("transactionId".to_string(), Value::from(transaction_id));
    }
}

/// A session-opening response without a status, or with status Accepted
fn is_accepted(payload: &Value) -> bool {
    payload
        .get("status")
        .and_then(Value::as_str)
        .map_or(true, |status| status == "Accepted")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;
    use crate::transport::ChannelTransport;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn immediate_retries() -> QueueConfig {
        QueueConfig {
            retry_interval_secs: 0,
            ..Default::default()
        }
    }

    fn test_queue(config: QueueConfig) -> (MessageQueue, Arc<ChannelTransport>, UnboundedReceiver<Call>) {
        let (transport, wire) = ChannelTransport::new();
        let transport = Arc::new(transport);
        let queue = MessageQueue::new(transport.clone(), config);
        (queue, transport, wire)
    }

    fn call(id: &str, kind: MessageKind) -> Call {
        Call::with_unique_id(id, kind, json!({})).unwrap()
    }

    fn sent_ids(wire: &mut UnboundedReceiver<Call>) -> Vec<String> {
        let mut ids = Vec::new();
        while let Ok(call) = wire.try_recv() {
            ids.push(call.unique_id);
        }
        ids
    }

    #[tokio::test]
    async fn test_send_and_resolve() {
        let (queue, _transport, mut wire) = test_queue(QueueConfig::default());
        let handle = queue
            .enqueue(call("hb-1", MessageKind::Heartbeat), false)
            .await
            .unwrap();
        assert_eq!(handle.unique_id(), "hb-1");

        assert_eq!(queue.pump().await.unwrap(), 1);
        assert_eq!(sent_ids(&mut wire), vec!["hb-1"]);
        assert_eq!(queue.in_flight_ids().await, vec!["hb-1"]);

        let payload = json!({"currentTime": "2026-01-01T00:00:00Z"});
        assert!(queue.notify_response("hb-1", Ok(payload.clone())).await);
        assert_eq!(handle.await.unwrap(), payload);

        // A late duplicate must not resurrect the entry
        assert!(!queue.notify_response("hb-1", Ok(json!({}))).await);
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_rejected() {
        let (queue, _transport, _wire) = test_queue(QueueConfig::default());
        queue
            .enqueue(call("dup", MessageKind::Heartbeat), false)
            .await
            .unwrap();
        let second = queue.enqueue(call("dup", MessageKind::Heartbeat), false).await;
        assert!(matches!(second, Err(ChargePointError::DuplicateUniqueId(id)) if id == "dup"));
        assert_eq!(queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_transaction_stream_is_strictly_ordered() {
        let (queue, _transport, mut wire) = test_queue(immediate_retries());
        let start = queue
            .enqueue(call("a", MessageKind::StartTransaction), true)
            .await
            .unwrap();
        let meter = queue
            .enqueue(call("b", MessageKind::MeterValues), true)
            .await
            .unwrap();

        queue.pump().await.unwrap();
        queue.pump().await.unwrap();
        assert!(queue.on_timeout("a").await);
        queue.pump().await.unwrap();
        assert!(queue.on_timeout("a").await);
        queue.pump().await.unwrap();
        assert_eq!(sent_ids(&mut wire), vec!["a", "a", "a"]);

        queue.notify_response("a", Ok(json!({"transactionId": 7}))).await;
        queue.pump().await.unwrap();
        assert_eq!(sent_ids(&mut wire), vec!["b"]);

        assert_eq!(start.await.unwrap()["transactionId"], 7);
        queue.notify_response("b", Ok(json!({}))).await;
        assert!(meter.await.is_ok());
        assert!(queue.is_transaction_queue_empty().await);
    }

    #[tokio::test]
    async fn test_transaction_kind_cannot_opt_out_of_ordering() {
        let (queue, _transport, mut wire) = test_queue(QueueConfig::default());
        queue
            .enqueue(call("start", MessageKind::StartTransaction), false)
            .await
            .unwrap();
        queue
            .enqueue(call("stop", MessageKind::StopTransaction), false)
            .await
            .unwrap();

        queue.pump().await.unwrap();
        assert_eq!(sent_ids(&mut wire), vec!["start"]);
        assert!(!queue.is_transaction_queue_empty().await);
    }

    #[tokio::test]
    async fn test_normal_traffic_interleaves_with_transactions() {
        let (queue, _transport, mut wire) = test_queue(QueueConfig::default());
        queue
            .enqueue(call("tx", MessageKind::StartTransaction), true)
            .await
            .unwrap();
        queue
            .enqueue(call("auth", MessageKind::Authorize), false)
            .await
            .unwrap();
        queue
            .enqueue(call("hb", MessageKind::Heartbeat), false)
            .await
            .unwrap();

        queue.pump().await.unwrap();
        assert_eq!(sent_ids(&mut wire), vec!["tx", "auth"]);

        queue.notify_response("auth", Ok(json!({}))).await;
        queue.pump().await.unwrap();
        assert_eq!(sent_ids(&mut wire), vec!["hb"]);
    }

    #[tokio::test]
    async fn test_normal_in_flight_limit() {
        let config = QueueConfig {
            normal_in_flight_limit: 2,
            ..Default::default()
        };
        let (queue, _transport, mut wire) = test_queue(config);
        for id in ["n1", "n2", "n3"] {
            queue
                .enqueue(call(id, MessageKind::DataTransfer), false)
                .await
                .unwrap();
        }

        queue.pump().await.unwrap();
        assert_eq!(sent_ids(&mut wire), vec!["n1", "n2"]);
        queue.notify_response("n2", Ok(json!({}))).await;
        queue.pump().await.unwrap();
        assert_eq!(sent_ids(&mut wire), vec!["n3"]);
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let config = QueueConfig {
            max_attempts: 2,
            ..immediate_retries()
        };
        let (queue, _transport, mut wire) = test_queue(config);
        let handle = queue
            .enqueue(call("lost", MessageKind::StopTransaction), true)
            .await
            .unwrap();

        for _ in 0..3 {
            queue.pump().await.unwrap();
            assert!(queue.on_timeout("lost").await);
        }

        assert_eq!(sent_ids(&mut wire).len(), 3);
        assert_eq!(
            handle.await,
            Err(ChargePointError::CmdTimeout {
                unique_id: "lost".to_string(),
                attempts: 2
            })
        );
        assert!(!queue.on_timeout("lost").await);
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let config = QueueConfig {
            retry_interval_secs: 3600,
            max_retry_interval_secs: 3600,
            ..Default::default()
        };
        let (queue, _transport, mut wire) = test_queue(config);
        queue
            .enqueue(call("m", MessageKind::MeterValues), true)
            .await
            .unwrap();

        queue.pump().await.unwrap();
        queue.on_timeout("m").await;
        assert_eq!(queue.pump().await.unwrap(), 0);
        assert_eq!(sent_ids(&mut wire), vec!["m"]);
    }

    #[tokio::test]
    async fn test_stale_timer_is_ignored() {
        let (queue, _transport, mut wire) = test_queue(immediate_retries());
        queue
            .enqueue(call("s", MessageKind::StartTransaction), true)
            .await
            .unwrap();

        queue.pump().await.unwrap();
        let first_generation = queue.inner.state.lock().await.table.get("s").unwrap().generation;
        queue.on_timeout("s").await;
        queue.pump().await.unwrap();

        queue.expire("s", first_generation).await;
        let state = queue.inner.state.lock().await;
        let message = state.table.get("s").unwrap();
        assert_eq!(message.attempts, 1);
        assert!(message.is_in_flight());
        drop(state);
        assert_eq!(sent_ids(&mut wire).len(), 2);
    }

    #[tokio::test]
    async fn test_stall_until_boot_accepted() {
        let (queue, _transport, mut wire) = test_queue(QueueConfig::default());
        let heartbeat = queue
            .enqueue(call("hb", MessageKind::Heartbeat), false)
            .await
            .unwrap();
        queue
            .enqueue(call("start", MessageKind::StartTransaction), true)
            .await
            .unwrap();
        let boot = queue
            .enqueue(call("boot", MessageKind::BootNotification), false)
            .await
            .unwrap();
        assert!(queue.is_stalled().await);

        queue.pump().await.unwrap();
        assert_eq!(sent_ids(&mut wire), vec!["boot"]);

        queue
            .notify_response("boot", Ok(json!({"status": "Accepted", "interval": 300})))
            .await;
        assert!(boot.await.is_ok());
        assert!(!queue.is_stalled().await);

        queue.pump().await.unwrap();
        assert_eq!(sent_ids(&mut wire), vec!["start", "hb"]);
        queue.notify_response("hb", Ok(json!({}))).await;
        assert!(heartbeat.await.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_boot_keeps_stall() {
        let config = QueueConfig {
            start_stalled: true,
            ..Default::default()
        };
        let (queue, _transport, mut wire) = test_queue(config);
        queue
            .enqueue(call("auth", MessageKind::Authorize), false)
            .await
            .unwrap();
        assert_eq!(queue.pump().await.unwrap(), 0);

        queue
            .enqueue(call("boot-1", MessageKind::BootNotification), false)
            .await
            .unwrap();
        queue.pump().await.unwrap();
        queue
            .notify_response("boot-1", Ok(json!({"status": "Rejected"})))
            .await;
        assert!(queue.is_stalled().await);
        assert_eq!(queue.pump().await.unwrap(), 0);

        queue
            .enqueue(call("boot-2", MessageKind::BootNotification), false)
            .await
            .unwrap();
        queue.pump().await.unwrap();
        queue
            .notify_response("boot-2", Ok(json!({"status": "Accepted"})))
            .await;
        queue.pump().await.unwrap();
        assert_eq!(sent_ids(&mut wire), vec!["boot-1", "boot-2", "auth"]);
    }

    #[tokio::test]
    async fn test_not_ready_defers_everything() {
        let (queue, transport, mut wire) = test_queue(QueueConfig::default());
        transport.set_connected(false);
        let mut handle = queue
            .enqueue(call("hb", MessageKind::Heartbeat), false)
            .await
            .unwrap();

        assert_eq!(queue.pump().await, Err(ChargePointError::NotReady));
        assert!(sent_ids(&mut wire).is_empty());
        assert!(handle.try_result().is_none());

        transport.set_connected(true);
        assert_eq!(queue.pump().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_still_waits_for_timeout() {
        let (queue, transport, _wire) = test_queue(QueueConfig::default());
        transport.set_fail_sends(true);
        let mut handle = queue
            .enqueue(call("hb", MessageKind::Heartbeat), false)
            .await
            .unwrap();

        assert_eq!(queue.pump().await.unwrap(), 1);
        assert!(handle.try_result().is_none());
        assert_eq!(queue.in_flight_ids().await, vec!["hb"]);
    }

    #[tokio::test]
    async fn test_call_error_classification() {
        let config = QueueConfig {
            max_attempts: 1,
            ..immediate_retries()
        };
        let (queue, _transport, mut wire) = test_queue(config);

        let schema = queue
            .enqueue(call("schema", MessageKind::DataTransfer), false)
            .await
            .unwrap();
        queue.pump().await.unwrap();
        assert!(
            queue
                .notify_error("schema", CallErrorCode::FormationViolation, "bad payload")
                .await
        );
        assert!(matches!(
            schema.await,
            Err(ChargePointError::SchemaValidationError(_))
        ));

        let internal = queue
            .enqueue(call("internal", MessageKind::StopTransaction), true)
            .await
            .unwrap();
        queue.pump().await.unwrap();
        queue
            .notify_error("internal", CallErrorCode::InternalError, "db down")
            .await;
        queue.pump().await.unwrap();
        queue
            .notify_error("internal", CallErrorCode::InternalError, "db down")
            .await;
        assert_eq!(
            internal.await,
            Err(ChargePointError::CallError {
                code: CallErrorCode::InternalError,
                description: "db down".to_string()
            })
        );
        assert_eq!(sent_ids(&mut wire), vec!["schema", "internal", "internal"]);

        assert!(
            !queue
                .notify_error("internal", CallErrorCode::NotSupported, "late")
                .await
        );
    }

    #[tokio::test]
    async fn test_receive_frames() {
        let (queue, _transport, _wire) = test_queue(QueueConfig::default());
        let ok = queue
            .enqueue(call("ok", MessageKind::Authorize), false)
            .await
            .unwrap();
        let failed = queue
            .enqueue(call("failed", MessageKind::DataTransfer), false)
            .await
            .unwrap();

        let result = CallResponse::parse(r#"[3, "ok", {"idTagInfo": {"status": "Accepted"}}]"#).unwrap();
        assert!(queue.receive(result).await);
        let error =
            CallResponse::parse(r#"[4, "failed", "NotSupported", "no vendor", {}]"#).unwrap();
        assert!(queue.receive(error).await);

        let occurrence = queue
            .enqueue(call("occurrence", MessageKind::StartTransaction), true)
            .await
            .unwrap();
        let error = CallResponse::parse(
            r#"[4, "occurrence", "OccurenceConstraintViolation", "idTag missing", {}]"#,
        )
        .unwrap();
        assert!(queue.receive(error).await);
        assert!(matches!(
            occurrence.await,
            Err(ChargePointError::SchemaValidationError(_))
        ));

        assert_eq!(ok.await.unwrap()["idTagInfo"]["status"], "Accepted");
        assert!(matches!(
            failed.await,
            Err(ChargePointError::CallError {
                code: CallErrorCode::NotSupported,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_resolves_everything() {
        let (queue, _transport, _wire) = test_queue(QueueConfig::default());
        let first = queue
            .enqueue(call("one", MessageKind::StartTransaction), true)
            .await
            .unwrap();
        let second = queue
            .enqueue(call("two", MessageKind::Heartbeat), false)
            .await
            .unwrap();
        queue.pump().await.unwrap();

        queue.shutdown().await;
        queue.shutdown().await;
        assert_eq!(first.await, Err(ChargePointError::Shutdown));
        assert_eq!(second.await, Err(ChargePointError::Shutdown));

        let late = queue
            .enqueue(call("three", MessageKind::Heartbeat), false)
            .await
            .unwrap();
        assert_eq!(late.await, Err(ChargePointError::Shutdown));
        assert_eq!(queue.pump().await, Err(ChargePointError::Shutdown));
        assert!(!queue.notify_response("one", Ok(json!({}))).await);
    }

    #[tokio::test]
    async fn test_restore_puts_stored_messages_first() {
        let store = Arc::new(InMemoryStore::new());
        let config = QueueConfig {
            persist_transaction_messages: true,
            ..Default::default()
        };

        let (transport, _wire) = ChannelTransport::new();
        let first = MessageQueue::with_store(Arc::new(transport), config.clone(), store.clone());
        first
            .enqueue(call("stop", MessageKind::StopTransaction), true)
            .await
            .unwrap();
        first
            .enqueue(call("hb", MessageKind::Heartbeat), false)
            .await
            .unwrap();
        first.pump().await.unwrap();
        first.on_timeout("stop").await;
        first.shutdown().await;
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        let (transport, mut wire) = ChannelTransport::new();
        let second = MessageQueue::with_store(Arc::new(transport), config, store.clone());
        second
            .enqueue(call("meter", MessageKind::MeterValues), true)
            .await
            .unwrap();
        assert_eq!(second.restore().await.unwrap(), 1);

        second.pump().await.unwrap();
        assert_eq!(sent_ids(&mut wire), vec!["stop"]);
        let restored_attempts = second.inner.state.lock().await.table.get("stop").unwrap().attempts;
        assert_eq!(restored_attempts, 1);

        assert!(second.notify_response("stop", Ok(json!({}))).await);
        let remaining: Vec<String> = store
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.call.unique_id)
            .collect();
        assert_eq!(remaining, vec!["meter"]);
    }

    #[tokio::test]
    async fn test_restore_waits_behind_sent_transaction() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert(StoredMessage {
                call: call("old", MessageKind::StopTransaction),
                attempts: 0,
            })
            .await
            .unwrap();
        let config = QueueConfig {
            persist_transaction_messages: true,
            ..Default::default()
        };
        let (transport, mut wire) = ChannelTransport::new();
        let queue = MessageQueue::with_store(Arc::new(transport), config, store.clone());

        queue
            .enqueue(call("new", MessageKind::StartTransaction), true)
            .await
            .unwrap();
        queue.pump().await.unwrap();

        assert_eq!(queue.restore().await.unwrap(), 1);
        assert_eq!(queue.pump().await.unwrap(), 0);
        assert_eq!(queue.in_flight_ids().await, vec!["new"]);

        queue
            .notify_response("new", Ok(json!({"transactionId": 3})))
            .await;
        queue.pump().await.unwrap();
        assert_eq!(sent_ids(&mut wire), vec!["new", "old"]);
        assert_eq!(queue.in_flight_ids().await, vec!["old"]);
    }

    #[tokio::test]
    async fn test_unbounded_retry_interval_does_not_overflow() {
        let config = QueueConfig {
            retry_interval_secs: u64::MAX,
            max_retry_interval_secs: u64::MAX,
            ..Default::default()
        };
        let (queue, _transport, mut wire) = test_queue(config);
        queue
            .enqueue(call("m", MessageKind::MeterValues), true)
            .await
            .unwrap();

        queue.pump().await.unwrap();
        assert!(queue.on_timeout("m").await);
        assert_eq!(queue.pump().await.unwrap(), 0);
        assert!(queue.in_flight_ids().await.is_empty());
        assert_eq!(sent_ids(&mut wire), vec!["m"]);
    }

    #[tokio::test]
    async fn test_local_failures_reach_caller() {
        let (queue, _transport, mut wire) = test_queue(QueueConfig::default());
        let boot = queue
            .enqueue(call("boot-1", MessageKind::BootNotification), false)
            .await
            .unwrap();
        let auth = queue
            .enqueue(call("auth", MessageKind::Authorize), false)
            .await
            .unwrap();
        queue.pump().await.unwrap();

        let parse_failure = ChargePointError::parsing("truncated BootNotification response");
        assert!(queue.notify_response("boot-1", Err(parse_failure.clone())).await);
        assert_eq!(boot.await, Err(parse_failure));
        assert!(queue.is_stalled().await);
        assert_eq!(queue.pump().await.unwrap(), 0);

        queue
            .enqueue(call("boot-2", MessageKind::BootNotification), false)
            .await
            .unwrap();
        queue.pump().await.unwrap();
        queue
            .notify_response("boot-2", Ok(json!({"status": "Accepted"})))
            .await;
        queue.pump().await.unwrap();

        let handler_failure = ChargePointError::handler("idTagInfo missing");
        assert!(queue.notify_response("auth", Err(handler_failure)).await);
        assert!(matches!(
            auth.await,
            Err(ChargePointError::HandlerException(message)) if message == "idTagInfo missing"
        ));
        assert_eq!(sent_ids(&mut wire), vec!["boot-1", "boot-2", "auth"]);
    }

    #[tokio::test]
    async fn test_try_result_is_repeatable() {
        let (queue, _transport, _wire) = test_queue(QueueConfig::default());
        let mut handle = queue
            .enqueue(call("hb", MessageKind::Heartbeat), false)
            .await
            .unwrap();
        queue.pump().await.unwrap();
        assert!(handle.try_result().is_none());

        let payload = json!({"currentTime": "2026-01-01T00:00:00Z"});
        queue.notify_response("hb", Ok(payload.clone())).await;
        assert_eq!(handle.try_result(), Some(Ok(payload.clone())));
        assert_eq!(handle.try_result(), Some(Ok(payload.clone())));
        assert_eq!(handle.await, Ok(payload));
    }

    #[tokio::test]
    async fn test_size_threshold_drops_normal_then_meter_values() {
        let config = QueueConfig {
            queues_total_size_threshold: 4,
            queue_all_messages: true,
            start_offline: true,
            ..Default::default()
        };
        let (queue, _transport, mut wire) = test_queue(config);

        let mut handles = Vec::new();
        for (id, kind, transactional) in [
            ("n1", MessageKind::Heartbeat, false),
            ("n2", MessageKind::DataTransfer, false),
            ("s", MessageKind::StartTransaction, true),
            ("m1", MessageKind::MeterValues, true),
            ("m2", MessageKind::MeterValues, true),
            ("m3", MessageKind::MeterValues, true),
            ("e", MessageKind::StopTransaction, true),
        ] {
            handles.push(queue.enqueue(call(id, kind), transactional).await.unwrap());
        }

        let pending: Vec<String> = queue
            .inner
            .state
            .lock()
            .await
            .table
            .iter()
            .map(|m| m.unique_id().to_string())
            .collect();
        assert_eq!(pending, vec!["s", "m2", "m3", "e"]);

        let mut dropped = Vec::new();
        for mut handle in handles {
            if let Some(Err(ChargePointError::Dropped(id))) = handle.try_result() {
                dropped.push(id);
            }
        }
        assert_eq!(dropped, vec!["n1", "n2", "m1"]);

        queue.resume(Duration::ZERO).await;
        assert_eq!(queue.pump().await.unwrap(), 1);
        assert_eq!(sent_ids(&mut wire), vec!["s"]);
    }

    #[tokio::test]
    async fn test_paused_queue_refuses_normal_calls() {
        let (queue, _transport, mut wire) = test_queue(QueueConfig::default());
        queue.pause().await;
        assert!(queue.is_paused().await);

        let heartbeat = queue
            .enqueue(call("hb", MessageKind::Heartbeat), false)
            .await
            .unwrap();
        assert_eq!(heartbeat.await, Err(ChargePointError::Offline));
        queue
            .enqueue(call("stop", MessageKind::StopTransaction), true)
            .await
            .unwrap();
        queue
            .enqueue(call("boot", MessageKind::BootNotification), false)
            .await
            .unwrap();

        assert_eq!(queue.pump().await, Err(ChargePointError::NotReady));
        assert_eq!(queue.pending_count().await, 2);

        queue.resume(Duration::ZERO).await;
        assert!(!queue.is_paused().await);
        queue.pump().await.unwrap();
        assert_eq!(sent_ids(&mut wire), vec!["boot"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_waits_for_reconnect_delay() {
        let (queue, _transport, mut wire) = test_queue(QueueConfig::default());
        let worker = queue.spawn_worker();

        queue.pause().await;
        queue
            .enqueue(call("stop", MessageKind::StopTransaction), true)
            .await
            .unwrap();
        queue.resume(Duration::from_secs(10)).await;
        assert!(queue.is_paused().await);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(wire.try_recv().is_err());
        assert_eq!(wire.recv().await.unwrap().unique_id, "stop");
        assert!(!queue.is_paused().await);

        // A pause during the delay cancels the pending resume
        queue.pause().await;
        queue.resume(Duration::from_secs(10)).await;
        queue.pause().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(queue.is_paused().await);

        queue.shutdown().await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_ids_filled_in_before_send() {
        let (queue, _transport, mut wire) = test_queue(QueueConfig::default());
        let start = Call::with_unique_id(
            "start",
            MessageKind::StartTransaction,
            json!({"connectorId": 1, "idTag": "TAG1", "meterStart": 0}),
        )
        .unwrap();
        let meter = Call::with_unique_id(
            "meter",
            MessageKind::MeterValues,
            json!({"connectorId": 1, "meterValue": []}),
        )
        .unwrap();
        let stop = Call::with_unique_id(
            "stop",
            MessageKind::StopTransaction,
            json!({"transactionId": -1, "meterStop": 100}),
        )
        .unwrap();
        for call in [start, meter, stop] {
            queue.enqueue(call, true).await.unwrap();
        }
        queue.add_meter_value_message_id("start", "meter").await;
        queue.add_stopped_transaction_id("stop", 42).await;
        assert!(queue.contains_stop_transaction_message(-1).await);
        assert!(!queue.contains_transaction_messages(42).await);

        queue.pump().await.unwrap();
        assert_eq!(wire.try_recv().unwrap().unique_id, "start");
        queue
            .notify_response("start", Ok(json!({"transactionId": 42})))
            .await;
        queue.notify_start_transaction_handled("start", 42).await;
        assert!(queue.contains_transaction_messages(42).await);

        queue.pump().await.unwrap();
        let sent = wire.try_recv().unwrap();
        assert_eq!(sent.unique_id, "meter");
        assert_eq!(sent.payload["transactionId"], 42);
        queue.notify_response("meter", Ok(json!({}))).await;

        queue.pump().await.unwrap();
        let sent = wire.try_recv().unwrap();
        assert_eq!(sent.unique_id, "stop");
        assert_eq!(sent.payload["transactionId"], 42);
        assert!(queue.contains_stop_transaction_message(42).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_retries_on_timer_until_exhausted() {
        let (queue, _transport, mut wire) = test_queue(QueueConfig::default());
        let worker = queue.spawn_worker();

        let handle = queue
            .enqueue(call("tx", MessageKind::StartTransaction), true)
            .await
            .unwrap();
        assert!(matches!(
            handle.await,
            Err(ChargePointError::CmdTimeout { attempts: 3, .. })
        ));
        assert_eq!(sent_ids(&mut wire).len(), 4);

        queue.shutdown().await;
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_waits_for_transport() {
        let (queue, transport, mut wire) = test_queue(QueueConfig::default());
        transport.set_connected(false);
        let worker = queue.spawn_worker();

        queue
            .enqueue(call("hb", MessageKind::Heartbeat), false)
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(wire.try_recv().is_err());

        transport.set_connected(true);
        queue.notify_ready();
        let sent = wire.recv().await.unwrap();
        assert_eq!(sent.unique_id, "hb");

        queue.shutdown().await;
        worker.await.unwrap();
    }
}
