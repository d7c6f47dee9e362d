use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use nexus_core::agent::{AgentFactory, AgentStatus, AgentTask, AlwaysOnAgent, SpawnRequest};
use nexus_core::errors::{AgentFailure, BrokerError};
use nexus_core::events::{BrokerEvent, EventKind};
use nexus_core::ids::{is_synthetic_sender, AgentId, RunId};
use nexus_core::messages::{DeliveryMode, DeliveryPreference, Message, MessageSource, Priority};
use nexus_core::session::{HistoryTurn, SessionMetadata, SessionStore, TurnRole};

use crate::bus::{panic_message, EventBus, ListenerId};
use crate::collect::{CollectionBuffers, Offer};
use crate::config::BrokerConfig;
use crate::queue::QueueManager;
use crate::router::{self, AgentDirectory};

/// Outcome delivered to [`Broker::once_agent_completes`] waiters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCompletion {
    pub agent_id: AgentId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentCompletion {
    fn succeeded(agent_id: &AgentId) -> Self {
        Self {
            agent_id: agent_id.clone(),
            success: true,
            error: None,
        }
    }

    fn failed(agent_id: &AgentId, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.clone(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// An organizational unit: the factory and session store for its spawned agents.
pub(crate) struct Unit {
    pub(crate) name: String,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) factory: Arc<dyn AgentFactory>,
}

pub(crate) struct RunningAgent {
    pub(crate) run_id: RunId,
    pub(crate) cancel: CancellationToken,
    pub(crate) settled: watch::Receiver<bool>,
    pub(crate) started: Instant,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) batch_size: usize,
    pub(crate) sender: String,
    /// Set when an interrupt claimed the follow-up dispatch.
    pub(crate) interrupted: bool,
}

/// All scheduling state. Guarded by one mutex that is never held across an await.
pub(crate) struct BrokerState {
    /// Registration order; the first entry is the primary unit.
    pub(crate) units: Vec<Unit>,
    pub(crate) always_on: HashMap<AgentId, Arc<dyn AlwaysOnAgent>>,
    pub(crate) queues: QueueManager,
    pub(crate) collect: CollectionBuffers,
    pub(crate) collect_debounce: Duration,
    pub(crate) collect_cap: usize,
    pub(crate) running: HashMap<AgentId, RunningAgent>,
    pub(crate) starting: HashSet<AgentId>,
    pub(crate) status: HashMap<AgentId, AgentStatus>,
    pub(crate) external_callers: HashMap<AgentId, BTreeSet<String>>,
    pub(crate) delivery: HashMap<AgentId, DeliveryPreference>,
    pub(crate) waiters: HashMap<AgentId, Vec<oneshot::Sender<AgentCompletion>>>,
    pub(crate) shut_down: bool,
}

impl BrokerState {
    fn new(config: &BrokerConfig) -> Self {
        Self {
            units: Vec::new(),
            always_on: HashMap::new(),
            queues: QueueManager::default(),
            collect: CollectionBuffers::default(),
            collect_debounce: config.collect_debounce(),
            collect_cap: config.collect_max_messages,
            running: HashMap::new(),
            starting: HashSet::new(),
            status: HashMap::new(),
            external_callers: HashMap::new(),
            delivery: HashMap::new(),
            waiters: HashMap::new(),
            shut_down: false,
        }
    }

    pub(crate) fn unit(&self, name: &str) -> Option<&Unit> {
        self.units.iter().find(|u| u.name == name)
    }

    pub(crate) fn status_of(&self, id: &AgentId) -> AgentStatus {
        self.status.get(id).copied().unwrap_or_default()
    }

    /// Returns the event to publish when the status actually changed.
    fn set_status(&mut self, id: &AgentId, new_status: AgentStatus) -> Option<BrokerEvent> {
        let old_status = self.status.insert(id.clone(), new_status);
        (old_status.unwrap_or_default() != new_status).then(|| BrokerEvent::AgentStatusChanged {
            agent_id: id.clone(),
            old_status,
            new_status,
            timestamp: Utc::now(),
        })
    }

    fn record_caller(&mut self, recipient: &AgentId, sender: &str) {
        if sender == recipient.as_str() || is_synthetic_sender(sender) {
            return;
        }
        self.external_callers
            .entry(recipient.clone())
            .or_default()
            .insert(sender.to_string());
    }

    /// Claim the starting mark if nothing is running, starting, or blocking.
    fn try_claim_start(&mut self, id: &AgentId) -> bool {
        let free = !self.shut_down
            && !self.running.contains_key(id)
            && !self.starting.contains(id)
            && self.queues.has_pending(id);
        if free {
            self.starting.insert(id.clone());
        }
        free
    }
}

impl AgentDirectory for BrokerState {
    fn is_always_on(&self, id: &AgentId) -> bool {
        self.always_on.contains_key(id)
    }

    fn is_running(&self, id: &AgentId) -> bool {
        self.running.contains_key(id)
    }

    fn has_unit(&self, unit: &str) -> bool {
        self.unit(unit).is_some()
    }

    fn primary_unit(&self) -> Option<&str> {
        self.units.first().map(|u| u.name.as_str())
    }
}

pub(crate) struct BrokerInner {
    pub(crate) config: BrokerConfig,
    pub(crate) state: Mutex<BrokerState>,
    pub(crate) bus: EventBus,
}

/// The agent lifecycle broker.
///
/// Owns per-agent queues and decides, for every inbound message, whether to
/// start an agent, interrupt the running one, or let it finish and drain the
/// queue afterwards. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct Broker {
    pub(crate) inner: Arc<BrokerInner>,
}

/// A launched execution waiting to be driven.
struct Run {
    run_id: RunId,
    cancel: CancellationToken,
    settled: watch::Sender<bool>,
    task_description: String,
    store: Arc<dyn SessionStore>,
}

enum Decision {
    Interrupt {
        cancel: CancellationToken,
        settled: watch::Receiver<bool>,
    },
    Start,
    Defer,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let state = BrokerState::new(&config);
        let bus = EventBus::new(config.event_channel_capacity);
        Self {
            inner: Arc::new(BrokerInner {
                config,
                state: Mutex::new(state),
                bus,
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    // ── Registration ──

    /// Register (or replace) the factory and session store of a unit.
    pub fn register_unit(
        &self,
        name: impl Into<String>,
        store: Arc<dyn SessionStore>,
        factory: Arc<dyn AgentFactory>,
    ) {
        let name = name.into();
        let mut st = self.inner.state.lock();
        match st.units.iter_mut().find(|u| u.name == name) {
            Some(unit) => {
                unit.store = store;
                unit.factory = factory;
            }
            None => st.units.push(Unit {
                name: name.clone(),
                store,
                factory,
            }),
        }
        info!(unit = %name, "organizational unit registered");
    }

    pub fn register_always_on(&self, agent_id: AgentId, agent: Arc<dyn AlwaysOnAgent>) {
        info!(agent_id = %agent_id, "always-on agent registered");
        self.inner.state.lock().always_on.insert(agent_id, agent);
    }

    pub fn set_delivery_mode(&self, agent_id: &AgentId, preference: DeliveryPreference) {
        debug!(agent_id = %agent_id, ?preference, "delivery preference set");
        self.inner
            .state
            .lock()
            .delivery
            .insert(agent_id.clone(), preference);
    }

    /// Applies to offers made after the call.
    pub fn set_collection_params(&self, debounce: Duration, max_messages: usize) {
        let mut st = self.inner.state.lock();
        st.collect_debounce = debounce;
        st.collect_cap = max_messages.max(1);
    }

    // ── Events ──

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&BrokerEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.bus.off(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.bus.subscribe()
    }

    fn emit_all(&self, events: impl IntoIterator<Item = BrokerEvent>) {
        for event in events {
            self.inner.bus.emit(event);
        }
    }

    // ── Sending ──

    /// Route, enqueue, and schedule a message.
    ///
    /// Only routing failures are returned. Execution outcomes are reported
    /// through [`Broker::once_agent_completes`] and the event bus.
    #[instrument(skip_all, fields(from = %message.from, to = %message.to))]
    pub async fn send(&self, mut message: Message) -> Result<(), BrokerError> {
        let (recipient, always_on) = self.admit(&message, false)?;
        message.to = recipient.to_string();
        debug!(
            agent_id = %recipient,
            mode = ?message.delivery_mode,
            preview = message.preview(),
            "message admitted"
        );

        match message.delivery_mode {
            DeliveryMode::Collect => {
                self.offer_collect(recipient, message);
                return Ok(());
            }
            DeliveryMode::Steer => {
                message.priority = Priority::Urgent;
                message.delivery_mode = DeliveryMode::Interrupt;
            }
            _ => {}
        }

        self.enqueue(&recipient, message.clone());

        if let Some(agent) = always_on {
            self.hand_off(&recipient, &agent, &message);
            self.spawn_process_queue(recipient, agent);
            return Ok(());
        }

        self.schedule(&recipient, &message).await;
        Ok(())
    }

    /// Deliver to an always-on agent and wait for its acknowledgement.
    #[instrument(skip_all, fields(from = %message.from, to = %message.to))]
    pub async fn send_and_wait_for_ack(&self, mut message: Message) -> Result<String, BrokerError> {
        let (recipient, always_on) = self.admit(&message, true)?;
        let agent = always_on.ok_or_else(|| BrokerError::NotAlwaysOn(recipient.to_string()))?;
        message.to = recipient.to_string();

        self.enqueue(&recipient, message.clone());
        self.hand_off(&recipient, &agent, &message);
        let ack = agent.process_queue().await?;
        debug!(agent_id = %recipient, "always-on agent acknowledged");
        Ok(ack)
    }

    /// Resolve the recipient, check it can be served, and record the caller.
    fn admit(
        &self,
        message: &Message,
        require_always_on: bool,
    ) -> Result<(AgentId, Option<Arc<dyn AlwaysOnAgent>>), BrokerError> {
        let mut st = self.inner.state.lock();
        let recipient = router::resolve(
            &*st,
            &self.inner.config.default_unit,
            &message.from,
            &message.to,
        )?;

        let always_on = st.always_on.get(&recipient).cloned();
        if always_on.is_none() {
            if require_always_on {
                return Err(BrokerError::NotAlwaysOn(recipient.to_string()));
            }
            let unit = recipient.unit().unwrap_or_default();
            if !st.has_unit(unit) {
                return Err(BrokerError::UnregisteredUnit {
                    unit: unit.to_string(),
                    agent_id: recipient.to_string(),
                });
            }
        }

        st.record_caller(&recipient, &message.from);
        Ok((recipient, always_on))
    }

    fn enqueue(&self, recipient: &AgentId, message: Message) {
        let message_id = message.id.clone();
        let from = message.from.clone();
        let priority = message.priority;
        let queue_size = self.inner.state.lock().queues.enqueue(recipient, message);

        debug!(agent_id = %recipient, queue_size, priority = %priority, "message queued");
        self.inner.bus.emit(BrokerEvent::MessageQueued {
            message_id,
            from,
            to: recipient.clone(),
            priority,
            timestamp: Utc::now(),
            queue_size,
        });
    }

    /// Move a queued message out of the broker and into an always-on agent.
    fn hand_off(&self, recipient: &AgentId, agent: &Arc<dyn AlwaysOnAgent>, message: &Message) {
        self.inner
            .state
            .lock()
            .queues
            .remove(recipient, &message.id);
        agent.queue_message(&message.content, message.priority, &message.from);
    }

    fn spawn_process_queue(&self, recipient: AgentId, agent: Arc<dyn AlwaysOnAgent>) {
        tokio::spawn(async move {
            match agent.process_queue().await {
                Ok(_) => debug!(agent_id = %recipient, "always-on agent processed queue"),
                Err(e) => error!(
                    agent_id = %recipient,
                    error = %e,
                    kind = e.error_kind(),
                    "always-on agent failed to process queue"
                ),
            }
        });
    }

    async fn schedule(&self, recipient: &AgentId, message: &Message) {
        let threshold = self.inner.config.high_priority_threshold();
        let decision = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            if st.shut_down {
                Decision::Defer
            } else {
                let interrupt = |run: &RunningAgent| {
                    should_interrupt(recipient, message, run.started.elapsed(), threshold)
                };
                match st.running.get_mut(recipient) {
                    Some(run) if interrupt(&*run) => {
                        run.interrupted = true;
                        Decision::Interrupt {
                            cancel: run.cancel.clone(),
                            settled: run.settled.clone(),
                        }
                    }
                    Some(_) => Decision::Defer,
                    None if st.starting.contains(recipient) => Decision::Defer,
                    None => {
                        st.starting.insert(recipient.clone());
                        Decision::Start
                    }
                }
            }
        };

        match decision {
            Decision::Start => {
                info!(agent_id = %recipient, "processing batch");
                self.spawn_chain(recipient.clone());
            }
            Decision::Interrupt { cancel, mut settled } => {
                info!(
                    agent_id = %recipient,
                    priority = %message.priority,
                    "interrupting running agent"
                );
                cancel.cancel();
                let _ = settled.wait_for(|done| *done).await;
                self.try_start(recipient);
            }
            Decision::Defer => {
                debug!(agent_id = %recipient, "agent busy, message waits for current run");
            }
        }
    }

    fn try_start(&self, recipient: &AgentId) -> bool {
        let claimed = self.inner.state.lock().try_claim_start(recipient);
        if claimed {
            self.spawn_chain(recipient.clone());
        }
        claimed
    }

    // ── Execution chain ──

    /// Drive executions for `recipient` until the queue is drained or a run
    /// ends without claiming the next batch. The caller holds the starting mark.
    fn spawn_chain(&self, recipient: AgentId) {
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                let Some((run, task)) = broker.launch(&recipient).await else {
                    return;
                };
                let outcome = match AssertUnwindSafe(task.execute(run.cancel.clone()))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => Err(AgentFailure::Panicked(panic_message(panic.as_ref()))),
                };
                if !broker.finish(&recipient, run, outcome).await {
                    return;
                }
            }
        });
    }

    /// Dequeue the next batch and construct its execution. Clears the
    /// starting mark on every path.
    async fn launch(&self, recipient: &AgentId) -> Option<(Run, Box<dyn AgentTask>)> {
        let (batch, unit) = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let preference = st.delivery.get(recipient).copied().unwrap_or_default();
            let batch: Vec<Message> = match preference {
                DeliveryPreference::Batch => st.queues.dequeue_batch(recipient),
                DeliveryPreference::Single => {
                    st.queues.dequeue_one(recipient).into_iter().collect()
                }
            };
            if batch.is_empty() {
                st.starting.remove(recipient);
                return None;
            }
            let unit = recipient
                .unit()
                .and_then(|name| st.unit(name))
                .map(|u| (Arc::clone(&u.store), Arc::clone(&u.factory)));
            (batch, unit)
        };

        let Some((store, factory)) = unit else {
            let unit = recipient.unit().unwrap_or_default().to_string();
            let failure = AgentFailure::Construction(format!("unit {unit} not registered"));
            self.fail_launch(recipient, failure);
            return None;
        };

        let history = self.prepare_session(recipient, store.as_ref()).await;
        let task_description = build_task_description(&batch);
        let request = SpawnRequest {
            agent_id: recipient.clone(),
            task_description: task_description.clone(),
            history,
        };

        let task = match AssertUnwindSafe(factory.create(request)).catch_unwind().await {
            Ok(Ok(task)) => task,
            Ok(Err(failure)) => {
                self.fail_launch(recipient, failure);
                return None;
            }
            Err(panic) => {
                let failure = AgentFailure::Construction(panic_message(panic.as_ref()));
                self.fail_launch(recipient, failure);
                return None;
            }
        };

        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let (settled_tx, settled_rx) = watch::channel(false);
        let batch_size = batch.len();
        let sender = batch[0].from.clone();

        let events = {
            let mut st = self.inner.state.lock();
            let mut events: Vec<BrokerEvent> =
                st.set_status(recipient, AgentStatus::Active).into_iter().collect();
            events.push(BrokerEvent::AgentStarted {
                agent_id: recipient.clone(),
                unit: recipient.unit().unwrap_or_default().to_string(),
                timestamp: Utc::now(),
                queue_size: batch_size,
            });
            if st.shut_down {
                cancel.cancel();
            }
            st.running.insert(
                recipient.clone(),
                RunningAgent {
                    run_id: run_id.clone(),
                    cancel: cancel.clone(),
                    settled: settled_rx,
                    started: Instant::now(),
                    started_at: Utc::now(),
                    batch_size,
                    sender: sender.clone(),
                    interrupted: false,
                },
            );
            st.starting.remove(recipient);
            events
        };
        self.emit_all(events);
        info!(agent_id = %recipient, run_id = %run_id, batch_size, from = %sender, "agent started");

        Some((
            Run {
                run_id,
                cancel,
                settled: settled_tx,
                task_description,
                store,
            },
            task,
        ))
    }

    /// Load history and register or refresh the session record. Store
    /// failures are tolerated; the agent then starts with no history.
    async fn prepare_session(
        &self,
        recipient: &AgentId,
        store: &dyn SessionStore,
    ) -> Vec<HistoryTurn> {
        let (metadata, history) = match store.load(recipient).await {
            Ok(Some(record)) => {
                let mut metadata = record.metadata;
                metadata.updated_at = Utc::now();
                (metadata, record.history)
            }
            Ok(None) => (SessionMetadata::new(recipient.display_name()), Vec::new()),
            Err(e) => {
                warn!(
                    agent_id = %recipient,
                    error = %e,
                    "failed to load session, starting with empty history"
                );
                return Vec::new();
            }
        };
        if let Err(e) = store.write_metadata(recipient, metadata).await {
            warn!(agent_id = %recipient, error = %e, "failed to register agent session");
        }
        history
    }

    /// The batch is consumed: report the failure and release the starting mark.
    fn fail_launch(&self, recipient: &AgentId, failure: AgentFailure) {
        error!(
            agent_id = %recipient,
            error = %failure,
            kind = failure.error_kind(),
            "failed to launch agent"
        );
        let (events, waiters) = {
            let mut st = self.inner.state.lock();
            st.starting.remove(recipient);
            let mut events: Vec<BrokerEvent> =
                st.set_status(recipient, AgentStatus::Idle).into_iter().collect();
            events.push(completed_event(recipient, Some(failure.to_string())));
            (events, st.waiters.remove(recipient).unwrap_or_default())
        };
        self.emit_all(events);
        let completion = AgentCompletion::failed(recipient, failure.to_string());
        for waiter in waiters {
            let _ = waiter.send(completion.clone());
        }
    }

    /// Settle a run. Returns whether the chain should launch the next batch,
    /// in which case the starting mark has been claimed.
    async fn finish(
        &self,
        recipient: &AgentId,
        run: Run,
        outcome: Result<String, AgentFailure>,
    ) -> bool {
        if let Ok(result) = &outcome {
            if self.inner.config.record_turns {
                record_turns(recipient, run.store.as_ref(), &run.task_description, result).await;
            }
        }

        let success = outcome.is_ok();
        let error_text = outcome.as_ref().err().map(ToString::to_string);

        let (events, waiters, next) = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let ours = st
                .running
                .get(recipient)
                .is_some_and(|r| r.run_id == run.run_id);
            let interrupted = ours
                && st
                    .running
                    .remove(recipient)
                    .is_some_and(|r| r.interrupted);

            let mut events: Vec<BrokerEvent> =
                st.set_status(recipient, AgentStatus::Idle).into_iter().collect();
            events.push(completed_event(recipient, error_text.clone()));
            let waiters = st.waiters.remove(recipient).unwrap_or_default();
            let next = success && !interrupted && st.try_claim_start(recipient);
            (events, waiters, next)
        };
        run.settled.send_replace(true);
        self.emit_all(events);

        let completion = match &error_text {
            None => AgentCompletion::succeeded(recipient),
            Some(error) => AgentCompletion::failed(recipient, error.clone()),
        };
        for waiter in waiters {
            let _ = waiter.send(completion.clone());
        }

        match &outcome {
            Ok(_) => info!(agent_id = %recipient, run_id = %run.run_id, "agent completed"),
            Err(AgentFailure::Cancelled) => {
                info!(agent_id = %recipient, run_id = %run.run_id, "agent cancelled")
            }
            Err(e) => error!(
                agent_id = %recipient,
                run_id = %run.run_id,
                error = %e,
                kind = e.error_kind(),
                "agent failed"
            ),
        }
        if next {
            debug!(agent_id = %recipient, "draining queued messages");
        }
        next
    }

    // ── Collect mode ──

    fn offer_collect(&self, recipient: AgentId, message: Message) {
        let (offer, debounce) = {
            let mut st = self.inner.state.lock();
            let cap = st.collect_cap;
            (st.collect.offer(&recipient, message, cap), st.collect_debounce)
        };

        match offer {
            Offer::Flush(messages) => {
                let count = messages.len();
                debug!(agent_id = %recipient, count, "collect cap reached, flushing");
                self.release(&recipient, messages);
            }
            Offer::Arm { generation, replaced } => {
                if let Some(timer) = replaced {
                    timer.abort();
                }
                let broker = self.clone();
                let target = recipient.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(debounce).await;
                    let messages = broker
                        .inner
                        .state
                        .lock()
                        .collect
                        .take_if_current(&target, generation);
                    if let Some(messages) = messages {
                        let count = messages.len();
                        debug!(agent_id = %target, count, "collect debounce elapsed, flushing");
                        broker.release(&target, messages);
                    }
                });
                self.inner
                    .state
                    .lock()
                    .collect
                    .attach_timer(&recipient, generation, timer.abort_handle());
            }
        }
    }

    /// Flush a recipient's collection buffer now, cancelling its timer.
    pub fn flush_collection(&self, recipient: &AgentId) {
        let messages = self.inner.state.lock().collect.take(recipient);
        if !messages.is_empty() {
            self.release(recipient, messages);
        }
    }

    /// Enqueue collected messages one by one, then deliver or dispatch.
    fn release(&self, recipient: &AgentId, messages: Vec<Message>) {
        let always_on = self.inner.state.lock().always_on.get(recipient).cloned();
        for message in &messages {
            self.enqueue(recipient, message.clone());
        }
        match always_on {
            Some(agent) => {
                for message in &messages {
                    self.hand_off(recipient, &agent, message);
                }
                self.spawn_process_queue(recipient.clone(), agent);
            }
            None => {
                self.try_start(recipient);
            }
        }
    }

    // ── Completion & shutdown ──

    /// Resolves on the agent's next completion, success or failure.
    ///
    /// The waiter is registered when this is called, not when the future is
    /// first polled.
    pub fn once_agent_completes(
        &self,
        agent_id: &AgentId,
    ) -> impl Future<Output = AgentCompletion> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.inner
            .state
            .lock()
            .waiters
            .entry(agent_id.clone())
            .or_default()
            .push(tx);
        let agent_id = agent_id.clone();
        async move {
            rx.await
                .unwrap_or_else(|_| AgentCompletion::failed(&agent_id, "broker shut down"))
        }
    }

    /// Cancel every running execution and drop pending collection buffers.
    /// No new runs start afterwards. Returns the number of cancelled runs.
    pub fn shutdown(&self) -> usize {
        let (cancels, dropped) = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            st.shut_down = true;
            let cancels: Vec<CancellationToken> =
                st.running.values().map(|r| r.cancel.clone()).collect();
            let running = &st.running;
            st.waiters.retain(|id, _| running.contains_key(id));
            (cancels, st.collect.clear())
        };
        for cancel in &cancels {
            cancel.cancel();
        }
        info!(cancelled = cancels.len(), dropped_collected = dropped, "broker shut down");
        cancels.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }
}

fn completed_event(agent_id: &AgentId, error: Option<String>) -> BrokerEvent {
    BrokerEvent::AgentCompleted {
        agent_id: agent_id.clone(),
        unit: agent_id.unit().unwrap_or_default().to_string(),
        timestamp: Utc::now(),
        success: error.is_none(),
        error,
    }
}

async fn record_turns(recipient: &AgentId, store: &dyn SessionStore, task: &str, result: &str) {
    for turn in [
        HistoryTurn::new(TurnRole::User, task),
        HistoryTurn::new(TurnRole::Assistant, result),
    ] {
        if let Err(e) = store.append(recipient, turn).await {
            warn!(agent_id = %recipient, error = %e, "failed to record turn");
            return;
        }
    }
}

/// Whether `message` should cancel the recipient's current run.
pub(crate) fn should_interrupt(
    recipient: &AgentId,
    message: &Message,
    running_for: Duration,
    high_priority_threshold: Duration,
) -> bool {
    if recipient.targets_always_on() {
        match message.source() {
            Some(MessageSource::User) => return true,
            Some(MessageSource::Ea) => return false,
            _ => {}
        }
    }
    if message.delivery_mode == DeliveryMode::Interrupt {
        return true;
    }
    match message.priority {
        Priority::Urgent => true,
        Priority::High => running_for > high_priority_threshold,
        _ => false,
    }
}

/// One message is passed as-is; several become numbered blocks.
pub(crate) fn build_task_description(batch: &[Message]) -> String {
    if let [only] = batch {
        return only.content.clone();
    }
    batch
        .iter()
        .enumerate()
        .map(|(i, m)| format!("Message {}:\n{}", i + 1, m.content))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}
