use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use walletkit_core::envelope::{self, InboundMessage};
use walletkit_core::event::NetworkChanged;
use walletkit_core::{BridgeError, Event, EventHandler, EventKind, EventRouter, ParsedEvent, RpcClient};

use crate::config::DurabilityPolicy;
use crate::durable::{DurableEventStore, ReplayReport};
use crate::inflight::{self, Outcome};

/// JS method that starts event emission.
pub const SET_EVENTS_LISTENERS: &str = "setEventsListeners";
/// JS method that stops event emission.
pub const REMOVE_EVENT_LISTENERS: &str = "removeEventListeners";

/// Told about network changes reported by the JS side, whether or not any
/// handler is registered.
pub trait NetworkObserver: Send + Sync {
    fn network_changed(&self, change: &NetworkChanged);
}

/// JS-side listener state. The in-flight variants carry the shared outcome
/// of the call being made; no lock is held while it runs.
enum Listeners {
    Inactive,
    SettingUp(watch::Receiver<Outcome>),
    Active,
    TearingDown(watch::Receiver<Outcome>),
}

/// Restores listener state if the task making a listener call is cancelled.
struct ListenerCall<'a> {
    listeners: &'a StdMutex<Listeners>,
    on_cancel: fn() -> Listeners,
    armed: bool,
}

impl Drop for ListenerCall<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*listeners, Listeners::SettingUp(_) | Listeners::TearingDown(_)) {
            *listeners = (self.on_cancel)();
        }
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// A response; `completed` is false for unknown or duplicate ids.
    Response { completed: bool },
    /// Undecodable; `failed_call` when a pending call was failed for it.
    Malformed { failed_call: bool },
    /// Queued on the event lane.
    Event,
    /// Logged and dropped.
    Dropped,
}

/// Routes inbound transport messages to the RPC client or the event router.
///
/// Responses are completed inline by [`handle_message`](Self::handle_message).
/// Events go through a single ordered lane drained by
/// [`run_event_lane`](Self::run_event_lane), so a handler awaiting an SDK
/// call never blocks the response that call is waiting for.
pub struct MessageDispatcher {
    rpc: Arc<RpcClient>,
    router: Arc<EventRouter>,
    durable: Arc<DurableEventStore>,
    policy: DurabilityPolicy,
    network_observer: Option<Arc<dyn NetworkObserver>>,
    events: mpsc::UnboundedSender<Event>,
    listeners: StdMutex<Listeners>,
}

impl MessageDispatcher {
    pub fn new(
        rpc: Arc<RpcClient>,
        router: Arc<EventRouter>,
        durable: Arc<DurableEventStore>,
        policy: DurabilityPolicy,
        network_observer: Option<Arc<dyn NetworkObserver>>,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, lane) = mpsc::unbounded_channel();
        let dispatcher = Self {
            rpc,
            router,
            durable,
            policy,
            network_observer,
            events,
            listeners: StdMutex::new(Listeners::Inactive),
        };
        (dispatcher, lane)
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Classify one raw inbound message. Never fails.
    pub fn handle_message(&self, raw: &str) -> Routed {
        match envelope::classify(raw) {
            InboundMessage::Response(response) => Routed::Response {
                completed: self.rpc.handle_response(response),
            },
            InboundMessage::Malformed { id, reason } => Routed::Malformed {
                failed_call: self.rpc.handle_malformed(id.as_deref(), &reason),
            },
            InboundMessage::Unroutable { reason } => {
                tracing::warn!(reason, "Discarding unroutable bridge message");
                Routed::Dropped
            }
            InboundMessage::Event(envelope) => match Event::parse(envelope) {
                ParsedEvent::Known(event) => {
                    if self.events.send(event).is_err() {
                        tracing::warn!("Event lane closed, dropping event");
                        return Routed::Dropped;
                    }
                    Routed::Event
                }
                ParsedEvent::Unknown { event_type } => {
                    tracing::debug!(event_type, "Dropping event of unknown type");
                    Routed::Dropped
                }
                ParsedEvent::Invalid { event_type, reason } => {
                    tracing::warn!(%event_type, reason, "Dropping event with invalid payload");
                    Routed::Dropped
                }
            },
        }
    }

    /// Drain the event lane until every sender is gone.
    pub async fn run_event_lane(self: Arc<Self>, mut lane: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = lane.recv().await {
            self.deliver(&event).await;
        }
        tracing::debug!("Event lane closed");
    }

    /// Persist per policy, then fan out to handlers.
    pub async fn deliver(&self, event: &Event) {
        if let (EventKind::NetworkChanged(change), Some(observer)) =
            (&event.kind, &self.network_observer)
        {
            observer.network_changed(change);
        }

        let has_handlers = self.router.has_handlers();
        let mut persisted = None;
        if self.policy.should_persist(event.event_type(), has_handlers) {
            match self.durable.persist(event).await {
                Ok(key) => persisted = Some(key),
                Err(e) => {
                    tracing::error!(id = %event.id, error = %e, "Failed to persist durable event")
                }
            }
        }

        // Re-read: a handler may have registered (and replayed) meanwhile.
        if !self.router.has_handlers() {
            tracing::debug!(id = %event.id, event_type = %event.event_type(), "No handlers, event kept for replay");
            return;
        }

        let Some(key) = persisted else {
            self.router.dispatch(event).await;
            return;
        };
        // A concurrent replay may have claimed the record first.
        match self.durable.deliver(&key, event, &self.router).await {
            Ok(Some(_)) => {}
            Ok(None) => tracing::debug!(id = %event.id, key, "Durable event already delivered by replay"),
            Err(e) => tracing::error!(id = %event.id, key, error = %e, "Failed to deliver durable event"),
        }
    }

    /// Register `handler`; the first one starts JS-side listeners and
    /// replays durable events.
    ///
    /// Listener setup and replay are best effort: their failures are logged
    /// and do not undo the registration. The first registration waits on a
    /// JS call that has no deadline of its own; bound it with
    /// `tokio::time::timeout` if the runtime may stop answering.
    pub async fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        if !self.router.add_handler(handler) {
            return;
        }
        if let Err(e) = self.ensure_event_listeners_set_up().await {
            tracing::warn!(error = %e, "Failed to set up JS event listeners");
        }
        // The last handler may have left while setup was in flight.
        if !self.router.has_handlers() {
            if let Err(e) = self.remove_event_listeners_if_needed().await {
                tracing::warn!(error = %e, "Failed to remove JS event listeners");
            }
            return;
        }
        match self.durable.replay(&self.router).await {
            Ok(report) if report != ReplayReport::default() => {
                tracing::info!(
                    delivered = report.delivered,
                    retained = report.retained,
                    discarded = report.discarded,
                    skipped = report.skipped,
                    "Durable replay finished"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Durable replay failed"),
        }
    }

    /// Unregister `handler`; removing the last one stops JS-side listeners.
    /// Never waits on a listener setup still in flight.
    pub async fn remove_handler(&self, handler: &Arc<dyn EventHandler>) {
        if !self.router.remove_handler(handler) {
            return;
        }
        if let Err(e) = self.remove_event_listeners_if_needed().await {
            tracing::warn!(error = %e, "Failed to remove JS event listeners");
        }
    }

    /// Ask the JS side to emit events, once. Concurrent callers share a
    /// single `setEventsListeners` call and its result.
    pub async fn ensure_event_listeners_set_up(&self) -> Result<(), BridgeError> {
        loop {
            let lead = {
                let mut listeners = self.listeners();
                match &*listeners {
                    Listeners::Active => return Ok(()),
                    Listeners::SettingUp(outcome) => Err((outcome.clone(), true)),
                    Listeners::TearingDown(outcome) => Err((outcome.clone(), false)),
                    Listeners::Inactive => {
                        let (tx, rx) = inflight::channel();
                        *listeners = Listeners::SettingUp(rx);
                        Ok(tx)
                    }
                }
            };
            let tx = match lead {
                Ok(tx) => tx,
                // Share a setup's result; after a teardown, start over.
                Err((outcome, joined_setup)) => match inflight::join(outcome).await {
                    Some(result) if joined_setup => return result,
                    _ => continue,
                },
            };

            let mut call = ListenerCall {
                listeners: &self.listeners,
                on_cancel: || Listeners::Inactive,
                armed: true,
            };
            let result = self.rpc.call(SET_EVENTS_LISTENERS, None).await.map(|_| ());
            call.armed = false;
            self.finish_listener_call(if result.is_ok() { Listeners::Active } else { Listeners::Inactive });
            tx.send_replace(Some(result.clone()));
            result?;
            tracing::info!("JS event listeners set up");
            return Ok(());
        }
    }

    /// Stop JS-side emission if it was started and no handler is left.
    /// Returns whether a teardown call was made.
    pub async fn remove_event_listeners_if_needed(&self) -> Result<bool, BridgeError> {
        let tx = {
            let mut listeners = self.listeners();
            if !matches!(*listeners, Listeners::Active) || self.router.has_handlers() {
                return Ok(false);
            }
            let (tx, rx) = inflight::channel();
            *listeners = Listeners::TearingDown(rx);
            tx
        };

        let mut call = ListenerCall {
            listeners: &self.listeners,
            on_cancel: || Listeners::Active,
            armed: true,
        };
        let result = self.rpc.call(REMOVE_EVENT_LISTENERS, None).await.map(|_| ());
        call.armed = false;
        self.finish_listener_call(if result.is_ok() { Listeners::Inactive } else { Listeners::Active });
        tx.send_replace(Some(result.clone()));
        result?;
        tracing::info!("JS event listeners removed");
        Ok(true)
    }

    /// Settle an in-flight listener call, unless a reset replaced it.
    fn finish_listener_call(&self, settled: Listeners) {
        let mut listeners = self.listeners();
        if matches!(*listeners, Listeners::SettingUp(_) | Listeners::TearingDown(_)) {
            *listeners = settled;
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn listeners_active(&self) -> bool {
        matches!(*self.listeners(), Listeners::Active)
    }

    /// Forget listener state after the runtime is gone.
    pub fn reset_listeners(&self) {
        *self.listeners() = Listeners::Inactive;
    }
}
