use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;

use crate::error::BridgeError;
use crate::event::Event;

/// A native consumer of bridge events.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility. Identity is the `Arc`
/// allocation: registering the same `Arc` twice keeps one entry.
pub trait EventHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send + 'a>>;

    /// Handler name for logging.
    fn name(&self) -> &str {
        "handler"
    }
}

/// Adapter turning a synchronous closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Event) -> Result<(), BridgeError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> Result<(), BridgeError> + Send + Sync,
{
    fn handle<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send + 'a>> {
        Box::pin(async move { (self.f)(event) })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Per-dispatch delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

impl DispatchReport {
    /// At least one handler saw the event and none of them failed.
    pub fn fully_delivered(&self) -> bool {
        self.delivered > 0 && self.failed == 0
    }
}

/// Ordered, identity-unique set of event handlers.
///
/// The lock only guards the list itself. `dispatch` snapshots the list and
/// releases the lock before running handlers, so handlers may add or remove
/// handlers (themselves included) while being invoked. Handlers added during a
/// dispatch see only later events.
#[derive(Default)]
pub struct EventRouter {
    handlers: Mutex<Vec<Arc<dyn EventHandler>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`. Returns `true` when it is the first handler.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) -> bool {
        let mut handlers = self.lock();
        if handlers.iter().any(|h| same_handler(h, &handler)) {
            tracing::debug!(handler = handler.name(), "Handler already registered");
            return false;
        }
        handlers.push(handler);
        handlers.len() == 1
    }

    /// Unregister `handler`. Returns `true` when this removal left the
    /// router empty.
    pub fn remove_handler(&self, handler: &Arc<dyn EventHandler>) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        before != handlers.len() && handlers.is_empty()
    }

    pub fn has_handlers(&self) -> bool {
        !self.lock().is_empty()
    }

    pub fn handler_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `event` to every handler registered at call time, in
    /// registration order. A failing or panicking handler is logged and does
    /// not stop the others.
    pub async fn dispatch(&self, event: &Event) -> DispatchReport {
        let snapshot: Vec<Arc<dyn EventHandler>> = self.lock().clone();
        let mut report = DispatchReport::default();

        for handler in snapshot {
            // A handler may panic while building its future or while running it.
            let started = std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event)));
            let outcome = match started {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(panic) => Some(BridgeError::Handler(panic_message(panic.as_ref()))),
            };
            match error {
                None => report.delivered += 1,
                Some(e) => {
                    report.failed += 1;
                    tracing::error!(
                        handler = handler.name(),
                        event_id = %event.id,
                        event_type = %event.event_type(),
                        error = %e,
                        "Event handler failed"
                    );
                }
            }
        }

        report
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn EventHandler>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Disconnect, EventKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(id: &str) -> Event {
        Event {
            id: id.into(),
            kind: EventKind::Disconnect(Disconnect::default()),
            payload: serde_json::Value::Null,
        }
    }

    fn counting(name: &str, counter: Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        Arc::new(FnHandler::new(name, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    #[tokio::test]
    async fn fans_out_to_every_handler() {
        let router = EventRouter::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..5 {
            router.add_handler(counting(&format!("h{i}"), counter.clone()));
        }

        let report = router.dispatch(&event("e1")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(report.delivered, 5);
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_are_isolated() {
        let router = EventRouter::new();
        let counter = Arc::new(AtomicUsize::new(0));
        router.add_handler(counting("a", counter.clone()));
        router.add_handler(Arc::new(FnHandler::new("err", |_| {
            Err(BridgeError::Handler("nope".into()))
        })));
        router.add_handler(counting("b", counter.clone()));
        router.add_handler(Arc::new(FnHandler::new("panics", |_| -> Result<(), BridgeError> {
            panic!("handler blew up")
        })));
        router.add_handler(counting("c", counter.clone()));

        let report = router.dispatch(&event("e1")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(report, DispatchReport { delivered: 3, failed: 2 });
        assert!(!report.fully_delivered());
        assert_eq!(router.handler_count(), 5);

        router.dispatch(&event("e2")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn duplicate_registration_is_idempotent() {
        let router = EventRouter::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting("once", counter.clone());

        assert!(router.add_handler(handler.clone()));
        assert!(!router.add_handler(handler.clone()));
        router.dispatch(&event("e1")).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(router.handler_count(), 1);
    }

    #[tokio::test]
    async fn removed_handler_is_silent_until_readded() {
        let router = EventRouter::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting("h", counter.clone());

        router.add_handler(handler.clone());
        router.dispatch(&event("e1")).await;
        assert!(router.remove_handler(&handler));
        router.dispatch(&event("e2")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(router.add_handler(handler.clone()));
        router.dispatch(&event("e3")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn remove_reports_empty_only_on_last_removal() {
        let router = EventRouter::new();
        let a = counting("a", Arc::new(AtomicUsize::new(0)));
        let b = counting("b", Arc::new(AtomicUsize::new(0)));
        router.add_handler(a.clone());
        router.add_handler(b.clone());

        assert!(!router.remove_handler(&a));
        assert!(!router.remove_handler(&a));
        assert!(router.remove_handler(&b));
        assert!(!router.remove_handler(&b));
    }

    #[tokio::test]
    async fn dispatch_preserves_registration_order() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let seen = seen.clone();
            router.add_handler(Arc::new(FnHandler::new(name, move |_| {
                seen.lock().unwrap().push(name);
                Ok(())
            })));
        }

        router.dispatch(&event("e1")).await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    /// Removes itself and registers a newcomer while being invoked.
    struct Reentrant {
        router: Arc<EventRouter>,
        me: Mutex<Option<Arc<dyn EventHandler>>>,
        newcomer: Arc<dyn EventHandler>,
        calls: AtomicUsize,
    }

    impl EventHandler for Reentrant {
        fn handle<'a>(
            &'a self,
            _event: &'a Event,
        ) -> Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = self.me.lock().unwrap().take() {
                    self.router.remove_handler(&me);
                }
                self.router.add_handler(self.newcomer.clone());
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn handlers_may_mutate_router_during_dispatch() {
        let router = Arc::new(EventRouter::new());
        let newcomer_count = Arc::new(AtomicUsize::new(0));
        let tail_count = Arc::new(AtomicUsize::new(0));
        let newcomer = counting("newcomer", newcomer_count.clone());

        let reentrant = Arc::new(Reentrant {
            router: router.clone(),
            me: Mutex::new(None),
            newcomer,
            calls: AtomicUsize::new(0),
        });
        let as_handler: Arc<dyn EventHandler> = reentrant.clone();
        *reentrant.me.lock().unwrap() = Some(as_handler.clone());

        router.add_handler(as_handler);
        router.add_handler(counting("tail", tail_count.clone()));

        router.dispatch(&event("e1")).await;
        assert_eq!(reentrant.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tail_count.load(Ordering::SeqCst), 1);
        assert_eq!(newcomer_count.load(Ordering::SeqCst), 0);

        router.dispatch(&event("e2")).await;
        assert_eq!(reentrant.calls.load(Ordering::SeqCst), 1);
        assert_eq!(newcomer_count.load(Ordering::SeqCst), 1);
        assert_eq!(tail_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_keeps_each_handler_once() {
        let router = Arc::new(EventRouter::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..10 {
            let router = router.clone();
            let handler = counting(&format!("h{i}"), counter.clone());
            tasks.push(tokio::spawn(async move {
                router.add_handler(handler.clone());
                router.add_handler(handler);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(router.handler_count(), 10);
        router.dispatch(&event("e1")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
