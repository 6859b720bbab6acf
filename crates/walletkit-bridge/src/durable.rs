use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use walletkit_core::envelope::EventEnvelope;
use walletkit_core::{BridgeError, DispatchReport, Event, EventRouter, ParsedEvent};
use walletkit_storage::{KeyValueStorage, StorageError};

/// Storage key (or key prefix, when namespaced) of the durable event record.
pub const DURABLE_EVENTS_KEY: &str = "durable_events";

/// Completed records kept per store before the oldest are pruned.
pub const DEFAULT_COMPLETED_RETENTION: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurableStatus {
    New,
    Completed,
}

/// One persisted arrival of an event.
///
/// Records are stored under `<event id>#<seq>`, so an event that arrives
/// twice is kept twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableEvent {
    /// Record key in the stored JSON object.
    #[serde(skip)]
    pub key: String,
    /// Event id. Records written before ids were stored fall back to the key.
    #[serde(default)]
    pub id: String,
    pub status: DurableStatus,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Arrival order within this store.
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub delivered: usize,
    /// Left as `new` for the next pass.
    pub retained: usize,
    /// Could not be rehydrated into a known event; marked completed.
    pub discarded: usize,
    /// Already being delivered, or completed, by a live dispatch.
    pub skipped: usize,
}

type Records = BTreeMap<String, DurableEvent>;

/// Events persisted until a handler has seen them.
///
/// All records live under one storage key as a JSON object keyed by record
/// key. Every read-modify-write goes through `records`, so concurrent
/// persists and completions do not lose each other's updates. A record is
/// delivered only by whoever claims it first, live dispatch or replay.
pub struct DurableEventStore {
    storage: Arc<dyn KeyValueStorage>,
    key: String,
    completed_retention: usize,
    records: Mutex<()>,
    replaying: Mutex<()>,
    claimed: StdMutex<HashSet<String>>,
}

/// Releases a claimed record when delivery finishes or is cancelled.
struct Claim<'a> {
    store: &'a DurableEventStore,
    key: &'a str,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.store.claimed().remove(self.key);
    }
}

impl DurableEventStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self::with_key(storage, DURABLE_EVENTS_KEY.to_string())
    }

    /// Store under `durable_events:<namespace>`, e.g. one per engine.
    pub fn namespaced(storage: Arc<dyn KeyValueStorage>, namespace: &str) -> Self {
        Self::with_key(storage, format!("{DURABLE_EVENTS_KEY}:{namespace}"))
    }

    pub fn with_key(storage: Arc<dyn KeyValueStorage>, key: String) -> Self {
        Self {
            storage,
            key,
            completed_retention: DEFAULT_COMPLETED_RETENTION,
            records: Mutex::new(()),
            replaying: Mutex::new(()),
            claimed: StdMutex::new(HashSet::new()),
        }
    }

    /// Keep at most `retention` completed records; older ones are pruned
    /// whenever a record completes. `new` records are never pruned.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.completed_retention = retention;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Persist this arrival of `event` as `new` and return its record key.
    pub async fn persist(&self, event: &Event) -> Result<String, BridgeError> {
        let _guard = self.records.lock().await;
        let mut records = self.load().await?;

        let seq = records.values().map(|r| r.seq).max().map_or(0, |max| max + 1);
        let key = format!("{}#{seq}", event.id);
        records.insert(
            key.clone(),
            DurableEvent {
                key: key.clone(),
                id: event.id.clone(),
                status: DurableStatus::New,
                event_type: event.event_type().as_str().to_string(),
                payload: event.payload.clone(),
                created_at: Utc::now(),
                seq,
            },
        );
        self.store(&records).await?;
        tracing::info!(id = %event.id, event_type = %event.event_type(), seq, "Durable event persisted");
        Ok(key)
    }

    /// Flip the record under `key` to `completed`, pruning completed records
    /// beyond the retention limit. Returns `false` if the key is unknown.
    pub async fn mark_completed(&self, key: &str) -> Result<bool, BridgeError> {
        let _guard = self.records.lock().await;
        let mut records = self.load().await?;
        let Some(record) = records.get_mut(key) else {
            return Ok(false);
        };
        if record.status == DurableStatus::Completed {
            return Ok(true);
        }
        record.status = DurableStatus::Completed;
        let pruned = self.prune_completed(&mut records);
        self.store(&records).await?;
        tracing::debug!(key, pruned, "Durable event completed");
        Ok(true)
    }

    fn prune_completed(&self, records: &mut Records) -> usize {
        let mut completed: Vec<(u64, String)> = records
            .values()
            .filter(|r| r.status == DurableStatus::Completed)
            .map(|r| (r.seq, r.key.clone()))
            .collect();
        let excess = completed.len().saturating_sub(self.completed_retention);
        if excess == 0 {
            return 0;
        }
        completed.sort_unstable();
        for (_, key) in completed.into_iter().take(excess) {
            records.remove(&key);
        }
        excess
    }

    /// `new` records in arrival order.
    pub async fn pending(&self) -> Result<Vec<DurableEvent>, BridgeError> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|r| r.status == DurableStatus::New)
            .collect())
    }

    /// Every record in arrival order.
    pub async fn all(&self) -> Result<Vec<DurableEvent>, BridgeError> {
        let _guard = self.records.lock().await;
        let mut records: Vec<DurableEvent> = self.load().await?.into_values().collect();
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }

    /// Drop `completed` records. Returns how many were removed.
    pub async fn purge_completed(&self) -> Result<usize, BridgeError> {
        let _guard = self.records.lock().await;
        let mut records = self.load().await?;
        let before = records.len();
        records.retain(|_, r| r.status == DurableStatus::New);
        let purged = before - records.len();
        if purged > 0 {
            self.store(&records).await?;
        }
        Ok(purged)
    }

    pub async fn clear(&self) -> Result<(), BridgeError> {
        let _guard = self.records.lock().await;
        self.storage.remove(&self.key).await.map_err(storage_error)
    }

    /// Dispatch the persisted record `key` to `router` and mark it completed
    /// once fully delivered.
    ///
    /// Returns `None` without dispatching when the record is gone, already
    /// completed, or currently being delivered elsewhere.
    pub async fn deliver(
        &self,
        key: &str,
        event: &Event,
        router: &EventRouter,
    ) -> Result<Option<DispatchReport>, BridgeError> {
        let Some(_claim) = self.claim(key).await? else {
            return Ok(None);
        };
        let report = router.dispatch(event).await;
        if report.fully_delivered() {
            self.mark_completed(key).await?;
        } else {
            tracing::warn!(
                key,
                delivered = report.delivered,
                failed = report.failed,
                "Durable event not fully delivered, keeping for next replay"
            );
        }
        Ok(Some(report))
    }

    async fn claim<'a>(&'a self, key: &'a str) -> Result<Option<Claim<'a>>, BridgeError> {
        let _guard = self.records.lock().await;
        let records = self.load().await?;
        let claimable = records
            .get(key)
            .is_some_and(|r| r.status == DurableStatus::New);
        if !claimable || !self.claimed().insert(key.to_string()) {
            return Ok(None);
        }
        Ok(Some(Claim { store: self, key }))
    }

    fn claimed(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver every `new` record to `router` in arrival order, marking each
    /// one completed once fully delivered.
    ///
    /// Only one replay runs at a time; a replay requested while another is in
    /// progress (for example from a handler re-registering itself) is skipped.
    pub async fn replay(&self, router: &EventRouter) -> Result<ReplayReport, BridgeError> {
        let Ok(_replaying) = self.replaying.try_lock() else {
            tracing::debug!(key = %self.key, "Durable replay already in progress");
            return Ok(ReplayReport::default());
        };

        let pending = self.pending().await?;
        let mut report = ReplayReport::default();
        if pending.is_empty() {
            return Ok(report);
        }
        tracing::info!(count = pending.len(), key = %self.key, "Replaying durable events");

        for record in pending {
            let envelope = EventEnvelope {
                id: Some(record.id.clone()),
                event_type: record.event_type.clone(),
                payload: record.payload.clone(),
            };
            let event = match Event::parse(envelope) {
                ParsedEvent::Known(event) => event,
                ParsedEvent::Unknown { event_type } => {
                    tracing::warn!(key = %record.key, event_type, "Discarding durable event of unknown type");
                    self.mark_completed(&record.key).await?;
                    report.discarded += 1;
                    continue;
                }
                ParsedEvent::Invalid { event_type, reason } => {
                    tracing::warn!(key = %record.key, %event_type, reason, "Discarding invalid durable event");
                    self.mark_completed(&record.key).await?;
                    report.discarded += 1;
                    continue;
                }
            };

            if !router.has_handlers() {
                report.retained += 1;
                continue;
            }
            match self.deliver(&record.key, &event, router).await? {
                Some(dispatched) if dispatched.fully_delivered() => report.delivered += 1,
                Some(_) => report.retained += 1,
                None => report.skipped += 1,
            }
        }
        Ok(report)
    }

    async fn load(&self) -> Result<Records, BridgeError> {
        let Some(raw) = self.storage.get(&self.key).await.map_err(storage_error)? else {
            return Ok(Records::new());
        };
        let mut records: Records = serde_json::from_str(&raw).map_err(|e| {
            storage_error(StorageError::Serialization(format!("{}: {e}", self.key)))
        })?;
        for (key, record) in records.iter_mut() {
            record.key = key.clone();
            if record.id.is_empty() {
                record.id = key.clone();
            }
        }
        Ok(records)
    }

    async fn store(&self, records: &Records) -> Result<(), BridgeError> {
        let raw = serde_json::to_string(records)
            .map_err(|e| storage_error(StorageError::Serialization(e.to_string())))?;
        self.storage
            .save(&self.key, &raw)
            .await
            .map_err(storage_error)
    }
}

/// Storage failures surface as bridge errors, never raw.
pub(crate) fn storage_error(e: StorageError) -> BridgeError {
    BridgeError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use serde_json::json;
    use walletkit_core::{EventHandler, FnHandler};
    use walletkit_storage::MemoryStorage;

    fn connect_event(id: &str) -> Event {
        let envelope = EventEnvelope {
            id: None,
            event_type: "connectRequest".into(),
            payload: json!({ "id": id, "dappName": "Demo" }),
        };
        match Event::parse(envelope) {
            ParsedEvent::Known(event) => event,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn counting_handler(count: Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        Arc::new(FnHandler::new("counter", move |_: &Event| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    #[tokio::test]
    async fn every_arrival_gets_its_own_record() {
        let store = DurableEventStore::new(Arc::new(MemoryStorage::new()));
        assert_eq!(store.persist(&connect_event("a")).await.unwrap(), "a#0");
        assert_eq!(store.persist(&connect_event("a")).await.unwrap(), "a#1");
        assert_eq!(store.persist(&connect_event("b")).await.unwrap(), "b#2");

        let pending = store.pending().await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "a", "b"]);
        assert_eq!(pending[0].status, DurableStatus::New);
        assert_eq!(pending[0].event_type, "connectRequest");
    }

    #[tokio::test]
    async fn repeated_arrivals_are_each_replayed() {
        let store = DurableEventStore::new(Arc::new(MemoryStorage::new()));
        store.persist(&connect_event("dup")).await.unwrap();
        store.persist(&connect_event("dup")).await.unwrap();

        let router = EventRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        router.add_handler(counting_handler(count.clone()));

        let report = store.replay(&router).await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn arrival_after_completion_is_pending_again() {
        let store = DurableEventStore::new(Arc::new(MemoryStorage::new()));
        let first = store.persist(&connect_event("a")).await.unwrap();
        store.mark_completed(&first).await.unwrap();

        let second = store.persist(&connect_event("a")).await.unwrap();
        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, second);
        assert_eq!(pending[0].id, "a");
    }

    #[tokio::test]
    async fn stored_record_is_a_json_object_keyed_by_arrival() {
        let storage = Arc::new(MemoryStorage::new());
        let store = DurableEventStore::new(storage.clone());
        store.persist(&connect_event("req-1")).await.unwrap();

        let raw = storage.get(DURABLE_EVENTS_KEY).await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        let record = &value["req-1#0"];
        assert_eq!(record["id"], "req-1");
        assert_eq!(record["status"], "new");
        assert_eq!(record["type"], "connectRequest");
        assert_eq!(record["payload"]["dappName"], "Demo");
        assert!(record["createdAt"].is_string());
        assert!(record.get("key").is_none());
    }

    #[tokio::test]
    async fn replay_delivers_once_and_completes() {
        let store = DurableEventStore::new(Arc::new(MemoryStorage::new()));
        store.persist(&connect_event("a")).await.unwrap();
        store.persist(&connect_event("b")).await.unwrap();

        let router = EventRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        router.add_handler(counting_handler(count.clone()));

        let report = store.replay(&router).await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(store.pending().await.unwrap().is_empty());

        let again = store.replay(&router).await.unwrap();
        assert_eq!(again, ReplayReport::default());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_delivery_stays_new() {
        let store = DurableEventStore::new(Arc::new(MemoryStorage::new()));
        store.persist(&connect_event("a")).await.unwrap();

        let router = EventRouter::new();
        router.add_handler(Arc::new(FnHandler::new("broken", |_: &Event| {
            Err(BridgeError::Handler("not yet".into()))
        })));

        let report = store.replay(&router).await.unwrap();
        assert_eq!(report.retained, 1);
        assert_eq!(store.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replay_without_handlers_retains_everything() {
        let store = DurableEventStore::new(Arc::new(MemoryStorage::new()));
        store.persist(&connect_event("a")).await.unwrap();
        let report = store.replay(&EventRouter::new()).await.unwrap();
        assert_eq!(report.retained, 1);
    }

    #[tokio::test]
    async fn unknown_types_are_discarded_on_replay() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .save(
                DURABLE_EVENTS_KEY,
                r#"{"x":{"status":"new","type":"legacyEvent","payload":{},"createdAt":"2026-01-01T00:00:00Z","seq":0}}"#,
            )
            .await
            .unwrap();
        let store = DurableEventStore::new(storage);
        let router = EventRouter::new();
        router.add_handler(counting_handler(Arc::new(AtomicUsize::new(0))));

        let report = store.replay(&router).await.unwrap();
        assert_eq!(report.discarded, 1);
        assert!(store.pending().await.unwrap().is_empty());

        let records = store.all().await.unwrap();
        assert_eq!(records[0].key, "x");
        assert_eq!(records[0].id, "x", "records without an id fall back to their key");
    }

    #[tokio::test]
    async fn purge_and_clear() {
        let store = DurableEventStore::namespaced(Arc::new(MemoryStorage::new()), "mainnet");
        assert_eq!(store.key(), "durable_events:mainnet");
        let a = store.persist(&connect_event("a")).await.unwrap();
        store.persist(&connect_event("b")).await.unwrap();
        store.mark_completed(&a).await.unwrap();
        assert!(!store.mark_completed("zzz").await.unwrap());

        assert_eq!(store.purge_completed().await.unwrap(), 1);
        assert_eq!(store.all().await.unwrap().len(), 1);

        store.clear().await.unwrap();
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_records_are_pruned_beyond_retention() {
        let store = DurableEventStore::new(Arc::new(MemoryStorage::new())).with_retention(3);
        let waiting = store.persist(&connect_event("waiting")).await.unwrap();
        for i in 0..10 {
            let key = store.persist(&connect_event(&format!("e{i}"))).await.unwrap();
            store.mark_completed(&key).await.unwrap();
        }

        let records = store.all().await.unwrap();
        let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec![waiting.as_str(), "e7#8", "e8#9", "e9#10"]);
        assert_eq!(store.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completed_record_is_not_delivered_again() {
        let store = DurableEventStore::new(Arc::new(MemoryStorage::new()));
        let event = connect_event("a");
        let key = store.persist(&event).await.unwrap();

        let router = EventRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        router.add_handler(counting_handler(count.clone()));

        let first = store.deliver(&key, &event, &router).await.unwrap();
        assert!(first.is_some_and(|report| report.fully_delivered()));
        assert_eq!(store.deliver(&key, &event, &router).await.unwrap(), None);
        assert_eq!(store.deliver("missing#9", &event, &router).await.unwrap(), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn claimed_record_is_skipped_by_replay() {
        let store = DurableEventStore::new(Arc::new(MemoryStorage::new()));
        let key = store.persist(&connect_event("a")).await.unwrap();

        let router = EventRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        router.add_handler(counting_handler(count.clone()));

        let claim = store.claim(&key).await.unwrap();
        assert!(claim.is_some());
        assert!(store.claim(&key).await.unwrap().is_none());

        let report = store.replay(&router).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        drop(claim);
        let report = store.replay(&router).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn corrupt_record_is_a_storage_error() {
        let storage = Arc::new(MemoryStorage::new());
        storage.save(DURABLE_EVENTS_KEY, "not json").await.unwrap();
        let store = DurableEventStore::new(storage);
        assert!(matches!(
            store.pending().await,
            Err(BridgeError::Storage(_))
        ));
    }
}
