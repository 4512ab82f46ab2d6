//! In-memory mirror of DatabaseCredentialBinding resources.
//!
//! A single background task applies watch events to the store. Admission
//! requests never read the store in place: `snapshot` copies the entries out
//! under a short read lock and decodes them afterwards, so readers and the
//! watch task only ever contend for the duration of a map clone or insert.
//!
//! Entries are kept as `DynamicObject` and keyed by namespace/name. Decoding
//! into the typed binding happens on read, which is where a malformed entry
//! surfaces as `Error::Enumeration`.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::pin;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::{Stream, StreamExt};
use kube::api::{Api, ApiResource, DynamicObject};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Event};
use kube::{Client, Resource, ResourceExt};
use prometheus_client::metrics::gauge::Gauge;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crd::DatabaseCredentialBinding;
use crate::error::{Error, Result};

/// Identity of a stored object (namespace + name)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn of(obj: &DynamicObject) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A change to a single binding, as reported by the watch
#[derive(Clone, Debug)]
pub enum BindingEvent {
    Added(DynamicObject),
    Updated(DynamicObject),
    Deleted(DynamicObject),
}

impl BindingEvent {
    fn object(&self) -> &DynamicObject {
        match self {
            BindingEvent::Added(obj) | BindingEvent::Updated(obj) | BindingEvent::Deleted(obj) => {
                obj
            }
        }
    }
}

type Store = BTreeMap<ObjectKey, Arc<DynamicObject>>;

/// Eventually consistent cache of every binding in the cluster
pub struct BindingCache {
    store: RwLock<Store>,
    size: Gauge,
    synced: watch::Sender<bool>,
}

impl BindingCache {
    /// Create an empty, unsynced cache reporting its size to `size`
    pub fn new(size: Gauge) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            store: RwLock::new(BTreeMap::new()),
            size,
            synced,
        }
    }

    /// Start watching bindings cluster-wide and wait for the initial list.
    ///
    /// Returns the handle of the background watch task once the first full
    /// list has been applied. Fails if the task ends before that happens.
    /// No timeout is applied here; callers bound the wait themselves.
    pub async fn start(
        self: &Arc<Self>,
        client: Client,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let resource = ApiResource::erase::<DatabaseCredentialBinding>(&());
        let api: Api<DynamicObject> = Api::all_with(client, &resource);
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();

        info!(
            kind = %DatabaseCredentialBinding::kind(&()),
            "Starting binding watch"
        );

        let cache = Arc::clone(self);
        let mut handle = tokio::spawn(async move { cache.run(stream, cancel).await });

        let mut synced = self.synced.subscribe();
        tokio::select! {
            res = synced.wait_for(|synced| *synced) => {
                res.map_err(|_| Error::InitialSync("sync signal dropped".to_string()))?;
            }
            res = &mut handle => {
                let reason = match res {
                    Ok(()) => "watch ended before the initial list completed".to_string(),
                    Err(e) => format!("watch task failed: {e}"),
                };
                return Err(Error::InitialSync(reason));
            }
        }

        info!(bindings = self.len(), "Binding cache synced");
        Ok(handle)
    }

    /// Apply a watch stream to the store until it ends or `cancel` fires
    pub async fn run<S>(&self, stream: S, cancel: CancellationToken)
    where
        S: Stream<Item = std::result::Result<Event<DynamicObject>, watcher::Error>>,
    {
        let mut stream = pin!(stream);
        // Objects of an in-progress (re)list, swapped in whole on InitDone
        let mut relist: Option<Store> = None;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Binding watch cancelled");
                    return;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(Event::Init)) => {
                    debug!("Binding relist started");
                    relist = Some(BTreeMap::new());
                }
                Some(Ok(Event::InitApply(obj))) => match relist.as_mut() {
                    Some(buffer) => {
                        buffer.insert(ObjectKey::of(&obj), Arc::new(obj));
                    }
                    None => self.apply(BindingEvent::Added(obj)),
                },
                Some(Ok(Event::InitDone)) => {
                    if let Some(buffer) = relist.take() {
                        self.replace_all(buffer);
                    }
                    self.synced.send_replace(true);
                }
                Some(Ok(Event::Apply(obj))) => {
                    let event = if self.contains(&ObjectKey::of(&obj)) {
                        BindingEvent::Updated(obj)
                    } else {
                        BindingEvent::Added(obj)
                    };
                    self.apply(event);
                }
                Some(Ok(Event::Delete(obj))) => self.apply(BindingEvent::Deleted(obj)),
                Some(Err(e)) => {
                    warn!(error = %e, "Binding watch error, retrying");
                }
                None => {
                    error!("Binding watch stream ended unexpectedly");
                    self.synced.send_replace(false);
                    return;
                }
            }
        }
    }

    /// Apply a single event. Upserts and removals are idempotent.
    pub fn apply(&self, event: BindingEvent) {
        let key = ObjectKey::of(event.object());
        let mut store = self.write();
        match event {
            BindingEvent::Added(obj) => {
                debug!(binding = %key, "Adding binding");
                store.insert(key, Arc::new(obj));
            }
            BindingEvent::Updated(obj) => {
                debug!(binding = %key, "Updating binding");
                store.insert(key, Arc::new(obj));
            }
            BindingEvent::Deleted(_) => {
                debug!(binding = %key, "Deleting binding");
                store.remove(&key);
            }
        }
        self.size.set(store.len() as i64);
    }

    fn replace_all(&self, objects: Store) {
        let mut store = self.write();
        *store = objects;
        self.size.set(store.len() as i64);
        debug!(bindings = store.len(), "Binding relist applied");
    }

    /// Copy of every stored binding, ordered by namespace then name
    pub fn snapshot(&self) -> Result<Vec<DatabaseCredentialBinding>> {
        let entries: Vec<(ObjectKey, Arc<DynamicObject>)> = self
            .read()
            .iter()
            .map(|(key, obj)| (key.clone(), Arc::clone(obj)))
            .collect();

        entries
            .into_iter()
            .map(|(key, obj)| decode(&key, &obj))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Whether the initial list has been applied and the watch is still running
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    fn contains(&self, key: &ObjectKey) -> bool {
        self.read().contains_key(key)
    }

    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn decode(key: &ObjectKey, obj: &DynamicObject) -> Result<DatabaseCredentialBinding> {
    let expected = DatabaseCredentialBinding::kind(&());
    if let Some(types) = &obj.types
        && types.kind != expected
    {
        return Err(Error::Enumeration {
            key: key.to_string(),
            message: format!("expected kind {expected}, found {}", types.kind),
        });
    }

    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::Enumeration {
            key: key.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::crd::DatabaseCredentialBindingSpec;
    use futures::stream;
    use serde_json::json;

    type WatchItem = std::result::Result<Event<DynamicObject>, watcher::Error>;

    fn dynamic(namespace: &str, name: &str, database: &str) -> DynamicObject {
        let mut binding = DatabaseCredentialBinding::new(
            name,
            DatabaseCredentialBindingSpec {
                database: database.to_string(),
                role: "readonly".to_string(),
                service_account: Some("sa1".to_string()),
                ..Default::default()
            },
        );
        binding.metadata.namespace = Some(namespace.to_string());
        serde_json::from_value(serde_json::to_value(binding).unwrap()).unwrap()
    }

    fn cache() -> BindingCache {
        BindingCache::new(Gauge::default())
    }

    #[test]
    fn test_apply_upserts_by_identity() {
        let cache = cache();
        cache.apply(BindingEvent::Added(dynamic("ns1", "a", "foo")));
        cache.apply(BindingEvent::Added(dynamic("ns1", "a", "foo")));
        cache.apply(BindingEvent::Updated(dynamic("ns1", "a", "bar")));
        cache.apply(BindingEvent::Added(dynamic("ns2", "a", "foo")));

        assert_eq!(cache.len(), 2);
        let snapshot = cache.snapshot().unwrap();
        assert_eq!(snapshot[0].spec.database, "bar");
        assert_eq!(snapshot[1].metadata.namespace.as_deref(), Some("ns2"));
    }

    #[test]
    fn test_size_gauge_follows_store() {
        let gauge = Gauge::default();
        let cache = BindingCache::new(gauge.clone());

        // Delete before add must not drive the size negative
        cache.apply(BindingEvent::Deleted(dynamic("ns1", "a", "foo")));
        assert_eq!(gauge.get(), 0);

        cache.apply(BindingEvent::Added(dynamic("ns1", "a", "foo")));
        cache.apply(BindingEvent::Added(dynamic("ns1", "b", "foo")));
        assert_eq!(gauge.get(), 2);

        cache.apply(BindingEvent::Deleted(dynamic("ns1", "a", "foo")));
        cache.apply(BindingEvent::Deleted(dynamic("ns1", "a", "foo")));
        assert_eq!(gauge.get(), 1);
        assert_eq!(gauge.get(), cache.len() as i64);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let cache = cache();
        cache.apply(BindingEvent::Added(dynamic("ns1", "a", "foo")));

        let snapshot = cache.snapshot().unwrap();
        cache.apply(BindingEvent::Deleted(dynamic("ns1", "a", "foo")));

        assert_eq!(snapshot.len(), 1);
        assert!(cache.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_rejects_malformed_entry() {
        let cache = cache();
        let mut obj = dynamic("ns1", "broken", "foo");
        obj.data = json!({"spec": {"database": 42}});
        cache.apply(BindingEvent::Added(obj));

        match cache.snapshot() {
            Err(Error::Enumeration { key, .. }) => assert_eq!(key, "ns1/broken"),
            other => panic!("expected enumeration error, got {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_rejects_foreign_kind() {
        let cache = cache();
        let resource = ApiResource::erase::<k8s_openapi::api::core::v1::ConfigMap>(&());
        let obj = DynamicObject::new("cm", &resource).within("ns1");
        cache.apply(BindingEvent::Added(obj));

        assert!(matches!(cache.snapshot(), Err(Error::Enumeration { .. })));
    }

    #[tokio::test]
    async fn test_run_applies_initial_list_and_marks_synced() {
        let cache = cache();
        let events: Vec<WatchItem> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(dynamic("ns1", "a", "foo"))),
            Ok(Event::InitApply(dynamic("ns1", "b", "bar"))),
            Ok(Event::InitDone),
            Ok(Event::Delete(dynamic("ns1", "a", "foo"))),
            Ok(Event::Apply(dynamic("ns2", "c", "baz"))),
        ];

        // Keep the watch open after the events, as a live watch would be
        let live = stream::iter(events).chain(stream::pending());
        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            cache.run(live, CancellationToken::new()),
        )
        .await;

        assert!(cache.is_synced());
        let databases: Vec<_> = cache
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|b| b.spec.database)
            .collect();
        assert_eq!(databases, vec!["bar", "baz"]);
    }

    #[tokio::test]
    async fn test_relist_drops_objects_missing_from_new_list() {
        let cache = cache();
        let events: Vec<WatchItem> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(dynamic("ns1", "a", "foo"))),
            Ok(Event::InitApply(dynamic("ns1", "b", "bar"))),
            Ok(Event::InitDone),
            Ok(Event::Init),
            Ok(Event::InitApply(dynamic("ns1", "b", "bar"))),
            Ok(Event::InitDone),
        ];

        cache
            .run(stream::iter(events), CancellationToken::new())
            .await;

        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_not_synced_without_init_done() {
        let cache = cache();
        let events: Vec<WatchItem> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(dynamic("ns1", "a", "foo"))),
        ];

        cache
            .run(stream::iter(events), CancellationToken::new())
            .await;

        assert!(!cache.is_synced());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_stream_end_clears_synced() {
        let cache = cache();
        let events: Vec<WatchItem> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(dynamic("ns1", "a", "foo"))),
            Ok(Event::InitDone),
        ];

        cache
            .run(stream::iter(events), CancellationToken::new())
            .await;

        assert!(!cache.is_synced());
        // Stale entries are kept, only the sync signal drops
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let cache = cache();
        let cancel = CancellationToken::new();
        cancel.cancel();

        cache.run(stream::pending::<WatchItem>(), cancel).await;
        assert!(!cache.is_synced());
    }
}
