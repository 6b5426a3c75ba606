//! Paginated streaming query/search engine: long-lived cursor sessions
//! keyed by an opaque page token, each backed by a producer task holding
//! one snapshot scan open for the session's lifetime.
//!
//! Four session kinds (List, Query, Search, SearchRef) share one generic
//! [`SessionRegistry`], each with its own lock — "distinct session
//! universes do not share ids" (design notes), so no cross-kind
//! collision is possible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::{ObjectStoreError, Result};
use crate::jsonsearch;
use crate::key::{ObjRef, TypeId, TypeTag};
use crate::record::TypedObject;
use crate::registry::SchemaRegistry;
use crate::storage::StorageEngine;

/// Sessions idle longer than this are reaped by the sweep task, bounding
/// how long a forgotten page token can pin old `sled` pages.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Bounded buffer size for every session's producer→consumer channel.
pub const SESSION_BUFFER_SIZE: usize = 10;

pub type SessionId = Uuid;

/// One item produced for a `List`/`Query` session: the raw key plus the
/// decoded record.
pub struct ListItem {
    pub type_id: TypeId,
    pub object: Box<dyn TypedObject>,
}

/// One item produced for a `Search` session: a record with at least one
/// matching JSON leaf path.
pub struct SearchHit {
    pub type_id: TypeId,
    pub object: Box<dyn TypedObject>,
    pub hits: Vec<String>,
}

struct Session<T> {
    receiver: mpsc::Receiver<T>,
    cancelled: Arc<AtomicBool>,
    last_touched: Instant,
}

/// A generic registry of live cursor sessions producing items of type `T`.
pub struct SessionRegistry<T> {
    sessions: Mutex<HashMap<SessionId, Session<T>>>,
    idle_timeout: Duration,
}

impl<T: Send + 'static> SessionRegistry<T> {
    pub fn new(idle_timeout: Duration) -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Collect up to `page_size` items from `session`. Returns `(items,
    /// drained)`; `drained` is true once the producer's channel has
    /// closed.
    async fn collect(session: &mut Session<T>, page_size: usize) -> (Vec<T>, bool) {
        let mut items = Vec::with_capacity(page_size);
        for _ in 0..page_size {
            match session.receiver.recv().await {
                Some(item) => items.push(item),
                None => return (items, true),
            }
        }
        (items, false)
    }

    /// Begin a new session from a freshly spawned producer and
    /// immediately collect its first page.
    pub async fn first_page(
        &self,
        page_size: usize,
        receiver: mpsc::Receiver<T>,
        cancelled: Arc<AtomicBool>,
    ) -> (Vec<T>, String) {
        let mut session = Session {
            receiver,
            cancelled,
            last_touched: Instant::now(),
        };
        let (items, drained) = Self::collect(&mut session, page_size).await;
        if drained {
            (items, String::new())
        } else {
            let id = Uuid::new_v4();
            self.sessions.lock().await.insert(id, session);
            (items, id.to_string())
        }
    }

    /// Continue an existing session. `SessionInvalid` if the token does
    /// not name a live session; `ContextCancelled` if it was cancelled
    /// since the caller last paged it.
    pub async fn next_page(&self, token: &str, page_size: usize) -> Result<(Vec<T>, String)> {
        let id = Uuid::parse_str(token)
            .map_err(|_| ObjectStoreError::SessionInvalid(token.to_string()))?;
        let mut guard = self.sessions.lock().await;
        let session = guard
            .get_mut(&id)
            .ok_or_else(|| ObjectStoreError::SessionInvalid(token.to_string()))?;
        if session.cancelled.load(Ordering::Acquire) {
            guard.remove(&id);
            return Err(ObjectStoreError::ContextCancelled);
        }
        let (items, drained) = Self::collect(session, page_size).await;
        if drained {
            guard.remove(&id);
            Ok((items, String::new()))
        } else {
            session.last_touched = Instant::now();
            Ok((items, token.to_string()))
        }
    }

    /// Cancel a live session: flip its cancellation flag, observed both by
    /// the producer (which stops scanning at its next item) and by a
    /// following `next_page` call (which reports `ContextCancelled` and
    /// removes the session). The session is left in the map for the sweep
    /// task to reap if the caller never pages it again.
    pub async fn cancel(&self, token: &str) -> Result<()> {
        let id = Uuid::parse_str(token)
            .map_err(|_| ObjectStoreError::SessionInvalid(token.to_string()))?;
        let guard = self.sessions.lock().await;
        if let Some(session) = guard.get(&id) {
            session.cancelled.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Reap sessions: a session already flagged cancelled (explicitly, or
    /// by a prior sweep tick) and never paged since is removed outright;
    /// one that has merely gone idle past `idle_timeout` is flagged
    /// cancelled and given one more sweep interval for `next_page` to
    /// observe `ContextCancelled` before it is removed.
    async fn sweep(&self) {
        let mut guard = self.sessions.lock().await;
        let timeout = self.idle_timeout;
        let now = Instant::now();
        guard.retain(|_, session| {
            if session.cancelled.load(Ordering::Acquire) {
                return false;
            }
            let expired = now.duration_since(session.last_touched) > timeout;
            if expired {
                session.cancelled.store(true, Ordering::Release);
            }
            true
        });
    }

    pub async fn live_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Wraps the four session registries plus the background idle-timeout
/// sweep, so `StorageEngine` + `SchemaRegistry` can be projected into
/// `List`/`Query`/`Search`/`SearchRef` streams.
pub struct QueryEngine {
    storage: Arc<StorageEngine>,
    lists: Arc<SessionRegistry<ListItem>>,
    queries: Arc<SessionRegistry<ListItem>>,
    searches: Arc<SessionRegistry<SearchHit>>,
    refs: Arc<SessionRegistry<ObjRef>>,
}

impl QueryEngine {
    pub fn new(storage: Arc<StorageEngine>, idle_timeout: Duration) -> Self {
        let engine = QueryEngine {
            storage,
            lists: Arc::new(SessionRegistry::new(idle_timeout)),
            queries: Arc::new(SessionRegistry::new(idle_timeout)),
            searches: Arc::new(SessionRegistry::new(idle_timeout)),
            refs: Arc::new(SessionRegistry::new(idle_timeout)),
        };
        engine.spawn_sweep_task();
        engine
    }

    fn spawn_sweep_task(&self) {
        let lists = self.lists.clone();
        let queries = self.queries.clone();
        let searches = self.searches.clone();
        let refs = self.refs.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                lists.sweep().await;
                queries.sweep().await;
                searches.sweep().await;
                refs.sweep().await;
            }
        });
    }

    /// `List(tag, pageSize, pageToken)`: identity predicate.
    pub async fn list(&self, tag: TypeTag, page_size: usize, page_token: &str) -> Result<(Vec<ListItem>, String)> {
        if page_token.is_empty() {
            let (rx, stop) = self.spawn_scan_producer(tag, None);
            Ok(self.lists.first_page(page_size, rx, stop).await)
        } else {
            self.lists.next_page(page_token, page_size).await
        }
    }

    /// `Query(tag, predicate, pageSize, pageToken)`: caller-supplied
    /// predicate over the decoded record; returning `Err` from the
    /// predicate terminates the session early (mirrors the source's
    /// `io.EOF`-from-predicate convention).
    pub async fn query(
        &self,
        tag: TypeTag,
        predicate: Arc<dyn Fn(&dyn TypedObject) -> Result<bool> + Send + Sync>,
        page_size: usize,
        page_token: &str,
    ) -> Result<(Vec<ListItem>, String)> {
        if page_token.is_empty() {
            let (rx, stop) = self.spawn_scan_producer(tag, Some(predicate));
            Ok(self.queries.first_page(page_size, rx, stop).await)
        } else {
            self.queries.next_page(page_token, page_size).await
        }
    }

    /// `Search(tag, predicate, pageSize, pageToken)`: projects each record
    /// to its canonical JSON form and tests every scalar leaf; a record
    /// yields a hit iff at least one leaf matches.
    pub async fn search(
        &self,
        tag: TypeTag,
        predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
        page_size: usize,
        page_token: &str,
    ) -> Result<(Vec<SearchHit>, String)> {
        if page_token.is_empty() {
            let (rx, stop) = self.spawn_search_producer(tag, predicate);
            Ok(self.searches.first_page(page_size, rx, stop).await)
        } else {
            self.searches.next_page(page_token, page_size).await
        }
    }

    /// `SearchRef(selector, pageSize, pageToken)`: scans the whole `obj`
    /// namespace, decoding only keys, for shell-completion style use.
    pub async fn search_ref(
        &self,
        selector: Arc<dyn Fn(&ObjRef) -> bool + Send + Sync>,
        page_size: usize,
        page_token: &str,
    ) -> Result<(Vec<ObjRef>, String)> {
        if page_token.is_empty() {
            let (rx, stop) = self.spawn_ref_producer(selector);
            Ok(self.refs.first_page(page_size, rx, stop).await)
        } else {
            self.refs.next_page(page_token, page_size).await
        }
    }

    pub async fn cancel_list(&self, token: &str) -> Result<()> {
        self.lists.cancel(token).await
    }
    pub async fn cancel_query(&self, token: &str) -> Result<()> {
        self.queries.cancel(token).await
    }
    pub async fn cancel_search(&self, token: &str) -> Result<()> {
        self.searches.cancel(token).await
    }
    pub async fn cancel_search_ref(&self, token: &str) -> Result<()> {
        self.refs.cancel(token).await
    }

    fn spawn_scan_producer(
        &self,
        tag: TypeTag,
        predicate: Option<Arc<dyn Fn(&dyn TypedObject) -> Result<bool> + Send + Sync>>,
    ) -> (mpsc::Receiver<ListItem>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER_SIZE);
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled_for_task = cancelled.clone();
        let storage = self.storage.clone();

        tokio::task::spawn_blocking(move || {
            for kv in storage.iter_prefix(tag) {
                if cancelled_for_task.load(Ordering::Relaxed) {
                    break;
                }
                let Ok((k, v)) = kv else { break };
                let tid = match TypeId::decode(&k) {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                let object = match storage.registry().unmarshal(&k, &v) {
                    Ok(o) => o,
                    Err(_) => continue,
                };
                if let Some(pred) = &predicate {
                    match pred(object.as_ref()) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(_) => break,
                    }
                }
                let item = ListItem { type_id: tid, object };
                if tx.blocking_send(item).is_err() {
                    break;
                }
            }
        });

        (rx, cancelled)
    }

    fn spawn_search_producer(
        &self,
        tag: TypeTag,
        predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    ) -> (mpsc::Receiver<SearchHit>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER_SIZE);
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled_for_task = cancelled.clone();
        let storage = self.storage.clone();

        tokio::task::spawn_blocking(move || {
            for kv in storage.iter_prefix(tag) {
                if cancelled_for_task.load(Ordering::Relaxed) {
                    break;
                }
                let Ok((k, v)) = kv else { break };
                let tid = match TypeId::decode(&k) {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                let object = match storage.registry().unmarshal(&k, &v) {
                    Ok(o) => o,
                    Err(_) => continue,
                };
                let Ok(json) = object.as_json() else { continue };
                let hits = jsonsearch::search_paths(&json, predicate.as_ref());
                if hits.is_empty() {
                    continue;
                }
                let hit = SearchHit { type_id: tid, object, hits };
                if tx.blocking_send(hit).is_err() {
                    break;
                }
            }
        });

        (rx, cancelled)
    }

    fn spawn_ref_producer(
        &self,
        selector: Arc<dyn Fn(&ObjRef) -> bool + Send + Sync>,
    ) -> (mpsc::Receiver<ObjRef>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER_SIZE);
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled_for_task = cancelled.clone();
        let storage = self.storage.clone();

        tokio::task::spawn_blocking(move || {
            for kv in storage.iter_all_keys() {
                if cancelled_for_task.load(Ordering::Relaxed) {
                    break;
                }
                let Ok((k, _v)) = kv else { break };
                let Ok(tid) = TypeId::decode(&k) else { continue };
                let reference = ObjRef::from_type_id(tid);
                if !selector(&reference) {
                    continue;
                }
                if tx.blocking_send(reference).is_err() {
                    break;
                }
            }
        });

        (rx, cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SchemaRegistry, TypeSpec};
    use crate::record::test_fixtures::TestObject;
    use crate::watch::WatchBus;
    use std::collections::HashMap;

    async fn engine_with(n: usize) -> (tempfile::TempDir, QueryEngine, TypeTag) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SchemaRegistry::new());
        registry.register_static::<TestObject>(vec![], HashMap::new()).unwrap();
        let watch = WatchBus::spawn();
        let storage = Arc::new(StorageEngine::open(dir.path(), registry.clone(), watch).unwrap());
        let mut tag = TypeTag([0, 0, 0, 0]);
        for i in 0..n {
            let mut obj = registry
                .create(&TypeSpec::FullName(TestObject::FULL_NAME.to_string()))
                .unwrap();
            tag = obj.metadata().type_tag().unwrap();
            let mut test_obj = TestObject::default();
            test_obj.metadata = Some(obj.metadata());
            test_obj.my_int = i as i64;
            obj = Box::new(crate::record::StaticObject::new(test_obj));
            storage.put(vec![obj]).await.unwrap();
        }
        let qe = QueryEngine::new(storage, Duration::from_secs(300));
        (dir, qe, tag)
    }

    #[tokio::test]
    async fn list_paginates_through_all_records() {
        let (_dir, qe, tag) = engine_with(25).await;
        let mut seen = 0;
        let mut token = String::new();
        loop {
            let (items, next) = qe.list(tag, 10, &token).await.unwrap();
            seen += items.len();
            if next.is_empty() {
                break;
            }
            token = next;
        }
        assert_eq!(seen, 25);
    }

    #[tokio::test]
    async fn unknown_token_is_session_invalid() {
        let (_dir, qe, _tag) = engine_with(1).await;
        let err = qe.list(TypeTag([1, 1, 1, 1]), 10, "not-a-uuid").await.unwrap_err();
        assert_eq!(err.code(), "SESSION_INVALID");
    }
}
