//! Query cache: cached collections addressed by key.
//!
//! Every slot holds an `Arc` to an immutable list. Writes swap the whole `Arc`
//! and then broadcast the key, which is the only change notification readers
//! get. A reader holding an old `Arc` keeps a consistent snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::event::{SessionId, SessionInfo, SessionMessage};
use crate::reconcile::Reconciled;

const CHANGE_CAPACITY: usize = 256;

/// Address of a cached collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    /// All sessions of the connected server, newest first.
    Sessions,
    /// Messages of one session, ordered by creation time.
    SessionMessages(SessionId),
}

pub type SessionList = Arc<Vec<SessionInfo>>;
pub type MessageList = Arc<Vec<SessionMessage>>;

#[derive(Debug, Clone)]
enum Slot {
    Sessions(SessionList),
    Messages(MessageList),
}

/// Typed access to slot contents.
trait SlotValue: Sized {
    fn view(slot: &Slot) -> Option<&Arc<Vec<Self>>>;
    fn wrap(list: Arc<Vec<Self>>) -> Slot;
}

impl SlotValue for SessionInfo {
    fn view(slot: &Slot) -> Option<&Arc<Vec<Self>>> {
        match slot {
            Slot::Sessions(list) => Some(list),
            Slot::Messages(_) => None,
        }
    }

    fn wrap(list: Arc<Vec<Self>>) -> Slot {
        Slot::Sessions(list)
    }
}

impl SlotValue for SessionMessage {
    fn view(slot: &Slot) -> Option<&Arc<Vec<Self>>> {
        match slot {
            Slot::Messages(list) => Some(list),
            Slot::Sessions(_) => None,
        }
    }

    fn wrap(list: Arc<Vec<Self>>) -> Slot {
        Slot::Messages(list)
    }
}

/// Shared store for the collections the event stream mutates.
pub struct QueryCache {
    slots: RwLock<HashMap<QueryKey, Slot>>,
    changes: broadcast::Sender<QueryKey>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            slots: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Receive the key of every slot written after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<QueryKey> {
        self.changes.subscribe()
    }

    pub async fn sessions(&self) -> Option<SessionList> {
        self.get(&QueryKey::Sessions).await
    }

    pub async fn messages(&self, session_id: &str) -> Option<MessageList> {
        self.get(&QueryKey::SessionMessages(session_id.to_string()))
            .await
    }

    /// Seed or overwrite the session list (e.g. from `GET /session`).
    pub async fn set_sessions(&self, sessions: Vec<SessionInfo>) -> SessionList {
        self.set(QueryKey::Sessions, sessions).await
    }

    /// Seed or overwrite one session's messages (e.g. from `GET /session/{id}/message`).
    pub async fn set_messages(
        &self,
        session_id: &str,
        messages: Vec<SessionMessage>,
    ) -> MessageList {
        self.set(QueryKey::SessionMessages(session_id.to_string()), messages)
            .await
    }

    /// Apply `f` to the session list under the write lock; stores and announces `Applied` results.
    pub async fn update_sessions<F>(&self, f: F) -> Reconciled<SessionList>
    where
        F: FnOnce(Option<&[SessionInfo]>) -> Reconciled<Vec<SessionInfo>>,
    {
        self.update(QueryKey::Sessions, f).await
    }

    /// Apply `f` to one session's message list under the write lock.
    pub async fn update_messages<F>(&self, session_id: &str, f: F) -> Reconciled<MessageList>
    where
        F: FnOnce(Option<&[SessionMessage]>) -> Reconciled<Vec<SessionMessage>>,
    {
        self.update(QueryKey::SessionMessages(session_id.to_string()), f)
            .await
    }

    /// Block writers while the guard is held.
    #[cfg(test)]
    pub(crate) async fn read_guard(&self) -> impl Sized + '_ {
        self.slots.read().await
    }

    async fn get<T: SlotValue>(&self, key: &QueryKey) -> Option<Arc<Vec<T>>> {
        self.slots.read().await.get(key).and_then(T::view).cloned()
    }

    async fn set<T: SlotValue>(&self, key: QueryKey, list: Vec<T>) -> Arc<Vec<T>> {
        let list = Arc::new(list);
        self.slots
            .write()
            .await
            .insert(key.clone(), T::wrap(list.clone()));
        self.announce(key);
        list
    }

    async fn update<T, F>(&self, key: QueryKey, f: F) -> Reconciled<Arc<Vec<T>>>
    where
        T: SlotValue,
        F: FnOnce(Option<&[T]>) -> Reconciled<Vec<T>>,
    {
        let mut slots = self.slots.write().await;
        let current = slots.get(&key).and_then(T::view).map(|list| list.as_slice());
        match f(current) {
            Reconciled::Applied(next) => {
                let next = Arc::new(next);
                slots.insert(key.clone(), T::wrap(next.clone()));
                drop(slots);
                self.announce(key);
                Reconciled::Applied(next)
            }
            Reconciled::Unchanged => Reconciled::Unchanged,
            Reconciled::Deferred => Reconciled::Deferred,
        }
    }

    fn announce(&self, key: QueryKey) {
        log::trace!("cache write: {:?}", key);
        // No subscribers is fine.
        let _ = self.changes.send(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SessionTime;
    use serde_json::Map;

    fn session(id: &str) -> SessionInfo {
        SessionInfo {
            id: id.into(),
            title: String::new(),
            directory: String::new(),
            parent_id: None,
            share: None,
            time: SessionTime::default(),
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn absent_slot_reads_as_none() {
        let cache = QueryCache::new();
        assert!(cache.sessions().await.is_none());
        assert!(cache.messages("s1").await.is_none());
    }

    #[tokio::test]
    async fn set_announces_key() {
        let cache = QueryCache::new();
        let mut rx = cache.subscribe();
        cache.set_messages("s1", Vec::new()).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            QueryKey::SessionMessages("s1".into())
        );
        assert!(cache.messages("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn applied_update_swaps_the_arc() {
        let cache = QueryCache::new();
        let before = cache.set_sessions(vec![session("a")]).await;
        let mut rx = cache.subscribe();

        let out = cache
            .update_sessions(|current| {
                let mut next = current.unwrap_or_default().to_vec();
                next.insert(0, session("b"));
                Reconciled::Applied(next)
            })
            .await;
        let Reconciled::Applied(after) = out else {
            panic!("expected applied");
        };
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
        assert_eq!(rx.try_recv().unwrap(), QueryKey::Sessions);
    }

    #[tokio::test]
    async fn unchanged_and_deferred_do_not_write() {
        let cache = QueryCache::new();
        let before = cache.set_sessions(vec![session("a")]).await;
        let mut rx = cache.subscribe();

        let out = cache.update_sessions(|_| Reconciled::Unchanged).await;
        assert_eq!(out, Reconciled::Unchanged);
        let out = cache.update_messages("s1", |_| Reconciled::Deferred).await;
        assert!(out.is_deferred());

        assert!(rx.try_recv().is_err());
        let now = cache.sessions().await.unwrap();
        assert!(Arc::ptr_eq(&before, &now));
        assert!(cache.messages("s1").await.is_none());
    }
}
