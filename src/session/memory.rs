//! In-memory session provider.
//!
//! Committed records live in one shared map. Each session buffers its own
//! writes and publishes a copy of them in the store's uncommitted area, which
//! is what a `READ UNCOMMITTED` reader sees. Snapshot levels copy the
//! committed map on their first read and keep reading from that copy.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::session::error::{SessionError, SessionResult};
use crate::session::record::{EntityId, Record, Version};
use crate::session::{Session, SessionProvider};
use crate::transaction::{IsolationLevel, LockRequest};

/// Shared in-memory record store.
///
/// Cheap to clone; clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    committed: RwLock<BTreeMap<EntityId, Record>>,
    /// Buffered writes of live sessions, keyed by session id.
    uncommitted: Mutex<HashMap<u64, BTreeMap<EntityId, Record>>>,
    next_session: AtomicU64,
    fail_next_commit: AtomicBool,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly as committed data, bypassing any session.
    pub fn seed(&self, record: Record) -> Record {
        let stored = record.next_version();
        self.inner.committed.write().insert(stored.id, stored.clone());
        stored
    }

    /// Committed state of a record.
    pub fn get(&self, id: EntityId) -> Option<Record> {
        self.inner.committed.read().get(&id).cloned()
    }

    /// All committed records, ordered by id.
    pub fn records(&self) -> Vec<Record> {
        self.inner.committed.read().values().cloned().collect()
    }

    /// Number of committed records.
    pub fn len(&self) -> usize {
        self.inner.committed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next session commit fail with a backend error.
    pub fn fail_next_commit(&self) {
        self.inner.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of successful session commits.
    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Number of session rollbacks.
    pub fn rollbacks(&self) -> u64 {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    /// Number of sessions opened so far.
    pub fn sessions_opened(&self) -> u64 {
        self.inner.next_session.load(Ordering::SeqCst)
    }

    /// Committed records as pretty-printed JSON.
    pub fn dump_json(&self) -> SessionResult<String> {
        let records = self.records();
        Ok(serde_json::to_string_pretty(&records)?)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.len())
            .field("commits", &self.commits())
            .field("rollbacks", &self.rollbacks())
            .finish()
    }
}

impl SessionProvider for MemoryStore {
    fn open_session(&self) -> SessionResult<Box<dyn Session>> {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(session = id, "opened memory session");
        Ok(Box::new(MemorySession {
            id,
            store: Arc::clone(&self.inner),
            isolation: IsolationLevel::default(),
            snapshot: None,
            pending: BTreeMap::new(),
            locks: Vec::new(),
            closed: false,
        }))
    }
}

/// A buffered write and the committed version it was based on.
#[derive(Debug, Clone)]
struct PendingWrite {
    record: Record,
    /// `None` for inserts.
    base: Option<Version>,
}

/// Session over a [`MemoryStore`].
pub struct MemorySession {
    id: u64,
    store: Arc<StoreInner>,
    isolation: IsolationLevel,
    snapshot: Option<BTreeMap<EntityId, Record>>,
    pending: BTreeMap<EntityId, PendingWrite>,
    locks: Vec<LockRequest>,
    closed: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> SessionResult<()> {
        if self.closed {
            return Err(SessionError::Closed(self.id));
        }
        Ok(())
    }

    /// Committed data as seen by this session: either the live map or the
    /// snapshot taken at the first read.
    fn base_view(&mut self) -> BTreeMap<EntityId, Record> {
        if self.isolation.uses_snapshot() {
            let store = &self.store;
            self.snapshot
                .get_or_insert_with(|| store.committed.read().clone())
                .clone()
        } else {
            self.store.committed.read().clone()
        }
    }

    fn dirty_view(&self) -> BTreeMap<EntityId, Record> {
        let uncommitted = self.store.uncommitted.lock();
        uncommitted
            .iter()
            .filter(|(session, _)| **session != self.id)
            .flat_map(|(_, writes)| writes.iter().map(|(id, r)| (*id, r.clone())))
            .collect()
    }

    fn visible(&mut self) -> BTreeMap<EntityId, Record> {
        let mut view = self.base_view();
        if !self.isolation.prevents_dirty_reads() {
            view.extend(self.dirty_view());
        }
        for (id, write) in &self.pending {
            view.insert(*id, write.record.clone());
        }
        view
    }

    fn publish_pending(&self) {
        let writes = self
            .pending
            .iter()
            .map(|(id, w)| (*id, w.record.clone()))
            .collect();
        self.store.uncommitted.lock().insert(self.id, writes);
    }

    fn discard(&mut self) {
        self.pending.clear();
        self.snapshot = None;
        self.store.uncommitted.lock().remove(&self.id);
    }
}

impl Session for MemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> SessionResult<()> {
        self.ensure_open()?;
        self.isolation = level;
        Ok(())
    }

    fn begin_lock(&mut self, request: &LockRequest) -> SessionResult<()> {
        self.ensure_open()?;
        debug!(session = self.id, target = %request.target, mode = %request.mode, "row lock noted");
        self.locks.push(request.clone());
        Ok(())
    }

    fn save(&mut self, record: Record) -> SessionResult<Record> {
        self.ensure_open()?;

        let id = record.id;
        let stored = if let Some(write) = self.pending.get(&id) {
            if record.version != write.record.version {
                return Err(SessionError::StaleVersion {
                    id,
                    expected: record.version,
                    found: write.record.version,
                });
            }
            PendingWrite {
                record: record.next_version(),
                base: write.base,
            }
        } else {
            let committed = self.store.committed.read().get(&id).map(|r| r.version);
            match committed {
                Some(found) if found != record.version => {
                    return Err(SessionError::StaleVersion {
                        id,
                        expected: record.version,
                        found,
                    });
                }
                Some(found) => PendingWrite {
                    record: record.next_version(),
                    base: Some(found),
                },
                None if record.version == 0 => PendingWrite {
                    record: record.next_version(),
                    base: None,
                },
                None => return Err(SessionError::NotFound(id)),
            }
        };

        let saved = stored.record.clone();
        self.pending.insert(id, stored);
        self.publish_pending();
        Ok(saved)
    }

    fn find(&mut self, id: EntityId) -> SessionResult<Option<Record>> {
        self.ensure_open()?;
        Ok(self.visible().remove(&id))
    }

    fn find_all(&mut self) -> SessionResult<Vec<Record>> {
        self.ensure_open()?;
        Ok(self.visible().into_values().collect())
    }

    fn version(&mut self, id: EntityId) -> SessionResult<Option<Version>> {
        self.ensure_open()?;
        Ok(self.store.committed.read().get(&id).map(|r| r.version))
    }

    fn commit(&mut self) -> SessionResult<()> {
        self.ensure_open()?;

        if self.store.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(SessionError::Backend("injected commit failure".into()));
        }

        {
            let mut committed = self.store.committed.write();

            // first committer wins: every update must still sit on its base
            for (id, write) in &self.pending {
                let current = committed.get(id).map(|r| r.version);
                if current != write.base {
                    return Err(SessionError::StaleVersion {
                        id: *id,
                        expected: write.base.unwrap_or(0),
                        found: current.unwrap_or(0),
                    });
                }
            }

            for (id, write) in std::mem::take(&mut self.pending) {
                committed.insert(id, write.record);
            }
        }

        self.discard();
        self.closed = true;
        self.store.commits.fetch_add(1, Ordering::SeqCst);
        debug!(
            session = self.id,
            isolation = %self.isolation,
            locks = self.locks.len(),
            "memory session committed"
        );
        self.locks.clear();
        Ok(())
    }

    fn rollback(&mut self) -> SessionResult<()> {
        self.ensure_open()?;
        self.discard();
        self.closed = true;
        self.store.rollbacks.fetch_add(1, Ordering::SeqCst);
        debug!(
            session = self.id,
            isolation = %self.isolation,
            locks = self.locks.len(),
            "memory session rolled back"
        );
        self.locks.clear();
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed {
            self.store.uncommitted.lock().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(store: &MemoryStore, level: IsolationLevel) -> Box<dyn Session> {
        let mut session = store.open_session().unwrap();
        session.set_isolation(level).unwrap();
        session
    }

    #[test]
    fn test_commit_publishes_writes() {
        let store = MemoryStore::new();
        let mut session = open(&store, IsolationLevel::ReadCommitted);

        let saved = session.save(Record::named("dummy")).unwrap();
        assert_eq!(saved.version, 1);
        assert!(store.get(saved.id).is_none());

        session.commit().unwrap();
        assert_eq!(store.get(saved.id).unwrap().name(), Some("dummy"));
        assert_eq!(store.commits(), 1);
    }

    #[test]
    fn test_rollback_discards_writes() {
        let store = MemoryStore::new();
        let mut session = open(&store, IsolationLevel::ReadCommitted);

        session.save(Record::named("another")).unwrap();
        session.rollback().unwrap();

        assert!(store.is_empty());
        assert_eq!(store.rollbacks(), 1);
        assert!(matches!(session.commit(), Err(SessionError::Closed(_))));
    }

    #[test]
    fn test_read_uncommitted_sees_dirty_writes() {
        let store = MemoryStore::new();
        let mut writer = open(&store, IsolationLevel::ReadCommitted);
        let mut dirty = open(&store, IsolationLevel::ReadUncommitted);
        let mut clean = open(&store, IsolationLevel::ReadCommitted);

        let saved = writer.save(Record::named("uncommitted")).unwrap();

        assert!(dirty.find(saved.id).unwrap().is_some());
        assert!(clean.find(saved.id).unwrap().is_none());

        writer.rollback().unwrap();
        assert!(dirty.find(saved.id).unwrap().is_none());
    }

    #[test]
    fn test_repeatable_read_keeps_snapshot() {
        let store = MemoryStore::new();
        let mut reader = open(&store, IsolationLevel::RepeatableRead);
        let mut committed_reader = open(&store, IsolationLevel::ReadCommitted);

        assert!(reader.find_all().unwrap().is_empty());
        assert!(committed_reader.find_all().unwrap().is_empty());

        store.seed(Record::named("phantom"));

        assert!(reader.find_all().unwrap().is_empty());
        assert_eq!(committed_reader.find_all().unwrap().len(), 1);
    }

    #[test]
    fn test_stale_update_rejected_on_save() {
        let store = MemoryStore::new();
        let seeded = store.seed(Record::named("v1"));

        let mut session = open(&store, IsolationLevel::ReadCommitted);
        let mut stale = seeded.clone();
        stale.version = 0;
        // version 0 against an existing id is a stale insert
        let err = session.save(stale).unwrap_err();
        assert!(err.is_stale());
    }

    #[test]
    fn test_first_committer_wins() {
        let store = MemoryStore::new();
        let seeded = store.seed(Record::named("start"));

        let mut first = open(&store, IsolationLevel::ReadCommitted);
        let mut second = open(&store, IsolationLevel::ReadCommitted);

        let mut a = seeded.clone();
        a.set("name", "first");
        first.save(a).unwrap();

        let mut b = seeded.clone();
        b.set("name", "second");
        second.save(b).unwrap();

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert!(err.is_stale());
        assert_eq!(store.get(seeded.id).unwrap().name(), Some("first"));
    }

    #[test]
    fn test_injected_commit_failure() {
        let store = MemoryStore::new();
        let mut session = open(&store, IsolationLevel::ReadCommitted);
        session.save(Record::named("doomed")).unwrap();

        store.fail_next_commit();
        assert!(matches!(session.commit(), Err(SessionError::Backend(_))));
        session.rollback().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_unknown_record() {
        let store = MemoryStore::new();
        let mut session = open(&store, IsolationLevel::ReadCommitted);
        let mut ghost = Record::named("ghost");
        ghost.version = 3;
        assert!(matches!(session.save(ghost), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn test_lock_notes_survive_until_commit() {
        let store = MemoryStore::new();
        let seeded = store.seed(Record::named("locked"));
        let mut session = open(&store, IsolationLevel::Serializable);

        session.begin_lock(&LockRequest::pessimistic_write(seeded.id)).unwrap();
        let mut record = session.find(seeded.id).unwrap().unwrap();
        record.set("name", "updated");
        session.save(record).unwrap();
        session.commit().unwrap();

        assert_eq!(store.get(seeded.id).unwrap().name(), Some("updated"));
        assert!(matches!(
            session.begin_lock(&LockRequest::pessimistic_read(seeded.id)),
            Err(SessionError::Closed(_))
        ));
    }
}
