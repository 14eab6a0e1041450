//! The append-only event store.
//!
//! Writes are serialized behind the connection lock; the invariant checks
//! and the insert are atomic with respect to other appenders. Reads never
//! take the subscriber lock and subscribers never block the store: each
//! subscription owns a bounded queue, and overflow drops the *oldest
//! pending notification* (logged, and counted on the subscription) — the
//! log itself never drops an event. Consumers resync by re-reading with
//! `since_seq`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use tokio::sync::Notify;

use weft_domain::{Error, EventId, EventPayload, Result, Thread, ThreadEvent, ThreadId, ThreadMetadata};

use crate::db::{storage, Database};

/// Default per-subscription notification queue capacity.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// An event together with its store-wide sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub seq: u64,
    pub event: ThreadEvent,
}

/// Durable, append-only persistence for events plus a pub/sub surface.
pub struct EventStore {
    pub(crate) db: Arc<Database>,
    subscribers: Mutex<HashMap<ThreadId, Vec<Weak<SubscriptionInner>>>>,
}

impl EventStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    // ── Threads ────────────────────────────────────────────────────

    /// Create a thread record. Fails if the id already exists.
    pub fn create_thread(&self, thread: &Thread) -> Result<()> {
        let metadata = serde_json::to_string(&thread.metadata)?;
        let conn = self.db.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO threads (id, parent_id, created_at, metadata, is_shadow) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    thread.id.as_str(),
                    thread.parent_id.as_ref().map(|p| p.as_str()),
                    thread.created_at.to_rfc3339(),
                    metadata,
                    thread.is_shadow as i64,
                ],
            )
            .map_err(storage)?;
        if inserted == 0 {
            return Err(Error::InvariantViolation(format!(
                "thread '{}' already exists",
                thread.id
            )));
        }
        Ok(())
    }

    pub fn get_thread(&self, id: &ThreadId) -> Result<Option<Thread>> {
        let conn = self.db.conn.lock();
        conn.query_row(
            "SELECT id, parent_id, created_at, metadata, is_shadow FROM threads WHERE id = ?1",
            params![id.as_str()],
            row_to_thread,
        )
        .optional()
        .map_err(storage)
    }

    pub fn list_threads(&self) -> Result<Vec<Thread>> {
        let conn = self.db.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, parent_id, created_at, metadata, is_shadow FROM threads ORDER BY created_at, id")
            .map_err(storage)?;
        let rows = stmt
            .query_map([], row_to_thread)
            .map_err(storage)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage)?;
        Ok(rows)
    }

    /// All non-shadow threads whose id lies strictly below `root`.
    pub fn delegate_threads(&self, root: &ThreadId) -> Result<Vec<Thread>> {
        Ok(self
            .list_threads()?
            .into_iter()
            .filter(|t| !t.is_shadow && root.is_ancestor_of(&t.id))
            .collect())
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Append an event atomically, assign its sequence number, and notify
    /// subscribers of the thread.
    ///
    /// Fails with [`Error::InvariantViolation`] on a duplicate event id or
    /// an unknown thread, and [`Error::Storage`] on disk failure. A
    /// timestamp earlier than the thread's latest is clamped forward so
    /// per-thread timestamps stay non-decreasing.
    pub fn append(&self, event: ThreadEvent) -> Result<StoredEvent> {
        let stored = {
            let conn = self.db.conn.lock();

            let thread_exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM threads WHERE id = ?1",
                    params![event.thread_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage)?;
            if thread_exists.is_none() {
                return Err(Error::InvariantViolation(format!(
                    "append to unknown thread '{}'",
                    event.thread_id
                )));
            }

            let last_ts: Option<String> = conn
                .query_row(
                    "SELECT timestamp FROM events WHERE thread_id = ?1 ORDER BY seq DESC LIMIT 1",
                    params![event.thread_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage)?;

            let mut event = event;
            if let Some(last) = last_ts.as_deref().and_then(parse_timestamp) {
                if event.timestamp < last {
                    event.timestamp = last;
                }
            }

            let data = serde_json::to_string(&event.payload)?;
            let result = conn.execute(
                "INSERT INTO events (id, thread_id, type, timestamp, data) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.id.as_str(),
                    event.thread_id.as_str(),
                    event.payload.kind(),
                    event.timestamp.to_rfc3339(),
                    data,
                ],
            );
            match result {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Err(Error::InvariantViolation(format!(
                        "duplicate event id '{}' in thread '{}'",
                        event.id, event.thread_id
                    )));
                }
                Err(e) => return Err(storage(e)),
            }

            StoredEvent {
                seq: conn.last_insert_rowid() as u64,
                event,
            }
        };

        self.notify(&stored);
        Ok(stored)
    }

    /// Events of a thread in insertion order, optionally only those with a
    /// sequence number greater than `since_seq`. No events are omitted.
    pub fn events_for_thread(
        &self,
        thread_id: &ThreadId,
        since_seq: Option<u64>,
    ) -> Result<Vec<StoredEvent>> {
        let conn = self.db.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT seq, id, thread_id, timestamp, data FROM events \
                 WHERE thread_id = ?1 AND seq > ?2 ORDER BY seq",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(
                params![thread_id.as_str(), since_seq.unwrap_or(0) as i64],
                row_to_stored_event,
            )
            .map_err(storage)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage)?;
        rows.into_iter().collect()
    }

    // ── Subscriptions ──────────────────────────────────────────────

    /// Subscribe to every subsequently appended event of `thread_id`, in
    /// insertion order.
    pub fn subscribe(&self, thread_id: &ThreadId) -> Subscription {
        let inner = Arc::new(SubscriptionInner {
            thread_id: thread_id.clone(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: SUBSCRIBER_QUEUE_CAPACITY,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.subscribers
            .lock()
            .entry(thread_id.clone())
            .or_default()
            .push(Arc::downgrade(&inner));
        Subscription { inner }
    }

    fn notify(&self, stored: &StoredEvent) {
        let mut subscribers = self.subscribers.lock();
        if let Some(subs) = subscribers.get_mut(&stored.event.thread_id) {
            subs.retain(|weak| match weak.upgrade() {
                Some(sub) => {
                    sub.push(stored.clone());
                    true
                }
                None => false,
            });
            if subs.is_empty() {
                subscribers.remove(&stored.event.thread_id);
            }
        }
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        for subs in self.subscribers.lock().values() {
            for weak in subs {
                if let Some(sub) = weak.upgrade() {
                    sub.closed.store(true, Ordering::Release);
                    sub.notify.notify_waiters();
                }
            }
        }
    }
}

struct SubscriptionInner {
    #[allow(dead_code)]
    thread_id: ThreadId,
    queue: Mutex<VecDeque<StoredEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriptionInner {
    fn push(&self, stored: StoredEvent) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    thread_id = %stored.event.thread_id,
                    dropped_total = total,
                    "subscriber queue overflow, dropping oldest notification"
                );
            }
            queue.push_back(stored);
        }
        self.notify.notify_waiters();
    }
}

/// A bounded, drop-oldest notification queue for one thread.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Receive the next notification. Returns `None` once the store has
    /// been dropped and the queue is drained.
    pub async fn recv(&mut self) -> Option<StoredEvent> {
        loop {
            if let Some(stored) = self.inner.queue.lock().pop_front() {
                return Some(stored);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            let notified = self.inner.notify.notified();
            if !self.inner.queue.lock().is_empty() || self.inner.closed.load(Ordering::Acquire) {
                continue;
            }
            notified.await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<StoredEvent> {
        self.inner.queue.lock().pop_front()
    }

    /// Number of notifications dropped due to overflow. The caller should
    /// resync by re-reading with `since_seq` when this grows.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

// ── Row mapping ────────────────────────────────────────────────────

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    let id: String = row.get(0)?;
    let parent: Option<String> = row.get(1)?;
    let created_at: String = row.get(2)?;
    let metadata: String = row.get(3)?;
    let is_shadow: i64 = row.get(4)?;
    Ok(Thread {
        id: ThreadId::new(id),
        parent_id: parent.map(ThreadId::new),
        created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
        metadata: serde_json::from_str::<ThreadMetadata>(&metadata).unwrap_or_default(),
        is_shadow: is_shadow != 0,
    })
}

fn row_to_stored_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<StoredEvent>> {
    let seq: i64 = row.get(0)?;
    let id: String = row.get(1)?;
    let thread_id: String = row.get(2)?;
    let timestamp: String = row.get(3)?;
    let data: String = row.get(4)?;
    Ok(decode_event(seq, id, thread_id, timestamp, data))
}

fn decode_event(
    seq: i64,
    id: String,
    thread_id: String,
    timestamp: String,
    data: String,
) -> Result<StoredEvent> {
    let payload: EventPayload = serde_json::from_str(&data)?;
    let timestamp = parse_timestamp(&timestamp)
        .ok_or_else(|| Error::Storage(format!("unreadable timestamp '{timestamp}'")))?;
    Ok(StoredEvent {
        seq: seq as u64,
        event: ThreadEvent {
            id: EventId::new(id),
            thread_id: ThreadId::new(thread_id),
            timestamp,
            payload,
        },
    })
}
