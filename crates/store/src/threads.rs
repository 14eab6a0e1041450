//! Thread manager — a thin index over the event store that understands
//! the delegate hierarchy and compaction splicing.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use weft_domain::{
    EventPayload, Result, Thread, ThreadEvent, ThreadId, ThreadMetadata,
};

use crate::events::EventStore;

/// Maximum compaction markers followed while splicing, to stop a cyclic
/// shadow reference from looping forever.
const MAX_SPLICE_DEPTH: usize = 16;

pub struct ThreadManager {
    store: Arc<EventStore>,
    /// Guards delegate-id allocation so concurrent spawns under the same
    /// parent get distinct, monotonically increasing suffixes.
    allocate: Mutex<()>,
}

impl ThreadManager {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self {
            store,
            allocate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// The effective event list of a thread: if a compaction marker
    /// exists, the shadow thread's events form a prefix of everything
    /// appended after the marker. The *last* marker wins.
    pub fn effective_events(&self, thread_id: &ThreadId) -> Result<Vec<ThreadEvent>> {
        self.effective_events_inner(thread_id, 0)
    }

    fn effective_events_inner(&self, thread_id: &ThreadId, depth: usize) -> Result<Vec<ThreadEvent>> {
        let events: Vec<ThreadEvent> = self
            .store
            .events_for_thread(thread_id, None)?
            .into_iter()
            .map(|stored| stored.event)
            .collect();

        let marker = events.iter().rposition(|e| {
            matches!(e.payload, EventPayload::Compaction { .. })
        });

        let Some(idx) = marker else {
            return Ok(events);
        };

        if depth >= MAX_SPLICE_DEPTH {
            tracing::warn!(
                thread_id = %thread_id,
                "compaction splice depth exceeded, returning raw events"
            );
            return Ok(events);
        }

        let shadow_id = match &events[idx].payload {
            EventPayload::Compaction { shadow_thread_id } => shadow_thread_id.clone(),
            _ => unreachable!(),
        };

        let mut spliced = self.effective_events_inner(&shadow_id, depth + 1)?;
        spliced.extend(events.into_iter().skip(idx + 1));
        Ok(spliced)
    }

    /// The root thread's effective events plus those of every delegate
    /// thread under it, delegates ordered by id.
    pub fn main_and_delegate_events(
        &self,
        root: &ThreadId,
    ) -> Result<Vec<(Thread, Vec<ThreadEvent>)>> {
        let mut result = Vec::new();
        if let Some(thread) = self.store.get_thread(root)? {
            let events = self.effective_events(root)?;
            result.push((thread, events));
        }
        let mut delegates = self.store.delegate_threads(root)?;
        delegates.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        for thread in delegates {
            let events = self.effective_events(&thread.id)?;
            result.push((thread, events));
        }
        Ok(result)
    }

    /// Allocate the next delegate thread id under `parent` and create its
    /// record. Allocation is monotonic even under concurrent spawns.
    pub fn next_delegate_id(&self, parent: &ThreadId, name: Option<&str>) -> Result<ThreadId> {
        let _guard = self.allocate.lock();

        let max_suffix = self
            .store
            .list_threads()?
            .into_iter()
            .filter_map(|t| {
                let rest = t.id.as_str().strip_prefix(parent.as_str())?;
                let suffix = rest.strip_prefix('.')?;
                // Direct children only: a single numeric segment.
                suffix.parse::<u32>().ok()
            })
            .max()
            .unwrap_or(0);

        let child = parent.delegate(max_suffix + 1);
        self.store.create_thread(&Thread {
            id: child.clone(),
            parent_id: Some(parent.clone()),
            created_at: Utc::now(),
            metadata: ThreadMetadata {
                name: name.map(str::to_owned),
                is_agent: true,
                ..Default::default()
            },
            is_shadow: false,
        })?;
        Ok(child)
    }

    /// Create a shadow thread attached to `origin` for compaction.
    pub fn create_shadow(&self, origin: &ThreadId) -> Result<ThreadId> {
        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = ThreadId::new(format!("shadow-{}", &short[..12]));
        self.store.create_thread(&Thread {
            id: id.clone(),
            parent_id: Some(origin.clone()),
            created_at: Utc::now(),
            metadata: ThreadMetadata::default(),
            is_shadow: true,
        })?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn manager() -> ThreadManager {
        let store = Arc::new(EventStore::new(Arc::new(Database::open_in_memory().unwrap())));
        ThreadManager::new(store)
    }

    fn root(manager: &ThreadManager, id: &str) -> ThreadId {
        let tid = ThreadId::new(id);
        manager
            .store()
            .create_thread(&Thread {
                id: tid.clone(),
                parent_id: None,
                created_at: Utc::now(),
                metadata: ThreadMetadata::default(),
                is_shadow: false,
            })
            .unwrap();
        tid
    }

    fn append_user(manager: &ThreadManager, tid: &ThreadId, text: &str) {
        manager
            .store()
            .append(ThreadEvent::new(
                tid.clone(),
                EventPayload::UserMessage { text: text.into() },
            ))
            .unwrap();
    }

    fn texts(events: &[ThreadEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match &e.payload {
                EventPayload::UserMessage { text } => text.clone(),
                EventPayload::AgentMessage { text, .. } => text.clone(),
                other => format!("<{}>", other.kind()),
            })
            .collect()
    }

    #[test]
    fn delegate_ids_are_monotonic() {
        let manager = manager();
        let parent = root(&manager, "s1");
        let a = manager.next_delegate_id(&parent, Some("worker")).unwrap();
        let b = manager.next_delegate_id(&parent, None).unwrap();
        assert_eq!(a.as_str(), "s1.1");
        assert_eq!(b.as_str(), "s1.2");

        // Grandchildren do not disturb the parent's numbering.
        let grandchild = manager.next_delegate_id(&a, None).unwrap();
        assert_eq!(grandchild.as_str(), "s1.1.1");
        let c = manager.next_delegate_id(&parent, None).unwrap();
        assert_eq!(c.as_str(), "s1.3");
    }

    #[test]
    fn effective_events_without_compaction() {
        let manager = manager();
        let tid = root(&manager, "s1");
        append_user(&manager, &tid, "a");
        append_user(&manager, &tid, "b");
        assert_eq!(texts(&manager.effective_events(&tid).unwrap()), ["a", "b"]);
    }

    #[test]
    fn effective_events_splice_shadow_prefix() {
        let manager = manager();
        let tid = root(&manager, "s1");
        append_user(&manager, &tid, "old 1");
        append_user(&manager, &tid, "old 2");

        let shadow = manager.create_shadow(&tid).unwrap();
        manager
            .store()
            .append(ThreadEvent::new(
                shadow.clone(),
                EventPayload::AgentMessage {
                    text: "summary of old".into(),
                    usage: None,
                },
            ))
            .unwrap();
        manager
            .store()
            .append(ThreadEvent::new(
                tid.clone(),
                EventPayload::Compaction {
                    shadow_thread_id: shadow,
                },
            ))
            .unwrap();
        append_user(&manager, &tid, "new");

        let effective = manager.effective_events(&tid).unwrap();
        assert_eq!(texts(&effective), ["summary of old", "new"]);
    }

    #[test]
    fn last_compaction_marker_wins() {
        let manager = manager();
        let tid = root(&manager, "s1");
        append_user(&manager, &tid, "ancient");

        let first_shadow = manager.create_shadow(&tid).unwrap();
        manager
            .store()
            .append(ThreadEvent::new(
                first_shadow.clone(),
                EventPayload::AgentMessage {
                    text: "first summary".into(),
                    usage: None,
                },
            ))
            .unwrap();
        manager
            .store()
            .append(ThreadEvent::new(
                tid.clone(),
                EventPayload::Compaction {
                    shadow_thread_id: first_shadow,
                },
            ))
            .unwrap();
        append_user(&manager, &tid, "middle");

        let second_shadow = manager.create_shadow(&tid).unwrap();
        manager
            .store()
            .append(ThreadEvent::new(
                second_shadow.clone(),
                EventPayload::AgentMessage {
                    text: "second summary".into(),
                    usage: None,
                },
            ))
            .unwrap();
        manager
            .store()
            .append(ThreadEvent::new(
                tid.clone(),
                EventPayload::Compaction {
                    shadow_thread_id: second_shadow,
                },
            ))
            .unwrap();
        append_user(&manager, &tid, "latest");

        let effective = manager.effective_events(&tid).unwrap();
        assert_eq!(texts(&effective), ["second summary", "latest"]);
    }

    #[test]
    fn main_and_delegates_excludes_shadows() {
        let manager = manager();
        let parent = root(&manager, "s1");
        append_user(&manager, &parent, "root msg");
        let child = manager.next_delegate_id(&parent, Some("helper")).unwrap();
        append_user(&manager, &child, "child msg");
        let _shadow = manager.create_shadow(&parent).unwrap();

        let all = manager.main_and_delegate_events(&parent).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0.id, parent);
        assert_eq!(all[1].0.id, child);
    }
}
