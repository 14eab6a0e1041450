//! Hierarchical thread identifiers.
//!
//! A session's coordinator thread carries the session id itself; delegate
//! threads append `.N` per level, so `s1.2.1` is the first delegate of the
//! second delegate of `s1`. The parent is obtained by stripping the final
//! `.N`.

use serde::{Deserialize, Serialize};

/// A stable thread identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id of the Nth delegate under this thread.
    pub fn delegate(&self, n: u32) -> ThreadId {
        ThreadId(format!("{}.{n}", self.0))
    }

    /// The parent thread id, or `None` for a root thread.
    ///
    /// Only a trailing `.N` (numeric) suffix denotes a delegate; a root id
    /// containing dots (e.g. a dotted UUID-ish name) has no parent.
    pub fn parent(&self) -> Option<ThreadId> {
        let (prefix, suffix) = self.0.rsplit_once('.')?;
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            Some(ThreadId(prefix.to_owned()))
        } else {
            None
        }
    }

    /// Number of delegate levels below the root (root = 0).
    pub fn depth(&self) -> u32 {
        let mut depth = 0;
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// Whether `other` lies strictly below this thread in the hierarchy.
    pub fn is_ancestor_of(&self, other: &ThreadId) -> bool {
        other
            .0
            .strip_prefix(&self.0)
            .and_then(|rest| rest.strip_prefix('.'))
            .is_some_and(|rest| !rest.is_empty())
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        ThreadId(s.to_owned())
    }
}

impl From<String> for ThreadId {
    fn from(s: String) -> Self {
        ThreadId(s)
    }
}
