//! Cancellation tokens with group fan-out.
//!
//! Every suspending operation (provider call, tool invocation, store
//! append) takes a `CancelToken` and must stop promptly once it fires.
//! Groups support cascading cancellation: cancelling a parent key cancels
//! every child registered in its group, which is how a coordinator stop
//! reaches in-flight delegate turns.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A cancellation token checked by the runtime at every suspension point.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once the token fires. Returns immediately if already
    /// cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Compose a timeout onto this token: the returned token fires when
    /// either the timeout elapses or this token is cancelled.
    ///
    /// Must be called within a tokio runtime.
    pub fn with_timeout(&self, timeout: Duration) -> CancelToken {
        let combined = CancelToken::new();
        let user = self.clone();
        let out = combined.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => out.cancel(),
                _ = user.cancelled() => out.cancel(),
            }
        });
        combined
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks active cancellation tokens per key, with group support for
/// cascading parent→child cancellation.
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
    /// group key (parent) → set of child keys.
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a new cancel token under `key`.
    pub fn register(&self, key: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(key.to_owned(), token.clone());
        token
    }

    /// Register an existing token under `key`, replacing any previous
    /// one.
    pub fn insert(&self, key: &str, token: CancelToken) {
        self.tokens.lock().insert(key.to_owned(), token);
    }

    /// Cancel the token under `key` and cascade to all children in its
    /// group. Returns true if a token was found.
    pub fn cancel(&self, key: &str) -> bool {
        let found = if let Some(token) = self.tokens.lock().get(key) {
            token.cancel();
            true
        } else {
            false
        };

        if let Some(children) = self.groups.lock().get(key) {
            let tokens = self.tokens.lock();
            for child in children {
                if let Some(token) = tokens.get(child) {
                    token.cancel();
                }
            }
        }

        found
    }

    /// Remove the token for `key` (called when the operation completes).
    pub fn remove(&self, key: &str) {
        self.tokens.lock().remove(key);
        self.groups.lock().remove(key);
    }

    /// Whether `key` currently has a registered (running) token.
    pub fn is_running(&self, key: &str) -> bool {
        self.tokens.lock().contains_key(key)
    }

    /// Register `child` in `parent`'s cancel group.
    pub fn add_to_group(&self, parent: &str, child: &str) {
        self.groups
            .lock()
            .entry(parent.to_owned())
            .or_default()
            .insert(child.to_owned());
    }

    /// Remove `child` from `parent`'s cancel group.
    pub fn remove_from_group(&self, parent: &str, child: &str) {
        let mut groups = self.groups.lock();
        if let Some(children) = groups.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                groups.remove(parent);
            }
        }
    }
}
