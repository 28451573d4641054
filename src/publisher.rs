//! Status Publisher: snapshots and subscriber fan-out
//!
//! Subscribers are plain callbacks keyed by a numeric id. A callback that
//! panics is logged and skipped; the rest still get the notification.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use atomic_counter::{AtomicCounter, RelaxedCounter};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::{ExitReport, Status, StreamKind};

/// Point-in-time view of the monitor session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub running: bool,
    pub status: Status,
    /// Whether the supervisor itself is elevated.
    pub admin: bool,
    pub requires_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub integrated_mode: bool,
    pub session_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub monitors: BTreeMap<String, bool>,
}

/// One raw line from the child, forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub pid: u32,
    pub stream: StreamKind,
    pub line: String,
}

/// Handle returned by the `subscribe_*` calls.
pub type SubscriptionId = u64;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    name: &'static str,
    subscribers: DashMap<SubscriptionId, Callback<T>>,
}

impl<T> Registry<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: DashMap::new(),
        }
    }

    fn notify(&self, value: &T) {
        // Snapshot the callbacks so none runs while a shard lock is held;
        // a callback may (un)subscribe.
        let mut callbacks: Vec<(SubscriptionId, Callback<T>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        callbacks.sort_by_key(|(id, _)| *id);

        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                log::error!("{} subscriber {id} panicked during notification", self.name);
            }
        }
    }
}

pub struct Publisher {
    next_id: RelaxedCounter,
    status: Registry<StatusSnapshot>,
    output: Registry<OutputLine>,
    exit: Registry<ExitReport>,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher {
    pub fn new() -> Self {
        Self {
            next_id: RelaxedCounter::new(1),
            status: Registry::new("status"),
            output: Registry::new("output"),
            exit: Registry::new("exit"),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        self.next_id.inc() as SubscriptionId
    }

    pub fn subscribe_status<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.status.subscribers.insert(id, Arc::new(callback));
        id
    }

    pub fn subscribe_output<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&OutputLine) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.output.subscribers.insert(id, Arc::new(callback));
        id
    }

    pub fn subscribe_exit<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ExitReport) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.exit.subscribers.insert(id, Arc::new(callback));
        id
    }

    /// Remove a subscription of any kind. Returns whether it existed;
    /// removing twice is harmless.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.status.subscribers.remove(&id).is_some()
            | self.output.subscribers.remove(&id).is_some()
            | self.exit.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.status.subscribers.len() + self.output.subscribers.len() + self.exit.subscribers.len()
    }

    pub fn publish_status(&self, snapshot: &StatusSnapshot) {
        self.status.notify(snapshot);
    }

    pub fn publish_output(&self, line: &OutputLine) {
        self.output.notify(line);
    }

    pub fn publish_exit(&self, report: &ExitReport) {
        self.exit.notify(report);
    }
}
