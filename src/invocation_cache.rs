use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use function_proto::FunctionMessage;
use tokio::{sync::OnceCell, time::Instant};

use crate::config::InvocationCacheConfig;

/// Result slot of one invocation. Concurrent duplicates wait on the same
/// cell; it stays empty while the handler runs or after it failed.
pub type InvocationSlot = Arc<OnceCell<FunctionMessage>>;

struct Invocation {
    slot: InvocationSlot,
    created_at: Instant,
}

/// Invocations keyed by `(FunctionName, FunctionInvokeID)`.
///
/// Entries expire `ttl` after they were created. When full, expired entries
/// are dropped first and then the oldest one.
pub struct InvocationCache {
    entries: DashMap<(String, String), Invocation>,
    ttl: Duration,
    capacity: usize,
}

impl InvocationCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity,
        }
    }

    pub fn from_config(config: &InvocationCacheConfig) -> Option<Self> {
        if !config.enabled || config.capacity == 0 {
            return None;
        }
        Some(Self::new(Duration::from_secs(config.ttl_secs), config.capacity))
    }

    /// Returns the slot shared by every call with this function name and
    /// invoke id, creating it on first use.
    pub fn slot(&self, function_name: &str, invoke_id: &str) -> InvocationSlot {
        let key = (function_name.to_string(), invoke_id.to_string());
        let now = Instant::now();
        self.entries
            .remove_if(&key, |_, invocation| self.is_expired(invocation, now));
        if let Some(invocation) = self.entries.get(&key) {
            return invocation.slot.clone();
        }
        if self.entries.len() >= self.capacity {
            self.evict(now);
        }
        self.entries
            .entry(key)
            .or_insert_with(|| Invocation {
                slot: Arc::new(OnceCell::new()),
                created_at: now,
            })
            .slot
            .clone()
    }

    /// The completed response for an invocation, if any.
    pub fn get(&self, function_name: &str, invoke_id: &str) -> Option<FunctionMessage> {
        let key = (function_name.to_string(), invoke_id.to_string());
        let now = Instant::now();
        if self
            .entries
            .remove_if(&key, |_, invocation| self.is_expired(invocation, now))
            .is_some()
        {
            return None;
        }
        self.entries
            .get(&key)
            .and_then(|invocation| invocation.slot.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, invocation: &Invocation, now: Instant) -> bool {
        now.duration_since(invocation.created_at) >= self.ttl
    }

    fn evict(&self, now: Instant) {
        self.entries
            .retain(|_, invocation| !self.is_expired(invocation, now));
        if self.entries.len() < self.capacity {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().created_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}
