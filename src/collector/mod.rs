/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;
use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::CancelReason;
use crate::DEFAULT_COLLECTOR_SIZE;
use crate::Error;
use crate::Result;
use crate::Stanza;
use crate::StanzaError;
use crate::StanzaErrorCondition;
use crate::StanzaFilter;

/// Which stanzas a collector captures and how many it keeps.
#[derive(Clone)]
pub struct CollectorConfig {
    pub filter: Arc<dyn StanzaFilter>,
    pub capacity: usize,
}

impl CollectorConfig {
    pub fn new(filter: impl StanzaFilter + 'static) -> Self {
        CollectorConfig::shared(Arc::new(filter))
    }

    pub fn shared(filter: Arc<dyn StanzaFilter>) -> Self {
        CollectorConfig {
            filter,
            capacity: DEFAULT_COLLECTOR_SIZE,
        }
    }

    /// Sets the queue bound. A zero capacity is raised to one.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

struct Queue {
    items: VecDeque<Arc<Stanza>>,
    cancelled: Option<CancelReason>,
    collected: u64,
    dropped: u64,
}

pub(crate) struct Shared {
    filter: Arc<dyn StanzaFilter>,
    capacity: usize,
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl Shared {
    fn new(config: CollectorConfig) -> Self {
        Shared {
            filter: config.filter,
            capacity: config.capacity.max(1),
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                cancelled: None,
                collected: 0,
                dropped: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Queues the stanza if the filter accepts it, evicting the oldest
    /// unread entry when full. Never blocks on readers.
    fn offer(&self, stanza: &Arc<Stanza>) -> bool {
        if !self.filter.accept(stanza) {
            return false;
        }
        let mut queue = self.queue.lock();
        if queue.cancelled.is_some() {
            return false;
        }
        if queue.items.len() >= self.capacity {
            queue.items.pop_front();
            queue.dropped += 1;
            trace!(capacity = self.capacity, "collector full, oldest stanza dropped");
        }
        queue.items.push_back(Arc::clone(stanza));
        queue.collected += 1;
        drop(queue);
        self.ready.notify_one();
        true
    }

    /// Marks the collector terminated. The first reason sticks.
    fn cancel(&self, reason: CancelReason) -> bool {
        let mut queue = self.queue.lock();
        if queue.cancelled.is_some() {
            return false;
        }
        queue.cancelled = Some(reason);
        drop(queue);
        self.ready.notify_all();
        true
    }
}

struct RegistryInner {
    collectors: Mutex<Vec<Arc<Shared>>>,
    live: AtomicBool,
}

impl RegistryInner {
    fn unregister(&self, shared: &Arc<Shared>) {
        self.collectors
            .lock()
            .retain(|other| !Arc::ptr_eq(other, shared));
    }
}

/// The dispatch-side list of live collectors of one connection.
///
/// The connection's reader thread is the only caller of `dispatch()`,
/// which makes it the single writer of every registered queue.
#[derive(Clone)]
pub struct CollectorRegistry {
    inner: Arc<RegistryInner>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        CollectorRegistry {
            inner: Arc::new(RegistryInner {
                collectors: Mutex::new(Vec::new()),
                live: AtomicBool::new(false),
            }),
        }
    }

    /// Creates a collector which is already registered when returned, so
    /// a reply to a stanza sent right afterwards cannot be missed.
    pub fn create(&self, config: CollectorConfig) -> StanzaCollector {
        let shared = Arc::new(Shared::new(config));
        self.inner.collectors.lock().push(Arc::clone(&shared));
        StanzaCollector {
            shared,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Offers the stanza to every registered collector and returns how
    /// many of them accepted it.
    pub fn dispatch(&self, stanza: &Arc<Stanza>) -> usize {
        let collectors = self.inner.collectors.lock().clone();
        let mut accepted = 0;
        for collector in collectors {
            match catch_unwind(AssertUnwindSafe(|| collector.offer(stanza))) {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(_) => error!(
                    filter = %collector.filter.describe(),
                    "collector filter panicked, stanza skipped for it"
                ),
            }
        }
        accepted
    }

    /// Cancels and unregisters every collector, waking all blocked readers.
    pub fn cancel_all(&self, reason: CancelReason) {
        let collectors = std::mem::take(&mut *self.inner.collectors.lock());
        if !collectors.is_empty() {
            debug!(count = collectors.len(), %reason, "cancelling collectors");
        }
        for collector in collectors {
            collector.cancel(reason.clone());
        }
    }

    /// Whether a stream currently feeds this registry.
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn set_live(&self, live: bool) {
        self.inner.live.store(live, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.inner.collectors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        CollectorRegistry::new()
    }
}

/// A bounded inbox of stanzas matching a filter.
///
/// Stanzas are read in arrival order and each one is handed to exactly
/// one reader, no matter how many threads poll concurrently. When more
/// stanzas arrive than the capacity allows, the oldest unread ones are
/// dropped.
///
/// Dropping the handle cancels the collector.
pub struct StanzaCollector {
    shared: Arc<Shared>,
    registry: Weak<RegistryInner>,
}

impl StanzaCollector {
    /// Takes the next stanza without waiting.
    ///
    /// Stanzas queued before a cancellation can still be drained this way.
    pub fn poll(&self) -> Option<Arc<Stanza>> {
        self.shared.queue.lock().items.pop_front()
    }

    /// Waits up to `timeout` for a stanza. `Ok(None)` means the time ran
    /// out, while a cancelled collector fails with `Error::Cancelled`.
    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<Arc<Stanza>>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut queue = self.shared.queue.lock();
        loop {
            if let Some(reason) = &queue.cancelled {
                return Err(Error::Cancelled(reason.clone()));
            }
            if let Some(stanza) = queue.items.pop_front() {
                return Ok(Some(stanza));
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.ready.wait_until(&mut queue, deadline).timed_out() {
                        if let Some(reason) = &queue.cancelled {
                            return Err(Error::Cancelled(reason.clone()));
                        }
                        return Ok(queue.items.pop_front());
                    }
                }
                None => self.shared.ready.wait(&mut queue),
            }
        }
    }

    /// Waits until a stanza arrives or the collector is cancelled.
    pub fn poll_blocking(&self) -> Result<Arc<Stanza>> {
        let mut queue = self.shared.queue.lock();
        loop {
            if let Some(reason) = &queue.cancelled {
                return Err(Error::Cancelled(reason.clone()));
            }
            if let Some(stanza) = queue.items.pop_front() {
                return Ok(stanza);
            }
            self.shared.ready.wait(&mut queue);
        }
    }

    /// Waits for the single reply this collector was created for and
    /// cancels it afterwards.
    ///
    /// A timeout is reported as `NotConnected` when the connection went
    /// away meanwhile, or as `NoResponse` otherwise. A reply of type
    /// `error` turns into `Error::Stanza`.
    pub fn next_reply(&self, timeout: Duration) -> Result<Arc<Stanza>> {
        let result = self.poll_timeout(timeout);
        self.cancel();
        let stanza = match result? {
            Some(stanza) => stanza,
            None => {
                let connected = self
                    .registry
                    .upgrade()
                    .is_some_and(|registry| registry.live.load(Ordering::Acquire));
                if !connected {
                    return Err(Error::NotConnected);
                }
                return Err(Error::NoResponse {
                    timeout,
                    filter: self.shared.filter.describe(),
                });
            }
        };
        if stanza.is_error() {
            let error = stanza
                .error()
                .cloned()
                .unwrap_or_else(|| StanzaError::new(StanzaErrorCondition::UndefinedCondition));
            return Err(Error::Stanza(error));
        }
        Ok(stanza)
    }

    /// Stops collecting. Idempotent.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Explicit);
    }

    pub(crate) fn cancel_with(&self, reason: CancelReason) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(&self.shared);
        }
        self.shared.cancel(reason);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.queue.lock().cancelled.is_some()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.shared.queue.lock().cancelled.clone()
    }

    /// Number of unread stanzas.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Stanzas accepted since creation, including dropped ones.
    pub fn collected_count(&self) -> u64 {
        self.shared.queue.lock().collected
    }

    /// Stanzas evicted unread because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.shared.queue.lock().dropped
    }

    pub fn filter(&self) -> &Arc<dyn StanzaFilter> {
        &self.shared.filter
    }
}

impl Drop for StanzaCollector {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests;
