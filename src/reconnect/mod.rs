/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

pub mod backoff;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::Connection;
use crate::ConnectionListener;
use crate::ConnectionRegistry;
use crate::Error;
use crate::ListenerId;
use crate::ReconnectionConfig;
use crate::ReconnectionPolicy;
use crate::StreamErrorCondition;
use crate::WeakConnection;
use crate::connection::isolate;

/// Progress reports of the retry thread.
pub trait ReconnectionListener: Send + Sync {
    /// Seconds left before the next attempt. Zero right before it.
    fn reconnecting_in(&self, _seconds: u64) {}

    fn reconnection_failed(&self, _error: &Error) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionState {
    /// Nothing to do: connected, or not allowed to retry yet.
    Idle,
    /// The retry thread is counting down or connecting.
    Reconnecting,
    /// The connection was closed on purpose.
    Stopped,
}

struct Control {
    enabled: bool,
    done: bool,
    policy: ReconnectionPolicy,
    running: bool,
    // The retry thread exists, possibly still finishing an aborted cycle.
    alive: bool,
    // Bumped to abandon the running retry cycle.
    cycle: u64,
    spawned: u64,
}

struct ManagerInner {
    connection: WeakConnection,
    random_base: u64,
    tick: Duration,
    suppressed: HashSet<StreamErrorCondition>,
    control: Mutex<Control>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ReconnectionListener>)>>,
}

/// Brings a connection back after it failed.
///
/// There is at most one manager per connection. When the stream fails,
/// and neither the user closed the connection nor the failure was a
/// suppressed stream error such as `conflict`, a single retry thread
/// waits according to the reconnection policy and calls `connect()`
/// until it succeeds or reconnection is no longer allowed.
#[derive(Clone)]
pub struct ReconnectionManager {
    inner: Arc<ManagerInner>,
}

impl ReconnectionManager {
    /// The manager of `connection`, created on first use from the
    /// connection's own reconnection settings.
    pub fn instance_for(connection: &Connection) -> ReconnectionManager {
        ReconnectionManager::instance_with(connection, connection.config().reconnection())
    }

    fn instance_with(connection: &Connection, config: &ReconnectionConfig) -> ReconnectionManager {
        connection
            .inner()
            .reconnection
            .get_or_init(|| {
                let manager = ReconnectionManager::new(connection, config);
                connection.add_connection_listener(manager.inner.clone());
                manager
            })
            .clone()
    }

    fn new(connection: &Connection, config: &ReconnectionConfig) -> Self {
        let random_base = backoff::random_base();
        debug!(connection = connection.id(), random_base, "reconnection manager created");
        ReconnectionManager {
            inner: Arc::new(ManagerInner {
                connection: connection.downgrade(),
                random_base,
                tick: config.tick,
                suppressed: config.suppressed_conditions.clone(),
                control: Mutex::new(Control {
                    enabled: config.enabled_by_default,
                    done: false,
                    policy: config.policy,
                    running: false,
                    alive: false,
                    cycle: 0,
                    spawned: 0,
                }),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attaches a manager to every connection the registry creates.
    pub fn install(registry: &ConnectionRegistry, config: ReconnectionConfig) -> ListenerId {
        registry.add_creation_listener(move |connection: &Connection| {
            ReconnectionManager::instance_with(connection, &config);
        })
    }

    pub fn enable_automatic_reconnection(&self) {
        self.inner.control.lock().enabled = true;
    }

    /// Stops retrying. A running retry thread exits at its next check.
    pub fn disable_automatic_reconnection(&self) {
        self.inner.control.lock().enabled = false;
    }

    pub fn is_automatic_reconnection_enabled(&self) -> bool {
        self.inner.control.lock().enabled
    }

    pub fn set_reconnection_policy(&self, policy: ReconnectionPolicy) {
        self.inner.control.lock().policy = policy;
    }

    pub fn reconnection_policy(&self) -> ReconnectionPolicy {
        self.inner.control.lock().policy
    }

    /// The random base of this manager, in seconds.
    pub fn random_base(&self) -> u64 {
        self.inner.random_base
    }

    /// Seconds the retry thread waits before the given attempt.
    pub fn delay_for_attempt(&self, attempt: u64) -> u64 {
        self.inner.delay_for_attempt(attempt)
    }

    pub fn state(&self) -> ReconnectionState {
        let control = self.inner.control.lock();
        if control.done {
            ReconnectionState::Stopped
        } else if control.running {
            ReconnectionState::Reconnecting
        } else {
            ReconnectionState::Idle
        }
    }

    /// Abandons the current retry cycle, if any. A later failure starts
    /// a new one, on the same thread if it is still finishing an attempt.
    pub fn abort_possibly_running_reconnection(&self) {
        let mut control = self.inner.control.lock();
        if control.running {
            debug!("aborting reconnection");
        }
        control.cycle += 1;
        control.running = false;
    }

    pub fn add_reconnection_listener(&self, listener: Arc<dyn ReconnectionListener>) -> ListenerId {
        let id = ListenerId::next();
        self.inner.listeners.lock().push((id, listener));
        id
    }

    pub fn remove_reconnection_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(other, _)| *other != id);
        listeners.len() != before
    }

    #[cfg(test)]
    fn threads_spawned(&self) -> u64 {
        self.inner.control.lock().spawned
    }

    #[cfg(test)]
    fn thread_alive(&self) -> bool {
        self.inner.control.lock().alive
    }
}

impl ManagerInner {
    fn delay_for_attempt(&self, attempt: u64) -> u64 {
        match self.control.lock().policy {
            ReconnectionPolicy::RandomIncreasingDelay => {
                backoff::tiered_delay(self.random_base, attempt)
            }
            ReconnectionPolicy::FixedDelay { seconds } => seconds,
        }
    }

    /// Starts the retry thread unless one is already running.
    fn reconnect(self: &Arc<Self>) {
        let mut control = self.control.lock();
        if control.running {
            debug!("reconnection already in progress");
            return;
        }
        if control.alive {
            // The thread of an aborted cycle takes the new one over.
            debug!("reconnection resumed");
            control.running = true;
            return;
        }
        let cycle = control.cycle;
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(String::from("ikslink-reconnect"))
            .spawn(move || inner.retry_loop(cycle));
        match spawned {
            Ok(_) => {
                control.running = true;
                control.alive = true;
                control.spawned += 1;
            }
            Err(err) => error!(error = %err, "could not start the reconnection thread"),
        }
    }

    /// The connection, while the retry thread may go on. Ends the cycle
    /// and the thread otherwise.
    fn allowed(&self, cycle: &mut u64) -> Option<Connection> {
        let mut control = self.control.lock();
        if control.cycle != *cycle {
            if !control.running {
                control.alive = false;
                return None;
            }
            // Aborted, then restarted while this thread was busy.
            *cycle = control.cycle;
        }
        let connection = self.connection.upgrade().filter(|connection| {
            control.enabled
                && !control.done
                && connection.config().is_reconnection_allowed()
                && !connection.is_connected()
        });
        if connection.is_none() {
            control.running = false;
            control.alive = false;
        }
        connection
    }

    fn retry_loop(&self, mut cycle: u64) {
        let mut attempt = 0;
        while let Some(connection) = self.allowed(&mut cycle) {
            attempt += 1;
            let delay = self.delay_for_attempt(attempt);
            info!(connection = connection.id(), attempt, delay_secs = delay, "reconnecting");
            drop(connection);
            for remaining in (1..=delay).rev() {
                if self.allowed(&mut cycle).is_none() {
                    return;
                }
                self.notify(|listener| listener.reconnecting_in(remaining));
                thread::sleep(self.tick);
            }
            self.notify(|listener| listener.reconnecting_in(0));
            let Some(connection) = self.allowed(&mut cycle) else {
                return;
            };
            match connection.connect() {
                Ok(()) | Err(Error::AlreadyConnected) => {
                    info!(connection = connection.id(), attempt, "reconnected");
                }
                // Closed on purpose while the attempt was under way.
                Err(Error::Cancelled(_)) => {
                    debug!(connection = connection.id(), attempt, "reconnection cancelled");
                }
                Err(err) => {
                    warn!(connection = connection.id(), attempt, error = %err, "reconnection failed");
                    self.notify(|listener| listener.reconnection_failed(&err));
                }
            }
        }
    }

    fn notify<F: Fn(&dyn ReconnectionListener)>(&self, f: F) {
        let listeners: Vec<Arc<dyn ReconnectionListener>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            isolate("reconnection", || f(listener.as_ref()));
        }
    }
}

impl ConnectionListener for ManagerInner {
    fn connected(&self, _connection: &Connection) {
        self.control.lock().done = false;
    }

    fn connection_closed(&self, _connection: &Connection) {
        self.control.lock().done = true;
    }

    fn connection_closed_on_error(&self, connection: &Connection, error: &Error) {
        if let Some(condition) = error.stream_condition() {
            if self.suppressed.contains(condition) {
                info!(connection = connection.id(), %condition, "stream error suppresses reconnection");
                return;
            }
        }
        {
            let control = self.control.lock();
            if !control.enabled || control.done {
                return;
            }
        }
        if !connection.config().is_reconnection_allowed() {
            return;
        }
        // The retry thread needs an `Arc` of this manager.
        let manager = ReconnectionManager::instance_for(connection);
        manager.inner.reconnect();
    }
}

#[cfg(test)]
mod tests;
