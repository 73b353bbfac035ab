/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Instant;

use super::*;
use crate::ConnectionConfig;
use crate::Jid;
use crate::Result;
use crate::transport::Connector;
use crate::transport::Session;
use crate::transport::memory::MemoryConnector;
use crate::transport::memory::MemoryServer;

const TICK: Duration = Duration::from_millis(10);

fn fast_config(enabled: bool, seconds: u64) -> ConnectionConfig {
    ConnectionConfig::builder(Jid::new("juliet@example.com/balcony").unwrap())
        .reconnection(ReconnectionConfig {
            enabled_by_default: enabled,
            policy: ReconnectionPolicy::FixedDelay { seconds },
            tick: TICK,
            ..ReconnectionConfig::default()
        })
        .build()
}

fn setup(enabled: bool, seconds: u64) -> (MemoryServer, Connection, ReconnectionManager) {
    let server = MemoryServer::new();
    let connection = Connection::new(fast_config(enabled, seconds), Arc::new(server.connector()));
    let manager = ReconnectionManager::instance_for(&connection);
    (server, connection, manager)
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    In(u64),
    Failed,
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Event>>);

impl ReconnectionListener for Recorder {
    fn reconnecting_in(&self, seconds: u64) {
        self.0.lock().push(Event::In(seconds));
    }

    fn reconnection_failed(&self, _error: &Error) {
        self.0.lock().push(Event::Failed);
    }
}

#[test]
fn tiers() {
    for attempt in 1..=7 {
        assert_eq!(backoff::tiered_delay(10, attempt), 10);
    }
    for attempt in 8..=13 {
        assert_eq!(backoff::tiered_delay(10, attempt), 60);
    }
    for attempt in [14, 15, 100] {
        assert_eq!(backoff::tiered_delay(10, attempt), 300);
    }
    for _ in 0..200 {
        assert!(backoff::BASE_RANGE.contains(&backoff::random_base()));
    }
}

#[test]
fn manager_policies() {
    let server = MemoryServer::new();
    let config = ConnectionConfig::builder(Jid::new("juliet@example.com").unwrap()).build();
    let connection = Connection::new(config, Arc::new(server.connector()));
    let manager = ReconnectionManager::instance_for(&connection);
    assert!(!manager.is_automatic_reconnection_enabled());
    assert_eq!(manager.reconnection_policy(), ReconnectionPolicy::RandomIncreasingDelay);

    let base = manager.random_base();
    assert!(backoff::BASE_RANGE.contains(&base));
    assert_eq!(manager.delay_for_attempt(1), base);
    assert_eq!(manager.delay_for_attempt(8), base * 6);
    assert_eq!(manager.delay_for_attempt(14), base * 30);

    manager.set_reconnection_policy(ReconnectionPolicy::FixedDelay { seconds: 4 });
    assert_eq!(manager.delay_for_attempt(1), 4);
    assert_eq!(manager.delay_for_attempt(20), 4);

    // One manager per connection.
    let again = ReconnectionManager::instance_for(&connection);
    assert!(Arc::ptr_eq(&manager.inner, &again.inner));
    manager.enable_automatic_reconnection();
    assert!(again.is_automatic_reconnection_enabled());
    again.disable_automatic_reconnection();
    assert!(!manager.is_automatic_reconnection_enabled());
}

#[test]
fn reconnects_after_stream_failure() {
    let (server, connection, manager) = setup(true, 1);
    let recorder = Arc::new(Recorder::default());
    manager.add_reconnection_listener(recorder.clone());

    connection.connect().unwrap();
    server.refuse_connections(2);
    assert!(server.drop_stream());

    wait_for("reconnection", || server.connect_count() == 2 && connection.is_connected());
    wait_for("idle manager", || manager.state() == ReconnectionState::Idle);
    assert_eq!(manager.threads_spawned(), 1);
    assert_eq!(
        *recorder.0.lock(),
        vec![
            Event::In(1),
            Event::In(0),
            Event::Failed,
            Event::In(1),
            Event::In(0),
            Event::Failed,
            Event::In(1),
            Event::In(0),
        ]
    );
}

#[test]
fn conflict_suppresses_reconnection() {
    let (server, connection, manager) = setup(true, 1);
    connection.connect().unwrap();
    assert!(server.raise_stream_error(StreamErrorCondition::Conflict));

    wait_for("disconnect", || !connection.is_connected());
    thread::sleep(TICK * 5);
    assert_eq!(manager.threads_spawned(), 0);
    assert_eq!(server.connect_count(), 1);
    assert_eq!(manager.state(), ReconnectionState::Idle);
}

#[test]
fn other_stream_errors_reconnect() {
    let (server, connection, manager) = setup(true, 1);
    connection.connect().unwrap();
    assert!(server.raise_stream_error(StreamErrorCondition::SystemShutdown));
    wait_for("reconnection", || server.connect_count() == 2 && connection.is_connected());
    assert_eq!(manager.threads_spawned(), 1);
}

#[test]
fn disabled_manager_does_nothing() {
    let (server, connection, manager) = setup(false, 1);
    connection.connect().unwrap();
    server.drop_stream();
    wait_for("disconnect", || !connection.is_connected());
    thread::sleep(TICK * 5);
    assert_eq!(manager.threads_spawned(), 0);
    assert_eq!(server.connect_count(), 1);
}

#[test]
fn start_is_idempotent() {
    let (server, connection, manager) = setup(true, 1);
    server.refuse_connections(usize::MAX);
    manager.inner.reconnect();
    manager.inner.reconnect();
    manager
        .inner
        .connection_closed_on_error(&connection, &Error::NotConnected);
    assert_eq!(manager.threads_spawned(), 1);
    assert_eq!(manager.state(), ReconnectionState::Reconnecting);

    manager.disable_automatic_reconnection();
    wait_for("retry thread exit", || manager.state() == ReconnectionState::Idle);
    assert!(!connection.is_connected());
}

#[test]
fn abort_ends_the_cycle() {
    let (server, _connection, manager) = setup(true, 50);
    server.refuse_connections(usize::MAX);
    manager.inner.reconnect();
    assert_eq!(manager.state(), ReconnectionState::Reconnecting);
    manager.abort_possibly_running_reconnection();
    assert_eq!(manager.state(), ReconnectionState::Idle);

    wait_for("retry thread exit", || !manager.thread_alive());
    manager.inner.reconnect();
    assert_eq!(manager.threads_spawned(), 2);
    manager.abort_possibly_running_reconnection();
}

/// Connects through a memory server after a pause.
struct SlowConnector {
    inner: MemoryConnector,
    delay: Duration,
    attempts: Arc<AtomicUsize>,
}

impl Connector for SlowConnector {
    fn connect(&self, config: &ConnectionConfig) -> Result<Session> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.inner.connect(config)
    }
}

fn slow_setup(seconds: u64) -> (MemoryServer, Connection, ReconnectionManager, Arc<AtomicUsize>) {
    let server = MemoryServer::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let connector = SlowConnector {
        inner: server.connector(),
        delay: Duration::from_millis(300),
        attempts: Arc::clone(&attempts),
    };
    let connection = Connection::new(fast_config(true, seconds), Arc::new(connector));
    let manager = ReconnectionManager::instance_for(&connection);
    (server, connection, manager, attempts)
}

#[test]
fn abort_during_connect_keeps_one_thread() {
    let (server, connection, manager, attempts) = slow_setup(0);
    connection.connect().unwrap();
    server.refuse_connections(usize::MAX);
    server.drop_stream();
    wait_for("attempt in flight", || attempts.load(Ordering::SeqCst) == 2);

    manager.abort_possibly_running_reconnection();
    manager
        .inner
        .connection_closed_on_error(&connection, &Error::NotConnected);
    assert!(manager.thread_alive());
    assert_eq!(manager.threads_spawned(), 1);
    assert_eq!(manager.state(), ReconnectionState::Reconnecting);

    manager.disable_automatic_reconnection();
    wait_for("retry thread exit", || !manager.thread_alive());
    assert_eq!(manager.threads_spawned(), 1);
}

#[test]
fn disconnect_during_connect_attempt_wins() {
    let (server, connection, manager, attempts) = slow_setup(0);
    connection.connect().unwrap();
    server.drop_stream();
    wait_for("attempt in flight", || attempts.load(Ordering::SeqCst) == 2);

    connection.disconnect();
    assert_eq!(manager.state(), ReconnectionState::Stopped);
    wait_for("retry thread exit", || !manager.thread_alive());
    assert!(!connection.is_connected());
    assert!(!server.is_connected());
    assert_eq!(manager.state(), ReconnectionState::Stopped);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn explicit_disconnect_stops_retries() {
    let (server, connection, manager) = setup(true, 1);
    connection.connect().unwrap();
    connection.disconnect();
    assert_eq!(manager.state(), ReconnectionState::Stopped);

    manager
        .inner
        .connection_closed_on_error(&connection, &Error::NotConnected);
    thread::sleep(TICK * 5);
    assert_eq!(manager.threads_spawned(), 0);
    assert_eq!(server.connect_count(), 1);

    // Connecting by hand brings automatic recovery back.
    connection.connect().unwrap();
    assert_eq!(manager.state(), ReconnectionState::Idle);
    server.drop_stream();
    wait_for("reconnection", || server.connect_count() == 3 && connection.is_connected());
}

#[test]
fn disconnect_during_countdown_stops_the_thread() {
    let (server, connection, manager) = setup(true, 50);
    connection.connect().unwrap();
    server.drop_stream();
    wait_for("retry thread", || manager.state() == ReconnectionState::Reconnecting);
    connection.disconnect();
    assert_eq!(manager.state(), ReconnectionState::Stopped);
    thread::sleep(TICK * 5);
    assert_eq!(server.connect_count(), 1);
}
