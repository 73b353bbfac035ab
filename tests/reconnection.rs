/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use ikslink::Connection;
use ikslink::ConnectionConfig;
use ikslink::ConnectionRegistry;
use ikslink::Jid;
use ikslink::ReconnectionConfig;
use ikslink::ReconnectionManager;
use ikslink::ReconnectionPolicy;
use ikslink::ReconnectionState;
use ikslink::StreamErrorCondition;
use ikslink::transport::memory::MemoryServer;

fn fast_reconnection() -> ReconnectionConfig {
    ReconnectionConfig {
        enabled_by_default: true,
        policy: ReconnectionPolicy::FixedDelay { seconds: 2 },
        tick: Duration::from_millis(10),
        ..ReconnectionConfig::default()
    }
}

fn create(registry: &ConnectionRegistry, server: &MemoryServer) -> Connection {
    let config = ConnectionConfig::builder(Jid::new("juliet@example.com/balcony").unwrap()).build();
    registry.create_connection(config, Arc::new(server.connector()))
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn installed_manager_heals_dropped_stream() {
    let registry = ConnectionRegistry::new();
    ReconnectionManager::install(&registry, fast_reconnection());
    let server = MemoryServer::new();
    let connection = create(&registry, &server);
    let manager = ReconnectionManager::instance_for(&connection);
    assert!(manager.is_automatic_reconnection_enabled());

    connection.connect().unwrap();
    server.refuse_connections(2);
    assert!(server.drop_stream());
    wait_for("reconnection", || server.connect_count() == 2 && connection.is_connected());
    wait_for("retry thread to finish", || manager.state() == ReconnectionState::Idle);

    // A second failure starts a fresh cycle.
    assert!(server.close_stream());
    wait_for("second reconnection", || server.connect_count() == 3 && connection.is_connected());
    connection.disconnect();
    assert_eq!(manager.state(), ReconnectionState::Stopped);
}

#[test]
fn conflict_is_left_alone() {
    let registry = ConnectionRegistry::new();
    ReconnectionManager::install(&registry, fast_reconnection());
    let server = MemoryServer::new();
    let connection = create(&registry, &server);
    connection.connect().unwrap();

    assert!(server.raise_stream_error(StreamErrorCondition::Conflict));
    wait_for("stream teardown", || !connection.is_connected());
    thread::sleep(Duration::from_millis(200));
    assert_eq!(server.connect_count(), 1);
    assert!(!connection.is_connected());
}

#[test]
fn connections_outside_the_registry_stay_down() {
    let registry = ConnectionRegistry::new();
    let id = ReconnectionManager::install(&registry, fast_reconnection());
    assert!(registry.remove_creation_listener(id));

    let server = MemoryServer::new();
    let connection = create(&registry, &server);
    connection.connect().unwrap();
    assert!(server.drop_stream());
    wait_for("stream teardown", || !connection.is_connected());
    thread::sleep(Duration::from_millis(200));
    assert_eq!(server.connect_count(), 1);
}
