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

use parking_lot::Mutex;

use crate::Connection;
use crate::ConnectionConfig;
use crate::ListenerId;
use crate::connection::isolate;
use crate::transport::Connector;

type CreationListener = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Creates connections and tells interested parties about each one.
///
/// Owned by whoever builds connections, typically once per process.
/// Features that attach to every connection, like the reconnection
/// manager, register a creation listener here.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    listeners: Arc<Mutex<Vec<(ListenerId, CreationListener)>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    pub fn add_creation_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_creation_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(other, _)| *other != id);
        listeners.len() != before
    }

    /// Creates a connection and runs every creation listener on it
    /// before returning it.
    pub fn create_connection(
        &self,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Connection {
        let connection = Connection::new(config, connector);
        let listeners: Vec<CreationListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            isolate("connection_created", || listener(&connection));
        }
        connection
    }
}
