/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::error;

use crate::Connection;
use crate::Error;
use crate::Stanza;
use crate::StanzaFilter;

/// Handle returned when registering a listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ListenerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle notifications of a connection.
///
/// Callbacks run on whichever thread caused the change: the caller of
/// `connect()`/`disconnect()`, or the reader thread when the stream
/// fails. They should return quickly.
pub trait ConnectionListener: Send + Sync {
    fn connected(&self, _connection: &Connection) {}

    /// The connection was closed on purpose.
    fn connection_closed(&self, _connection: &Connection) {}

    /// The stream failed or the server ended it.
    fn connection_closed_on_error(&self, _connection: &Connection, _error: &Error) {}
}

pub(crate) type StanzaCallback = Arc<dyn Fn(&Arc<Stanza>) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct StanzaListenerEntry {
    pub(crate) id: ListenerId,
    pub(crate) filter: Arc<dyn StanzaFilter>,
    pub(crate) callback: StanzaCallback,
}

impl StanzaListenerEntry {
    pub(crate) fn deliver(&self, stanza: &Arc<Stanza>) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if self.filter.accept(stanza) {
                (self.callback)(stanza);
            }
        }));
        if outcome.is_err() {
            error!(listener = ?self.id, "stanza listener panicked");
        }
    }
}

/// Runs one listener callback, keeping a panic from reaching the caller.
pub(crate) fn isolate<F: FnOnce()>(what: &str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(callback = what, "listener panicked");
    }
}
