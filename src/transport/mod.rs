/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

//! The byte stream underneath a connection.
//!
//! A `Connector` opens a negotiated session (TLS, authentication and
//! resource binding already done) and hands back its two halves: a sink
//! used by any thread sending stanzas, and a source drained by the
//! connection's reader thread.

pub mod memory;
#[cfg(feature = "tcp")]
pub mod tcp;

use crate::ConnectionConfig;
use crate::Jid;
use crate::Result;
use crate::Stanza;
use crate::StreamError;

/// What the reader thread gets from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Stanza(Stanza),
    /// The server sent `<stream:error/>` and is about to close.
    StreamError(StreamError),
    /// The stream ended without an error.
    Closed,
}

pub trait StanzaSink: Send {
    fn send(&mut self, stanza: &Stanza) -> Result<()>;

    /// Closes the stream from our side. Must be safe to call twice.
    fn close(&mut self) -> Result<()>;
}

pub trait StanzaSource: Send {
    /// Blocks until the next event. An `Err` means the transport broke.
    fn next_event(&mut self) -> Result<StreamEvent>;
}

/// A negotiated stream ready to carry stanzas.
pub struct Session {
    pub sink: Box<dyn StanzaSink>,
    pub source: Box<dyn StanzaSource>,
    /// The full JID the server bound for us.
    pub jid: Jid,
}

pub trait Connector: Send + Sync {
    fn connect(&self, config: &ConnectionConfig) -> Result<Session>;
}

#[cfg(test)]
mod tests;
