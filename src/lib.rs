/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

//! Stanza correlation and self-healing client connections for XMPP.
//!
//! A [`Connection`] reads stanzas off a [`transport`] and hands each one
//! to every live [`StanzaCollector`], to the stanza listeners and, for
//! IQ requests, to the registered [`IqHandler`]. Requests are matched to
//! their replies with [`StanzaFilter`]s, either synchronously through a
//! collector or asynchronously through a [`StanzaFuture`]. A
//! [`ReconnectionManager`] brings a connection back after the stream
//! fails.

mod collector;
mod config;
mod connection;
pub mod constants;
mod element;
pub(crate) mod error;
pub mod filter;
mod future;
mod jid;
pub mod reconnect;
mod registry;
mod stanza;
mod stream;
pub mod transport;

pub use jid::BadJid;
pub use jid::Jid;

pub use element::Element;
pub use element::Node;

pub use stanza::IqType;
pub use stanza::Stanza;
pub use stanza::StanzaBuilder;
pub use stanza::StanzaError;
pub use stanza::StanzaErrorCondition;
pub use stanza::StanzaErrorType;
pub use stanza::StanzaIdSource;
pub use stanza::StanzaKind;

pub use stream::StreamError;
pub use stream::StreamErrorCondition;

pub use error::CancelReason;
pub use error::Error;
pub use error::HostFailure;
pub use error::Result;

pub use filter::FilterExt;
pub use filter::FromFilter;
pub use filter::IqReplyFilter;
pub use filter::KindFilter;
pub use filter::StanzaFilter;
pub use filter::StanzaIdFilter;

pub use collector::CollectorConfig;
pub use collector::CollectorRegistry;
pub use collector::StanzaCollector;

pub use future::StanzaFuture;

pub use connection::Connection;
pub use connection::ConnectionListener;
pub use connection::IqHandler;
pub use connection::ListenerId;
pub use connection::WeakConnection;

pub use registry::ConnectionRegistry;

pub use reconnect::ReconnectionListener;
pub use reconnect::ReconnectionManager;
pub use reconnect::ReconnectionState;

pub use config::ConnectionConfig;
pub use config::ConnectionConfigBuilder;
pub use config::ReconnectionConfig;
pub use config::ReconnectionPolicy;
pub use config::TlsMode;
pub use config::UnknownIqReply;

pub use constants::CLIENT_PORT;
pub use constants::DEFAULT_COLLECTOR_SIZE;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
