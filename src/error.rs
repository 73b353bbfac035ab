/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::BadJid;
use crate::StanzaError;
use crate::StreamError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a collector or a future stopped waiting for stanzas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The owner called `cancel()`.
    Explicit,
    /// The connection was closed on purpose.
    Shutdown,
    /// The stream failed underneath the waiting reader.
    ConnectionLost(String),
}

impl Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Explicit => write!(f, "cancelled by the caller"),
            CancelReason::Shutdown => write!(f, "connection shut down"),
            CancelReason::ConnectionLost(cause) => write!(f, "connection lost: {cause}"),
        }
    }
}

/// One address the connector tried and the reason it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFailure {
    pub address: String,
    pub reason: String,
}

impl Display for HostFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.address, self.reason)
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("no response within {} ms from {filter}", .timeout.as_millis())]
    NoResponse { timeout: Duration, filter: String },
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("{0}")]
    Cancelled(CancelReason),
    #[error("stream error: {0}")]
    Stream(StreamError),
    #[error("stanza error: {0}")]
    Stanza(StanzaError),
    #[error("could not connect to any of {} address(es), first: {}", .0.len(), first_failure(.0))]
    ConnectFailed(Vec<HostFailure>),
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("invalid XML syntax: {0}")]
    BadXml(String),
    #[error("invalid stream protocol: {0}")]
    BadStream(&'static str),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error(transparent)]
    BadJid(#[from] BadJid),
    #[error("invalid configuration: {0}")]
    Config(String),
}

fn first_failure(failures: &[HostFailure]) -> String {
    failures
        .first()
        .map_or_else(|| String::from("none resolved"), |failure| failure.to_string())
}

impl Error {
    /// True for the "nothing arrived in time" outcome.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::NoResponse { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// The stream error condition, if the server closed the stream with one.
    pub fn stream_condition(&self) -> Option<&crate::StreamErrorCondition> {
        match self {
            Error::Stream(error) => Some(&error.condition),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<StreamError> for Error {
    fn from(err: StreamError) -> Self {
        Error::Stream(err)
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::BadXml(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Error::BadXml(err.to_string())
    }
}

#[cfg(feature = "tcp")]
impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}

pub(crate) mod description {
    pub(crate) const INCOMPLETE_ELEMENT: &str = "document ended inside an element";
    pub(crate) const UNEXPECTED_END_TAG: &str = "end tag without a start tag";
    pub(crate) const UNKNOWN_STANZA: &str = "top level element is not a stanza";
    pub(crate) const BAD_IQ_TYPE: &str = "iq type is missing or unknown";
    pub(crate) const BAD_ADDRESS: &str = "stanza address is not a valid JID";
    pub(crate) const NO_STREAM_HEADER: &str = "server did not open a stream";
    pub(crate) const STREAM_CLOSED: &str = "server closed the stream during negotiation";
    pub(crate) const NO_TLS: &str = "server does not offer STARTTLS but TLS is required";
    pub(crate) const TLS_REFUSED: &str = "server refused to start TLS";
    pub(crate) const NO_MECHANISM: &str = "server does not offer a supported SASL mechanism";
    pub(crate) const NO_BIND: &str = "server does not offer resource binding";
    pub(crate) const BAD_BIND: &str = "resource binding reply has no JID";
    pub(crate) const UNEXPECTED_ELEMENT: &str = "unexpected element during negotiation";
}
