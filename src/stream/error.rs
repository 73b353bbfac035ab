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

use serde::Deserialize;

use crate::Element;
use crate::constants::STREAMS_ERROR_NS;

/// Defined conditions of a `<stream:error/>` element (RFC 6120 section 4.9.3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum StreamErrorCondition {
    BadFormat,
    BadNamespacePrefix,
    /// The session was replaced by a new one with the same resource.
    Conflict,
    ConnectionTimeout,
    HostGone,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidFrom,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    NotWellFormed,
    PolicyViolation,
    RemoteConnectionFailed,
    Reset,
    ResourceConstraint,
    RestrictedXml,
    SeeOtherHost,
    SystemShutdown,
    UndefinedCondition,
    UnsupportedEncoding,
    UnsupportedFeature,
    UnsupportedStanzaType,
    UnsupportedVersion,
    Other(String),
}

impl StreamErrorCondition {
    pub fn as_str(&self) -> &str {
        match self {
            StreamErrorCondition::BadFormat => "bad-format",
            StreamErrorCondition::BadNamespacePrefix => "bad-namespace-prefix",
            StreamErrorCondition::Conflict => "conflict",
            StreamErrorCondition::ConnectionTimeout => "connection-timeout",
            StreamErrorCondition::HostGone => "host-gone",
            StreamErrorCondition::HostUnknown => "host-unknown",
            StreamErrorCondition::ImproperAddressing => "improper-addressing",
            StreamErrorCondition::InternalServerError => "internal-server-error",
            StreamErrorCondition::InvalidFrom => "invalid-from",
            StreamErrorCondition::InvalidNamespace => "invalid-namespace",
            StreamErrorCondition::InvalidXml => "invalid-xml",
            StreamErrorCondition::NotAuthorized => "not-authorized",
            StreamErrorCondition::NotWellFormed => "not-well-formed",
            StreamErrorCondition::PolicyViolation => "policy-violation",
            StreamErrorCondition::RemoteConnectionFailed => "remote-connection-failed",
            StreamErrorCondition::Reset => "reset",
            StreamErrorCondition::ResourceConstraint => "resource-constraint",
            StreamErrorCondition::RestrictedXml => "restricted-xml",
            StreamErrorCondition::SeeOtherHost => "see-other-host",
            StreamErrorCondition::SystemShutdown => "system-shutdown",
            StreamErrorCondition::UndefinedCondition => "undefined-condition",
            StreamErrorCondition::UnsupportedEncoding => "unsupported-encoding",
            StreamErrorCondition::UnsupportedFeature => "unsupported-feature",
            StreamErrorCondition::UnsupportedStanzaType => "unsupported-stanza-type",
            StreamErrorCondition::UnsupportedVersion => "unsupported-version",
            StreamErrorCondition::Other(name) => name,
        }
    }
}

impl From<&str> for StreamErrorCondition {
    fn from(name: &str) -> Self {
        match name {
            "bad-format" => StreamErrorCondition::BadFormat,
            "bad-namespace-prefix" => StreamErrorCondition::BadNamespacePrefix,
            "conflict" => StreamErrorCondition::Conflict,
            "connection-timeout" => StreamErrorCondition::ConnectionTimeout,
            "host-gone" => StreamErrorCondition::HostGone,
            "host-unknown" => StreamErrorCondition::HostUnknown,
            "improper-addressing" => StreamErrorCondition::ImproperAddressing,
            "internal-server-error" => StreamErrorCondition::InternalServerError,
            "invalid-from" => StreamErrorCondition::InvalidFrom,
            "invalid-namespace" => StreamErrorCondition::InvalidNamespace,
            "invalid-xml" => StreamErrorCondition::InvalidXml,
            "not-authorized" => StreamErrorCondition::NotAuthorized,
            "not-well-formed" => StreamErrorCondition::NotWellFormed,
            "policy-violation" => StreamErrorCondition::PolicyViolation,
            "remote-connection-failed" => StreamErrorCondition::RemoteConnectionFailed,
            "reset" => StreamErrorCondition::Reset,
            "resource-constraint" => StreamErrorCondition::ResourceConstraint,
            "restricted-xml" => StreamErrorCondition::RestrictedXml,
            "see-other-host" => StreamErrorCondition::SeeOtherHost,
            "system-shutdown" => StreamErrorCondition::SystemShutdown,
            "undefined-condition" => StreamErrorCondition::UndefinedCondition,
            "unsupported-encoding" => StreamErrorCondition::UnsupportedEncoding,
            "unsupported-feature" => StreamErrorCondition::UnsupportedFeature,
            "unsupported-stanza-type" => StreamErrorCondition::UnsupportedStanzaType,
            "unsupported-version" => StreamErrorCondition::UnsupportedVersion,
            other => StreamErrorCondition::Other(other.to_string()),
        }
    }
}

impl From<String> for StreamErrorCondition {
    fn from(name: String) -> Self {
        StreamErrorCondition::from(name.as_str())
    }
}

impl Display for StreamErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fatal error reported by the server before it closed the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub condition: StreamErrorCondition,
    pub text: Option<String>,
}

impl StreamError {
    pub fn new(condition: StreamErrorCondition) -> Self {
        StreamError {
            condition,
            text: None,
        }
    }

    /// Reads the condition out of a `<stream:error/>` element.
    ///
    /// A missing condition child is reported as `undefined-condition`.
    pub fn from_element(element: &Element) -> Self {
        let mut condition = StreamErrorCondition::UndefinedCondition;
        let mut text = None;
        for child in element.elements() {
            if child.namespace() != Some(STREAMS_ERROR_NS) {
                continue;
            }
            if child.name() == "text" {
                text = Some(child.text());
            } else {
                condition = StreamErrorCondition::from(child.name());
            }
        }
        StreamError { condition, text }
    }
}

impl Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{} ({})", self.condition, text),
            None => write!(f, "{}", self.condition),
        }
    }
}

impl std::error::Error for StreamError {}
