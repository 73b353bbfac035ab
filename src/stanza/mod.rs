/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

mod error;
mod id;

use std::fmt::Display;

pub use error::StanzaError;
pub use error::StanzaErrorCondition;
pub use error::StanzaErrorType;
pub use id::StanzaIdSource;

use crate::Element;
use crate::Error;
use crate::Jid;
use crate::error::description;

/// The three top level stanza elements of the client namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    pub fn tag(&self) -> &'static str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Iq => "iq",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "message" => Some(StanzaKind::Message),
            "presence" => Some(StanzaKind::Presence),
            "iq" => Some(StanzaKind::Iq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None,
        }
    }

    /// Requests must be answered, responses must not.
    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

/// A single message unit of the XML stream.
///
/// Stanzas are immutable once built. The dispatch loop wraps each inbound
/// stanza into an `Arc` so every interested collector shares the same
/// instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    kind: StanzaKind,
    id: Option<String>,
    from: Option<Jid>,
    to: Option<Jid>,
    stanza_type: Option<String>,
    payloads: Vec<Element>,
    error: Option<StanzaError>,
}

impl Stanza {
    pub fn message() -> StanzaBuilder {
        StanzaBuilder::new(StanzaKind::Message)
    }

    pub fn presence() -> StanzaBuilder {
        StanzaBuilder::new(StanzaKind::Presence)
    }

    pub fn iq(iq_type: IqType) -> StanzaBuilder {
        StanzaBuilder::new(StanzaKind::Iq).stanza_type(iq_type.as_str())
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn from(&self) -> Option<&Jid> {
        self.from.as_ref()
    }

    pub fn to(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.stanza_type.as_deref()
    }

    /// The IQ type, for IQ stanzas only.
    pub fn iq_type(&self) -> Option<IqType> {
        if self.kind != StanzaKind::Iq {
            return None;
        }
        self.stanza_type.as_deref().and_then(IqType::parse)
    }

    pub fn is_iq_request(&self) -> bool {
        self.iq_type().is_some_and(|iq_type| iq_type.is_request())
    }

    /// True when the stanza reports a failure of an earlier request.
    pub fn is_error(&self) -> bool {
        self.stanza_type.as_deref() == Some("error")
    }

    pub fn error(&self) -> Option<&StanzaError> {
        self.error.as_ref()
    }

    pub fn payloads(&self) -> &[Element] {
        &self.payloads
    }

    pub fn payload(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.payloads
            .iter()
            .find(|element| element.name() == name && element.namespace() == Some(namespace))
    }

    /// The first payload of an IQ, which names the request.
    pub fn iq_child(&self) -> Option<&Element> {
        self.payloads.first()
    }

    /// Text of the message body, if there is one.
    pub fn body(&self) -> Option<String> {
        self.payloads
            .iter()
            .find(|element| element.name() == "body")
            .map(Element::text)
    }

    pub fn into_builder(self) -> StanzaBuilder {
        StanzaBuilder { stanza: self }
    }

    /// An empty `result` answering this IQ request.
    pub fn result_reply(&self) -> Stanza {
        self.reply(IqType::Result).build()
    }

    /// An `error` answering this IQ request.
    pub fn error_reply(&self, error: StanzaError) -> Stanza {
        self.reply(IqType::Error).error(error).build()
    }

    fn reply(&self, iq_type: IqType) -> StanzaBuilder {
        let mut builder = Stanza::iq(iq_type);
        if let Some(id) = &self.id {
            builder = builder.id(id);
        }
        if let Some(from) = &self.from {
            builder = builder.to(from.clone());
        }
        if let Some(to) = &self.to {
            builder = builder.from(to.clone());
        }
        builder
    }

    pub fn from_element(element: Element) -> Result<Stanza, Error> {
        let kind = StanzaKind::from_tag(element.name())
            .ok_or(Error::BadStream(description::UNKNOWN_STANZA))?;
        let parse_jid = |value: Option<&str>| -> Result<Option<Jid>, Error> {
            match value {
                Some(value) => Jid::new(value)
                    .map(Some)
                    .map_err(|_| Error::BadStream(description::BAD_ADDRESS)),
                None => Ok(None),
            }
        };
        let from = parse_jid(element.attr("from"))?;
        let to = parse_jid(element.attr("to"))?;
        let id = element.attr("id").map(str::to_string);
        let stanza_type = element.attr("type").map(str::to_string);
        if kind == StanzaKind::Iq && stanza_type.as_deref().and_then(IqType::parse).is_none() {
            return Err(Error::BadStream(description::BAD_IQ_TYPE));
        }
        let is_error = stanza_type.as_deref() == Some("error");
        let mut payloads = Vec::new();
        let mut error = None;
        for child in element.into_elements() {
            if is_error && error.is_none() && child.name() == "error" {
                error = Some(StanzaError::from_element(&child));
            } else {
                payloads.push(child);
            }
        }
        Ok(Stanza {
            kind,
            id,
            from,
            to,
            stanza_type,
            payloads,
            error,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut element = Element::new(self.kind.tag());
        if let Some(id) = &self.id {
            element.set_attr("id", id);
        }
        if let Some(from) = &self.from {
            element.set_attr("from", from.full());
        }
        if let Some(to) = &self.to {
            element.set_attr("to", to.full());
        }
        if let Some(stanza_type) = &self.stanza_type {
            element.set_attr("type", stanza_type);
        }
        for payload in &self.payloads {
            element.push_child(payload.clone());
        }
        if let Some(error) = &self.error {
            element.push_child(error.to_element());
        }
        element
    }

    pub fn to_xml(&self) -> String {
        self.to_element().to_xml()
    }
}

impl Display for Stanza {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_xml())
    }
}

pub struct StanzaBuilder {
    stanza: Stanza,
}

impl StanzaBuilder {
    pub fn new(kind: StanzaKind) -> Self {
        StanzaBuilder {
            stanza: Stanza {
                kind,
                id: None,
                from: None,
                to: None,
                stanza_type: None,
                payloads: Vec::new(),
                error: None,
            },
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.stanza.id = Some(id.to_string());
        self
    }

    pub fn to(mut self, to: Jid) -> Self {
        self.stanza.to = Some(to);
        self
    }

    pub fn from(mut self, from: Jid) -> Self {
        self.stanza.from = Some(from);
        self
    }

    pub fn stanza_type(mut self, stanza_type: &str) -> Self {
        self.stanza.stanza_type = Some(stanza_type.to_string());
        self
    }

    pub fn payload(mut self, payload: Element) -> Self {
        self.stanza.payloads.push(payload);
        self
    }

    pub fn body(self, text: &str) -> Self {
        self.payload(Element::new("body").with_text(text))
    }

    /// Attaches an error condition and marks the stanza as `type='error'`.
    pub fn error(mut self, error: StanzaError) -> Self {
        self.stanza.stanza_type = Some(String::from("error"));
        self.stanza.error = Some(error);
        self
    }

    /// Finishes the stanza, assigning a fresh id if none was given.
    pub fn build(mut self) -> Stanza {
        if self.stanza.id.is_none() {
            self.stanza.id = Some(id::next_id());
        }
        self.stanza
    }
}
