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

use tracing::debug;
use tracing::error;

use crate::IqType;
use crate::Stanza;
use crate::StanzaError;
use crate::StanzaErrorCondition;
use crate::UnknownIqReply;

/// Answers inbound IQ requests of one element, namespace and type.
///
/// Handlers run on the reader thread. A handler must not wait for
/// another reply on the same connection, as nothing would dispatch it.
pub trait IqHandler: Send + Sync {
    /// Builds the reply. An `Err` is sent back as an `error` IQ.
    fn handle(&self, request: &Stanza) -> Result<Stanza, StanzaError>;
}

impl<F> IqHandler for F
where
    F: Fn(&Stanza) -> Result<Stanza, StanzaError> + Send + Sync,
{
    fn handle(&self, request: &Stanza) -> Result<Stanza, StanzaError> {
        self(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct HandlerKey {
    element: String,
    namespace: String,
    iq_type: IqType,
}

impl HandlerKey {
    pub(crate) fn new(element: &str, namespace: &str, iq_type: IqType) -> Self {
        HandlerKey {
            element: element.to_string(),
            namespace: namespace.to_string(),
            iq_type,
        }
    }

    /// The key an inbound request is looked up with.
    pub(crate) fn of(request: &Stanza) -> Option<Self> {
        let iq_type = request.iq_type()?;
        let child = request.iq_child()?;
        Some(HandlerKey::new(
            child.name(),
            child.namespace().unwrap_or_default(),
            iq_type,
        ))
    }
}

/// Computes the reply to an IQ request, if one is due.
pub(crate) fn reply_to(
    request: &Stanza,
    handler: Option<&dyn IqHandler>,
    unknown: UnknownIqReply,
) -> Option<Stanza> {
    let Some(handler) = handler else {
        debug!(id = ?request.id(), "no handler for IQ request");
        let condition = match unknown {
            UnknownIqReply::FeatureNotImplemented => StanzaErrorCondition::FeatureNotImplemented,
            UnknownIqReply::ServiceUnavailable => StanzaErrorCondition::ServiceUnavailable,
            UnknownIqReply::DoNotReply => return None,
        };
        return Some(request.error_reply(StanzaError::new(condition)));
    };
    match catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
        Ok(Ok(reply)) => Some(reply),
        Ok(Err(error)) => Some(request.error_reply(error)),
        Err(_) => {
            error!(id = ?request.id(), "IQ handler panicked");
            Some(request.error_reply(StanzaError::new(
                StanzaErrorCondition::InternalServerError,
            )))
        }
    }
}
