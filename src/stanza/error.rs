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

use crate::Element;
use crate::constants::STANZAS_ERROR_NS;

macro_rules! stanza_conditions {
    ($($variant:ident => $name:literal, $kind:ident;)*) => {
        /// Defined conditions of a stanza `<error/>` (RFC 6120 section 8.3.3).
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum StanzaErrorCondition {
            $($variant,)*
            Other(String),
        }

        impl StanzaErrorCondition {
            pub fn as_str(&self) -> &str {
                match self {
                    $(StanzaErrorCondition::$variant => $name,)*
                    StanzaErrorCondition::Other(name) => name,
                }
            }

            /// The error type RFC 6120 suggests for this condition.
            pub fn default_type(&self) -> StanzaErrorType {
                match self {
                    $(StanzaErrorCondition::$variant => StanzaErrorType::$kind,)*
                    StanzaErrorCondition::Other(_) => StanzaErrorType::Cancel,
                }
            }
        }

        impl From<&str> for StanzaErrorCondition {
            fn from(name: &str) -> Self {
                match name {
                    $($name => StanzaErrorCondition::$variant,)*
                    other => StanzaErrorCondition::Other(other.to_string()),
                }
            }
        }
    };
}

stanza_conditions! {
    BadRequest => "bad-request", Modify;
    Conflict => "conflict", Cancel;
    FeatureNotImplemented => "feature-not-implemented", Cancel;
    Forbidden => "forbidden", Auth;
    Gone => "gone", Cancel;
    InternalServerError => "internal-server-error", Cancel;
    ItemNotFound => "item-not-found", Cancel;
    JidMalformed => "jid-malformed", Modify;
    NotAcceptable => "not-acceptable", Modify;
    NotAllowed => "not-allowed", Cancel;
    NotAuthorized => "not-authorized", Auth;
    PolicyViolation => "policy-violation", Modify;
    RecipientUnavailable => "recipient-unavailable", Wait;
    Redirect => "redirect", Modify;
    RegistrationRequired => "registration-required", Auth;
    RemoteServerNotFound => "remote-server-not-found", Cancel;
    RemoteServerTimeout => "remote-server-timeout", Wait;
    ResourceConstraint => "resource-constraint", Wait;
    ServiceUnavailable => "service-unavailable", Cancel;
    SubscriptionRequired => "subscription-required", Auth;
    UndefinedCondition => "undefined-condition", Cancel;
    UnexpectedRequest => "unexpected-request", Wait;
}

impl Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl StanzaErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaErrorType::Auth => "auth",
            StanzaErrorType::Cancel => "cancel",
            StanzaErrorType::Continue => "continue",
            StanzaErrorType::Modify => "modify",
            StanzaErrorType::Wait => "wait",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "auth" => Some(StanzaErrorType::Auth),
            "cancel" => Some(StanzaErrorType::Cancel),
            "continue" => Some(StanzaErrorType::Continue),
            "modify" => Some(StanzaErrorType::Modify),
            "wait" => Some(StanzaErrorType::Wait),
            _ => None,
        }
    }
}

/// The `<error/>` child of an error-typed stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    pub error_type: StanzaErrorType,
    pub condition: StanzaErrorCondition,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(condition: StanzaErrorCondition) -> Self {
        StanzaError {
            error_type: condition.default_type(),
            condition,
            text: None,
        }
    }

    pub fn from_element(element: &Element) -> Self {
        let mut condition = StanzaErrorCondition::UndefinedCondition;
        let mut text = None;
        for child in element.elements() {
            if child.namespace() != Some(STANZAS_ERROR_NS) {
                continue;
            }
            if child.name() == "text" {
                text = Some(child.text());
            } else {
                condition = StanzaErrorCondition::from(child.name());
            }
        }
        let error_type = element
            .attr("type")
            .and_then(StanzaErrorType::parse)
            .unwrap_or_else(|| condition.default_type());
        StanzaError {
            error_type,
            condition,
            text,
        }
    }

    pub fn to_element(&self) -> Element {
        let mut element = Element::new("error").with_attr("type", self.error_type.as_str());
        element.push_child(Element::with_ns(self.condition.as_str(), STANZAS_ERROR_NS));
        if let Some(text) = &self.text {
            element.push_child(Element::with_ns("text", STANZAS_ERROR_NS).with_text(text));
        }
        element
    }
}

impl Display for StanzaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.condition, self.error_type.as_str())?;
        if let Some(text) = &self.text {
            write!(f, ": {text}")?;
        }
        Ok(())
    }
}

impl std::error::Error for StanzaError {}
