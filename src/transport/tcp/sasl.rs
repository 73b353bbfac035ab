/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::ConnectionConfig;
use crate::Element;
use crate::Error;
use crate::Result;
use crate::constants::SASL_NS;

/// A SASL mechanism completing in a single round trip.
pub trait Authenticator: Send + Sync {
    /// Name as advertised in `<mechanisms/>`.
    fn mechanism(&self) -> &str;

    fn initial_response(&self, config: &ConnectionConfig) -> Result<Vec<u8>>;
}

/// RFC 4616 PLAIN. Only safe over TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainAuthenticator;

impl Authenticator for PlainAuthenticator {
    fn mechanism(&self) -> &str {
        "PLAIN"
    }

    fn initial_response(&self, config: &ConnectionConfig) -> Result<Vec<u8>> {
        let password = config
            .password()
            .ok_or_else(|| Error::Auth(String::from("no password configured")))?;
        let jid = config.jid();
        let user = jid.localpart().unwrap_or(jid.domainpart());
        let mut response = Vec::with_capacity(user.len() + password.len() + 2);
        response.push(0);
        response.extend_from_slice(user.as_bytes());
        response.push(0);
        response.extend_from_slice(password.as_bytes());
        Ok(response)
    }
}

/// Mechanism names offered in a `<stream:features/>` element.
pub(crate) fn offered_mechanisms(features: &Element) -> Vec<String> {
    features
        .child_ns("mechanisms", SASL_NS)
        .map(|mechanisms| {
            mechanisms
                .elements()
                .filter(|element| element.name() == "mechanism")
                .map(Element::text)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn auth_element(
    authenticator: &dyn Authenticator,
    config: &ConnectionConfig,
) -> Result<Element> {
    let response = authenticator.initial_response(config)?;
    // An empty initial response is sent as a single '='.
    let encoded = if response.is_empty() {
        String::from("=")
    } else {
        STANDARD.encode(response)
    };
    Ok(Element::with_ns("auth", SASL_NS)
        .with_attr("mechanism", authenticator.mechanism())
        .with_text(&encoded))
}

/// Reads the server's verdict on an `<auth/>`.
pub(crate) fn outcome(element: &Element) -> Result<()> {
    match element.name() {
        "success" => Ok(()),
        "failure" => {
            let condition = element
                .elements()
                .find(|child| child.name() != "text")
                .map_or("not-authorized", Element::name);
            Err(Error::Auth(condition.to_string()))
        }
        _ => Err(Error::BadStream(crate::error::description::UNEXPECTED_ELEMENT)),
    }
}
