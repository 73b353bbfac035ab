/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use super::*;
use crate::Element;

#[test]
fn condition_names_round_trip() {
    for name in ["conflict", "policy-violation", "system-shutdown", "see-other-host"] {
        assert_eq!(StreamErrorCondition::from(name).as_str(), name);
    }
    assert_eq!(
        StreamErrorCondition::from("x-vendor-specific"),
        StreamErrorCondition::Other("x-vendor-specific".to_string())
    );
}

#[test]
fn conflict_from_element() {
    let element = Element::parse(
        "<stream:error>\
            <conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
            <text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>Replaced by new connection</text>\
        </stream:error>",
    )
    .unwrap();
    let error = StreamError::from_element(&element);
    assert_eq!(error.condition, StreamErrorCondition::Conflict);
    assert_eq!(error.text.as_deref(), Some("Replaced by new connection"));
    assert_eq!(error.to_string(), "conflict (Replaced by new connection)");
}

#[test]
fn missing_condition_is_undefined() {
    let element = Element::parse("<stream:error/>").unwrap();
    let error = StreamError::from_element(&element);
    assert_eq!(error.condition, StreamErrorCondition::UndefinedCondition);
    assert_eq!(error.text, None);
}
