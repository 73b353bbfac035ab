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

#[test]
fn parse_nested() {
    let element = Element::parse(
        "<iq type='result' id='r1'><query xmlns='jabber:iq:roster'>\
         <item jid='romeo@example.net'/></query></iq>",
    )
    .unwrap();
    assert_eq!(element.name(), "iq");
    assert_eq!(element.attr("type"), Some("result"));
    assert_eq!(element.attr("id"), Some("r1"));
    let query = element.child_ns("query", "jabber:iq:roster").unwrap();
    assert_eq!(query.child("item").unwrap().attr("jid"), Some("romeo@example.net"));
    assert!(element.child_ns("query", "jabber:iq:version").is_none());
}

#[test]
fn text_is_unescaped_and_escaped_back() {
    let element = Element::parse("<body>a &lt; b &amp;&amp; c</body>").unwrap();
    assert_eq!(element.text(), "a < b && c");
    assert_eq!(element.to_xml(), "<body>a &lt; b &amp;&amp; c</body>");
}

#[test]
fn serialize_builder() {
    let element = Element::new("message")
        .with_attr("to", "juliet@example.com")
        .with_child(Element::new("body").with_text("Art thou not Romeo?"))
        .with_child(Element::with_ns("active", "http://jabber.org/protocol/chatstates"));
    assert_eq!(
        element.to_xml(),
        "<message to=\"juliet@example.com\"><body>Art thou not Romeo?</body>\
         <active xmlns=\"http://jabber.org/protocol/chatstates\"/></message>"
    );
}

#[test]
fn set_attr_replaces() {
    let mut element = Element::new("presence").with_attr("type", "away");
    element.set_attr("type", "unavailable");
    assert_eq!(element.attr("type"), Some("unavailable"));
    assert_eq!(element.attributes().count(), 1);
    assert_eq!(element.remove_attr("type").as_deref(), Some("unavailable"));
    assert_eq!(element.attr("type"), None);
}

#[test]
fn start_tag_only() {
    let header = Element::with_ns("stream:stream", "jabber:client").with_attr("to", "example.com");
    let mut out = String::new();
    header.write_start_tag(&mut out);
    assert_eq!(out, "<stream:stream xmlns=\"jabber:client\" to=\"example.com\">");
}

#[test]
fn bad_documents() {
    assert!(matches!(Element::parse("<a><b></a>"), Err(Error::BadXml(_))));
    assert!(matches!(Element::parse("<a><b/>"), Err(Error::BadXml(_))));
    assert!(matches!(Element::parse(""), Err(Error::BadXml(_))));
}
