/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::thread;
use std::time::Duration;

use super::memory::MemoryServer;
use super::*;
use crate::Error;
use crate::IqType;
use crate::StreamErrorCondition;

fn config(resource: Option<&str>) -> ConnectionConfig {
    ConnectionConfig::builder(Jid::new("juliet@example.com").unwrap())
        .resource(resource.map(str::to_string))
        .build()
}

#[test]
fn memory_session_binds_resource() {
    let server = MemoryServer::new();
    let session = server.connector().connect(&config(None)).unwrap();
    assert_eq!(session.jid.full(), "juliet@example.com/ikslink");
    let session = server.connector().connect(&config(Some("balcony"))).unwrap();
    assert_eq!(session.jid.full(), "juliet@example.com/balcony");
    assert_eq!(server.connect_count(), 2);
}

#[test]
fn refused_connects_are_not_counted() {
    let server = MemoryServer::new();
    server.refuse_connections(2);
    for _ in 0..2 {
        assert!(matches!(
            server.connector().connect(&config(None)),
            Err(Error::ConnectFailed(_))
        ));
    }
    assert!(server.connector().connect(&config(None)).is_ok());
    assert_eq!(server.connect_count(), 1);
}

#[test]
fn server_events_reach_the_source() {
    let server = MemoryServer::new();
    let mut session = server.connector().connect(&config(None)).unwrap();
    assert!(server.push(Stanza::message().id("m1").body("hi").build()));
    assert!(server.raise_stream_error(StreamErrorCondition::SeeOtherHost));
    assert!(!server.is_connected());
    assert!(!server.push(Stanza::message().build()));

    match session.source.next_event().unwrap() {
        StreamEvent::Stanza(stanza) => assert_eq!(stanza.id(), Some("m1")),
        other => panic!("unexpected {other:?}"),
    }
    match session.source.next_event().unwrap() {
        StreamEvent::StreamError(error) => {
            assert_eq!(error.condition, StreamErrorCondition::SeeOtherHost)
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.source.next_event().unwrap(), StreamEvent::Closed);
}

#[test]
fn dropped_stream_is_an_error() {
    let server = MemoryServer::new();
    let mut session = server.connector().connect(&config(None)).unwrap();
    assert!(server.drop_stream());
    assert!(matches!(session.source.next_event(), Err(Error::Io(_))));
}

#[test]
fn sink_records_and_auto_replies() {
    let server = MemoryServer::new();
    server.set_auto_reply(|stanza| stanza.is_iq_request().then(|| stanza.result_reply()));
    let mut session = server.connector().connect(&config(None)).unwrap();

    let request = Stanza::iq(IqType::Get).id("q1").build();
    session.sink.send(&request).unwrap();
    session.sink.send(&Stanza::presence().build()).unwrap();
    assert_eq!(server.sent().len(), 2);

    match session.source.next_event().unwrap() {
        StreamEvent::Stanza(reply) => {
            assert_eq!(reply.id(), Some("q1"));
            assert_eq!(reply.iq_type(), Some(IqType::Result));
        }
        other => panic!("unexpected {other:?}"),
    }

    server.fail_sends(true);
    assert!(matches!(session.sink.send(&request), Err(Error::Io(_))));
    server.fail_sends(false);
    assert_eq!(server.take_sent().len(), 2);
    assert!(server.sent().is_empty());
}

#[test]
fn replaced_session_is_dead() {
    let server = MemoryServer::new();
    let mut old = server.connector().connect(&config(None)).unwrap();
    let mut new = server.connector().connect(&config(None)).unwrap();
    assert!(matches!(
        old.sink.send(&Stanza::presence().build()),
        Err(Error::NotConnected)
    ));
    assert_eq!(old.source.next_event().unwrap(), StreamEvent::Closed);

    // Closing the stale sink leaves the new session alone.
    old.sink.close().unwrap();
    assert!(server.is_connected());
    new.sink.close().unwrap();
    new.sink.close().unwrap();
    assert!(!server.is_connected());
}

#[test]
fn wait_for_sent_sees_other_threads() {
    let server = MemoryServer::new();
    let mut session = server.connector().connect(&config(None)).unwrap();
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        session
            .sink
            .send(&Stanza::message().id("late").build())
            .unwrap();
    });
    let seen = server.wait_for_sent(|stanza| stanza.id() == Some("late"), Duration::from_secs(5));
    assert!(seen.is_some());
    assert!(
        server
            .wait_for_sent(|stanza| stanza.id() == Some("never"), Duration::from_millis(20))
            .is_none()
    );
    sender.join().unwrap();
}
