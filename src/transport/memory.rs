/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

//! An in-process server peer.
//!
//! `MemoryServer` plays the server side of every session opened through
//! its `MemoryConnector`: tests and embedders push stanzas, raise stream
//! errors, break the stream, and inspect what the client sent.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use crossbeam::channel::unbounded;
use parking_lot::Condvar;
use parking_lot::Mutex;
use tracing::trace;

use crate::ConnectionConfig;
use crate::Error;
use crate::HostFailure;
use crate::Result;
use crate::Stanza;
use crate::StreamError;
use crate::StreamErrorCondition;
use crate::transport::Connector;
use crate::transport::Session;
use crate::transport::StanzaSink;
use crate::transport::StanzaSource;
use crate::transport::StreamEvent;

type Event = Result<StreamEvent>;
type AutoReply = Arc<dyn Fn(&Stanza) -> Option<Stanza> + Send + Sync>;

const DEFAULT_RESOURCE: &str = "ikslink";

struct Live {
    generation: u64,
    events: Sender<Event>,
}

struct State {
    live: Option<Live>,
    generation: u64,
    connects: usize,
    refuse: usize,
    fail_sends: bool,
    sent: Vec<Stanza>,
    auto_reply: Option<AutoReply>,
}

struct Shared {
    state: Mutex<State>,
    sent_ready: Condvar,
}

#[derive(Clone)]
pub struct MemoryServer {
    shared: Arc<Shared>,
}

impl MemoryServer {
    pub fn new() -> Self {
        MemoryServer {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    live: None,
                    generation: 0,
                    connects: 0,
                    refuse: 0,
                    fail_sends: false,
                    sent: Vec::new(),
                    auto_reply: None,
                }),
                sent_ready: Condvar::new(),
            }),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
        }
    }

    /// Whether a session is open.
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().live.is_some()
    }

    /// Sessions opened so far, refused attempts excluded.
    pub fn connect_count(&self) -> usize {
        self.shared.state.lock().connects
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: usize) {
        self.shared.state.lock().refuse = count;
    }

    /// Makes every client send fail while set.
    pub fn fail_sends(&self, fail: bool) {
        self.shared.state.lock().fail_sends = fail;
    }

    /// Answers client stanzas. The reply is delivered on the same session.
    pub fn set_auto_reply<F>(&self, reply: F)
    where
        F: Fn(&Stanza) -> Option<Stanza> + Send + Sync + 'static,
    {
        self.shared.state.lock().auto_reply = Some(Arc::new(reply));
    }

    pub fn clear_auto_reply(&self) {
        self.shared.state.lock().auto_reply = None;
    }

    /// Delivers a stanza to the client. False when no session is open.
    pub fn push(&self, stanza: Stanza) -> bool {
        self.emit(Ok(StreamEvent::Stanza(stanza)), false)
    }

    /// Sends `<stream:error/>` and ends the session.
    pub fn raise_stream_error(&self, condition: StreamErrorCondition) -> bool {
        self.emit(Ok(StreamEvent::StreamError(StreamError::new(condition))), true)
    }

    /// Closes the stream cleanly from the server side.
    pub fn close_stream(&self) -> bool {
        self.emit(Ok(StreamEvent::Closed), true)
    }

    /// Breaks the session as if the network went away.
    pub fn drop_stream(&self) -> bool {
        let error = io::Error::new(io::ErrorKind::ConnectionReset, "stream dropped by peer");
        self.emit(Err(Error::from(error)), true)
    }

    fn emit(&self, event: Event, end: bool) -> bool {
        let mut state = self.shared.state.lock();
        let Some(live) = &state.live else {
            return false;
        };
        let delivered = live.events.send(event).is_ok();
        if end {
            state.live = None;
        }
        delivered
    }

    /// Everything the client sent, oldest first.
    pub fn sent(&self) -> Vec<Stanza> {
        self.shared.state.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<Stanza> {
        std::mem::take(&mut self.shared.state.lock().sent)
    }

    /// Waits until the client has sent a stanza matching `predicate`.
    pub fn wait_for_sent<F>(&self, predicate: F, timeout: Duration) -> Option<Stanza>
    where
        F: Fn(&Stanza) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(stanza) = state.sent.iter().find(|stanza| predicate(stanza)) {
                return Some(stanza.clone());
            }
            if self
                .shared
                .sent_ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.sent.iter().find(|stanza| predicate(stanza)).cloned();
            }
        }
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        MemoryServer::new()
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

impl Connector for MemoryConnector {
    fn connect(&self, config: &ConnectionConfig) -> Result<Session> {
        let resource = config.resource().unwrap_or(DEFAULT_RESOURCE);
        let jid = config.jid().with_resource(resource)?;
        let mut state = self.server.shared.state.lock();
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(Error::ConnectFailed(vec![HostFailure {
                address: String::from("memory"),
                reason: String::from("connection refused"),
            }]));
        }
        let (events, receiver) = unbounded();
        state.generation += 1;
        state.connects += 1;
        let generation = state.generation;
        // A new session replaces any previous one.
        state.live = Some(Live { generation, events });
        trace!(%jid, generation, "memory session opened");
        Ok(Session {
            sink: Box::new(MemorySink {
                server: self.server.clone(),
                generation,
            }),
            source: Box::new(MemorySource { events: receiver }),
            jid,
        })
    }
}

struct MemorySink {
    server: MemoryServer,
    generation: u64,
}

impl StanzaSink for MemorySink {
    fn send(&mut self, stanza: &Stanza) -> Result<()> {
        let shared = &self.server.shared;
        let (events, reply) = {
            let mut state = shared.state.lock();
            let events = match &state.live {
                Some(live) if live.generation == self.generation => live.events.clone(),
                _ => return Err(Error::NotConnected),
            };
            if state.fail_sends {
                let error = io::Error::new(io::ErrorKind::BrokenPipe, "send refused by peer");
                return Err(Error::from(error));
            }
            state.sent.push(stanza.clone());
            (events, state.auto_reply.clone())
        };
        shared.sent_ready.notify_all();
        if let Some(reply) = reply.and_then(|reply| reply(stanza)) {
            let _ = events.send(Ok(StreamEvent::Stanza(reply)));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.server.shared.state.lock();
        if state
            .live
            .as_ref()
            .is_some_and(|live| live.generation == self.generation)
        {
            state.live = None;
        }
        Ok(())
    }
}

struct MemorySource {
    events: Receiver<Event>,
}

impl StanzaSource for MemorySource {
    fn next_event(&mut self) -> Result<StreamEvent> {
        match self.events.recv() {
            Ok(event) => event,
            // Every sender is gone: the session was closed.
            Err(_) => Ok(StreamEvent::Closed),
        }
    }
}
