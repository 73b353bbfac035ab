/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

mod iq;
mod listener;
mod timer;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

pub use iq::IqHandler;
pub use listener::ConnectionListener;
pub use listener::ListenerId;

use crate::CancelReason;
use crate::CollectorConfig;
use crate::CollectorRegistry;
use crate::ConnectionConfig;
use crate::Error;
use crate::IqReplyFilter;
use crate::IqType;
use crate::Jid;
use crate::ReconnectionManager;
use crate::Result;
use crate::Stanza;
use crate::StanzaCollector;
use crate::StanzaFilter;
use crate::StanzaFuture;
use crate::transport::Connector;
use crate::transport::Session;
use crate::transport::StanzaSink;
use crate::transport::StanzaSource;
use crate::transport::StreamEvent;
use iq::HandlerKey;
use listener::StanzaListenerEntry;
use timer::Timer;
pub(crate) use listener::isolate;

struct ActiveSession {
    generation: u64,
    sink: Box<dyn StanzaSink>,
    jid: Jid,
}

pub(crate) struct ConnectionInner {
    id: u64,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    collectors: CollectorRegistry,
    session: Mutex<Option<ActiveSession>>,
    generation: AtomicU64,
    // Bumped by every `disconnect()`, so a connect racing with it gives up.
    disconnects: AtomicU64,
    connect_lock: Mutex<()>,
    stanza_listeners: Mutex<Vec<StanzaListenerEntry>>,
    connection_listeners: Mutex<Vec<(ListenerId, Arc<dyn ConnectionListener>)>>,
    iq_handlers: Mutex<HashMap<HandlerKey, Arc<dyn IqHandler>>>,
    reply_timer: Timer,
    pub(crate) reconnection: OnceLock<ReconnectionManager>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(mut active) = self.session.get_mut().take() {
            let _ = active.sink.close();
        }
        self.collectors.set_live(false);
        self.collectors.cancel_all(CancelReason::Shutdown);
    }
}

/// A client connection multiplexing many request/reply exchanges over
/// one stream.
///
/// `Connection` is a cheap handle; clones refer to the same connection.
/// Once connected, a reader thread takes inbound stanzas off the stream
/// and dispatches each one, first to IQ handlers (requests only), then
/// to every registered collector, then to the stanza listeners.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// A non-owning reference to a connection.
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl Connection {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, jid = %config.jid(), "connection created");
        Connection {
            inner: Arc::new(ConnectionInner {
                id,
                config,
                connector,
                collectors: CollectorRegistry::new(),
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                disconnects: AtomicU64::new(0),
                connect_lock: Mutex::new(()),
                stanza_listeners: Mutex::new(Vec::new()),
                connection_listeners: Mutex::new(Vec::new()),
                iq_handlers: Mutex::new(HashMap::new()),
                reply_timer: Timer::new(format!("ikslink-timer-{id}")),
                reconnection: OnceLock::new(),
            }),
        }
    }

    /// Process-unique number of this connection, used in logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn inner(&self) -> &ConnectionInner {
        &self.inner
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    /// The full JID bound for the current session.
    pub fn user(&self) -> Option<Jid> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|active| active.jid.clone())
    }

    /// Opens a session and starts dispatching inbound stanzas.
    ///
    /// Fails with `Cancelled(Shutdown)` when `disconnect()` is called while
    /// the session is being negotiated; the new session is closed again.
    pub fn connect(&self) -> Result<()> {
        {
            let _guard = self.inner.connect_lock.lock();
            if self.is_connected() {
                return Err(Error::AlreadyConnected);
            }
            info!(connection = self.inner.id, jid = %self.inner.config.jid(), "connecting");
            let disconnects = self.inner.disconnects.load(Ordering::SeqCst);
            let Session {
                mut sink,
                source,
                jid,
            } = self.inner.connector.connect(&self.inner.config)?;
            let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
            {
                let mut session = self.inner.session.lock();
                if self.inner.disconnects.load(Ordering::SeqCst) != disconnects {
                    drop(session);
                    info!(connection = self.inner.id, "disconnected while connecting");
                    let _ = sink.close();
                    return Err(Error::Cancelled(CancelReason::Shutdown));
                }
                *session = Some(ActiveSession {
                    generation,
                    sink,
                    jid: jid.clone(),
                });
            }
            self.inner.collectors.set_live(true);

            let weak = Arc::downgrade(&self.inner);
            let spawned = thread::Builder::new()
                .name(format!("ikslink-reader-{}", self.inner.id))
                .spawn(move || read_loop(weak, generation, source));
            if let Err(err) = spawned {
                self.end_session(generation);
                return Err(Error::from(err));
            }
            info!(connection = self.inner.id, %jid, "connected");
        }
        for listener in self.connection_listeners() {
            isolate("connected", || listener.connected(self));
        }
        Ok(())
    }

    /// Closes the session on purpose.
    ///
    /// Sends an unavailable presence when possible, cancels every pending
    /// collector, and tells connection listeners the connection closed,
    /// even if it was not connected.
    pub fn disconnect(&self) {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        let session = self.inner.session.lock().take();
        self.inner.collectors.set_live(false);
        if let Some(mut active) = session {
            let presence = Stanza::presence().stanza_type("unavailable").build();
            if let Err(err) = active.sink.send(&presence) {
                debug!(connection = self.inner.id, error = %err, "unavailable presence not sent");
            }
            if let Err(err) = active.sink.close() {
                debug!(connection = self.inner.id, error = %err, "closing the stream failed");
            }
            info!(connection = self.inner.id, "disconnected");
        }
        self.inner.collectors.cancel_all(CancelReason::Shutdown);
        for listener in self.connection_listeners() {
            isolate("connection_closed", || listener.connection_closed(self));
        }
    }

    /// Tears the current session down after a failure and notifies the
    /// connection listeners. Only the first call per session has effect.
    pub fn notify_connection_error(&self, error: Error) {
        let current = self
            .inner
            .session
            .lock()
            .as_ref()
            .map(|active| active.generation);
        if let Some(generation) = current {
            self.fail_session(generation, error);
        }
    }

    fn fail_session(&self, generation: u64, error: Error) {
        if !self.end_session(generation) {
            return;
        }
        warn!(connection = self.inner.id, %error, "connection closed on error");
        self.inner
            .collectors
            .cancel_all(CancelReason::ConnectionLost(error.to_string()));
        for listener in self.connection_listeners() {
            isolate("connection_closed_on_error", || {
                listener.connection_closed_on_error(self, &error)
            });
        }
    }

    // Closes the given session if it is still the current one.
    fn end_session(&self, generation: u64) -> bool {
        let session = {
            let mut session = self.inner.session.lock();
            match session.as_ref() {
                Some(active) if active.generation == generation => session.take(),
                _ => None,
            }
        };
        let Some(mut active) = session else {
            return false;
        };
        self.inner.collectors.set_live(false);
        let _ = active.sink.close();
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner
            .session
            .lock()
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    pub fn send_stanza(&self, stanza: &Stanza) -> Result<()> {
        let mut session = self.inner.session.lock();
        let Some(active) = session.as_mut() else {
            return Err(Error::NotConnected);
        };
        trace!(connection = self.inner.id, %stanza, "sending");
        let generation = active.generation;
        let result = active.sink.send(stanza);
        drop(session);
        if let Err(err) = &result {
            if matches!(err, Error::Io(_) | Error::Tls(_)) {
                self.fail_session(generation, err.clone());
            }
        }
        result
    }

    /// Creates a collector for inbound stanzas, sized per the configuration.
    pub fn create_collector(&self, filter: impl StanzaFilter + 'static) -> StanzaCollector {
        let config = CollectorConfig::new(filter).capacity(self.inner.config.collector_size());
        self.inner.collectors.create(config)
    }

    pub fn create_collector_with(&self, config: CollectorConfig) -> StanzaCollector {
        self.inner.collectors.create(config)
    }

    /// Creates a collector and then sends the stanza, so the reply can
    /// not slip past. The collector is cancelled if the send fails.
    pub fn create_collector_and_send(
        &self,
        filter: impl StanzaFilter + 'static,
        stanza: &Stanza,
    ) -> Result<StanzaCollector> {
        let collector = self.create_collector(filter);
        if let Err(err) = self.send_stanza(stanza) {
            collector.cancel();
            return Err(err);
        }
        Ok(collector)
    }

    /// Sends an IQ request and waits for its result within the reply
    /// timeout.
    pub fn send_iq_and_wait(&self, request: &Stanza) -> Result<Arc<Stanza>> {
        let filter = IqReplyFilter::new(request, self.user().as_ref());
        let collector = self.create_collector_and_send(filter, request)?;
        collector.next_reply(self.inner.config.reply_timeout())
    }

    /// Sends a stanza and returns a future completed by the first inbound
    /// stanza matching `filter`.
    ///
    /// An `error` reply fails the future with `Error::Stanza`. If nothing
    /// matches within `timeout`, it fails with `NoResponse`, or with
    /// `NotConnected` when the stream went down meanwhile.
    pub fn send_async(
        &self,
        stanza: &Stanza,
        filter: impl StanzaFilter + 'static,
        timeout: Duration,
    ) -> StanzaFuture<Arc<Stanza>> {
        let description = filter.describe();
        let future = StanzaFuture::with_resolver(|reply: &Stanza| {
            Some(match reply.error() {
                Some(error) if reply.is_error() => Err(Error::Stanza(error.clone())),
                _ => Ok(Arc::new(reply.clone())),
            })
        })
        .describe(&description);
        self.resolve_with(filter, &future);

        if let Err(err) = self.send_stanza(stanza) {
            future.set_error(err);
            return future;
        }

        let waiter = future.clone();
        let weak = self.downgrade();
        let scheduled = self.inner.reply_timer.schedule(timeout, move || {
            if waiter.is_done() {
                return;
            }
            let connected = weak.upgrade().is_some_and(|c| c.inner.collectors.is_live());
            if connected {
                waiter.set_error(Error::NoResponse {
                    timeout,
                    filter: description,
                });
            } else {
                waiter.set_error(Error::NotConnected);
            }
        });
        if let Err(err) = scheduled {
            future.set_error(err);
        }
        future
    }

    /// Feeds inbound stanzas accepted by `filter` to
    /// `future.process_stanza()` until the future completes.
    pub fn resolve_with<T>(&self, filter: impl StanzaFilter + 'static, future: &StanzaFuture<T>) -> ListenerId
    where
        T: Clone + Send + 'static,
    {
        let resolver = future.clone();
        let listener = self.add_stanza_listener(filter, move |stanza: &Arc<Stanza>| {
            resolver.process_stanza(stanza);
        });
        let weak = self.downgrade();
        future.on_complete(move |_| {
            if let Some(connection) = weak.upgrade() {
                connection.remove_stanza_listener(listener);
            }
        });
        listener
    }

    #[cfg(test)]
    fn reply_timer(&self) -> &Timer {
        &self.inner.reply_timer
    }

    /// `send_async` for an IQ request, matching its reply within the
    /// configured reply timeout.
    pub fn send_iq_async(&self, request: &Stanza) -> StanzaFuture<Arc<Stanza>> {
        let filter = IqReplyFilter::new(request, self.user().as_ref());
        self.send_async(request, filter, self.inner.config.reply_timeout())
    }

    /// Calls `listener` for every inbound stanza accepted by `filter`,
    /// after the collectors got it. IQ requests are never delivered here.
    pub fn add_stanza_listener<F>(&self, filter: impl StanzaFilter + 'static, listener: F) -> ListenerId
    where
        F: Fn(&Arc<Stanza>) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.inner.stanza_listeners.lock().push(StanzaListenerEntry {
            id,
            filter: Arc::new(filter),
            callback: Arc::new(listener),
        });
        id
    }

    pub fn remove_stanza_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.stanza_listeners.lock();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        let id = ListenerId::next();
        self.inner.connection_listeners.lock().push((id, listener));
        id
    }

    pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.connection_listeners.lock();
        let before = listeners.len();
        listeners.retain(|(other, _)| *other != id);
        listeners.len() != before
    }

    fn connection_listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.inner
            .connection_listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Answers inbound IQ requests with the given child element,
    /// namespace, and type. Returns the handler it replaced.
    pub fn register_iq_handler(
        &self,
        element: &str,
        namespace: &str,
        iq_type: IqType,
        handler: impl IqHandler + 'static,
    ) -> Option<Arc<dyn IqHandler>> {
        self.inner
            .iq_handlers
            .lock()
            .insert(HandlerKey::new(element, namespace, iq_type), Arc::new(handler))
    }

    pub fn unregister_iq_handler(&self, element: &str, namespace: &str, iq_type: IqType) -> bool {
        self.inner
            .iq_handlers
            .lock()
            .remove(&HandlerKey::new(element, namespace, iq_type))
            .is_some()
    }

    fn process_stanza(&self, stanza: Stanza) {
        trace!(connection = self.inner.id, %stanza, "received");
        if stanza.is_iq_request() {
            self.process_iq_request(&stanza);
            return;
        }
        let stanza = Arc::new(stanza);
        self.inner.collectors.dispatch(&stanza);
        let listeners = self.inner.stanza_listeners.lock().clone();
        for listener in &listeners {
            listener.deliver(&stanza);
        }
    }

    fn process_iq_request(&self, request: &Stanza) {
        let handler = HandlerKey::of(request)
            .and_then(|key| self.inner.iq_handlers.lock().get(&key).cloned());
        let reply = iq::reply_to(
            request,
            handler.as_deref(),
            self.inner.config.unknown_iq_reply(),
        );
        if let Some(reply) = reply {
            if let Err(err) = self.send_stanza(&reply) {
                warn!(connection = self.inner.id, error = %err, "IQ reply not sent");
            }
        }
    }
}

fn read_loop(weak: Weak<ConnectionInner>, generation: u64, mut source: Box<dyn StanzaSource>) {
    loop {
        let event = source.next_event();
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let connection = Connection { inner };
        if !connection.is_current(generation) {
            trace!(connection = connection.id(), generation, "stale reader exits");
            return;
        }
        match event {
            Ok(StreamEvent::Stanza(stanza)) => connection.process_stanza(stanza),
            Ok(StreamEvent::StreamError(error)) => {
                connection.fail_session(generation, Error::Stream(error));
                return;
            }
            Ok(StreamEvent::Closed) => {
                let error = io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the stream");
                connection.fail_session(generation, Error::from(error));
                return;
            }
            Err(err) => {
                connection.fail_session(generation, err);
                return;
            }
        }
    }
}
