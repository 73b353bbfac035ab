/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

//! XMPP over TCP (RFC 6120) with STARTTLS, SASL and resource binding.

mod framing;
mod sasl;

use std::io;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::ClientConfig;
use rustls::ClientConnection;
use rustls::RootCertStore;
use rustls::StreamOwned;
use rustls::pki_types::ServerName;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

pub use sasl::Authenticator;
pub use sasl::PlainAuthenticator;

use crate::ConnectionConfig;
use crate::Element;
use crate::Error;
use crate::HostFailure;
use crate::IqType;
use crate::Jid;
use crate::Result;
use crate::Stanza;
use crate::StreamError;
use crate::TlsMode;
use crate::constants::BIND_NS;
use crate::constants::CLIENT_NS;
use crate::constants::CLIENT_PORT;
use crate::constants::ERROR_TAG;
use crate::constants::FEATURES_TAG;
use crate::constants::STREAM_NS;
use crate::constants::STREAM_TAG;
use crate::constants::TLS_NS;
use crate::error::description;
use crate::transport::Connector;
use crate::transport::Session;
use crate::transport::StanzaSink;
use crate::transport::StanzaSource;
use crate::transport::StreamEvent;
use framing::Frame;
use framing::Framer;

// How long the reader holds the socket before letting a sender in.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Socket {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Socket {
    fn tcp(&self) -> &TcpStream {
        match self {
            Socket::Plain(stream) => stream,
            Socket::Tls(stream) => stream.get_ref(),
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Plain(stream) => stream.read(buf),
            Socket::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Plain(stream) => stream.write(buf),
            Socket::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Plain(stream) => stream.flush(),
            Socket::Tls(stream) => stream.flush(),
        }
    }
}

/// Connects to a server over TCP.
#[derive(Clone)]
pub struct TcpConnector {
    authenticator: Arc<dyn Authenticator>,
}

impl TcpConnector {
    pub fn new() -> Self {
        TcpConnector::with_authenticator(Arc::new(PlainAuthenticator))
    }

    pub fn with_authenticator(authenticator: Arc<dyn Authenticator>) -> Self {
        TcpConnector { authenticator }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        TcpConnector::new()
    }
}

impl Connector for TcpConnector {
    fn connect(&self, config: &ConnectionConfig) -> Result<Session> {
        let stream = open_socket(config)?;
        stream.set_read_timeout(Some(config.connection_timeout()))?;
        stream.set_nodelay(true)?;
        let mut negotiation = Negotiation {
            config,
            socket: Socket::Plain(stream),
            framer: Framer::new(),
        };
        let jid = negotiation.run(self.authenticator.as_ref())?;
        let Negotiation { socket, framer, .. } = negotiation;
        socket.tcp().set_read_timeout(Some(POLL_INTERVAL))?;
        let socket = Arc::new(Mutex::new(socket));
        Ok(Session {
            sink: Box::new(TcpSink {
                socket: Arc::clone(&socket),
                closed: false,
            }),
            source: Box::new(TcpSource { socket, framer }),
            jid,
        })
    }
}

/// True when `host` carries no port of its own.
fn needs_default_port(host: &str) -> bool {
    // Rust resolver does require a port number but does NOT provide
    // a way to provide a default one :(
    let column_pos = host.rfind(':');
    let bracket_pos = host.rfind(']');
    match (column_pos, bracket_pos) {
        (None, _) => true,
        (Some(_), None) => host.matches(':').count() > 1,
        (Some(column), Some(bracket)) => column < bracket,
    }
}

fn resolve(host: &str) -> Result<Vec<SocketAddr>> {
    let resolved = if needs_default_port(host) {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        (bare, CLIENT_PORT).to_socket_addrs()
    } else {
        host.to_socket_addrs()
    };
    let addresses: Vec<SocketAddr> = resolved
        .map_err(|err| {
            Error::ConnectFailed(vec![HostFailure {
                address: host.to_string(),
                reason: err.to_string(),
            }])
        })?
        .collect();
    if addresses.is_empty() {
        return Err(Error::ConnectFailed(vec![HostFailure {
            address: host.to_string(),
            reason: String::from("no addresses"),
        }]));
    }
    Ok(addresses)
}

fn open_socket(config: &ConnectionConfig) -> Result<TcpStream> {
    let host = config.server().unwrap_or(config.jid().domainpart());
    let mut failures = Vec::new();
    for address in resolve(host)? {
        debug!(%address, "connecting");
        match TcpStream::connect_timeout(&address, config.connection_timeout()) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(%address, error = %err, "connect failed");
                failures.push(HostFailure {
                    address: address.to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }
    Err(Error::ConnectFailed(failures))
}

fn tls_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

struct Negotiation<'a> {
    config: &'a ConnectionConfig,
    socket: Socket,
    framer: Framer,
}

impl Negotiation<'_> {
    fn run(&mut self, authenticator: &dyn Authenticator) -> Result<Jid> {
        let mut features = self.open_stream()?;
        let offers_tls = features.child_ns("starttls", TLS_NS).is_some();
        match (self.config.tls(), offers_tls) {
            (TlsMode::Disabled, _) | (TlsMode::Optional, false) => {}
            (TlsMode::Required, false) => return Err(Error::BadStream(description::NO_TLS)),
            (_, true) => {
                self.start_tls()?;
                features = self.open_stream()?;
            }
        }

        let offered = sasl::offered_mechanisms(&features);
        if !offered.iter().any(|name| name == authenticator.mechanism()) {
            return Err(Error::BadStream(description::NO_MECHANISM));
        }
        self.send(&sasl::auth_element(authenticator, self.config)?)?;
        sasl::outcome(&self.read_element()?)?;
        debug!(mechanism = authenticator.mechanism(), "authenticated");

        let features = self.open_stream()?;
        if features.child_ns("bind", BIND_NS).is_none() {
            return Err(Error::BadStream(description::NO_BIND));
        }
        self.bind()
    }

    fn send(&mut self, element: &Element) -> Result<()> {
        self.send_raw(element.to_xml().as_bytes())
    }

    fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        trace!(bytes = %String::from_utf8_lossy(bytes), "sending");
        self.socket.write_all(bytes)?;
        self.socket.flush()?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let mut buffer = [0; 4096];
        loop {
            if let Some(frame) = self.framer.next_frame()? {
                return Ok(frame);
            }
            let nr_read = self.socket.read(&mut buffer)?;
            if nr_read == 0 {
                return Err(Error::BadStream(description::STREAM_CLOSED));
            }
            trace!(bytes = %String::from_utf8_lossy(&buffer[..nr_read]), "received");
            self.framer.push(&buffer[..nr_read]);
        }
    }

    fn read_element(&mut self) -> Result<Element> {
        match self.read_frame()? {
            Frame::Element(element) if element.name() == ERROR_TAG => {
                Err(Error::Stream(StreamError::from_element(&element)))
            }
            Frame::Element(element) => Ok(element),
            Frame::Close => Err(Error::BadStream(description::STREAM_CLOSED)),
            Frame::Open(_) => Err(Error::BadStream(description::UNEXPECTED_ELEMENT)),
        }
    }

    /// Sends our stream header and returns the server's features.
    fn open_stream(&mut self) -> Result<Element> {
        let header = Element::with_ns(STREAM_TAG, CLIENT_NS)
            .with_attr("xmlns:stream", STREAM_NS)
            .with_attr("version", "1.0")
            .with_attr("xml:lang", "en")
            .with_attr("from", self.config.jid().bare())
            .with_attr("to", self.config.jid().domainpart());
        let mut bytes = String::from("<?xml version='1.0'?>");
        header.write_start_tag(&mut bytes);
        self.send_raw(bytes.as_bytes())?;

        match self.read_frame()? {
            Frame::Open(_) => {}
            Frame::Element(element) if element.name() == ERROR_TAG => {
                return Err(Error::Stream(StreamError::from_element(&element)));
            }
            _ => return Err(Error::BadStream(description::NO_STREAM_HEADER)),
        }
        let features = self.read_element()?;
        if features.name() != FEATURES_TAG {
            return Err(Error::BadStream(description::UNEXPECTED_ELEMENT));
        }
        Ok(features)
    }

    fn start_tls(&mut self) -> Result<()> {
        self.send(&Element::with_ns("starttls", TLS_NS))?;
        let answer = self.read_element()?;
        if answer.name() != "proceed" {
            return Err(Error::BadStream(description::TLS_REFUSED));
        }
        let domain = self.config.jid().domainpart().to_string();
        let server_name =
            ServerName::try_from(domain).map_err(|err| Error::Tls(err.to_string()))?;
        let connection = ClientConnection::new(tls_config(), server_name)?;
        let placeholder = Socket::Plain(self.socket.tcp().try_clone()?);
        let Socket::Plain(stream) = std::mem::replace(&mut self.socket, placeholder) else {
            return Err(Error::BadStream(description::UNEXPECTED_ELEMENT));
        };
        self.socket = Socket::Tls(Box::new(StreamOwned::new(connection, stream)));
        self.framer = Framer::new();
        info!("stream encrypted");
        Ok(())
    }

    fn bind(&mut self) -> Result<Jid> {
        let mut bind = Element::with_ns("bind", BIND_NS);
        if let Some(resource) = self.config.resource() {
            bind.push_child(Element::new("resource").with_text(resource));
        }
        let request = Stanza::iq(IqType::Set).payload(bind).build();
        self.send(&request.to_element())?;
        loop {
            let reply = Stanza::from_element(self.read_element()?)?;
            if reply.id() != request.id() {
                // Anything arriving before the bind result is not for us yet.
                warn!(id = ?reply.id(), "stanza before resource binding dropped");
                continue;
            }
            if let Some(error) = reply.error() {
                return Err(Error::Stanza(error.clone()));
            }
            let jid = reply
                .payload("bind", BIND_NS)
                .and_then(|bind| bind.child("jid"))
                .map(Element::text)
                .ok_or(Error::BadStream(description::BAD_BIND))?;
            return Jid::new(&jid).map_err(|_| Error::BadStream(description::BAD_BIND));
        }
    }
}

struct TcpSink {
    socket: Arc<Mutex<Socket>>,
    closed: bool,
}

impl StanzaSink for TcpSink {
    fn send(&mut self, stanza: &Stanza) -> Result<()> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        let xml = stanza.to_xml();
        trace!(bytes = %xml, "sending");
        let mut socket = self.socket.lock();
        socket.write_all(xml.as_bytes())?;
        socket.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut socket = self.socket.lock();
        let _ = socket.write_all(b"</stream:stream>");
        if let Socket::Tls(stream) = &mut *socket {
            stream.conn.send_close_notify();
        }
        let _ = socket.flush();
        match socket.tcp().shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err.into()),
            _ => Ok(()),
        }
    }
}

struct TcpSource {
    socket: Arc<Mutex<Socket>>,
    framer: Framer,
}

impl StanzaSource for TcpSource {
    fn next_event(&mut self) -> Result<StreamEvent> {
        let mut buffer = [0; 4096];
        loop {
            while let Some(frame) = self.framer.next_frame()? {
                match frame {
                    Frame::Element(element) if element.name() == ERROR_TAG => {
                        return Ok(StreamEvent::StreamError(StreamError::from_element(&element)));
                    }
                    Frame::Element(element) => match Stanza::from_element(element) {
                        Ok(stanza) => return Ok(StreamEvent::Stanza(stanza)),
                        Err(err) => debug!(error = %err, "inbound element skipped"),
                    },
                    Frame::Close => return Ok(StreamEvent::Closed),
                    Frame::Open(_) => debug!("unexpected stream header skipped"),
                }
            }
            let read = self.socket.lock().read(&mut buffer);
            match read {
                Ok(0) => return Ok(StreamEvent::Closed),
                Ok(nr_read) => {
                    trace!(bytes = %String::from_utf8_lossy(&buffer[..nr_read]), "received");
                    self.framer.push(&buffer[..nr_read]);
                }
                Err(err)
                    if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}
