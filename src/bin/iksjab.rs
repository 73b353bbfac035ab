/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use ikslink::Connection;
use ikslink::ConnectionConfig;
use ikslink::ConnectionListener;
use ikslink::ConnectionRegistry;
use ikslink::Element;
use ikslink::Error;
use ikslink::IqType;
use ikslink::Jid;
use ikslink::KindFilter;
use ikslink::ReconnectionConfig;
use ikslink::ReconnectionListener;
use ikslink::ReconnectionManager;
use ikslink::Result;
use ikslink::Stanza;
use ikslink::StanzaKind;
use ikslink::constants::PING_NS;
use ikslink::transport::tcp::TcpConnector;

#[derive(Parser)]
#[command(
    name = "iksjab",
    version,
    about = "This tool can communicate over XMPP.",
    after_help = "Report issues at https://github.com/meduketto/iksemel-rust/issues"
)]
struct Args {
    /// Jabber ID to log in as
    #[arg(short, long)]
    jid: Option<Jid>,

    /// TOML file with the connection settings
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Host or host:port to connect instead of the JID's domain
    #[arg(short, long)]
    server: Option<String>,

    /// Recipient of --message, or the entity to --ping
    #[arg(short, long)]
    to: Option<Jid>,

    /// Send a chat message to --to
    #[arg(short, long)]
    message: Option<String>,

    /// Ping --to (or the server) and print the round trip time
    #[arg(short, long)]
    ping: bool,

    /// Print incoming messages until interrupted
    #[arg(short, long)]
    listen: bool,

    /// Reconnect automatically when the stream fails
    #[arg(short, long)]
    reconnect: bool,

    /// Log protocol details
    #[arg(short, long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("ikslink=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ikslink=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<ConnectionConfig> {
    let config = match (&args.config, &args.jid) {
        (Some(path), jid) => {
            if jid.is_some() {
                warn!("--jid ignored, the configuration file names the account");
            }
            ConnectionConfig::from_file(path)?
        }
        (None, Some(jid)) => ConnectionConfig::builder(jid.clone()).build(),
        (None, None) => {
            return Err(Error::Config(String::from("either --jid or --config is needed")));
        }
    };
    let mut builder = config.clone().into_builder();
    if args.server.is_some() {
        builder = builder.server(args.server.clone());
    }
    if config.password().is_none() {
        let password = rpassword::prompt_password(format!("Password for {}: ", config.jid()))?;
        builder = builder.password(Some(password));
    }
    Ok(builder.build())
}

/// Announces presence again after every (re)connect so messages keep coming.
struct Presence;

impl ConnectionListener for Presence {
    fn connected(&self, connection: &Connection) {
        if let Err(err) = connection.send_stanza(&Stanza::presence().build()) {
            warn!(error = %err, "could not send presence");
        }
    }
}

struct Progress;

impl ReconnectionListener for Progress {
    fn reconnecting_in(&self, seconds: u64) {
        if seconds == 0 {
            info!("reconnecting");
        } else if seconds % 10 == 0 || seconds <= 3 {
            info!(seconds, "reconnecting soon");
        }
    }

    fn reconnection_failed(&self, error: &Error) {
        warn!(error = %error, "reconnection failed");
    }
}

fn ping(connection: &Connection, to: Jid) -> Result<()> {
    let request = Stanza::iq(IqType::Get)
        .to(to.clone())
        .payload(Element::with_ns("ping", PING_NS))
        .build();
    let start = Instant::now();
    connection.send_iq_and_wait(&request)?;
    println!("pong from {} in {} ms", to, start.elapsed().as_millis());
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let registry = ConnectionRegistry::new();
    ReconnectionManager::install(
        &registry,
        ReconnectionConfig {
            enabled_by_default: args.reconnect,
            ..config.reconnection().clone()
        },
    );
    let connection = registry.create_connection(config, Arc::new(TcpConnector::new()));
    ReconnectionManager::instance_for(&connection).add_reconnection_listener(Arc::new(Progress));
    if args.listen {
        connection.add_connection_listener(Arc::new(Presence));
        connection.add_stanza_listener(KindFilter(StanzaKind::Message), |stanza| {
            if let Some(body) = stanza.body() {
                let from = stanza.from().map(Jid::full).unwrap_or("?");
                println!("{from}: {body}");
            }
        });
    }

    connection.connect()?;
    if let Some(user) = connection.user() {
        info!(jid = %user, "logged in");
    }

    if args.ping {
        let to = match &args.to {
            Some(to) => to.clone(),
            None => connection.config().jid().to_domain(),
        };
        ping(&connection, to)?;
    }

    if let Some(text) = &args.message {
        let to = args
            .to
            .clone()
            .ok_or_else(|| Error::Config(String::from("--message needs --to")))?;
        connection.send_stanza(&Stanza::message().to(to).stanza_type("chat").body(text).build())?;
    }

    if args.listen {
        loop {
            thread::park();
        }
    }
    connection.disconnect();
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}
