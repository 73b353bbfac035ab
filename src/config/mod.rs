/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::DEFAULT_COLLECTOR_SIZE;
use crate::Error;
use crate::Jid;
use crate::Result;
use crate::StreamErrorCondition;

/// Whether the TCP connector upgrades the stream with STARTTLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    /// Fail unless the server offers STARTTLS.
    #[default]
    Required,
    /// Upgrade when offered, continue in plain text otherwise.
    Optional,
    Disabled,
}

/// How an IQ `get` or `set` without a registered handler is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownIqReply {
    #[default]
    FeatureNotImplemented,
    ServiceUnavailable,
    DoNotReply,
}

/// Delay schedule between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectionPolicy {
    /// A random base of 5 to 15 seconds, multiplied by 6 after seven
    /// attempts and by 30 after thirteen.
    #[default]
    RandomIncreasingDelay,
    FixedDelay { seconds: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionConfig {
    /// Turn automatic reconnection on for every new connection.
    pub enabled_by_default: bool,
    pub policy: ReconnectionPolicy,
    /// Granularity of the wait between attempts. Countdown notifications
    /// and the allowed-check happen once per tick.
    pub tick: Duration,
    /// Stream errors after which the server must not be contacted again.
    pub suppressed_conditions: HashSet<StreamErrorCondition>,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        ReconnectionConfig {
            enabled_by_default: false,
            policy: ReconnectionPolicy::default(),
            tick: Duration::from_secs(1),
            suppressed_conditions: HashSet::from([StreamErrorCondition::Conflict]),
        }
    }
}

/// Read-only settings of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    jid: Jid,
    password: Option<String>,
    server: Option<String>,
    connection_timeout: Duration,
    reply_timeout: Duration,
    collector_size: usize,
    reconnection_allowed: bool,
    tls: TlsMode,
    resource: Option<String>,
    unknown_iq_reply: UnknownIqReply,
    reconnection: ReconnectionConfig,
}

impl ConnectionConfig {
    pub fn builder(jid: Jid) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new(jid)
    }

    /// Reopens the settings for changes, as when command line options
    /// override a loaded file.
    pub fn into_builder(self) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder { config: self }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text).map_err(|err| Error::Config(err.to_string()))?;
        file.into_config()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        ConnectionConfig::from_toml_str(&text)
    }

    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Host or `host:port` to connect to instead of the JID's domain.
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub fn collector_size(&self) -> usize {
        self.collector_size
    }

    pub fn is_reconnection_allowed(&self) -> bool {
        self.reconnection_allowed
    }

    pub fn tls(&self) -> TlsMode {
        self.tls
    }

    /// The resource to bind, falling back to the JID's own resource.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref().or(self.jid.resourcepart())
    }

    pub fn unknown_iq_reply(&self) -> UnknownIqReply {
        self.unknown_iq_reply
    }

    pub fn reconnection(&self) -> &ReconnectionConfig {
        &self.reconnection
    }
}

pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    pub fn new(jid: Jid) -> Self {
        ConnectionConfigBuilder {
            config: ConnectionConfig {
                jid,
                password: None,
                server: None,
                connection_timeout: Duration::from_secs(30),
                reply_timeout: Duration::from_secs(5),
                collector_size: DEFAULT_COLLECTOR_SIZE,
                reconnection_allowed: true,
                tls: TlsMode::default(),
                resource: None,
                unknown_iq_reply: UnknownIqReply::default(),
                reconnection: ReconnectionConfig::default(),
            },
        }
    }

    pub fn password(mut self, password: Option<String>) -> Self {
        self.config.password = password;
        self
    }

    pub fn server(mut self, server: Option<String>) -> Self {
        self.config.server = server;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.reply_timeout = timeout;
        self
    }

    pub fn collector_size(mut self, size: usize) -> Self {
        self.config.collector_size = size.max(1);
        self
    }

    pub fn reconnection_allowed(mut self, allowed: bool) -> Self {
        self.config.reconnection_allowed = allowed;
        self
    }

    pub fn tls(mut self, tls: TlsMode) -> Self {
        self.config.tls = tls;
        self
    }

    pub fn resource(mut self, resource: Option<String>) -> Self {
        self.config.resource = resource;
        self
    }

    pub fn unknown_iq_reply(mut self, reply: UnknownIqReply) -> Self {
        self.config.unknown_iq_reply = reply;
        self
    }

    pub fn reconnection(mut self, reconnection: ReconnectionConfig) -> Self {
        self.config.reconnection = reconnection;
        self
    }

    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

// On-disk layout. Durations are integer milliseconds.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    jid: Jid,
    password: Option<String>,
    server: Option<String>,
    connection_timeout_ms: Option<u64>,
    reply_timeout_ms: Option<u64>,
    collector_size: Option<usize>,
    reconnection_allowed: Option<bool>,
    tls: Option<TlsMode>,
    resource: Option<String>,
    unknown_iq_reply: Option<UnknownIqReply>,
    reconnection: Option<ReconnectionFile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
enum PolicyName {
    RandomIncreasingDelay,
    FixedDelay,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReconnectionFile {
    enabled_by_default: Option<bool>,
    policy: Option<PolicyName>,
    fixed_delay_secs: Option<u64>,
    tick_ms: Option<u64>,
    suppressed_conditions: Option<Vec<StreamErrorCondition>>,
}

impl ConfigFile {
    fn into_config(self) -> Result<ConnectionConfig> {
        let mut builder = ConnectionConfig::builder(self.jid)
            .password(self.password)
            .server(self.server)
            .resource(self.resource);
        if let Some(ms) = self.connection_timeout_ms {
            builder = builder.connection_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.reply_timeout_ms {
            builder = builder.reply_timeout(Duration::from_millis(ms));
        }
        if let Some(size) = self.collector_size {
            builder = builder.collector_size(size);
        }
        if let Some(allowed) = self.reconnection_allowed {
            builder = builder.reconnection_allowed(allowed);
        }
        if let Some(tls) = self.tls {
            builder = builder.tls(tls);
        }
        if let Some(reply) = self.unknown_iq_reply {
            builder = builder.unknown_iq_reply(reply);
        }
        if let Some(reconnection) = self.reconnection {
            builder = builder.reconnection(reconnection.into_config()?);
        }
        Ok(builder.build())
    }
}

impl ReconnectionFile {
    fn into_config(self) -> Result<ReconnectionConfig> {
        let mut config = ReconnectionConfig::default();
        if let Some(enabled) = self.enabled_by_default {
            config.enabled_by_default = enabled;
        }
        config.policy = match (self.policy, self.fixed_delay_secs) {
            (None | Some(PolicyName::RandomIncreasingDelay), None) => {
                ReconnectionPolicy::RandomIncreasingDelay
            }
            (None | Some(PolicyName::FixedDelay), Some(seconds)) => {
                ReconnectionPolicy::FixedDelay { seconds }
            }
            (Some(PolicyName::FixedDelay), None) => {
                return Err(Error::Config(String::from(
                    "fixed-delay policy needs fixed_delay_secs",
                )));
            }
            (Some(PolicyName::RandomIncreasingDelay), Some(_)) => {
                return Err(Error::Config(String::from(
                    "fixed_delay_secs only applies to the fixed-delay policy",
                )));
            }
        };
        if let Some(ms) = self.tick_ms {
            if ms == 0 {
                return Err(Error::Config(String::from("tick_ms must be positive")));
            }
            config.tick = Duration::from_millis(ms);
        }
        if let Some(conditions) = self.suppressed_conditions {
            config.suppressed_conditions = conditions.into_iter().collect();
        }
        Ok(config)
    }
}
