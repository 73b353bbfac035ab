/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

mod error;

use std::fmt::Display;
use std::hash::Hash;
use std::hash::Hasher;
use std::str::FromStr;

use serde::Deserialize;

pub use error::BadJid;
use error::description;

const MAX_PART_SIZE: usize = 1023;

fn check_part(
    part: &str,
    empty: &'static str,
    too_long: &'static str,
) -> Result<(), BadJid> {
    if part.is_empty() {
        return Err(BadJid(empty));
    }
    if part.len() > MAX_PART_SIZE {
        return Err(BadJid(too_long));
    }
    if part.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(BadJid(description::FORBIDDEN_CHARACTER));
    }
    Ok(())
}

/// The address of an entity in the XMPP protocol.
///
/// Each JID has three parts:
/// - Local part: Optionally identifies a local entity on the domain.
/// - Domain part: Identifies an XMPP server.
/// - Resource part: Optionally identifies a connected client or an object.
///
/// Stanza filters compare addresses through this type, so two JIDs are
/// equal exactly when their full forms are equal.
#[derive(Debug, Clone, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Jid {
    full: String,
    // Byte offset of the '@' separator, if there is a localpart.
    at: Option<usize>,
    // Byte offset of the '/' separator, if there is a resourcepart.
    slash: Option<usize>,
}

impl Jid {
    /// Create a JID from a string.
    pub fn new(jid: &str) -> Result<Self, BadJid> {
        // The resource may contain '@' and '/', so split on the first
        // slash before looking for the localpart separator.
        let (bare, resource) = match jid.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (jid, None),
        };
        let (local, domain) = match bare.split_once('@') {
            Some((local, domain)) => (Some(local), domain),
            None => (None, bare),
        };
        // RFC 7622 section 3.2: a final dot is not part of the domain.
        let domain = domain.strip_suffix('.').unwrap_or(domain);

        check_part(domain, description::DOMAIN_EMPTY, description::DOMAIN_TOO_LONG)?;
        if let Some(local) = local {
            check_part(local, description::LOCAL_EMPTY, description::LOCAL_TOO_LONG)?;
        }
        if let Some(resource) = resource {
            check_part(
                resource,
                description::RESOURCE_EMPTY,
                description::RESOURCE_TOO_LONG,
            )?;
        }

        let mut full = String::with_capacity(jid.len());
        let mut at = None;
        if let Some(local) = local {
            full.push_str(local);
            at = Some(full.len());
            full.push('@');
        }
        full.push_str(domain);
        let mut slash = None;
        if let Some(resource) = resource {
            slash = Some(full.len());
            full.push('/');
            full.push_str(resource);
        }
        Ok(Jid { full, at, slash })
    }

    /// Full form of the JID with all the components.
    pub fn full(&self) -> &str {
        &self.full
    }

    /// Bare form of the JID without the resource part.
    pub fn bare(&self) -> &str {
        match self.slash {
            Some(pos) => &self.full[..pos],
            None => &self.full,
        }
    }

    /// Only the local part of the JID.
    pub fn localpart(&self) -> Option<&str> {
        self.at.map(|pos| &self.full[..pos])
    }

    /// Only the domain part of the JID.
    pub fn domainpart(&self) -> &str {
        let start = self.at.map_or(0, |pos| pos + 1);
        let end = self.slash.unwrap_or(self.full.len());
        &self.full[start..end]
    }

    /// Only the resource part of the JID.
    pub fn resourcepart(&self) -> Option<&str> {
        self.slash.map(|pos| &self.full[pos + 1..])
    }

    /// True if the JID does not contain a resource part.
    pub fn is_bare(&self) -> bool {
        self.slash.is_none()
    }

    /// The bare JID as a separate address.
    pub fn to_bare(&self) -> Jid {
        Jid {
            full: self.bare().to_string(),
            at: self.at,
            slash: None,
        }
    }

    /// The domain of this JID as a separate address.
    pub fn to_domain(&self) -> Jid {
        Jid {
            full: self.domainpart().to_string(),
            at: None,
            slash: None,
        }
    }

    /// Creates another JID by overriding the resource part.
    pub fn with_resource(&self, resource: &str) -> Result<Jid, BadJid> {
        check_part(
            resource,
            description::RESOURCE_EMPTY,
            description::RESOURCE_TOO_LONG,
        )?;
        let bare = self.bare();
        let mut full = String::with_capacity(bare.len() + 1 + resource.len());
        full.push_str(bare);
        full.push('/');
        full.push_str(resource);
        Ok(Jid {
            full,
            at: self.at,
            slash: Some(bare.len()),
        })
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for Jid {
    type Err = BadJid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::new(s)
    }
}

impl TryFrom<String> for Jid {
    type Error = BadJid;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Jid::new(&value)
    }
}

impl PartialEq for Jid {
    fn eq(&self, other: &Jid) -> bool {
        self.full == other.full
    }
}

impl PartialOrd for Jid {
    fn partial_cmp(&self, other: &Jid) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Jid {
    fn cmp(&self, other: &Jid) -> std::cmp::Ordering {
        self.full.cmp(&other.full)
    }
}

impl Hash for Jid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full.hash(state)
    }
}
