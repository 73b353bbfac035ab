/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::sync::Arc;

use crate::IqType;
use crate::Jid;
use crate::Stanza;
use crate::StanzaKind;

/// A predicate deciding which inbound stanzas a collector or listener sees.
///
/// Filters run on the dispatch thread for every inbound stanza, so they
/// must be cheap and must not block. Any `Fn(&Stanza) -> bool` closure is
/// a filter.
pub trait StanzaFilter: Send + Sync {
    fn accept(&self, stanza: &Stanza) -> bool;

    /// Human readable form used in "no response" errors and logs.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

impl<F> StanzaFilter for F
where
    F: Fn(&Stanza) -> bool + Send + Sync,
{
    fn accept(&self, stanza: &Stanza) -> bool {
        self(stanza)
    }

    fn describe(&self) -> String {
        String::from("custom filter")
    }
}

/// Matches stanzas carrying the given id.
#[derive(Debug, Clone)]
pub struct StanzaIdFilter {
    id: String,
}

impl StanzaIdFilter {
    pub fn new(id: &str) -> Self {
        StanzaIdFilter { id: id.to_string() }
    }

    /// Matches replies carrying the id of the given stanza.
    pub fn of(stanza: &Stanza) -> Self {
        StanzaIdFilter::new(stanza.id().unwrap_or_default())
    }
}

impl StanzaFilter for StanzaIdFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.id() == Some(self.id.as_str())
    }

    fn describe(&self) -> String {
        format!("stanza id '{}'", self.id)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KindFilter(pub StanzaKind);

impl StanzaFilter for KindFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.kind() == self.0
    }

    fn describe(&self) -> String {
        format!("{} stanzas", self.0.tag())
    }
}

/// Matches stanzas sent by an address.
#[derive(Debug, Clone)]
pub struct FromFilter {
    address: Jid,
    bare: bool,
}

impl FromFilter {
    /// Only the exact full address matches.
    pub fn full(address: Jid) -> Self {
        FromFilter {
            address,
            bare: false,
        }
    }

    /// Any resource of the bare address matches.
    pub fn bare(address: Jid) -> Self {
        FromFilter {
            address: address.to_bare(),
            bare: true,
        }
    }
}

impl StanzaFilter for FromFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        match stanza.from() {
            Some(from) if self.bare => from.bare() == self.address.full(),
            Some(from) => from == &self.address,
            None => false,
        }
    }

    fn describe(&self) -> String {
        format!("from '{}'", self.address)
    }
}

/// Matches the `result` or `error` answering an IQ request.
///
/// Besides the id, the sender must be the entity the request was sent to.
/// A request without a `to` address goes to the user's own account, so
/// the reply may come from the server domain, the bare or full JID of
/// the user, or carry no `from` at all.
#[derive(Debug, Clone)]
pub struct IqReplyFilter {
    id: String,
    senders: Vec<Option<Jid>>,
}

impl IqReplyFilter {
    pub fn new(request: &Stanza, local: Option<&Jid>) -> Self {
        let mut senders = Vec::new();
        match request.to() {
            Some(to) => {
                senders.push(Some(to.clone()));
                if let Some(local) = local {
                    if to.full() == local.bare() {
                        senders.push(None);
                        senders.push(Some(local.clone()));
                    }
                }
            }
            None => {
                senders.push(None);
                if let Some(local) = local {
                    senders.push(Some(local.clone()));
                    senders.push(Some(local.to_bare()));
                    senders.push(Some(local.to_domain()));
                }
            }
        }
        IqReplyFilter {
            id: request.id().unwrap_or_default().to_string(),
            senders,
        }
    }
}

impl StanzaFilter for IqReplyFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        if !matches!(stanza.iq_type(), Some(IqType::Result | IqType::Error)) {
            return false;
        }
        if stanza.id() != Some(self.id.as_str()) {
            return false;
        }
        self.senders
            .iter()
            .any(|sender| sender.as_ref() == stanza.from())
    }

    fn describe(&self) -> String {
        format!("IQ reply to '{}'", self.id)
    }
}

pub struct And(Vec<Arc<dyn StanzaFilter>>);

impl StanzaFilter for And {
    fn accept(&self, stanza: &Stanza) -> bool {
        self.0.iter().all(|filter| filter.accept(stanza))
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(|filter| filter.describe()).collect();
        format!("({})", parts.join(" and "))
    }
}

pub struct Or(Vec<Arc<dyn StanzaFilter>>);

impl StanzaFilter for Or {
    fn accept(&self, stanza: &Stanza) -> bool {
        self.0.iter().any(|filter| filter.accept(stanza))
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(|filter| filter.describe()).collect();
        format!("({})", parts.join(" or "))
    }
}

pub struct Not(Arc<dyn StanzaFilter>);

impl StanzaFilter for Not {
    fn accept(&self, stanza: &Stanza) -> bool {
        !self.0.accept(stanza)
    }

    fn describe(&self) -> String {
        format!("not {}", self.0.describe())
    }
}

/// Composition helpers available on every filter.
pub trait FilterExt: StanzaFilter + Sized + 'static {
    fn and<F: StanzaFilter + 'static>(self, other: F) -> And {
        And(vec![Arc::new(self), Arc::new(other)])
    }

    fn or<F: StanzaFilter + 'static>(self, other: F) -> Or {
        Or(vec![Arc::new(self), Arc::new(other)])
    }

    fn not(self) -> Not {
        Not(Arc::new(self))
    }
}

impl<T: StanzaFilter + Sized + 'static> FilterExt for T {}

/// Accepts every stanza.
pub fn any() -> impl StanzaFilter {
    |_: &Stanza| true
}
