/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::sync::LazyLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use rand::Rng;
use rand::distr::Alphanumeric;

const PREFIX_SIZE: usize = 5;

/// Generates stanza ids that are unique within the process.
///
/// Ids are a random per-source prefix followed by a counter, so ids of
/// two processes talking through the same server do not collide either.
pub struct StanzaIdSource {
    prefix: String,
    counter: AtomicU64,
}

impl StanzaIdSource {
    pub fn new() -> Self {
        let prefix = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(PREFIX_SIZE)
            .map(char::from)
            .collect();
        StanzaIdSource {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

impl Default for StanzaIdSource {
    fn default() -> Self {
        Self::new()
    }
}

static IDS: LazyLock<StanzaIdSource> = LazyLock::new(StanzaIdSource::new);

pub(crate) fn next_id() -> String {
    IDS.next_id()
}
