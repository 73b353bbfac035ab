/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::sync::atomic::AtomicBool;
use std::thread;

use proptest::prelude::*;

use super::*;
use crate::IqType;
use crate::KindFilter;
use crate::StanzaKind;
use crate::filter;

fn numbered(n: usize) -> Arc<Stanza> {
    Arc::new(Stanza::message().id(&n.to_string()).build())
}

fn ids(collector: &StanzaCollector) -> Vec<usize> {
    let mut ids = Vec::new();
    while let Some(stanza) = collector.poll() {
        ids.push(stanza.id().unwrap().parse().unwrap());
    }
    ids
}

#[test]
fn rollover_keeps_newest() {
    let registry = CollectorRegistry::new();
    let collector = registry.create(CollectorConfig::new(filter::any()).capacity(5));

    for n in 0..=5 {
        registry.dispatch(&numbered(n));
    }
    assert_eq!(ids(&collector), vec![1, 2, 3, 4, 5]);
    assert!(collector.poll().is_none());

    for n in 10..=14 {
        registry.dispatch(&numbered(n));
    }
    assert_eq!(ids(&collector), vec![10, 11, 12, 13, 14]);
    assert!(collector.poll().is_none());

    let start = Instant::now();
    let timeout = Duration::from_millis(100);
    assert!(collector.poll_timeout(timeout).unwrap().is_none());
    assert!(start.elapsed() >= timeout);

    assert_eq!(collector.collected_count(), 11);
    assert_eq!(collector.dropped_count(), 1);
}

#[test]
fn zero_capacity_is_raised() {
    let registry = CollectorRegistry::new();
    let collector = registry.create(CollectorConfig::new(filter::any()).capacity(0));
    assert_eq!(collector.capacity(), 1);
    registry.dispatch(&numbered(1));
    registry.dispatch(&numbered(2));
    assert_eq!(ids(&collector), vec![2]);
}

#[test]
fn only_accepted_stanzas_are_queued() {
    let registry = CollectorRegistry::new();
    let iqs = registry.create(CollectorConfig::new(KindFilter(StanzaKind::Iq)));
    let all = registry.create(CollectorConfig::new(filter::any()));

    let accepted = registry.dispatch(&numbered(1));
    assert_eq!(accepted, 1);
    let accepted = registry.dispatch(&Arc::new(Stanza::iq(IqType::Result).id("r").build()));
    assert_eq!(accepted, 2);

    assert_eq!(iqs.len(), 1);
    assert_eq!(all.len(), 2);
    // Both collectors share the same stanza.
    let a = iqs.poll().unwrap();
    all.poll().unwrap();
    let b = all.poll().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn cancel_wakes_blocked_reader() {
    let registry = CollectorRegistry::new();
    let collector = registry.create(CollectorConfig::new(filter::any()));
    thread::scope(|scope| {
        let reader = scope.spawn(|| collector.poll_blocking());
        thread::sleep(Duration::from_millis(50));
        collector.cancel();
        let result = reader.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled(CancelReason::Explicit))));
    });
    assert!(collector.is_cancelled());
    assert!(collector.poll_timeout(Duration::from_secs(5)).unwrap_err().is_cancelled());
}

#[test]
fn cancel_and_drop_unregister() {
    let registry = CollectorRegistry::new();
    let first = registry.create(CollectorConfig::new(filter::any()));
    let second = registry.create(CollectorConfig::new(filter::any()));
    assert_eq!(registry.len(), 2);

    first.cancel();
    first.cancel();
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.dispatch(&numbered(7)), 1);
    assert!(first.poll().is_none());

    drop(second);
    assert!(registry.is_empty());
}

#[test]
fn cancel_all_keeps_leftovers_pollable() {
    let registry = CollectorRegistry::new();
    let collector = registry.create(CollectorConfig::new(filter::any()));
    registry.dispatch(&numbered(1));
    registry.dispatch(&numbered(2));

    registry.cancel_all(CancelReason::Shutdown);
    assert!(registry.is_empty());
    assert_eq!(collector.cancel_reason(), Some(CancelReason::Shutdown));
    // A later explicit cancel does not overwrite the reason.
    collector.cancel();
    assert_eq!(collector.cancel_reason(), Some(CancelReason::Shutdown));

    assert!(matches!(
        collector.poll_blocking(),
        Err(Error::Cancelled(CancelReason::Shutdown))
    ));
    assert_eq!(ids(&collector), vec![1, 2]);

    // Nothing new arrives after the cancel.
    registry.dispatch(&numbered(3));
    assert!(collector.poll().is_none());
}

#[test]
fn next_reply_outcomes() {
    let registry = CollectorRegistry::new();
    let short = Duration::from_millis(20);

    let collector = registry.create(CollectorConfig::new(filter::any()));
    assert!(matches!(collector.next_reply(short), Err(Error::NotConnected)));
    assert!(collector.is_cancelled());

    registry.set_live(true);
    let collector = registry.create(CollectorConfig::new(crate::StanzaIdFilter::new("q1")));
    match collector.next_reply(short) {
        Err(Error::NoResponse { timeout, filter }) => {
            assert_eq!(timeout, short);
            assert_eq!(filter, "stanza id 'q1'");
        }
        other => panic!("unexpected {other:?}"),
    }

    let collector = registry.create(CollectorConfig::new(crate::StanzaIdFilter::new("q2")));
    registry.dispatch(&Arc::new(
        Stanza::iq(IqType::Error)
            .id("q2")
            .error(StanzaError::new(StanzaErrorCondition::ItemNotFound))
            .build(),
    ));
    match collector.next_reply(short) {
        Err(Error::Stanza(error)) => {
            assert_eq!(error.condition, StanzaErrorCondition::ItemNotFound)
        }
        other => panic!("unexpected {other:?}"),
    }

    let collector = registry.create(CollectorConfig::new(crate::StanzaIdFilter::new("q3")));
    registry.dispatch(&Arc::new(Stanza::iq(IqType::Result).id("q3").build()));
    assert_eq!(collector.next_reply(short).unwrap().id(), Some("q3"));
    assert!(registry.is_empty());
}

#[test]
fn panicking_filter_does_not_stop_delivery() {
    let registry = CollectorRegistry::new();
    let _bad = registry.create(CollectorConfig::new(|_: &Stanza| -> bool {
        panic!("broken filter")
    }));
    let good = registry.create(CollectorConfig::new(filter::any()));
    assert_eq!(registry.dispatch(&numbered(1)), 1);
    assert_eq!(ids(&good), vec![1]);
}

#[test]
fn concurrent_readers_see_each_stanza_once() {
    const COUNT: usize = 2000;
    const READERS: usize = 4;

    let registry = CollectorRegistry::new();
    let collector = registry.create(CollectorConfig::new(filter::any()).capacity(COUNT));
    let done = AtomicBool::new(false);

    let mut seen: Vec<usize> = thread::scope(|scope| {
        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                scope.spawn(|| {
                    let mut got: Vec<usize> = Vec::new();
                    loop {
                        match collector.poll_timeout(Duration::from_millis(20)) {
                            Ok(Some(stanza)) => got.push(stanza.id().unwrap().parse().unwrap()),
                            Ok(None) if done.load(Ordering::Acquire) => {
                                // Everything is queued by now.
                                while let Some(stanza) = collector.poll() {
                                    got.push(stanza.id().unwrap().parse().unwrap());
                                }
                                break;
                            }
                            Ok(None) => {}
                            Err(err) => panic!("reader failed: {err}"),
                        }
                    }
                    got
                })
            })
            .collect();
        for n in 0..COUNT {
            registry.dispatch(&numbered(n));
        }
        done.store(true, Ordering::Release);
        readers
            .into_iter()
            .flat_map(|reader| reader.join().unwrap())
            .collect()
    });

    seen.sort_unstable();
    assert_eq!(seen, (0..COUNT).collect::<Vec<_>>());
    assert!(collector.poll().is_none());
}

proptest! {
    #[test]
    fn rollover_yields_last_capacity_stanzas(capacity in 1usize..32, count in 0usize..100) {
        let registry = CollectorRegistry::new();
        let collector = registry.create(CollectorConfig::new(filter::any()).capacity(capacity));
        for n in 0..count {
            registry.dispatch(&numbered(n));
        }
        let expected: Vec<usize> = (count.saturating_sub(capacity)..count).collect();
        prop_assert_eq!(ids(&collector), expected);
        prop_assert!(collector.poll().is_none());
        prop_assert_eq!(collector.dropped_count(), count.saturating_sub(capacity) as u64);
    }
}
