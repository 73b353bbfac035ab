/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;
use tracing::error;

use crate::CancelReason;
use crate::Error;
use crate::Result;
use crate::Stanza;

type Resolver<T> = Arc<dyn Fn(&Stanza) -> Option<Result<T>> + Send + Sync>;
type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct Slot<T> {
    outcome: Option<Result<T>>,
    resolver: Option<Resolver<T>>,
    callbacks: Vec<Callback<T>>,
    description: String,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    done: Condvar,
}

/// A single-result handle for one outstanding request.
///
/// The first of `set_result`, `set_error`, `cancel`, or an expired
/// `get_timeout` decides the outcome; every later attempt is ignored.
/// Clones share the same slot.
pub struct StanzaFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for StanzaFuture<T> {
    fn clone(&self) -> Self {
        StanzaFuture {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> StanzaFuture<T> {
    pub fn new() -> Self {
        StanzaFuture {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    outcome: None,
                    resolver: None,
                    callbacks: Vec::new(),
                    description: String::from("stanza future"),
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// A future resolved by `process_stanza`. The resolver returns `None`
    /// for stanzas it is not interested in.
    pub fn with_resolver<F>(resolver: F) -> Self
    where
        F: Fn(&Stanza) -> Option<Result<T>> + Send + Sync + 'static,
    {
        let future = StanzaFuture::new();
        future.inner.slot.lock().resolver = Some(Arc::new(resolver));
        future
    }

    /// Names what the future waits for in timeout errors.
    pub fn describe(self, description: &str) -> Self {
        self.inner.slot.lock().description = description.to_string();
        self
    }

    pub fn set_result(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn set_error(&self, error: Error) -> bool {
        self.complete(Err(error))
    }

    pub fn cancel(&self) -> bool {
        self.complete(Err(Error::Cancelled(CancelReason::Explicit)))
    }

    /// Feeds a candidate stanza to the resolver. Returns true if this
    /// stanza completed the future.
    pub fn process_stanza(&self, stanza: &Stanza) -> bool {
        let resolver = {
            let slot = self.inner.slot.lock();
            if slot.outcome.is_some() {
                return false;
            }
            match &slot.resolver {
                Some(resolver) => Arc::clone(resolver),
                None => return false,
            }
        };
        match resolver(stanza) {
            Some(outcome) => self.complete(outcome),
            None => false,
        }
    }

    fn complete(&self, outcome: Result<T>) -> bool {
        let callbacks = {
            let mut slot = self.inner.slot.lock();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome.clone());
            slot.resolver = None;
            std::mem::take(&mut slot.callbacks)
        };
        self.inner.done.notify_all();
        for callback in callbacks {
            run_callback(callback, &outcome);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.inner.slot.lock().outcome.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.slot.lock().outcome, Some(Err(Error::Cancelled(_))))
    }

    /// The outcome, if there is one already.
    pub fn try_get(&self) -> Option<Result<T>> {
        self.inner.slot.lock().outcome.clone()
    }

    /// Blocks until the future completes.
    pub fn get(&self) -> Result<T> {
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(outcome) = &slot.outcome {
                return outcome.clone();
            }
            self.inner.done.wait(&mut slot);
        }
    }

    /// Waits up to `timeout` for the outcome without deciding it.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.get());
        };
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(outcome) = &slot.outcome {
                return Some(outcome.clone());
            }
            if self.inner.done.wait_until(&mut slot, deadline).timed_out() {
                return slot.outcome.clone();
            }
        }
    }

    /// Blocks until the future completes or `timeout` elapses. On expiry
    /// the future is completed with `Error::NoResponse`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        if let Some(outcome) = self.wait_timeout(timeout) {
            return outcome;
        }
        let filter = self.inner.slot.lock().description.clone();
        self.complete(Err(Error::NoResponse { timeout, filter }));
        // Whoever won the race decided the outcome.
        self.get()
    }

    /// Runs `callback` once with the outcome, right away when the future
    /// is already done.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let outcome = {
            let mut slot = self.inner.slot.lock();
            match &slot.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    slot.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        run_callback(Box::new(callback), &outcome);
    }
}

impl<T: Clone + Send + 'static> Default for StanzaFuture<T> {
    fn default() -> Self {
        StanzaFuture::new()
    }
}

fn run_callback<T>(callback: Callback<T>, outcome: &Result<T>) {
    if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
        error!("future completion callback panicked");
    }
}
