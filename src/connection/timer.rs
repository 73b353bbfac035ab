/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;
use tracing::trace;

use crate::Result;
use crate::connection::isolate;

type Task = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed, so the heap yields the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

#[derive(Default)]
struct Queue {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    started: bool,
    shutdown: bool,
    spawned: u64,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
}

/// Runs delayed tasks of one connection on a single thread.
///
/// The thread starts with the first scheduled task. Dropping the timer
/// runs whatever is still pending right away and ends the thread.
pub(crate) struct Timer {
    name: String,
    shared: Arc<Shared>,
}

impl Timer {
    pub(crate) fn new(name: String) -> Self {
        Timer {
            name,
            shared: Arc::new(Shared::default()),
        }
    }

    pub(crate) fn schedule<F>(&self, delay: Duration, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let now = Instant::now();
        // Too far away to represent: it never fires before shutdown.
        let deadline = now.checked_add(delay).unwrap_or(now + Duration::from_secs(86400 * 365));
        let mut queue = self.shared.queue.lock();
        if !queue.started {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || run(&shared))?;
            queue.started = true;
            queue.spawned += 1;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push(Entry {
            deadline,
            seq,
            task: Box::new(task),
        });
        drop(queue);
        self.shared.wake.notify_one();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn threads_spawned(&self) -> u64 {
        self.shared.queue.lock().spawned
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.wake.notify_one();
    }
}

fn run(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        let now = Instant::now();
        let due = queue
            .entries
            .peek()
            .is_some_and(|entry| queue.shutdown || entry.deadline <= now);
        if due {
            if let Some(entry) = queue.entries.pop() {
                drop(queue);
                isolate("timer task", entry.task);
                queue = shared.queue.lock();
            }
            continue;
        }
        if queue.shutdown {
            trace!("timer thread exits");
            return;
        }
        match queue.entries.peek().map(|entry| entry.deadline) {
            Some(deadline) => {
                shared.wake.wait_until(&mut queue, deadline);
            }
            None => shared.wake.wait(&mut queue),
        }
    }
}
