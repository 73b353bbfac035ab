/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::ops::RangeInclusive;

use rand::Rng;

/// Range of the per-manager random base delay, in seconds.
pub const BASE_RANGE: RangeInclusive<u64> = 5..=15;

/// Picks the base delay of a new manager. Clients disconnected by the
/// same outage spread their retries over the range.
pub fn random_base() -> u64 {
    rand::rng().random_range(BASE_RANGE)
}

/// Seconds to wait before the given attempt, counting from one.
pub fn tiered_delay(base: u64, attempt: u64) -> u64 {
    if attempt > 13 {
        base * 30
    } else if attempt > 7 {
        base * 6
    } else {
        base
    }
}
