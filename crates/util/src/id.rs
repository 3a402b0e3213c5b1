// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::string_atom::StringAtom;

/// The last nanosecond tick handed out; advancing it keeps ids strictly
/// monotonic even when the clock returns the same instant twice.
static LAST_TICK: AtomicU64 = AtomicU64::new(0);

/// Generates a time-based hexadecimal id.
///
/// Ids are derived from the wall clock in nanoseconds and are unique
/// process-wide: concurrent calls within the same nanosecond receive
/// consecutive ticks instead of colliding.
pub fn next_id() -> StringAtom {
  let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0);

  let prev = LAST_TICK
    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(last.wrapping_add(1).max(now)))
    .unwrap_or(now);
  let tick = prev.wrapping_add(1).max(now);

  StringAtom::from(format!("{:x}", tick))
}
