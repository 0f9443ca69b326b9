//! Time-ordered checkpoint identifiers
//!
//! Ids have the shape `{unix_millis:012x}-{seq:06x}-{rand:08x}`. All three
//! parts are fixed-width lower-case hex, so lexicographic order of the string
//! equals `(millis, seq)` order and the key-value store can answer "latest"
//! and "before" queries with plain range scans.

use chrono::Utc;
use parking_lot::{const_mutex, Mutex};
use rand::Rng;

/// Width of the sequence part; a process can mint this many ids per millisecond
/// before borrowing from the next one.
const SEQ_LIMIT: u32 = 0x00ff_ffff;

static CLOCK: Mutex<IdClock> = const_mutex(IdClock { last_ms: 0, seq: 0 });

#[derive(Debug)]
struct IdClock {
    last_ms: u64,
    seq: u32,
}

impl IdClock {
    /// Advance to `now_ms`, never moving backwards.
    fn tick(&mut self, now_ms: u64) -> (u64, u32) {
        if now_ms > self.last_ms {
            self.last_ms = now_ms;
            self.seq = 0;
        } else if self.seq >= SEQ_LIMIT {
            self.last_ms = self.last_ms.saturating_add(1);
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        (self.last_ms, self.seq)
    }
}

/// Generate a new checkpoint id that sorts after every id previously
/// generated by this process.
pub fn generate() -> String {
    let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
    let (ms, seq) = CLOCK.lock().tick(now_ms);
    let suffix: u32 = rand::thread_rng().gen();
    format!("{:012x}-{:06x}-{:08x}", ms, seq, suffix)
}
