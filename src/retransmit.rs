use std::collections::HashMap;

use super::timer_wheel::{TimerKey, TimerWheel, WheelLevel};

// 4ms resolution out to ~2s, 128ms out to ~32s, 8s beyond that
const WHEEL_LEVELS: [WheelLevel; 3] = [
    WheelLevel {
        bins: 512,
        ms_per_bin: 4,
    },
    WheelLevel {
        bins: 256,
        ms_per_bin: 128,
    },
    WheelLevel {
        bins: 64,
        ms_per_bin: 8192,
    },
];

/// Retransmission timers for outstanding segments, keyed by sequence number.
///
/// At most one timer is live per sequence number: arming a sequence number which already has a
/// timer replaces it. Timers removed by [`RetransmitTimers::disarm`] are gone from the wheel and
/// can never fire afterwards.
pub struct RetransmitTimers {
    wheel: TimerWheel<u32>,
    keys: HashMap<u32, TimerKey>,
}

impl RetransmitTimers {
    pub fn new(now_ms: u64) -> Self {
        Self {
            wheel: TimerWheel::new(&WHEEL_LEVELS, now_ms),
            keys: HashMap::new(),
        }
    }

    pub fn arm(&mut self, seq_num: u32, deadline_ms: u64) {
        self.disarm(seq_num);

        let key = self.wheel.insert(deadline_ms, seq_num);
        self.keys.insert(seq_num, key);
    }

    /// Returns true if a live timer was removed.
    pub fn disarm(&mut self, seq_num: u32) -> bool {
        match self.keys.remove(&seq_num) {
            Some(key) => self.wheel.cancel(key).is_some(),
            None => false,
        }
    }

    pub fn disarm_all(&mut self) {
        for (_, key) in self.keys.drain() {
            self.wheel.cancel(key);
        }

        debug_assert!(self.wheel.is_empty());
    }

    /// Appends the sequence number of every timer which has expired by `now_ms`.
    pub fn expire(&mut self, now_ms: u64, expired: &mut Vec<u32>) {
        let first_new = expired.len();

        self.wheel.step(now_ms, expired);

        for seq_num in &expired[first_new..] {
            self.keys.remove(seq_num);
        }
    }

    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.wheel.next_expiration_ms()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[cfg(test)]
    pub fn is_armed(&self, seq_num: u32) -> bool {
        self.keys.contains_key(&seq_num)
    }
}
