use std::ops::Range;

// Hierarchical timer wheel. See https://lwn.net/Articles/646950/
//
// Each level is a ring of bins covering a fixed span of time. A timer is filed in the finest level
// whose ring can hold its deadline without aliasing; the coarsest level absorbs everything else
// and may alias, so its bins are filtered by deadline when they are swept.
//
// For levels of 8 bins each at 4, 16 and 64 ms per bin:
//
//  t (4ms) ->
//
//  xxxxxxxx
//  x---x---x---x---x---x---x---x---
//  x---------------x---------------x---------------x--------------- ...
//
// Bins are circular doubly-linked lists threaded through one index table. The first entries of
// the table are the bin sentinels; timers follow. Timers fire at the end of the bin they were
// filed in, so a timer fires no earlier than its deadline and no later than one bin afterwards.

type SlotIndex = u32;

/// Handle to a scheduled timer. Becomes stale once the timer fires or is cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerKey {
    idx: SlotIndex,
    generation: u32,
}

/// Shape of a single wheel level.
#[derive(Clone, Copy, Debug)]
pub struct WheelLevel {
    /// Number of bins, a power of two.
    pub bins: u32,
    /// Width of each bin, a power of two.
    pub ms_per_bin: u32,
}

struct Link {
    next: SlotIndex,
    prev: SlotIndex,
    deadline_ms: u64,
    generation: u32,
}

struct Level {
    sentinels: Range<SlotIndex>,
    bin_mask: u64,
    bin_shift: u32,
    bins: u64,
    // Absolute index of the bin containing the last step time
    cursor: u64,
}

pub struct TimerWheel<T> {
    levels: Box<[Level]>,
    links: Vec<Link>,
    data: Vec<Option<T>>,
    free_list: Vec<SlotIndex>,
    last_step_ms: u64,
    len: usize,
}

impl Link {
    fn detached(idx: SlotIndex) -> Self {
        Self {
            next: idx,
            prev: idx,
            deadline_ms: 0,
            generation: 0,
        }
    }
}

impl Level {
    fn new(sentinels: Range<SlotIndex>, config: &WheelLevel, now_ms: u64) -> Self {
        assert!(
            config.bins.is_power_of_two(),
            "wheel level bin count must be a power of two"
        );
        assert!(
            config.ms_per_bin.is_power_of_two(),
            "wheel level bin width must be a power of two"
        );

        let bin_shift = config.ms_per_bin.trailing_zeros();

        Self {
            sentinels,
            bin_mask: u64::from(config.bins - 1),
            bin_shift,
            bins: u64::from(config.bins),
            cursor: now_ms >> bin_shift,
        }
    }

    fn sentinel(&self, abs_bin: u64) -> SlotIndex {
        self.sentinels.start + (abs_bin & self.bin_mask) as SlotIndex
    }
}

impl<T> TimerWheel<T> {
    pub fn new(levels: &[WheelLevel], now_ms: u64) -> Self {
        assert!(!levels.is_empty(), "timer wheel requires at least one level");

        let mut sentinel_count: SlotIndex = 0;

        let levels: Box<[Level]> = levels
            .iter()
            .map(|config| {
                let sentinels = sentinel_count..sentinel_count + config.bins;
                sentinel_count += config.bins;
                Level::new(sentinels, config, now_ms)
            })
            .collect();

        Self {
            levels,
            links: (0..sentinel_count).map(Link::detached).collect(),
            data: (0..sentinel_count).map(|_| None).collect(),
            free_list: Vec::new(),
            last_step_ms: now_ms,
            len: 0,
        }
    }

    /// Number of pending timers.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn first_timer_index(&self) -> SlotIndex {
        self.levels[self.levels.len() - 1].sentinels.end
    }

    fn find_bin(&self, deadline_ms: u64) -> SlotIndex {
        let (coarsest, finer) = self.levels.split_last().expect("at least one level");

        for level in finer {
            let abs_bin = deadline_ms >> level.bin_shift;

            // Finer levels must not alias
            if abs_bin - level.cursor < level.bins {
                return level.sentinel(abs_bin);
            }
        }

        coarsest.sentinel(deadline_ms >> coarsest.bin_shift)
    }

    fn link_before(&mut self, sentinel: SlotIndex, idx: SlotIndex) {
        let tail = self.links[sentinel as usize].prev;

        self.links[tail as usize].next = idx;
        self.links[idx as usize].prev = tail;
        self.links[idx as usize].next = sentinel;
        self.links[sentinel as usize].prev = idx;
    }

    fn unlink(&mut self, idx: SlotIndex) {
        let next = self.links[idx as usize].next;
        let prev = self.links[idx as usize].prev;

        self.links[prev as usize].next = next;
        self.links[next as usize].prev = prev;
        self.links[idx as usize].next = idx;
        self.links[idx as usize].prev = idx;
    }

    fn release(&mut self, idx: SlotIndex) -> Option<T> {
        self.unlink(idx);

        let link = &mut self.links[idx as usize];
        link.generation = link.generation.wrapping_add(1);

        self.free_list.push(idx);
        self.len -= 1;

        self.data[idx as usize].take()
    }

    /// Schedules `data` to be returned by [`TimerWheel::step`] once `deadline_ms` has passed.
    /// Deadlines earlier than the last step are treated as due at the next step.
    pub fn insert(&mut self, deadline_ms: u64, data: T) -> TimerKey {
        let deadline_ms = deadline_ms.max(self.last_step_ms);

        let idx = match self.free_list.pop() {
            Some(idx) => {
                self.data[idx as usize] = Some(data);
                idx
            }
            None => {
                let idx = SlotIndex::try_from(self.links.len()).expect("timer limit reached");
                self.links.push(Link::detached(idx));
                self.data.push(Some(data));
                idx
            }
        };

        self.links[idx as usize].deadline_ms = deadline_ms;

        let sentinel = self.find_bin(deadline_ms);
        self.link_before(sentinel, idx);

        self.len += 1;

        TimerKey {
            idx,
            generation: self.links[idx as usize].generation,
        }
    }

    /// Removes a pending timer and returns its data. Returns `None` if the timer already fired or
    /// was cancelled; a stale key never affects a timer which later reused its slot.
    pub fn cancel(&mut self, key: TimerKey) -> Option<T> {
        let idx = key.idx;

        if idx < self.first_timer_index() || idx as usize >= self.links.len() {
            return None;
        }

        if self.links[idx as usize].generation != key.generation
            || self.data[idx as usize].is_none()
        {
            return None;
        }

        self.release(idx)
    }

    /// Returns the earliest time at which a call to [`TimerWheel::step`] may produce a timer.
    pub fn next_expiration_ms(&self) -> Option<u64> {
        let mut earliest: Option<u64> = None;

        for level in self.levels.iter() {
            for i in 0..level.bins {
                let sentinel = level.sentinel(level.cursor + i);

                if self.links[sentinel as usize].next != sentinel {
                    // Non-empty bins expire at the start of the following bin
                    let expire_ms = (level.cursor + i + 1) << level.bin_shift;
                    earliest = Some(earliest.map_or(expire_ms, |t| t.min(expire_ms)));
                    break;
                }
            }
        }

        earliest
    }

    fn sweep_bin(&mut self, sentinel: SlotIndex, now_ms: u64, filter: bool, out: &mut Vec<T>) {
        let mut idx = self.links[sentinel as usize].next;

        while idx != sentinel {
            let next = self.links[idx as usize].next;

            if !filter || self.links[idx as usize].deadline_ms <= now_ms {
                if let Some(data) = self.release(idx) {
                    out.push(data);
                }
            }

            idx = next;
        }
    }

    /// Advances the wheel to `now_ms`, appending the data of every expired timer to `out`.
    pub fn step(&mut self, now_ms: u64, out: &mut Vec<T>) {
        let now_ms = now_ms.max(self.last_step_ms);
        let level_count = self.levels.len();

        for level_idx in 0..level_count {
            let (cursor, bins, bin_shift) = {
                let level = &self.levels[level_idx];
                (level.cursor, level.bins, level.bin_shift)
            };

            let now_bin = now_ms >> bin_shift;
            let end_bin = now_bin.min(cursor + bins);

            // Only the coarsest level aliases and needs its bins filtered by deadline
            let filter = level_idx == level_count - 1;

            for abs_bin in cursor..end_bin {
                let sentinel = self.levels[level_idx].sentinel(abs_bin);
                self.sweep_bin(sentinel, now_ms, filter, out);
            }

            self.levels[level_idx].cursor = now_bin;
        }

        self.last_step_ms = now_ms;
    }
}
