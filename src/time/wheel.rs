//! Hierarchical timing wheel for future-dated events.
//!
//! The wheel stores alarms in multiple levels of buckets with increasing
//! spans. An alarm is inserted into the finest level whose range can
//! represent its deadline relative to the current time; as time advances,
//! coarse buckets are cascaded down into finer levels until their alarms
//! fire.
//!
//! # Edge Policy
//!
//! An alarm whose deadline is at or before the wheel's current time is
//! placed in the next-to-fire position: the next `advance_to` fires it.
//! Alarms are never fired inline from `add`.
//!
//! # Overflow Handling
//!
//! Deadlines beyond the last level's physical range but within the
//! configured horizon are held in an overflow heap and promoted into the
//! wheel as time advances. Deadlines beyond the horizon are rejected with
//! [`HorizonError`].
//!
//! # Performance Characteristics
//!
//! - `add`: O(1) amortized (direct slot calculation)
//! - `remove`: O(1) (generation-based invalidation; the bucket entry
//!   becomes garbage and is skipped when its bucket is visited)
//! - `advance_to`: O(fired + bucket promotions), with empty-tick skipping
//! - `min_alarm_time`: cached, recomputed lazily after the minimum is
//!   removed or fired

use crate::types::{Span, Time};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

const DEFAULT_LEVEL_BITS: [u32; 4] = [8, 8, 8, 8];
const DEFAULT_BASE_RESOLUTION: Span = Span::from_micros(1);
const DEFAULT_MAX_ALARM_IN_FUTURE: Span = Span::from_secs(86_400);

/// Configuration for a [`TimingWheel`]: level widths, base resolution,
/// and the alarm horizon.
#[derive(Debug, Clone)]
pub struct TimingWheelConfig {
    /// Bits per level; level `i` has `2^bits[i]` buckets.
    pub level_bits: Vec<u32>,
    /// Span covered by one bucket of the finest level. Must be positive.
    pub base_resolution: Span,
    /// How far in the future an alarm may be set. `add` beyond this fails.
    pub max_alarm_in_future: Span,
}

impl Default for TimingWheelConfig {
    fn default() -> Self {
        Self {
            level_bits: DEFAULT_LEVEL_BITS.to_vec(),
            base_resolution: DEFAULT_BASE_RESOLUTION,
            max_alarm_in_future: DEFAULT_MAX_ALARM_IN_FUTURE,
        }
    }
}

impl TimingWheelConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-level bit widths.
    #[must_use]
    pub fn level_bits(mut self, bits: Vec<u32>) -> Self {
        self.level_bits = bits;
        self
    }

    /// Sets the finest-level bucket span.
    #[must_use]
    pub fn base_resolution(mut self, resolution: Span) -> Self {
        self.base_resolution = resolution;
        self
    }

    /// Sets the alarm horizon.
    #[must_use]
    pub fn max_alarm_in_future(mut self, horizon: Span) -> Self {
        self.max_alarm_in_future = horizon;
        self
    }

    fn normalized(mut self) -> Self {
        if self.level_bits.is_empty() {
            self.level_bits = DEFAULT_LEVEL_BITS.to_vec();
        }
        for bits in &mut self.level_bits {
            *bits = (*bits).clamp(1, 16);
        }
        if self.base_resolution.is_nonpositive() {
            self.base_resolution = DEFAULT_BASE_RESOLUTION;
        }
        if self.max_alarm_in_future.is_nonpositive() {
            self.max_alarm_in_future = DEFAULT_MAX_ALARM_IN_FUTURE;
        }
        self
    }
}

/// Error returned when an alarm deadline exceeds the wheel horizon.
#[derive(Debug, Clone, thiserror::Error)]
#[error("alarm at {at} exceeds the wheel horizon ({horizon} past {now})")]
pub struct HorizonError {
    /// The requested deadline.
    pub at: Time,
    /// The wheel's current time when the add was attempted.
    pub now: Time,
    /// The configured horizon.
    pub horizon: Span,
}

impl From<HorizonError> for crate::error::Error {
    fn from(e: HorizonError) -> Self {
        Self::new(crate::error::ErrorKind::OutOfRange).with_context(e.to_string())
    }
}

/// Opaque handle for a scheduled alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmId {
    id: u64,
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    at: Time,
    id: u64,
    generation: u64,
}

struct AlarmRec<V> {
    at: Time,
    generation: u64,
    payload: V,
}

#[derive(Debug)]
struct OverflowEntry {
    at: Time,
    entry: Entry,
}

impl PartialEq for OverflowEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl Eq for OverflowEntry {}

impl PartialOrd for OverflowEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OverflowEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse for min-heap (earliest deadline first).
        other.at.cmp(&self.at)
    }
}

struct Level {
    slots: Vec<Vec<Entry>>,
    resolution_ns: u64,
    slot_count: usize,
    cursor: usize,
}

impl Level {
    fn new(resolution_ns: u64, slot_count: usize, cursor: usize) -> Self {
        Self {
            slots: vec![Vec::new(); slot_count],
            resolution_ns,
            slot_count,
            cursor,
        }
    }

    fn range_ns(&self) -> u64 {
        self.resolution_ns.saturating_mul(self.slot_count as u64)
    }
}

/// Hierarchical timing wheel over payloads of type `V`.
pub struct TimingWheel<V> {
    current_tick: u64,
    base_resolution_ns: u64,
    levels: Vec<Level>,
    overflow: BinaryHeap<OverflowEntry>,
    ready: Vec<Entry>,
    next_id: u64,
    next_generation: u64,
    active: HashMap<u64, AlarmRec<V>>,
    cached_min: Option<Time>,
    min_dirty: bool,
    horizon: Span,
}

impl<V> TimingWheel<V> {
    /// Creates a wheel starting at time zero with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Time::ZERO, TimingWheelConfig::default())
    }

    /// Creates a wheel starting at the given time.
    #[must_use]
    pub fn new_at(now: Time) -> Self {
        Self::with_config(now, TimingWheelConfig::default())
    }

    /// Creates a wheel with a custom configuration.
    #[must_use]
    pub fn with_config(now: Time, config: TimingWheelConfig) -> Self {
        let config = config.normalized();
        let base_resolution_ns = config.base_resolution.as_nanos() as u64;
        let now_nanos = now.as_nanos();

        let mut levels = Vec::with_capacity(config.level_bits.len());
        let mut resolution_ns = base_resolution_ns;
        for bits in &config.level_bits {
            let slot_count = 1usize << bits;
            let cursor = ((now_nanos / resolution_ns) % slot_count as u64) as usize;
            levels.push(Level::new(resolution_ns, slot_count, cursor));
            resolution_ns = resolution_ns.saturating_mul(slot_count as u64);
        }

        Self {
            current_tick: now_nanos / base_resolution_ns,
            base_resolution_ns,
            levels,
            overflow: BinaryHeap::new(),
            ready: Vec::new(),
            next_id: 0,
            next_generation: 0,
            active: HashMap::new(),
            cached_min: None,
            min_dirty: false,
            horizon: config.max_alarm_in_future,
        }
    }

    /// Returns the number of live alarms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Returns true if there are no live alarms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Returns the current time aligned to the base resolution.
    #[must_use]
    pub fn current_time(&self) -> Time {
        Time::from_nanos(self.current_tick.saturating_mul(self.base_resolution_ns))
    }

    /// Returns the number of alarms parked in the overflow heap.
    #[must_use]
    pub fn overflow_count(&self) -> usize {
        self.overflow.len()
    }

    /// Removes all alarms.
    pub fn clear(&mut self) {
        self.active.clear();
        self.ready.clear();
        self.overflow.clear();
        for level in &mut self.levels {
            for slot in &mut level.slots {
                slot.clear();
            }
        }
        self.cached_min = None;
        self.min_dirty = false;
    }

    /// Registers an alarm that fires once `advance_to` passes `at`.
    ///
    /// # Panics
    ///
    /// Panics if `at` is beyond the wheel horizon. Use
    /// [`try_add`][Self::try_add] for a fallible version.
    pub fn add(&mut self, at: Time, payload: V) -> AlarmId {
        self.try_add(at, payload)
            .expect("alarm deadline exceeds the wheel horizon")
    }

    /// Registers an alarm, rejecting deadlines beyond the horizon.
    pub fn try_add(&mut self, at: Time, payload: V) -> Result<AlarmId, HorizonError> {
        let now = self.current_time();
        if at > now + self.horizon {
            return Err(HorizonError {
                at,
                now,
                horizon: self.horizon,
            });
        }

        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        let generation = self.next_generation;
        self.next_generation = self.next_generation.saturating_add(1);

        self.active.insert(
            id,
            AlarmRec {
                at,
                generation,
                payload,
            },
        );
        if !self.min_dirty {
            self.cached_min = Some(self.cached_min.map_or(at, |m| m.min(at)));
        }

        self.insert_entry(Entry { at, id, generation });
        Ok(AlarmId { id, generation })
    }

    /// Cancels an alarm, returning its payload if it was still live.
    pub fn remove(&mut self, handle: AlarmId) -> Option<V> {
        let live = matches!(
            self.active.get(&handle.id),
            Some(rec) if rec.generation == handle.generation
        );
        if !live {
            return None;
        }
        let rec = self.active.remove(&handle.id)?;
        self.note_removed(rec.at);
        Some(rec.payload)
    }

    /// Returns true if the alarm is still pending in the wheel.
    #[must_use]
    pub fn contains(&self, handle: AlarmId) -> bool {
        matches!(
            self.active.get(&handle.id),
            Some(rec) if rec.generation == handle.generation
        )
    }

    /// Returns the deadline of a live alarm.
    #[must_use]
    pub fn alarm_time(&self, handle: AlarmId) -> Option<Time> {
        match self.active.get(&handle.id) {
            Some(rec) if rec.generation == handle.generation => Some(rec.at),
            _ => None,
        }
    }

    /// Moves a live alarm to a new deadline, keeping its payload.
    ///
    /// Returns `Ok(None)` if the alarm was no longer live. A horizon
    /// violation leaves the alarm in place at its old deadline.
    pub fn reschedule(
        &mut self,
        handle: AlarmId,
        at: Time,
    ) -> Result<Option<AlarmId>, HorizonError> {
        let now = self.current_time();
        if at > now + self.horizon {
            return Err(HorizonError {
                at,
                now,
                horizon: self.horizon,
            });
        }
        match self.remove(handle) {
            None => Ok(None),
            Some(payload) => {
                let id = self
                    .try_add(at, payload)
                    .expect("horizon was checked before removal");
                Ok(Some(id))
            }
        }
    }

    /// Returns the earliest pending deadline, if any.
    pub fn min_alarm_time(&mut self) -> Option<Time> {
        if self.min_dirty {
            self.cached_min = self.active.values().map(|rec| rec.at).reduce(Time::min);
            self.min_dirty = false;
        }
        self.cached_min
    }

    /// Advances time to `now` and returns fired payloads in deadline order
    /// (ties broken by registration order).
    pub fn advance_to(&mut self, now: Time) -> Vec<V> {
        let target_tick = now.as_nanos() / self.base_resolution_ns;
        if target_tick > self.current_tick {
            self.advance_ticks(target_tick);
        }
        self.drain_ready(now)
    }

    fn note_removed(&mut self, at: Time) {
        if self.cached_min == Some(at) {
            self.min_dirty = true;
        }
    }

    fn is_live(&self, entry: &Entry) -> bool {
        matches!(
            self.active.get(&entry.id),
            Some(rec) if rec.generation == entry.generation
        )
    }

    fn physical_range_ns(&self) -> u64 {
        self.levels.last().map_or(0, Level::range_ns)
    }

    fn insert_entry(&mut self, entry: Entry) {
        let current = self.current_time();
        if entry.at <= current {
            self.ready.push(entry);
            return;
        }

        let delta = entry.at.as_nanos().saturating_sub(current.as_nanos());
        if delta >= self.physical_range_ns() {
            self.overflow.push(OverflowEntry {
                at: entry.at,
                entry,
            });
            return;
        }

        for (idx, level) in self.levels.iter_mut().enumerate() {
            if delta < level.range_ns() {
                let tick = entry.at.as_nanos() / level.resolution_ns;
                // A deadline inside the already-crossed bucket of the
                // finest level is due now.
                if idx == 0 {
                    let current_tick_l0 = current.as_nanos() / level.resolution_ns;
                    if tick <= current_tick_l0 {
                        self.ready.push(entry);
                        return;
                    }
                }
                let slot = (tick as usize) % level.slot_count;
                level.slots[slot].push(entry);
                return;
            }
        }

        self.overflow.push(OverflowEntry {
            at: entry.at,
            entry,
        });
    }

    fn advance_ticks(&mut self, target_tick: u64) {
        while self.current_tick < target_tick {
            // Skip runs of ticks during which no occupied slot is crossed.
            // Cursors are a pure function of the current tick, so they can
            // be realigned after the jump instead of stepped through.
            let next_event = self.next_occupied_tick(target_tick);
            if next_event > self.current_tick + 1 {
                let jump = (next_event - 1).min(target_tick);
                if jump > self.current_tick {
                    self.current_tick = jump;
                    self.realign_cursors();
                }
                if self.current_tick >= target_tick {
                    break;
                }
            }

            self.current_tick = self.current_tick.saturating_add(1);
            self.tick_finest_level();
            self.refill_overflow();
        }
    }

    fn realign_cursors(&mut self) {
        let now_ns = self.current_tick.saturating_mul(self.base_resolution_ns);
        for level in &mut self.levels {
            level.cursor = ((now_ns / level.resolution_ns) % level.slot_count as u64) as usize;
        }
    }

    /// Finds the earliest tick at which something can happen: an occupied
    /// slot is crossed at any level, or an overflow alarm comes in range.
    fn next_occupied_tick(&self, limit: u64) -> u64 {
        let mut next = limit;
        let now_ns = self.current_tick.saturating_mul(self.base_resolution_ns);

        for level in &self.levels {
            let steps_done = now_ns / level.resolution_ns;
            for j in 1..=level.slot_count as u64 {
                let slot = ((steps_done + j) % level.slot_count as u64) as usize;
                if !level.slots[slot].is_empty() {
                    let cross_ns = (steps_done + j).saturating_mul(level.resolution_ns);
                    let tick = cross_ns / self.base_resolution_ns;
                    if tick < next {
                        next = tick;
                    }
                    break;
                }
            }
        }

        if let Some(head) = self.overflow.peek() {
            let enter_ns = head
                .at
                .as_nanos()
                .saturating_sub(self.physical_range_ns());
            let enter_tick = enter_ns / self.base_resolution_ns;
            if enter_tick < next {
                if enter_tick > self.current_tick {
                    next = enter_tick;
                } else {
                    // Already in range: process on the very next step.
                    return self.current_tick;
                }
            }
        }

        next
    }

    fn tick_finest_level(&mut self) {
        let cursor = {
            let level0 = &mut self.levels[0];
            level0.cursor = (level0.cursor + 1) % level0.slot_count;
            level0.cursor
        };

        let bucket = std::mem::take(&mut self.levels[0].slots[cursor]);
        self.collect_bucket(bucket);

        if cursor == 0 {
            self.cascade(1);
        }
    }

    fn cascade(&mut self, level_index: usize) {
        if level_index >= self.levels.len() {
            return;
        }

        let cursor = {
            let level = &mut self.levels[level_index];
            level.cursor = (level.cursor + 1) % level.slot_count;
            level.cursor
        };

        let bucket = std::mem::take(&mut self.levels[level_index].slots[cursor]);
        for entry in bucket {
            if self.is_live(&entry) {
                self.insert_entry(entry);
            }
        }

        if cursor == 0 {
            self.cascade(level_index + 1);
        }
    }

    fn collect_bucket(&mut self, bucket: Vec<Entry>) {
        let now = self.current_time();
        for entry in bucket {
            if !self.is_live(&entry) {
                continue;
            }
            if entry.at <= now {
                self.ready.push(entry);
            } else {
                self.insert_entry(entry);
            }
        }
    }

    fn refill_overflow(&mut self) {
        let current = self.current_time();
        let range = self.physical_range_ns();
        while let Some(head) = self.overflow.peek() {
            let delta = head.at.as_nanos().saturating_sub(current.as_nanos());
            if delta >= range {
                break;
            }
            let head = self.overflow.pop().expect("peeked entry missing");
            if self.is_live(&head.entry) {
                self.insert_entry(head.entry);
            }
        }
    }

    fn drain_ready(&mut self, now: Time) -> Vec<V> {
        if self.ready.is_empty() {
            return Vec::new();
        }

        let ready = std::mem::take(&mut self.ready);
        let mut due: Vec<Entry> = Vec::new();
        for entry in ready {
            if !self.is_live(&entry) {
                continue;
            }
            if entry.at <= now {
                due.push(entry);
            } else {
                self.ready.push(entry);
            }
        }

        due.sort_by_key(|entry| (entry.at, entry.id));

        let mut fired = Vec::with_capacity(due.len());
        for entry in due {
            if let Some(rec) = self.active.remove(&entry.id) {
                self.note_removed(rec.at);
                fired.push(rec.payload);
            }
        }
        fired
    }
}

impl<V> Default for TimingWheel<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for TimingWheel<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingWheel")
            .field("current_tick", &self.current_tick)
            .field("levels", &self.levels.len())
            .field("live", &self.active.len())
            .field("overflow", &self.overflow.len())
            .finish()
    }
}
