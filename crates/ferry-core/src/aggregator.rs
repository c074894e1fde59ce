//! Folds parsed stats records into a live progress model.
//!
//! The slot table is a fixed arena: every in-flight file holds one row until it
//! stops being reported, so a file keeps its visual position for as long as it
//! is transferring. Slots are handed out lowest index first from a free list.
//! Files reported while the table is full wait in a FIFO queue and are admitted
//! as soon as a slot frees.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::stats::{FileStatsRecord, GlobalStatsRecord, StatsRecord};

/// Whole-job totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalProgress {
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
    pub percent: Option<u8>,
    pub speed: u64,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
    pub files_completed: u64,
    pub files_total: Option<u64>,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Active,
    /// Missing from the latest block; released if still missing after the next.
    Completing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlot {
    pub slot_index: usize,
    pub file_name: String,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub percent: Option<u8>,
    pub speed: u64,
    pub eta: Option<Duration>,
    pub state: SlotState,
}

impl FileSlot {
    fn new(slot_index: usize, record: &FileStatsRecord, state: SlotState) -> Self {
        let mut slot = Self {
            slot_index,
            file_name: record.name.clone(),
            bytes_done: 0,
            bytes_total: None,
            percent: None,
            speed: 0,
            eta: None,
            state,
        };
        slot.update(record);
        slot.state = state;
        slot
    }

    fn update(&mut self, record: &FileStatsRecord) {
        if let Some(done) = record.bytes_done {
            self.bytes_done = done;
        }
        if record.bytes_total.is_some() {
            self.bytes_total = record.bytes_total;
        }
        if record.percent.is_some() {
            self.percent = record.percent;
        }
        if let Some(speed) = record.speed {
            self.speed = speed;
        }
        // A fresh per-file line always carries the latest estimate, unknown included.
        if record.percent.is_some() {
            self.eta = record.eta;
        }
        self.state = SlotState::Active;
    }
}

/// Immutable point-in-time view handed to consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub global: GlobalProgress,
    /// Occupied slots in slot order.
    pub slots: Vec<FileSlot>,
    /// Files reported as in flight that are waiting for a free slot.
    pub queued: usize,
    /// 1-based index of the source item being processed, 0 before the first.
    pub item: usize,
    pub items_total: usize,
    pub parse_anomalies: u64,
}

impl Snapshot {
    pub fn active_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Active)
            .count()
    }
}

#[derive(Debug)]
struct QueuedFile {
    record: FileStatsRecord,
    seen: bool,
}

/// Counters of the items already finished, added to the current item's figures.
#[derive(Debug, Default, Clone, Copy)]
struct ItemBase {
    bytes: u64,
    files: u64,
    errors: u64,
    elapsed: Duration,
}

#[derive(Debug)]
pub struct ProgressAggregator {
    slots: Vec<Option<FileSlot>>,
    free: BTreeSet<usize>,
    by_name: HashMap<String, usize>,
    queue: VecDeque<QueuedFile>,
    seen: HashSet<usize>,
    global: GlobalProgress,
    base: ItemBase,
    item: usize,
    items_total: usize,
    parse_anomalies: u64,
}

impl ProgressAggregator {
    pub fn new(capacity: usize, items_total: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            free: (0..capacity).collect(),
            by_name: HashMap::new(),
            queue: VecDeque::new(),
            seen: HashSet::new(),
            global: GlobalProgress::default(),
            base: ItemBase::default(),
            item: 0,
            items_total,
            parse_anomalies: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn apply(&mut self, record: StatsRecord) -> Snapshot {
        match record {
            StatsRecord::Global(global) => {
                self.close_block();
                self.apply_global(&global);
            }
            StatsRecord::File(file) => self.apply_file(file),
        }
        self.snapshot()
    }

    /// Start the next source item. The previous item's totals become the base
    /// its successor's figures are added to, and its slots are released.
    pub fn begin_item(&mut self) -> Snapshot {
        self.base = ItemBase {
            bytes: self.global.bytes_transferred,
            files: self.global.files_completed,
            errors: self.global.errors,
            elapsed: self.global.elapsed,
        };
        self.global.speed = 0;
        self.global.eta = None;
        self.release_all();
        self.item += 1;
        self.snapshot()
    }

    /// The job is over: clear the table and return the final view.
    pub fn finish(&mut self) -> Snapshot {
        self.release_all();
        self.global.speed = 0;
        self.global.eta = None;
        self.snapshot()
    }

    pub fn parse_anomalies(&self) -> u64 {
        self.parse_anomalies
    }

    pub fn set_parse_anomalies(&mut self, count: u64) {
        self.parse_anomalies = count;
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            global: self.global.clone(),
            slots: self.slots.iter().flatten().cloned().collect(),
            queued: self.queue.len(),
            item: self.item,
            items_total: self.items_total,
            parse_anomalies: self.parse_anomalies,
        }
    }

    fn apply_global(&mut self, record: &GlobalStatsRecord) {
        let base = self.base;
        let global = &mut self.global;

        // The byte line carries transferred, total, percent, speed and ETA together.
        if let Some(done) = record.bytes_transferred {
            global.bytes_transferred = base.bytes.saturating_add(done);
            global.bytes_total = record.bytes_total.map(|total| base.bytes.saturating_add(total));
            global.percent = if base.bytes == 0 {
                record.percent
            } else {
                global.bytes_total.and_then(|total| percent_of(global.bytes_transferred, total))
            };
            global.speed = record.speed.unwrap_or(0);
            global.eta = record.eta;
        }
        if let Some(elapsed) = record.elapsed {
            global.elapsed = global.elapsed.max(base.elapsed.saturating_add(elapsed));
        }
        if let Some(done) = record.files_completed {
            global.files_completed = global.files_completed.max(base.files.saturating_add(done));
        }
        if let Some(total) = record.files_total {
            global.files_total = Some(base.files.saturating_add(total));
        }
        if let Some(errors) = record.errors {
            global.errors = base.errors.saturating_add(errors);
        }
    }

    fn apply_file(&mut self, record: FileStatsRecord) {
        if let Some(&index) = self.by_name.get(&record.name) {
            if let Some(slot) = self.slots[index].as_mut() {
                slot.update(&record);
            }
            self.seen.insert(index);
            return;
        }

        if let Some(queued) = self.queue.iter_mut().find(|q| q.record.name == record.name) {
            queued.record = record;
            queued.seen = true;
            return;
        }

        match self.free.pop_first() {
            Some(index) => {
                self.occupy(index, &record, SlotState::Active);
                self.seen.insert(index);
            }
            None => {
                log::debug!(
                    "slot table full ({}), queueing {}",
                    self.capacity(),
                    record.name
                );
                self.queue.push_back(QueuedFile { record, seen: true });
            }
        }
    }

    /// End of a block: age slots that were not reported, release the ones that
    /// were already completing, then admit queued files into freed slots.
    fn close_block(&mut self) {
        for index in 0..self.slots.len() {
            let reported = self.seen.contains(&index);
            let release = match self.slots[index].as_mut() {
                Some(slot) if !reported => match slot.state {
                    SlotState::Active => {
                        slot.state = SlotState::Completing;
                        false
                    }
                    SlotState::Completing => true,
                },
                _ => false,
            };
            if release {
                self.release(index);
            }
        }
        self.seen.clear();

        while !self.queue.is_empty() {
            let Some(index) = self.free.pop_first() else {
                break;
            };
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            // A file that finished while waiting is still shown, already completing.
            let state = if queued.seen {
                SlotState::Active
            } else {
                SlotState::Completing
            };
            self.occupy(index, &queued.record, state);
        }
        for queued in &mut self.queue {
            queued.seen = false;
        }
    }

    /// Only a per-file record marks a slot as reported; a file admitted from the
    /// queue still has to show up in the block that follows.
    fn occupy(&mut self, index: usize, record: &FileStatsRecord, state: SlotState) {
        self.slots[index] = Some(FileSlot::new(index, record, state));
        self.by_name.insert(record.name.clone(), index);
    }

    fn release(&mut self, index: usize) {
        if let Some(slot) = self.slots[index].take() {
            self.by_name.remove(&slot.file_name);
            self.free.insert(index);
        }
    }

    fn release_all(&mut self) {
        for index in 0..self.slots.len() {
            self.release(index);
        }
        self.queue.clear();
        self.seen.clear();
    }
}

fn percent_of(done: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let pct = (u128::from(done) * 100 / u128::from(total)).min(100);
    u8::try_from(pct).ok()
}
