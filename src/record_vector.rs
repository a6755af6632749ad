/*
 * A fixed number of fixed size records in the segment, behind one mutex.
 *
 * Slots are never freed, "removing" a record only clears its in_use flag and
 * the slot is picked up again by the next insert. Once every slot is taken,
 * an insert overwrites the record created longest ago.
 *
 * Keys come from a counter in the segment (<name>_COUNTER) with its own
 * mutex, so they keep increasing for the life of the segment no matter which
 * process inserts. Key 0 means "not stored yet".
 */
use crate::constants::COUNTER_SUFFIX;
use crate::container::{mutex_name, SharedScalar, Slot};
use crate::error::Result;
use crate::segment::{Segment, SharedArray, SharedObject};
use crate::signal::{NamedMutex, NamedSignal};
use crate::utils::now_micros;
use log::{debug, info, warn};
use std::sync::Arc;

/// What a record vector needs to know about the records it holds.
pub trait Record: SharedObject + Copy {
    fn key(&self) -> u64;
    fn set_key(&mut self, key: u64);
    fn in_use(&self) -> bool;
    fn set_in_use(&mut self, in_use: bool);
    fn created_at(&self) -> u64;
    fn set_created_at(&mut self, micros: u64);
    fn set_updated_at(&mut self, micros: u64);

    /// One line summary for log messages.
    fn describe(&self) -> String;
}

// Replaces a stored record, keeping its identity and creation time.
fn overwrite<T: Record>(slot: &mut T, record: &mut T, now: u64) {
    record.set_key(slot.key());
    record.set_created_at(slot.created_at());
    record.set_updated_at(now);
    record.set_in_use(true);
    *slot = *record;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// An in use record with the same key was overwritten.
    Updated(u64),
    /// A free slot was claimed under a new key.
    Inserted(u64),
    /// The table was full and the oldest record gave way.
    Evicted { key: u64, evicted: u64 },
}

impl UpsertOutcome {
    pub fn key(&self) -> u64 {
        return match self {
            UpsertOutcome::Updated(key) => *key,
            UpsertOutcome::Inserted(key) => *key,
            UpsertOutcome::Evicted { key, .. } => *key,
        };
    }
}

pub struct RecordVector<T: Record> {
    name: String,
    slots: SharedArray<Slot<T>>,
    mutex: NamedMutex,
    counter: SharedScalar<u64>,
}

impl<T: Record> RecordVector<T> {
    pub fn get_or_create(segment: &Arc<Segment>, name: &str, capacity: usize) -> Result<RecordVector<T>> {
        let slots = segment.find_or_construct_array::<Slot<T>>(name, capacity)?;
        let mutex = NamedMutex::get_or_create(segment, &mutex_name(name))?;
        let counter = SharedScalar::get_or_create(segment, &format!("{}{}", name, COUNTER_SUFFIX))?;
        return Ok(RecordVector {
            name: name.to_string(),
            slots,
            mutex,
            counter,
        });
    }

    pub fn name(&self) -> &str {
        return &self.name;
    }

    pub fn capacity(&self) -> usize {
        return self.slots.len();
    }

    pub fn mutex(&self) -> &NamedMutex {
        return &self.mutex;
    }

    fn with_slots<R>(&self, f: impl FnOnce(&mut [T]) -> R) -> R {
        let _guard = self.mutex.lock();
        // SAFETY: Slot is a transparent UnsafeCell<T>, and we hold the mutex
        // that guards every slot for as long as the slice lives.
        let records = unsafe {
            std::slice::from_raw_parts_mut(self.slots.as_ptr() as *mut T, self.slots.len())
        };
        return f(records);
    }

    fn next_key(&self) -> u64 {
        return self.counter.update(|next| {
            if *next == 0 {
                *next = 1;
            }
            let key = *next;
            *next += 1;
            key
        });
    }

    /// Visits the records that are in use.
    pub fn for_each(&self, mut visitor: impl FnMut(&T)) {
        self.with_slots(|records| {
            for record in records.iter().filter(|r| r.in_use()) {
                visitor(record);
            }
        });
    }

    /// Visits every slot, including free ones.
    pub fn for_each_all(&self, mut visitor: impl FnMut(&T)) {
        self.with_slots(|records| {
            for record in records.iter() {
                visitor(record);
            }
        });
    }

    /// Visits the records that are in use and lets the visitor change them.
    pub fn for_each_mut(&self, mut visitor: impl FnMut(&mut T)) {
        self.with_slots(|records| {
            for record in records.iter_mut().filter(|r| r.in_use()) {
                visitor(record);
            }
        });
    }

    /// Copies out every in use record the predicate accepts.
    pub fn collect(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut out = Vec::new();
        self.for_each(|r| {
            if predicate(r) {
                out.push(*r);
            }
        });
        return out;
    }

    pub fn find(&self, key: u64) -> Option<T> {
        if key == 0 {
            return None;
        }
        let mut found = None;
        self.for_each(|r| {
            if found.is_none() && r.key() == key {
                found = Some(*r);
            }
        });
        return found;
    }

    pub fn count_in_use(&self) -> usize {
        let mut n = 0;
        self.for_each(|_| n += 1);
        return n;
    }

    /// Overwrites the in use record with the same key. Never inserts, returns
    /// false if the record is gone (for instance evicted by another process).
    pub fn update(&self, record: &mut T) -> bool {
        let key = record.key();
        let now = now_micros();
        let written = self.with_slots(|records| {
            if key == 0 {
                return false;
            }
            match records.iter_mut().find(|r| r.in_use() && r.key() == key) {
                Some(slot) => {
                    overwrite(slot, record, now);
                    true
                }
                None => false,
            }
        });
        if !written {
            info!(
                "{}: dropped update, no record with key {}: {}",
                self.name,
                key,
                record.describe()
            );
        }
        return written;
    }

    /// Changes the in use record with this key in place, so concurrent
    /// changes to other fields are not lost. Returns false if it is gone.
    pub fn modify(&self, key: u64, f: impl FnOnce(&mut T)) -> bool {
        let now = now_micros();
        let modified = self.with_slots(|records| {
            if key == 0 {
                return false;
            }
            match records.iter_mut().find(|r| r.in_use() && r.key() == key) {
                Some(slot) => {
                    f(slot);
                    slot.set_updated_at(now);
                    true
                }
                None => false,
            }
        });
        if !modified {
            debug!("{}: dropped change, no record with key {}", self.name, key);
        }
        return modified;
    }

    /// Update if the key is present, otherwise insert into a free slot,
    /// otherwise overwrite the oldest record. `record` gets the key and
    /// timestamps it was stored with.
    pub fn update_add(&self, record: &mut T) -> UpsertOutcome {
        let now = now_micros();
        let (outcome, evicted) = self.with_slots(|records| {
            if records.is_empty() {
                warn!(
                    "{} has no slots, dropped {}",
                    self.name,
                    record.describe()
                );
                return (UpsertOutcome::Inserted(0), None);
            }
            let key = record.key();
            if key != 0 {
                if let Some(slot) = records.iter_mut().find(|r| r.in_use() && r.key() == key) {
                    overwrite(slot, record, now);
                    return (UpsertOutcome::Updated(key), None);
                }
            }

            let free = records.iter().position(|r| !r.in_use());
            let (index, evicted) = match free {
                Some(index) => (index, None),
                None => {
                    // the first of equally old records goes
                    let mut oldest = 0;
                    for (i, r) in records.iter().enumerate() {
                        if r.created_at() < records[oldest].created_at() {
                            oldest = i;
                        }
                    }
                    (oldest, Some(records[oldest]))
                }
            };

            let key = self.next_key();
            record.set_key(key);
            record.set_in_use(true);
            record.set_created_at(now);
            record.set_updated_at(now);
            records[index] = *record;
            return match evicted {
                Some(old) => (
                    UpsertOutcome::Evicted {
                        key,
                        evicted: old.key(),
                    },
                    Some(old),
                ),
                None => (UpsertOutcome::Inserted(key), None),
            };
        });

        if let Some(old) = evicted {
            warn!(
                "{} is full ({} slots), evicted oldest record {} to store {}",
                self.name,
                self.capacity(),
                old.describe(),
                record.describe()
            );
        }
        return outcome;
    }

    /// Hands the record to `on_remove` (still under the lock) and then frees
    /// its slot. Returns false if no in use record has this key.
    pub fn remove(&self, key: u64, on_remove: impl FnOnce(&mut T)) -> bool {
        let removed = self.with_slots(|records| {
            if key == 0 {
                return false;
            }
            match records.iter_mut().find(|r| r.in_use() && r.key() == key) {
                Some(slot) => {
                    on_remove(slot);
                    slot.set_in_use(false);
                    true
                }
                None => false,
            }
        });
        if !removed {
            debug!("{}: nothing to remove for key {}", self.name, key);
        }
        return removed;
    }
}
