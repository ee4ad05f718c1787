// crates/lontalk-rs/src/transaction.rs
//! Transaction-id allocation and in-progress transaction tracking (spec
//! §4.6), grounded in `original_source/lcs_tcs.c`'s `NewTrans`/`TransDone`
//! style bookkeeping, re-expressed with an explicit TID table instead of a
//! fixed-size C array.

use alloc::vec::Vec;

/// Destination signature a TID-table entry is keyed by (§4.6 "matching
/// signature (domain-bytes, address mode, and address key)").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestSignature {
    pub domain: Vec<u8>,
    pub addr_fmt: u8,
    pub addr_key: u64,
}

struct TidEntry {
    signature: DestSignature,
    last_tid: u8,
    expires_at_ms: u64,
}

/// Bounded table of recently used destination signatures, each remembering
/// the last TID handed to it so a fresh `NewTrans` call never repeats one
/// within the eviction window (§4.6, §8 "TID freshness").
pub struct TidTable {
    entries: Vec<TidEntry>,
    capacity: usize,
}

impl TidTable {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity), capacity }
    }

    /// Clears the whole table (§4.6 "On power-up or external reset the
    /// entire table is cleared").
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn find_mut(&mut self, sig: &DestSignature) -> Option<&mut TidEntry> {
        self.entries.iter_mut().find(|e| &e.signature == sig)
    }

    fn evict_expired(&mut self, now_ms: u64) -> bool {
        if let Some(idx) = self.entries.iter().position(|e| e.expires_at_ms <= now_ms) {
            self.entries.remove(idx);
            true
        } else {
            false
        }
    }

    /// Returns the TID to use for a transaction to `sig` starting from
    /// `candidate_tid`, refreshing or inserting the table entry. `Err(())`
    /// when the table is full and has nothing evictable (§4.6 step 4).
    fn reserve(&mut self, sig: DestSignature, candidate_tid: u8, now_ms: u64, ttl_ms: u64) -> Result<u8, ()> {
        if let Some(entry) = self.find_mut(&sig) {
            let tid = if entry.last_tid == candidate_tid {
                wrap_tid(candidate_tid)
            } else {
                candidate_tid
            };
            entry.last_tid = tid;
            entry.expires_at_ms = now_ms + ttl_ms;
            return Ok(tid);
        }

        if self.entries.len() >= self.capacity && !self.evict_expired(now_ms) {
            return Err(());
        }
        self.entries.push(TidEntry { signature: sig, last_tid: candidate_tid, expires_at_ms: now_ms + ttl_ms });
        Ok(candidate_tid)
    }
}

/// Increments a TID with the `15 -> 1` wrap of §4.6 (TID 0 is reserved).
pub fn wrap_tid(tid: u8) -> u8 {
    if tid >= 15 {
        1
    } else {
        tid + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewTransError {
    Busy,
    TableFull,
}

struct PriorityClass {
    next_counter: u8,
    in_progress: Option<u8>,
}

impl Default for PriorityClass {
    fn default() -> Self {
        Self { next_counter: 1, in_progress: None }
    }
}

/// The two independent TID spaces (priority and non-priority, §6
/// "GLOSSARY") plus the shared destination-signature table.
pub struct TransactionControl {
    table: TidTable,
    classes: [PriorityClass; 2],
    ttl_ms: u64,
}

fn class_index(priority: bool) -> usize {
    priority as usize
}

impl TransactionControl {
    pub fn new(table_capacity: usize, ttl_ms: u64) -> Self {
        Self {
            table: TidTable::new(table_capacity),
            classes: [PriorityClass::default(), PriorityClass::default()],
            ttl_ms,
        }
    }

    /// `NewTrans(priority, dest) -> tid | Busy` (§4.6).
    pub fn new_trans(&mut self, priority: bool, dest: DestSignature, now_ms: u64) -> Result<u8, NewTransError> {
        let class = &mut self.classes[class_index(priority)];
        if class.in_progress.is_some() {
            return Err(NewTransError::Busy);
        }
        let candidate = class.next_counter;
        let tid = self
            .table
            .reserve(dest, candidate, now_ms, self.ttl_ms)
            .map_err(|_| NewTransError::TableFull)?;
        class.in_progress = Some(tid);
        Ok(tid)
    }

    /// `TransDone(priority)` (§4.6).
    pub fn trans_done(&mut self, priority: bool) {
        let class = &mut self.classes[class_index(priority)];
        class.in_progress = None;
        class.next_counter = wrap_tid(class.next_counter);
    }

    /// `ValidateTrans(priority, tid)` (§4.6).
    pub fn validate_trans(&self, priority: bool, tid: u8) -> bool {
        self.classes[class_index(priority)].in_progress == Some(tid)
    }

    pub fn in_progress(&self, priority: bool) -> Option<u8> {
        self.classes[class_index(priority)].in_progress
    }

    /// Clears the TID table (power-up/external reset); the in-progress
    /// counters are untouched since no transaction is expected across a
    /// reset.
    pub fn clear_table(&mut self) {
        self.table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(key: u64) -> DestSignature {
        DestSignature { domain: alloc::vec![0x2C], addr_fmt: 2, addr_key: key }
    }

    #[test]
    fn exclusivity_per_priority_class() {
        let mut tc = TransactionControl::new(4, 24_000);
        let tid = tc.new_trans(false, sig(1), 0).unwrap();
        assert!(tid >= 1 && tid <= 15);
        assert_eq!(tc.new_trans(false, sig(2), 0), Err(NewTransError::Busy));
        // A different priority class is independent.
        assert!(tc.new_trans(true, sig(1), 0).is_ok());
    }

    #[test]
    fn tid_freshness_for_repeated_destination_within_window() {
        let mut tc = TransactionControl::new(4, 24_000);
        let first = tc.new_trans(false, sig(1), 0).unwrap();
        tc.trans_done(false);
        let second = tc.new_trans(false, sig(1), 1_000).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn trans_done_advances_counter_with_wraparound() {
        let mut tc = TransactionControl::new(4, 24_000);
        tc.classes[0].next_counter = 15;
        tc.trans_done(false);
        assert_eq!(tc.classes[0].next_counter, 1);
    }

    #[test]
    fn validate_trans_matches_only_the_in_progress_tid() {
        let mut tc = TransactionControl::new(4, 24_000);
        let tid = tc.new_trans(false, sig(9), 0).unwrap();
        assert!(tc.validate_trans(false, tid));
        assert!(!tc.validate_trans(false, tid.wrapping_add(1)));
    }

    #[test]
    fn table_full_with_no_evictable_entry_is_refused() {
        let mut tc = TransactionControl::new(1, 24_000);
        tc.new_trans(false, sig(1), 0).unwrap();
        tc.trans_done(false);
        assert_eq!(tc.new_trans(false, sig(2), 0), Err(NewTransError::TableFull));
    }

    #[test]
    fn clear_table_drops_all_signatures() {
        let mut tc = TransactionControl::new(1, 24_000);
        tc.new_trans(false, sig(1), 0).unwrap();
        tc.trans_done(false);
        tc.clear_table();
        assert!(tc.new_trans(false, sig(2), 0).is_ok());
    }
}
