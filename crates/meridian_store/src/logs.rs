//! Append-only log structures used to assemble deterministic orders.
//!
//! `AsyncLog` is a sparse position -> item map with a cursor; `BatchLog`
//! pairs a slot log with out-of-order batch payloads; `LocalLog` merges the
//! per-partition batch queues of one region in the order decided by the
//! region's Paxos group.

use std::collections::{HashMap, VecDeque};

use crate::transaction::Batch;
use crate::types::{BatchId, PartitionId, SlotId};

/// Sparse append-only log. Items may arrive at any position; the cursor
/// only advances over a contiguous prefix.
#[derive(Debug)]
pub struct AsyncLog<T> {
    items: HashMap<u64, T>,
    next: u64,
}

impl<T> AsyncLog<T> {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
            next: 0,
        }
    }

    /// Insert at `position`. Re-inserting an occupied position is ignored;
    /// positions behind the cursor are stale duplicates and dropped.
    pub fn insert(&mut self, position: u64, item: T) {
        if position < self.next || self.items.contains_key(&position) {
            return;
        }
        self.items.insert(position, item);
    }

    pub fn has_next(&self) -> bool {
        self.items.contains_key(&self.next)
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.get(&self.next)
    }

    pub fn next(&mut self) -> Option<(u64, T)> {
        let item = self.items.remove(&self.next)?;
        let position = self.next;
        self.next += 1;
        Some((position, item))
    }

    pub fn num_buffered(&self) -> usize {
        self.items.len()
    }
}

impl<T> Default for AsyncLog<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffers batch payloads and slot decisions until both sides of a position
/// are known, then yields batches in slot order.
#[derive(Debug, Default)]
pub struct BatchLog {
    slots: AsyncLog<BatchId>,
    batches: HashMap<BatchId, Batch>,
    ready: VecDeque<(SlotId, Batch)>,
}

impl BatchLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch(&mut self, batch: Batch) {
        self.batches.insert(batch.id, batch);
        self.update_ready();
    }

    pub fn add_slot(&mut self, slot: SlotId, batch_id: BatchId) {
        self.slots.insert(slot, batch_id);
        self.update_ready();
    }

    pub fn has_next(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn next(&mut self) -> Option<(SlotId, Batch)> {
        self.ready.pop_front()
    }

    pub fn num_buffered_slots(&self) -> usize {
        self.slots.num_buffered()
    }

    pub fn num_buffered_batches(&self) -> usize {
        self.batches.len()
    }

    fn update_ready(&mut self) {
        while let Some(batch_id) = self.slots.peek() {
            if !self.batches.contains_key(batch_id) {
                break;
            }
            let (slot, batch_id) = self.slots.next().unwrap();
            let batch = self.batches.remove(&batch_id).unwrap();
            self.ready.push_back((slot, batch));
        }
    }
}

/// The region-wide local log: local Paxos decides which partition's batch
/// queue owns each slot; batches from each partition arrive tagged with
/// their position in that partition's own sequence.
#[derive(Debug, Default)]
pub struct LocalLog {
    slots: AsyncLog<PartitionId>,
    batch_queues: HashMap<PartitionId, AsyncLog<BatchId>>,
    ready: VecDeque<(SlotId, BatchId)>,
}

impl LocalLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch_id(&mut self, queue_id: PartitionId, position: u64, batch_id: BatchId) {
        self.batch_queues
            .entry(queue_id)
            .or_default()
            .insert(position, batch_id);
        self.update_ready();
    }

    pub fn add_slot(&mut self, slot: SlotId, queue_id: PartitionId) {
        self.slots.insert(slot, queue_id);
        self.update_ready();
    }

    pub fn has_next(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn next(&mut self) -> Option<(SlotId, BatchId)> {
        self.ready.pop_front()
    }

    pub fn num_buffered_slots(&self) -> usize {
        self.slots.num_buffered()
    }

    pub fn num_buffered_batches_per_queue(&self) -> HashMap<PartitionId, usize> {
        self.batch_queues
            .iter()
            .map(|(queue, log)| (*queue, log.num_buffered()))
            .collect()
    }

    fn update_ready(&mut self) {
        loop {
            let Some(queue_id) = self.slots.peek().copied() else {
                break;
            };
            let Some(queue) = self.batch_queues.get_mut(&queue_id) else {
                break;
            };
            if !queue.has_next() {
                break;
            }
            let (slot, _) = self.slots.next().unwrap();
            let (_, batch_id) = queue.next().unwrap();
            self.ready.push_back((slot, batch_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionType;

    fn batch(id: BatchId) -> Batch {
        let mut batch = Batch::new(TransactionType::SingleHome);
        batch.id = id;
        batch
    }

    #[test]
    fn async_log_advances_over_contiguous_prefix_only() {
        let mut log = AsyncLog::new();
        log.insert(1, "b");
        assert!(!log.has_next());
        log.insert(0, "a");
        assert_eq!(log.next(), Some((0, "a")));
        assert_eq!(log.next(), Some((1, "b")));
        assert_eq!(log.next(), None);
    }

    #[test]
    fn async_log_ignores_duplicates_and_stale_positions() {
        let mut log = AsyncLog::new();
        log.insert(0, "a");
        log.insert(0, "overwrite");
        assert_eq!(log.next(), Some((0, "a")));
        // Position 0 is behind the cursor now.
        log.insert(0, "late");
        assert!(!log.has_next());
    }

    #[test]
    fn batch_log_pairs_slots_with_data_in_any_arrival_order() {
        let mut log = BatchLog::new();
        log.add_slot(0, 1001);
        assert!(!log.has_next());
        log.add_batch(batch(2001));
        assert!(!log.has_next());
        log.add_batch(batch(1001));
        let (slot, ready) = log.next().unwrap();
        assert_eq!((slot, ready.id), (0, 1001));

        log.add_slot(1, 2001);
        let (slot, ready) = log.next().unwrap();
        assert_eq!((slot, ready.id), (1, 2001));
    }

    #[test]
    fn local_log_merges_partition_queues_in_slot_order() {
        let mut log = LocalLog::new();
        // Slot order: partition 1, partition 0, partition 1.
        log.add_slot(0, 1);
        log.add_slot(1, 0);
        log.add_slot(2, 1);

        log.add_batch_id(0, 0, 500);
        assert!(!log.has_next());

        log.add_batch_id(1, 0, 600);
        assert_eq!(log.next(), Some((0, 600)));
        assert_eq!(log.next(), Some((1, 500)));
        assert!(!log.has_next());

        log.add_batch_id(1, 1, 601);
        assert_eq!(log.next(), Some((2, 601)));
    }

    #[test]
    fn local_log_rerun_on_same_inputs_gives_same_sequence() {
        let feed = |log: &mut LocalLog| {
            log.add_batch_id(0, 0, 10);
            log.add_batch_id(1, 0, 20);
            log.add_slot(0, 0);
            log.add_slot(1, 1);
        };
        let drain = |log: &mut LocalLog| {
            let mut out = Vec::new();
            while let Some(item) = log.next() {
                out.push(item);
            }
            out
        };

        let mut a = LocalLog::new();
        feed(&mut a);
        let mut b = LocalLog::new();
        feed(&mut b);
        assert_eq!(drain(&mut a), drain(&mut b));
    }
}
