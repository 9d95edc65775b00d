//! # Time Circle
//!
//! A ring of delay slots that batches property deltas before they are sent.
//!
//! Producers (entity mutation paths, possibly on many threads) enqueue through
//! a [`TimeCircleHandle`]; the single consumer owning the [`TimeCircle`] calls
//! [`TimeCircle::tick`] from its scheduler loop. The hand-off is a crossbeam
//! channel, so producers never touch slot storage.
//!
//! Producers compute an absolute due tick from the current tick counter, which
//! only the consumer advances. Messages are placed into slots when the
//! consumer absorbs them, and a due tick that has already passed by then is
//! re-homed into the slot being drained. Nothing can be written into a slot
//! after it was drained for that lap.

use super::accumulator::SyncAccumulator;
use super::message::{PropertySyncCommand, PropertySyncCommandList, SyncMessage};
use crate::mailbox::MailBox;
use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Ring geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeCircleConfig {
    /// Width of one slot
    pub interval_ms: u64,
    /// Longest delay the ring can hold; the ring has `total_window_ms / interval_ms` slots
    pub total_window_ms: u64,
}

impl Default for TimeCircleConfig {
    fn default() -> Self {
        Self {
            interval_ms: 50,
            total_window_ms: 1000,
        }
    }
}

/// Counters exposed for monitoring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeCircleStats {
    /// Deltas accepted from producers
    pub enqueued: u64,
    /// Deltas handed to the ready callback
    pub drained: u64,
    /// Deltas folded into an already pending one
    pub coalesced: u64,
    /// Command lists emitted
    pub batches: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    drained: AtomicU64,
    coalesced: AtomicU64,
    batches: AtomicU64,
}

#[derive(Debug)]
struct PendingSync {
    due_tick: u64,
    keep_order: bool,
    message: SyncMessage,
}

#[derive(Debug, Default)]
struct Slot {
    ordered: Vec<SyncMessage>,
    coalesced: SyncAccumulator,
}

impl Slot {
    fn len(&self) -> usize {
        self.ordered.len() + self.coalesced.len()
    }
}

/// Producer side of a [`TimeCircle`]. Cheap to clone and safe to share.
#[derive(Debug, Clone)]
pub struct TimeCircleHandle {
    interval_ms: u64,
    slot_count: usize,
    current_tick: Arc<AtomicU64>,
    sender: Sender<PendingSync>,
    counters: Arc<Counters>,
}

impl TimeCircleHandle {
    /// Schedules a delta to be released after roughly `delay_ms`.
    ///
    /// Delays are rounded up to whole slots. Delays longer than the ring are
    /// clamped to its last slot.
    ///
    /// # Arguments
    ///
    /// * `message` - The delta to schedule
    /// * `delay_ms` - Requested delay; `0` releases on the next tick
    /// * `keep_order` - Deliver verbatim in FIFO order instead of coalescing
    pub fn add_property_sync_message(&self, message: SyncMessage, delay_ms: u64, keep_order: bool) {
        let mut offset = delay_ms.div_ceil(self.interval_ms);
        let max_offset = (self.slot_count - 1) as u64;
        if offset > max_offset {
            warn!(
                "⏱️ Sync delay {}ms exceeds the time circle window, clamping to {}ms",
                delay_ms,
                max_offset * self.interval_ms
            );
            offset = max_offset;
        }

        let due_tick = self.current_tick.load(Ordering::Acquire) + offset;
        let pending = PendingSync {
            due_tick,
            keep_order,
            message,
        };
        if self.sender.send(pending).is_err() {
            warn!("⏱️ Time circle is gone, dropping sync message");
            return;
        }
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }
}

/// Consumer side: owns the slot ring.
#[derive(Debug)]
pub struct TimeCircle {
    handle: TimeCircleHandle,
    receiver: Receiver<PendingSync>,
    slots: Vec<Slot>,
    elapsed_ms: u64,
}

impl TimeCircle {
    /// Creates a ring from `config`.
    ///
    /// A zero interval is treated as one millisecond and the ring always has
    /// at least one slot.
    pub fn new(config: TimeCircleConfig) -> Self {
        let interval_ms = config.interval_ms.max(1);
        let slot_count = ((config.total_window_ms / interval_ms) as usize).max(1);
        let (sender, receiver) = channel::unbounded();

        Self {
            handle: TimeCircleHandle {
                interval_ms,
                slot_count,
                current_tick: Arc::new(AtomicU64::new(0)),
                sender,
                counters: Arc::new(Counters::default()),
            },
            receiver,
            slots: (0..slot_count).map(|_| Slot::default()).collect(),
            elapsed_ms: 0,
        }
    }

    /// Returns a producer handle.
    pub fn handle(&self) -> TimeCircleHandle {
        self.handle.clone()
    }

    /// See [`TimeCircleHandle::add_property_sync_message`].
    pub fn add_property_sync_message(&self, message: SyncMessage, delay_ms: u64, keep_order: bool) {
        self.handle.add_property_sync_message(message, delay_ms, keep_order);
    }

    pub fn slot_count(&self) -> usize {
        self.handle.slot_count
    }

    pub fn interval_ms(&self) -> u64 {
        self.handle.interval_ms
    }

    /// Absolute number of slots drained so far.
    pub fn current_tick(&self) -> u64 {
        self.handle.current_tick.load(Ordering::Acquire)
    }

    /// Deltas sitting in slots, not counting ones still in the hand-off queue.
    pub fn pending(&self) -> usize {
        self.slots.iter().map(Slot::len).sum()
    }

    pub fn stats(&self) -> TimeCircleStats {
        let c = &self.handle.counters;
        TimeCircleStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            drained: c.drained.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            batches: c.batches.load(Ordering::Relaxed),
        }
    }

    /// Advances the ring by `delta_ms`, draining one slot per full interval.
    ///
    /// `on_ready` receives one command list per mailbox per drained slot.
    pub fn tick(&mut self, delta_ms: u64, mut on_ready: impl FnMut(MailBox, PropertySyncCommandList)) {
        self.elapsed_ms += delta_ms;
        while self.elapsed_ms >= self.handle.interval_ms {
            self.elapsed_ms -= self.handle.interval_ms;
            self.advance(&mut on_ready);
        }
    }

    /// Drains every slot immediately, in due order.
    pub fn flush(&mut self, mut on_ready: impl FnMut(MailBox, PropertySyncCommandList)) {
        for _ in 0..self.handle.slot_count {
            self.advance(&mut on_ready);
        }
        self.elapsed_ms = 0;
    }

    fn absorb(&mut self, current: u64) {
        let slot_count = self.handle.slot_count as u64;
        while let Ok(pending) = self.receiver.try_recv() {
            let due = pending.due_tick.max(current);
            let slot = &mut self.slots[(due % slot_count) as usize];
            if pending.keep_order {
                slot.ordered.push(pending.message);
            } else if slot.coalesced.push(pending.message) {
                self.handle.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn advance(&mut self, on_ready: &mut impl FnMut(MailBox, PropertySyncCommandList)) {
        let current = self.current_tick();
        self.absorb(current);

        let index = (current % self.handle.slot_count as u64) as usize;
        let slot = &mut self.slots[index];
        let mut messages = std::mem::take(&mut slot.ordered);
        messages.extend(slot.coalesced.drain());

        if !messages.is_empty() {
            let mut order: Vec<MailBox> = Vec::new();
            let mut grouped: HashMap<MailBox, Vec<PropertySyncCommand>> = HashMap::new();
            for message in messages {
                let commands = grouped.entry(message.mailbox.clone()).or_insert_with(|| {
                    order.push(message.mailbox.clone());
                    Vec::new()
                });
                commands.push(message.into_command());
            }

            for mailbox in order {
                let commands = grouped.remove(&mailbox).unwrap_or_default();
                trace!("⏱️ Releasing {} sync commands for {}", commands.len(), mailbox);
                self.handle
                    .counters
                    .drained
                    .fetch_add(commands.len() as u64, Ordering::Relaxed);
                self.handle.counters.batches.fetch_add(1, Ordering::Relaxed);
                let list = PropertySyncCommandList {
                    entity_id: mailbox.id.clone(),
                    commands,
                };
                on_ready(mailbox, list);
            }
        }

        self.handle.current_tick.store(current + 1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{SyncOperation, SyncPayload, SyncType};
    use crate::value::{PropValue, WireValue};

    fn mailbox() -> MailBox {
        MailBox::new("shadow_1", "127.0.0.1", 7001, 1)
    }

    fn list_message(payload: SyncPayload) -> SyncMessage {
        SyncMessage {
            mailbox: mailbox(),
            path: vec!["inventory".to_string()],
            sync_type: SyncType::List,
            operation: payload.operation(),
            payload,
        }
    }

    fn adds_then_removes(circle: &TimeCircle, adds: usize, removes: usize, keep_order: bool) {
        for i in 0..adds {
            let value = WireValue::Scalar(PropValue::Int(i as i64));
            circle.add_property_sync_message(list_message(SyncPayload::ListAdd(vec![value])), 50, keep_order);
        }
        for _ in 0..removes {
            circle.add_property_sync_message(list_message(SyncPayload::ListRemove(vec![0])), 50, keep_order);
        }
    }

    fn drain_all(circle: &mut TimeCircle) -> Vec<PropertySyncCommandList> {
        let window = circle.interval_ms() * circle.slot_count() as u64;
        let mut out = Vec::new();
        circle.tick(window, |_, list| out.push(list));
        out
    }

    #[test]
    fn test_keep_order_preserves_every_message() {
        let mut circle = TimeCircle::new(TimeCircleConfig::default());
        adds_then_removes(&circle, 5, 3, true);

        let batches = drain_all(&mut circle);
        assert_eq!(batches.len(), 1);
        let ops: Vec<SyncOperation> = batches[0].commands.iter().map(|c| c.operation).collect();
        assert_eq!(ops.len(), 8);
        assert!(ops[..5].iter().all(|op| *op == SyncOperation::AddListElem));
        assert!(ops[5..].iter().all(|op| *op == SyncOperation::RemoveElem));
        for (i, command) in batches[0].commands[..5].iter().enumerate() {
            assert_eq!(
                command.payload,
                SyncPayload::ListAdd(vec![WireValue::Scalar(PropValue::Int(i as i64))])
            );
        }
    }

    #[test]
    fn test_no_keep_order_coalesces_removes() {
        let mut circle = TimeCircle::new(TimeCircleConfig::default());
        adds_then_removes(&circle, 5, 3, false);

        let batches = drain_all(&mut circle);
        assert_eq!(batches.len(), 1);
        let removes: Vec<&PropertySyncCommand> = batches[0]
            .commands
            .iter()
            .filter(|c| c.operation == SyncOperation::RemoveElem)
            .collect();
        assert_eq!(removes.len(), 1);
        assert_eq!(removes[0].payload, SyncPayload::ListRemove(vec![0, 1, 2]));
        assert_eq!(circle.stats().coalesced, 7);
    }

    #[test]
    fn test_delay_rounds_up_to_slots() {
        let mut circle = TimeCircle::new(TimeCircleConfig::default());
        let value = WireValue::Scalar(PropValue::Int(1));
        circle.add_property_sync_message(list_message(SyncPayload::ListAdd(vec![value])), 120, true);

        let mut released = 0;
        circle.tick(150, |_, _| released += 1);
        assert_eq!(released, 0);
        assert_eq!(circle.pending(), 1);

        circle.tick(50, |_, _| released += 1);
        assert_eq!(released, 1);
        assert_eq!(circle.current_tick(), 4);
    }

    #[test]
    fn test_partial_interval_accumulates() {
        let mut circle = TimeCircle::new(TimeCircleConfig::default());
        circle.add_property_sync_message(list_message(SyncPayload::Clear), 0, true);

        let mut released = 0;
        circle.tick(30, |_, _| released += 1);
        assert_eq!(released, 0);
        circle.tick(30, |_, _| released += 1);
        assert_eq!(released, 1);
    }

    #[test]
    fn test_oversized_delay_is_clamped() {
        let mut circle = TimeCircle::new(TimeCircleConfig {
            interval_ms: 10,
            total_window_ms: 40,
        });
        circle.add_property_sync_message(list_message(SyncPayload::Clear), 10_000, true);
        let batches = drain_all(&mut circle);
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn test_concurrent_producers() {
        let mut circle = TimeCircle::new(TimeCircleConfig::default());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let handle = circle.handle();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let mut message = list_message(SyncPayload::Clear);
                        message.mailbox = MailBox::new(format!("e{t}"), "127.0.0.1", 7001, 1);
                        message.path = vec![format!("p{i}")];
                        handle.add_property_sync_message(message, 0, true);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let batches = drain_all(&mut circle);
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.commands.len() == 25));
        let stats = circle.stats();
        assert_eq!(stats.enqueued, 100);
        assert_eq!(stats.drained, 100);
        assert_eq!(stats.batches, 4);
    }
}
