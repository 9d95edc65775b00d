//! # Coalescing Accumulator
//!
//! Collapses deltas that target the same `(mailbox, path, sync type)` within
//! one time-circle slot into the smallest equivalent sequence.
//!
//! - Plain values and composites: the last `SetValue` wins.
//! - Lists: consecutive operations of the same kind merge. Adds append,
//!   removes union (later indices are rebased onto the list as it was before
//!   the first remove of the run) and indexed sets keep the last value per
//!   index. A `Clear` or whole-list assignment drops everything before it.
//!   Inserts never merge.
//! - Dictionaries: a pending assignment or clear, then removed keys, then
//!   updated keys. Removing a key cancels its pending update.

use super::message::{SyncMessage, SyncPayload, SyncType};
use crate::mailbox::MailBox;
use crate::value::{DictKey, WireValue};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
enum ListRun {
    Assign(WireValue),
    Clear,
    Add(Vec<WireValue>),
    /// Indices in the coordinates of the list before the run started
    Remove(BTreeSet<usize>),
    Set(BTreeMap<usize, WireValue>),
    Insert { index: usize, value: WireValue },
}

impl ListRun {
    fn into_payload(self) -> SyncPayload {
        match self {
            ListRun::Assign(value) => SyncPayload::SetValue(value),
            ListRun::Clear => SyncPayload::Clear,
            ListRun::Add(values) => SyncPayload::ListAdd(values),
            ListRun::Remove(indices) => SyncPayload::ListRemove(indices.into_iter().collect()),
            ListRun::Set(entries) => SyncPayload::ListSet(entries.into_iter().collect()),
            ListRun::Insert { index, value } => SyncPayload::ListInsert { index, value },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct DictState {
    assigned: Option<WireValue>,
    cleared: bool,
    removes: BTreeSet<DictKey>,
    updates: Vec<(DictKey, WireValue)>,
}

#[derive(Debug, Clone, PartialEq)]
enum Pending {
    Plain(SyncPayload),
    List(Vec<ListRun>),
    Dict(DictState),
}

#[derive(Debug, Clone)]
struct Entry {
    mailbox: MailBox,
    path: Vec<String>,
    sync_type: SyncType,
    pending: Pending,
}

type EntryKey = (MailBox, String, SyncType);

/// Per-slot accumulator for no-keep-order deltas.
#[derive(Debug, Default)]
pub struct SyncAccumulator {
    /// Entries in first-seen order
    entries: Vec<Entry>,
    index: HashMap<EntryKey, usize>,
}

impl SyncAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a delta into the accumulator.
    ///
    /// # Returns
    ///
    /// `true` when the delta was merged into an already pending one.
    pub fn push(&mut self, message: SyncMessage) -> bool {
        let key = (message.mailbox.clone(), message.path_key(), message.sync_type);

        match self.index.get(&key) {
            Some(&slot) => {
                fold(&mut self.entries[slot].pending, message.payload);
                true
            }
            None => {
                let pending = match message.sync_type {
                    SyncType::PlaintAndComposite => Pending::Plain(message.payload),
                    SyncType::List => {
                        let mut runs = Pending::List(Vec::new());
                        fold(&mut runs, message.payload);
                        runs
                    }
                    SyncType::Dict => {
                        let mut state = Pending::Dict(DictState::default());
                        fold(&mut state, message.payload);
                        state
                    }
                };
                self.index.insert(key, self.entries.len());
                self.entries.push(Entry {
                    mailbox: message.mailbox,
                    path: message.path,
                    sync_type: message.sync_type,
                    pending,
                });
                false
            }
        }
    }

    /// Number of distinct paths pending.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Emits the net-effect deltas, grouped by path in first-seen order.
    pub fn drain(&mut self) -> Vec<SyncMessage> {
        self.index.clear();
        let mut out = Vec::new();

        for entry in self.entries.drain(..) {
            let payloads = match entry.pending {
                Pending::Plain(payload) => vec![payload],
                Pending::List(runs) => runs.into_iter().map(ListRun::into_payload).collect(),
                Pending::Dict(state) => dict_payloads(state),
            };

            for payload in payloads {
                out.push(SyncMessage {
                    mailbox: entry.mailbox.clone(),
                    path: entry.path.clone(),
                    sync_type: entry.sync_type,
                    operation: payload.operation(),
                    payload,
                });
            }
        }
        out
    }
}

fn fold(pending: &mut Pending, payload: SyncPayload) {
    match pending {
        Pending::Plain(current) => *current = payload,
        Pending::List(runs) => fold_list(runs, payload),
        Pending::Dict(state) => fold_dict(state, payload),
    }
}

/// Maps an index taken after the removals in `removed` back onto the list
/// as it was before any of them.
fn rebase(removed: &BTreeSet<usize>, index: usize) -> usize {
    let mut original = index;
    for &r in removed {
        if r <= original {
            original += 1;
        } else {
            break;
        }
    }
    original
}

fn fold_list(runs: &mut Vec<ListRun>, payload: SyncPayload) {
    match payload {
        SyncPayload::SetValue(value) => {
            runs.clear();
            runs.push(ListRun::Assign(value));
        }
        SyncPayload::Clear => {
            runs.clear();
            runs.push(ListRun::Clear);
        }
        SyncPayload::ListAdd(values) => match runs.last_mut() {
            Some(ListRun::Add(pending)) => pending.extend(values),
            _ => runs.push(ListRun::Add(values)),
        },
        SyncPayload::ListRemove(indices) => match runs.last_mut() {
            Some(ListRun::Remove(removed)) => {
                let rebased: Vec<usize> = indices.into_iter().map(|i| rebase(removed, i)).collect();
                removed.extend(rebased);
            }
            _ => runs.push(ListRun::Remove(indices.into_iter().collect())),
        },
        SyncPayload::ListSet(entries) => match runs.last_mut() {
            Some(ListRun::Set(pending)) => pending.extend(entries),
            _ => runs.push(ListRun::Set(entries.into_iter().collect())),
        },
        SyncPayload::ListInsert { index, value } => runs.push(ListRun::Insert { index, value }),
        other => warn!("Dropping {:?} delta queued for a list", other.operation()),
    }
}

fn fold_dict(state: &mut DictState, payload: SyncPayload) {
    match payload {
        SyncPayload::SetValue(value) => {
            *state = DictState {
                assigned: Some(value),
                ..DictState::default()
            };
        }
        SyncPayload::Clear => {
            *state = DictState {
                cleared: true,
                ..DictState::default()
            };
        }
        SyncPayload::DictRemove(keys) => {
            for key in keys {
                state.updates.retain(|(k, _)| *k != key);
                state.removes.insert(key);
            }
        }
        SyncPayload::DictUpdate(pairs) => {
            for (key, value) in pairs {
                match state.updates.iter_mut().find(|(k, _)| *k == key) {
                    Some(slot) => slot.1 = value,
                    None => state.updates.push((key, value)),
                }
            }
        }
        other => warn!("Dropping {:?} delta queued for a dictionary", other.operation()),
    }
}

fn dict_payloads(state: DictState) -> Vec<SyncPayload> {
    let mut out = Vec::new();
    if let Some(value) = state.assigned {
        out.push(SyncPayload::SetValue(value));
    }
    if state.cleared {
        out.push(SyncPayload::Clear);
    }
    if !state.removes.is_empty() {
        out.push(SyncPayload::DictRemove(state.removes.into_iter().collect()));
    }
    if !state.updates.is_empty() {
        out.push(SyncPayload::DictUpdate(state.updates));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncOperation;
    use crate::value::PropValue;

    fn mailbox() -> MailBox {
        MailBox::new("shadow_1", "127.0.0.1", 7001, 1)
    }

    fn message(sync_type: SyncType, payload: SyncPayload) -> SyncMessage {
        SyncMessage {
            mailbox: mailbox(),
            path: vec!["bag".to_string()],
            sync_type,
            operation: payload.operation(),
            payload,
        }
    }

    fn int(v: i64) -> WireValue {
        WireValue::Scalar(PropValue::Int(v))
    }

    #[test]
    fn test_plain_last_value_wins() {
        let mut acc = SyncAccumulator::new();
        assert!(!acc.push(message(SyncType::PlaintAndComposite, SyncPayload::SetValue(int(1)))));
        assert!(acc.push(message(SyncType::PlaintAndComposite, SyncPayload::SetValue(int(2)))));

        let out = acc.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, SyncPayload::SetValue(int(2)));
        assert!(acc.is_empty());
    }

    #[test]
    fn test_list_removes_rebase_onto_original_indices() {
        let mut acc = SyncAccumulator::new();
        // [a b c d e]: remove 1 (b), then 1 (c), then 2 (e)
        for i in [1, 1, 2] {
            acc.push(message(SyncType::List, SyncPayload::ListRemove(vec![i])));
        }
        let out = acc.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].operation, SyncOperation::RemoveElem);
        assert_eq!(out[0].payload, SyncPayload::ListRemove(vec![1, 2, 4]));
    }

    #[test]
    fn test_list_clear_discards_earlier_runs() {
        let mut acc = SyncAccumulator::new();
        acc.push(message(SyncType::List, SyncPayload::ListAdd(vec![int(1)])));
        acc.push(message(SyncType::List, SyncPayload::ListRemove(vec![0])));
        acc.push(message(SyncType::List, SyncPayload::Clear));
        acc.push(message(SyncType::List, SyncPayload::ListAdd(vec![int(7)])));
        acc.push(message(SyncType::List, SyncPayload::ListAdd(vec![int(8)])));

        let payloads: Vec<SyncPayload> = acc.drain().into_iter().map(|m| m.payload).collect();
        assert_eq!(
            payloads,
            vec![SyncPayload::Clear, SyncPayload::ListAdd(vec![int(7), int(8)])]
        );
    }

    #[test]
    fn test_dict_remove_cancels_pending_update() {
        let mut acc = SyncAccumulator::new();
        acc.push(message(SyncType::Dict, SyncPayload::DictUpdate(vec![(DictKey::from("a"), int(1))])));
        acc.push(message(SyncType::Dict, SyncPayload::DictUpdate(vec![(DictKey::from("b"), int(2))])));
        acc.push(message(SyncType::Dict, SyncPayload::DictUpdate(vec![(DictKey::from("b"), int(3))])));
        acc.push(message(SyncType::Dict, SyncPayload::DictRemove(vec![DictKey::from("a")])));

        let payloads: Vec<SyncPayload> = acc.drain().into_iter().map(|m| m.payload).collect();
        assert_eq!(
            payloads,
            vec![
                SyncPayload::DictRemove(vec![DictKey::from("a")]),
                SyncPayload::DictUpdate(vec![(DictKey::from("b"), int(3))]),
            ]
        );
    }

    #[test]
    fn test_distinct_paths_stay_separate() {
        let mut acc = SyncAccumulator::new();
        acc.push(message(SyncType::PlaintAndComposite, SyncPayload::SetValue(int(1))));
        let mut other = message(SyncType::PlaintAndComposite, SyncPayload::SetValue(int(2)));
        other.path = vec!["hp".to_string()];
        acc.push(other);
        assert_eq!(acc.len(), 2);
        assert_eq!(acc.drain().len(), 2);
    }
}
