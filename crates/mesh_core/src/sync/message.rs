//! Typed property deltas.
//!
//! A change notification becomes exactly one [`SyncMessage`]. The payload shape
//! depends on the container kind that changed; combinations that make no sense
//! for a kind (inserting into a dictionary, say) are rejected with
//! [`PropertyError::InvalidSyncOperation`].

use crate::error::PropertyError;
use crate::mailbox::MailBox;
use crate::property::{PropertyNotification, SyncArg};
use crate::value::{DictKey, WireValue};
use serde::{Deserialize, Serialize};

/// Operation code carried by a notification and by every delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncOperation {
    SetValue,
    AddListElem,
    InsertElem,
    RemoveElem,
    UpdatePair,
    UpdateDict,
    Clear,
}

/// Container family a delta applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncType {
    PlaintAndComposite,
    List,
    Dict,
}

/// Operation specific delta body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args")]
pub enum SyncPayload {
    /// Replace the whole container (or leaf) at the path
    SetValue(WireValue),
    /// Append values to a list, in order
    ListAdd(Vec<WireValue>),
    ListInsert { index: usize, value: WireValue },
    /// Replace list elements by index
    ListSet(Vec<(usize, WireValue)>),
    /// Remove list elements; indices refer to the list before any of them is removed
    ListRemove(Vec<usize>),
    DictUpdate(Vec<(DictKey, WireValue)>),
    DictRemove(Vec<DictKey>),
    Clear,
}

impl SyncPayload {
    /// The operation code this payload is reported under.
    pub fn operation(&self) -> SyncOperation {
        match self {
            SyncPayload::SetValue(_) | SyncPayload::ListSet(_) => SyncOperation::SetValue,
            SyncPayload::ListAdd(_) => SyncOperation::AddListElem,
            SyncPayload::ListInsert { .. } => SyncOperation::InsertElem,
            SyncPayload::ListRemove(_) | SyncPayload::DictRemove(_) => SyncOperation::RemoveElem,
            SyncPayload::DictUpdate(pairs) if pairs.len() == 1 => SyncOperation::UpdatePair,
            SyncPayload::DictUpdate(_) => SyncOperation::UpdateDict,
            SyncPayload::Clear => SyncOperation::Clear,
        }
    }
}

/// One delta waiting in the time circle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Mailbox of the shadow entity that receives the delta
    pub mailbox: MailBox,
    /// Property name followed by the child names down to the changed container
    pub path: Vec<String>,
    pub sync_type: SyncType,
    pub operation: SyncOperation,
    pub payload: SyncPayload,
}

impl SyncMessage {
    /// Builds the delta for one change notification.
    ///
    /// # Errors
    ///
    /// Returns [`PropertyError::InvalidSyncOperation`] when the operation and
    /// argument shape are not defined for the notification's container kind.
    pub fn build(mailbox: MailBox, notification: &PropertyNotification) -> Result<Self, PropertyError> {
        let invalid = || PropertyError::InvalidSyncOperation {
            operation: notification.operation,
            sync_type: notification.sync_type,
        };

        let payload = match (notification.sync_type, notification.operation, &notification.arg) {
            (SyncType::PlaintAndComposite, SyncOperation::SetValue, SyncArg::Value(v)) => {
                SyncPayload::SetValue(v.clone())
            }

            (SyncType::List, SyncOperation::SetValue, SyncArg::Value(v)) => SyncPayload::SetValue(v.clone()),
            (SyncType::List, SyncOperation::SetValue, SyncArg::IndexedValue(i, v)) => {
                SyncPayload::ListSet(vec![(*i, v.clone())])
            }
            (SyncType::List, SyncOperation::AddListElem, SyncArg::IndexedValue(_, v)) => {
                SyncPayload::ListAdd(vec![v.clone()])
            }
            (SyncType::List, SyncOperation::AddListElem, SyncArg::Value(v)) => SyncPayload::ListAdd(vec![v.clone()]),
            (SyncType::List, SyncOperation::InsertElem, SyncArg::IndexedValue(i, v)) => SyncPayload::ListInsert {
                index: *i,
                value: v.clone(),
            },
            (SyncType::List, SyncOperation::RemoveElem, SyncArg::Index(i)) => SyncPayload::ListRemove(vec![*i]),
            (SyncType::List, SyncOperation::Clear, SyncArg::None) => SyncPayload::Clear,

            (SyncType::Dict, SyncOperation::SetValue, SyncArg::Value(v)) => SyncPayload::SetValue(v.clone()),
            (SyncType::Dict, SyncOperation::UpdatePair, SyncArg::Pair(k, v)) => {
                SyncPayload::DictUpdate(vec![(k.clone(), v.clone())])
            }
            (SyncType::Dict, SyncOperation::UpdateDict, SyncArg::Pairs(pairs)) => SyncPayload::DictUpdate(pairs.clone()),
            (SyncType::Dict, SyncOperation::RemoveElem, SyncArg::Key(k)) => SyncPayload::DictRemove(vec![k.clone()]),
            (SyncType::Dict, SyncOperation::Clear, SyncArg::None) => SyncPayload::Clear,

            _ => return Err(invalid()),
        };

        let mut path = Vec::with_capacity(notification.path.len() + 1);
        path.push(notification.property.name.clone());
        path.extend(notification.path.iter().cloned());

        Ok(Self {
            mailbox,
            path,
            sync_type: notification.sync_type,
            operation: notification.operation,
            payload,
        })
    }

    /// Key used to coalesce messages in no-keep-order mode.
    pub fn path_key(&self) -> String {
        self.path.join(".")
    }

    pub fn into_command(self) -> PropertySyncCommand {
        PropertySyncCommand {
            path: self.path,
            sync_type: self.sync_type,
            operation: self.operation,
            payload: self.payload,
        }
    }
}

/// A delta as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySyncCommand {
    pub path: Vec<String>,
    pub sync_type: SyncType,
    pub operation: SyncOperation,
    pub payload: SyncPayload,
}

/// All deltas released for one mailbox in one drain cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySyncCommandList {
    pub entity_id: String,
    pub commands: Vec<PropertySyncCommand>,
}
