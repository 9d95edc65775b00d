//! Change notification protocol between a mutated container and the property
//! that owns its tree.

use crate::error::PropertyError;
use crate::sync::{SyncOperation, SyncType};
use crate::value::{DictKey, WireValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Replication flags declared on a property.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PropertySetting(u32);

impl PropertySetting {
    pub const NONE: PropertySetting = PropertySetting(0);
    /// Persisted by the database layer
    pub const PERMANENT: PropertySetting = PropertySetting(1);
    /// Only the owning server may read it
    pub const SERVER_OWN: PropertySetting = PropertySetting(1 << 1);
    /// Replicated to the owning client
    pub const CLIENT_OWN: PropertySetting = PropertySetting(1 << 2);
    /// Skips the time circle delay
    pub const FAST_SYNC: PropertySetting = PropertySetting(1 << 3);
    /// Replicated to shadow copies on other instances
    pub const SERVER_TO_SHADOW: PropertySetting = PropertySetting(1 << 4);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: PropertySetting) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: PropertySetting) -> bool {
        self.0 & other.0 != 0
    }

    /// True when changes must leave the owning instance.
    pub const fn needs_sync(self) -> bool {
        self.intersects(PropertySetting(Self::CLIENT_OWN.0 | Self::SERVER_TO_SHADOW.0))
    }
}

impl BitOr for PropertySetting {
    type Output = PropertySetting;

    fn bitor(self, rhs: Self) -> Self::Output {
        PropertySetting(self.0 | rhs.0)
    }
}

impl fmt::Debug for PropertySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::PERMANENT, "Permanent"),
            (Self::SERVER_OWN, "ServerOwn"),
            (Self::CLIENT_OWN, "ClientOwn"),
            (Self::FAST_SYNC, "FastSync"),
            (Self::SERVER_TO_SHADOW, "ServerToShadow"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "PropertySetting({})", set.join("|"))
    }
}

/// How a property's deltas are scheduled in the time circle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    pub delay_ms: u64,
    /// Preserve every delta in order instead of coalescing per path
    pub keep_order: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            delay_ms: 50,
            keep_order: true,
        }
    }
}

/// Static description of a property, handed to the owner with every notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub name: String,
    pub setting: PropertySetting,
    pub policy: SyncPolicy,
}

/// Value carried by a notification. Its shape depends on the operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncArg {
    None,
    Value(WireValue),
    Index(usize),
    IndexedValue(usize, WireValue),
    Key(DictKey),
    Pair(DictKey, WireValue),
    Pairs(Vec<(DictKey, WireValue)>),
}

/// A committed mutation, reported to the root property's owner.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyNotification {
    pub property: PropertyInfo,
    /// Child names from the property root down to the mutated container.
    /// The root itself contributes no segment.
    pub path: Vec<String>,
    pub operation: SyncOperation,
    pub sync_type: SyncType,
    pub arg: SyncArg,
}

/// Hook invoked once per authoritative mutation.
///
/// Shadow properties never reach this hook: their mutators fail before the
/// change is committed.
pub trait PropertyOwner: Send + Sync {
    fn on_notify(&self, notification: &PropertyNotification) -> Result<(), PropertyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_flags() {
        let s = PropertySetting::PERMANENT | PropertySetting::SERVER_TO_SHADOW;
        assert!(s.contains(PropertySetting::PERMANENT));
        assert!(!s.contains(PropertySetting::CLIENT_OWN));
        assert!(s.needs_sync());
        assert!(!PropertySetting::SERVER_OWN.needs_sync());
        assert_eq!(format!("{:?}", s), "PropertySetting(Permanent|ServerToShadow)");
    }
}
