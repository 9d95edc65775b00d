//! Bridges property notifications into the time circle.

use super::message::SyncMessage;
use super::time_circle::TimeCircleHandle;
use crate::error::PropertyError;
use crate::mailbox::MailBox;
use crate::property::{PropertyNotification, PropertyOwner, PropertySetting};
use dashmap::DashMap;
use tracing::trace;

/// Who a subscriber mailbox stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberKind {
    /// Shadow copy of the entity on another instance
    Shadow,
    /// The client that owns the entity
    Client,
}

impl SubscriberKind {
    fn wants(self, setting: PropertySetting) -> bool {
        match self {
            SubscriberKind::Shadow => setting.contains(PropertySetting::SERVER_TO_SHADOW),
            SubscriberKind::Client => setting.contains(PropertySetting::CLIENT_OWN),
        }
    }
}

/// Property owner hook of an authoritative entity.
///
/// Every notification whose property needs replication becomes one
/// [`SyncMessage`] per interested subscriber, scheduled with the property's
/// declared delay and ordering policy. `FAST_SYNC` properties skip the delay.
#[derive(Debug)]
pub struct SyncPublisher {
    circle: TimeCircleHandle,
    subscribers: DashMap<MailBox, SubscriberKind>,
}

impl SyncPublisher {
    pub fn new(circle: TimeCircleHandle) -> Self {
        Self {
            circle,
            subscribers: DashMap::new(),
        }
    }

    pub fn subscribe(&self, mailbox: MailBox, kind: SubscriberKind) {
        self.subscribers.insert(mailbox, kind);
    }

    pub fn unsubscribe(&self, mailbox: &MailBox) -> bool {
        self.subscribers.remove(mailbox).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl PropertyOwner for SyncPublisher {
    fn on_notify(&self, notification: &PropertyNotification) -> Result<(), PropertyError> {
        let setting = notification.property.setting;
        if !setting.needs_sync() {
            return Ok(());
        }

        let policy = notification.property.policy;
        let delay_ms = if setting.contains(PropertySetting::FAST_SYNC) {
            0
        } else {
            policy.delay_ms
        };

        for entry in self.subscribers.iter() {
            if !entry.value().wants(setting) {
                continue;
            }
            let message = SyncMessage::build(entry.key().clone(), notification)?;
            trace!(
                "🔁 Scheduling {:?} on '{}' for {} in {}ms",
                message.operation,
                message.path_key(),
                entry.key(),
                delay_ms
            );
            self.circle.add_property_sync_message(message, delay_ms, policy.keep_order);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{FieldKind, PropertyDecl, PropertyTree, SyncPolicy, TypeRegistry};
    use crate::sync::{TimeCircle, TimeCircleConfig};
    use crate::value::PropValue;
    use std::sync::Arc;

    #[test]
    fn test_routes_by_setting_and_policy() {
        let mut circle = TimeCircle::new(TimeCircleConfig::default());
        let publisher = Arc::new(SyncPublisher::new(circle.handle()));
        let shadow = MailBox::new("avatar_1", "10.0.0.2", 7002, 1);
        let client = MailBox::new("avatar_1", "10.0.0.9", 9000, 1);
        publisher.subscribe(shadow.clone(), SubscriberKind::Shadow);
        publisher.subscribe(client.clone(), SubscriberKind::Client);

        let mut tree = PropertyTree::new(Arc::new(TypeRegistry::new()));
        let hp = tree
            .declare_property(
                PropertyDecl::new("hp", FieldKind::Leaf(PropValue::Int(100)))
                    .setting(PropertySetting::SERVER_TO_SHADOW | PropertySetting::FAST_SYNC),
            )
            .unwrap();
        let secret = tree
            .declare_property(
                PropertyDecl::new("secret", FieldKind::Leaf(PropValue::Int(0))).setting(PropertySetting::SERVER_OWN),
            )
            .unwrap();
        let gold = tree
            .declare_property(
                PropertyDecl::new("gold", FieldKind::Leaf(PropValue::Int(0)))
                    .setting(PropertySetting::CLIENT_OWN)
                    .policy(SyncPolicy {
                        delay_ms: 200,
                        keep_order: false,
                    }),
            )
            .unwrap();
        tree.set_owner_all(publisher.clone());

        let (hp, secret, gold) = (tree.root(hp).unwrap(), tree.root(secret).unwrap(), tree.root(gold).unwrap());
        tree.set_value(hp, 90i64).unwrap();
        tree.set_value(secret, 1i64).unwrap();
        tree.set_value(gold, 5i64).unwrap();
        tree.set_value(gold, 6i64).unwrap();

        let mut first_tick = Vec::new();
        circle.tick(50, |mailbox, list| first_tick.push((mailbox, list)));
        assert_eq!(first_tick.len(), 1);
        assert_eq!(first_tick[0].0, shadow);
        assert_eq!(first_tick[0].1.commands[0].path, vec!["hp".to_string()]);

        let mut later = Vec::new();
        circle.tick(1000, |mailbox, list| later.push((mailbox, list)));
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].0, client);
        assert_eq!(later[0].1.commands.len(), 1);
    }
}
