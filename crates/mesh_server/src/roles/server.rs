//! Server behaviour: authoritative entities and property sync delivery.

use super::node::Node;
use crate::entity::{EntityKind, LocalEntity, RpcMethodTable};
use crate::error::ServerError;
use mesh_core::id::GlobalIdGenerator;
use mesh_core::property::{PropertyTree, SyncPolicy};
use mesh_core::sync::{SubscriberKind, SyncPublisher, TimeCircle};
use mesh_core::utils::duration_ms;
use mesh_core::MailBox;
use std::sync::Arc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

impl Node {
    /// The instance-wide sync policy, with the configured default delay.
    pub fn sync_policy(&self, keep_order: bool) -> SyncPolicy {
        SyncPolicy {
            delay_ms: self.default_delay_ms,
            keep_order,
        }
    }

    /// Creates and registers an entity hosted here.
    ///
    /// On instances that run a time circle, a property tree is owned by a
    /// fresh [`SyncPublisher`] so its changes replicate to subscribers. On
    /// gates the tree is a shadow fed by incoming sync lists.
    ///
    /// # Arguments
    ///
    /// * `id` - Entity id, unique on this instance
    /// * `kind` - Entity or cell
    /// * `methods` - RPC methods the entity answers
    /// * `tree` - Optional property tree
    ///
    /// # Errors
    ///
    /// [`ServerError::Internal`] if `id` is already taken.
    pub fn create_entity(
        &self,
        id: &str,
        kind: EntityKind,
        methods: RpcMethodTable,
        tree: Option<PropertyTree>,
    ) -> Result<Arc<LocalEntity>, ServerError> {
        if self.entities().contains(id) || id == self.mailbox.id {
            return Err(ServerError::Internal(format!("entity id '{id}' is already in use")));
        }

        let mailbox = self.mailbox.with_id(id);
        let mut entity = LocalEntity::new(mailbox, kind, methods);
        if let Some(mut tree) = tree {
            let publisher = self.sync.as_ref().map(|handle| Arc::new(SyncPublisher::new(handle.clone())));
            if let Some(publisher) = &publisher {
                tree.set_owner_all(publisher.clone());
            }
            entity = entity.with_properties(tree, publisher);
        }

        let entity = Arc::new(entity);
        self.register_entity(entity.clone());
        info!("🧩 Created {:?} '{}' on {}", kind, id, self.mailbox);
        Ok(entity)
    }

    /// Subscribes `subscriber` to entity `id`'s replicated properties.
    ///
    /// # Returns
    ///
    /// `false` when the entity is unknown or has no publisher.
    pub fn subscribe(&self, id: &str, subscriber: MailBox, kind: SubscriberKind) -> bool {
        match self.entities().get(id).as_ref().and_then(|e| e.publisher()) {
            Some(publisher) => {
                debug!("📡 {} subscribed to '{}' as {:?}", subscriber, id, kind);
                publisher.subscribe(subscriber, kind);
                true
            }
            None => false,
        }
    }

    /// Like [`Self::create_entity`], with an id drawn from `ids`.
    ///
    /// # Errors
    ///
    /// [`ServerError::Internal`] if the generator fails or hands out an id
    /// that is already taken here.
    pub async fn spawn_entity(
        &self,
        ids: &dyn GlobalIdGenerator,
        kind: EntityKind,
        methods: RpcMethodTable,
        tree: Option<PropertyTree>,
    ) -> Result<Arc<LocalEntity>, ServerError> {
        let id = ids
            .generate_global_id()
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        self.create_entity(&id, kind, methods, tree)
    }
}

/// Drives the time circle at its configured interval and hands every
/// released list to the router. Whatever is still queued is flushed when
/// `stop` fires.
pub(crate) async fn run_sync_delivery(node: Arc<Node>, mut circle: TimeCircle, stop: CancellationToken) {
    let period = Duration::from_millis(circle.interval_ms());
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();
    info!(
        "⏱️ Sync delivery running: {} slots of {}ms",
        circle.slot_count(),
        circle.interval_ms()
    );

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                circle.flush(|mailbox, commands| node.deliver_sync(mailbox, commands));
                break;
            }
            _ = ticker.tick() => {
                let elapsed = duration_ms(last.elapsed());
                last += Duration::from_millis(elapsed);
                circle.tick(elapsed, |mailbox, commands| node.deliver_sync(mailbox, commands));
            }
        }
    }

    let stats = circle.stats();
    info!(
        "⏱️ Sync delivery stopped: {} enqueued, {} drained, {} coalesced, {} batches",
        stats.enqueued, stats.drained, stats.coalesced, stats.batches
    );
}

#[cfg(test)]
mod tests {
    use super::super::node::NodeParts;
    use super::*;
    use crate::transport::Transport;
    use mesh_core::id::{SequentialIdGenerator, UuidIdGenerator};
    use mesh_core::property::{FieldKind, PropertyDecl, TypeRegistry};
    use mesh_core::protocol::InstanceRole;
    use mesh_core::sync::TimeCircleConfig;

    fn server(circle: &TimeCircle) -> Arc<Node> {
        let (transport, _events) = Transport::new(CancellationToken::new());
        Node::new(NodeParts {
            role: InstanceRole::Server,
            mailbox: MailBox::new("server_0", "127.0.0.1", 9300, 1),
            transport,
            report_errors: false,
            client_address: None,
            sync: Some(circle.handle()),
            default_delay_ms: 50,
        })
    }

    #[tokio::test]
    async fn test_local_shadow_follows_authority() {
        let mut circle = TimeCircle::new(TimeCircleConfig {
            interval_ms: 50,
            total_window_ms: 500,
        });
        let node = server(&circle);
        let registry = Arc::new(TypeRegistry::new());

        let mut authority = PropertyTree::new(registry.clone());
        authority
            .declare_property(PropertyDecl::new("hp", FieldKind::Leaf(100i64.into())).policy(node.sync_policy(true)))
            .unwrap();
        let avatar = node
            .create_entity("avatar", EntityKind::Entity, RpcMethodTable::new(), Some(authority))
            .unwrap();
        assert!(avatar.publisher().is_some());

        let mut mirror = PropertyTree::new(registry);
        mirror
            .declare_property(PropertyDecl::new("hp", FieldKind::Leaf(100i64.into())).shadow())
            .unwrap();
        node.register_entity(Arc::new(
            LocalEntity::new(node.mailbox().with_id("avatar_shadow"), EntityKind::Shadow, RpcMethodTable::new())
                .with_properties(mirror, None),
        ));
        assert!(node.subscribe("avatar", node.mailbox().with_id("avatar_shadow"), SubscriberKind::Shadow));
        assert!(!node.subscribe("nobody", node.mailbox().with_id("x"), SubscriberKind::Shadow));

        avatar
            .with_tree(|tree| {
                let hp = tree.root_of("hp").unwrap();
                tree.set_value(hp, 75i64).unwrap();
            })
            .unwrap();

        circle.tick(100, |mailbox, commands| node.deliver_sync(mailbox, commands));

        let shadow = node.entities().get("avatar_shadow").unwrap();
        let hp = shadow
            .with_tree(|tree| tree.value(tree.root_of("hp").unwrap()).unwrap().as_int())
            .flatten();
        assert_eq!(hp, Some(75));
    }

    #[tokio::test]
    async fn test_spawned_entities_get_fresh_ids() {
        let circle = TimeCircle::new(TimeCircleConfig::default());
        let node = server(&circle);
        let ids = SequentialIdGenerator::new("monster");

        let first = node
            .spawn_entity(&ids, EntityKind::Entity, RpcMethodTable::new(), None)
            .await
            .unwrap();
        let second = node
            .spawn_entity(&UuidIdGenerator, EntityKind::Entity, RpcMethodTable::new(), None)
            .await
            .unwrap();
        assert_eq!(first.id(), "monster_1");
        assert_ne!(first.id(), second.id());
        assert!(second.mailbox.compare_only_address(node.mailbox()));
        assert_eq!(node.entities().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_entity_id_is_rejected() {
        let circle = TimeCircle::new(TimeCircleConfig::default());
        let node = server(&circle);
        node.create_entity("cell_0", EntityKind::Cell, RpcMethodTable::new(), None)
            .unwrap();
        assert!(node
            .create_entity("cell_0", EntityKind::Cell, RpcMethodTable::new(), None)
            .is_err());
        assert!(node
            .create_entity("server_0", EntityKind::Cell, RpcMethodTable::new(), None)
            .is_err());
    }
}
