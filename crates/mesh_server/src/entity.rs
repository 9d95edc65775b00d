//! Entities hosted on an instance.
//!
//! A [`LocalEntity`] bundles a mailbox, the RPC methods it exposes and,
//! optionally, a property tree. Instances keep their entities and cells in
//! an [`EntityRegistry`] that the router consults for local delivery.

use dashmap::DashMap;
use futures::future::BoxFuture;
use mesh_core::property::PropertyTree;
use mesh_core::rpc::{EntityRpc, RpcAuthority};
use mesh_core::sync::SyncPublisher;
use mesh_core::{MailBox, RpcError};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Future returned by an RPC method.
pub type RpcFuture = BoxFuture<'static, Result<serde_json::Value, RpcError>>;

type RpcHandler = Arc<dyn Fn(Arc<LocalEntity>, EntityRpc) -> RpcFuture + Send + Sync>;

/// A registered method: its declared authority and handler.
#[derive(Clone)]
pub struct RpcMethod {
    pub authority: RpcAuthority,
    handler: RpcHandler,
}

impl RpcMethod {
    pub(crate) fn invoke(&self, entity: Arc<LocalEntity>, rpc: EntityRpc) -> RpcFuture {
        (self.handler)(entity, rpc)
    }
}

impl fmt::Debug for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcMethod").field("authority", &self.authority).finish_non_exhaustive()
    }
}

/// Methods an entity answers, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct RpcMethodTable {
    methods: HashMap<String, RpcMethod>,
}

impl RpcMethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` with the authority it requires.
    ///
    /// Registering a name twice replaces the earlier method.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, authority: RpcAuthority, handler: F)
    where
        F: Fn(Arc<LocalEntity>, EntityRpc) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, RpcError>> + Send + 'static,
    {
        let name = name.into();
        let handler: RpcHandler = Arc::new(move |entity, rpc| Box::pin(handler(entity, rpc)));
        if self.methods.insert(name.clone(), RpcMethod { authority, handler }).is_some() {
            warn!("🔁 RPC method '{}' registered twice, keeping the latest", name);
        }
    }

    /// Builder form of [`Self::register`].
    pub fn with<F, Fut>(mut self, name: impl Into<String>, authority: RpcAuthority, handler: F) -> Self
    where
        F: Fn(Arc<LocalEntity>, EntityRpc) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, RpcError>> + Send + 'static,
    {
        self.register(name, authority, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&RpcMethod> {
        self.methods.get(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// What an entity is to its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// The instance's own singleton entity
    Root,
    /// An authoritative simulation entity
    Entity,
    /// A grouping entity owning other entities
    Cell,
    /// A read-only mirror of an entity held elsewhere
    Shadow,
}

/// An entity living on this instance.
pub struct LocalEntity {
    pub mailbox: MailBox,
    pub kind: EntityKind,
    methods: RpcMethodTable,
    properties: Option<Mutex<PropertyTree>>,
    publisher: Option<Arc<SyncPublisher>>,
}

impl LocalEntity {
    pub fn new(mailbox: MailBox, kind: EntityKind, methods: RpcMethodTable) -> Self {
        Self {
            mailbox,
            kind,
            methods,
            properties: None,
            publisher: None,
        }
    }

    /// Attaches a property tree. `publisher` is the tree's owner hook on
    /// authoritative entities and `None` on shadows.
    pub fn with_properties(mut self, tree: PropertyTree, publisher: Option<Arc<SyncPublisher>>) -> Self {
        self.properties = Some(Mutex::new(tree));
        self.publisher = publisher;
        self
    }

    pub fn id(&self) -> &str {
        &self.mailbox.id
    }

    pub fn methods(&self) -> &RpcMethodTable {
        &self.methods
    }

    pub fn publisher(&self) -> Option<&Arc<SyncPublisher>> {
        self.publisher.as_ref()
    }

    pub fn has_properties(&self) -> bool {
        self.properties.is_some()
    }

    /// Runs `f` on the entity's property tree.
    ///
    /// # Returns
    ///
    /// `None` when the entity has no properties.
    pub fn with_tree<R>(&self, f: impl FnOnce(&mut PropertyTree) -> R) -> Option<R> {
        let lock = self.properties.as_ref()?;
        let mut tree = lock.lock().unwrap_or_else(|e| e.into_inner());
        Some(f(&mut tree))
    }
}

impl fmt::Debug for LocalEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEntity")
            .field("mailbox", &self.mailbox)
            .field("kind", &self.kind)
            .field("methods", &self.methods.len())
            .field("has_properties", &self.properties.is_some())
            .finish()
    }
}

/// Entities and cells hosted on one instance, keyed by id.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: DashMap<String, Arc<LocalEntity>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `entity`, replacing any entity with the same id.
    pub fn register(&self, entity: Arc<LocalEntity>) {
        let id = entity.id().to_string();
        debug!("🧩 Registered {:?} '{}'", entity.kind, id);
        if self.entities.insert(id.clone(), entity).is_some() {
            warn!("🔁 Entity '{}' was already registered and has been replaced", id);
        }
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<LocalEntity>> {
        self.entities.remove(id).map(|(_, entity)| entity)
    }

    pub fn get(&self, id: &str) -> Option<Arc<LocalEntity>> {
        self.entities.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Ids of entities of `kind`.
    pub fn ids_of(&self, kind: EntityKind) -> Vec<String> {
        self.entities
            .iter()
            .filter(|entry| entry.value().kind == kind)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::property::{FieldKind, PropertyDecl, TypeRegistry};
    use serde_json::json;

    #[test]
    fn test_registry_replaces_and_filters() {
        let registry = EntityRegistry::new();
        let base = MailBox::new("server_0", "127.0.0.1", 9300, 1);
        registry.register(Arc::new(LocalEntity::new(base.with_id("a"), EntityKind::Entity, RpcMethodTable::new())));
        registry.register(Arc::new(LocalEntity::new(base.with_id("c"), EntityKind::Cell, RpcMethodTable::new())));
        registry.register(Arc::new(LocalEntity::new(base.with_id("a"), EntityKind::Cell, RpcMethodTable::new())));

        assert_eq!(registry.len(), 2);
        let mut cells = registry.ids_of(EntityKind::Cell);
        cells.sort();
        assert_eq!(cells, vec!["a".to_string(), "c".to_string()]);
        assert!(registry.unregister("a").is_some());
        assert!(!registry.contains("a"));
    }

    #[test]
    fn test_entity_tree_access() {
        let mut tree = PropertyTree::new(Arc::new(TypeRegistry::new()));
        tree.declare_property(PropertyDecl::new("hp", FieldKind::Leaf(100i64.into()))).unwrap();
        let methods = RpcMethodTable::new().with("noop", RpcAuthority::SERVER_ONLY, |_, _| async { Ok(json!(null)) });
        let entity = LocalEntity::new(MailBox::new("e", "127.0.0.1", 1, 1), EntityKind::Entity, methods)
            .with_properties(tree, None);

        let hp = entity
            .with_tree(|tree| {
                let root = tree.root_of("hp").unwrap();
                tree.value(root).unwrap().as_int()
            })
            .flatten();
        assert_eq!(hp, Some(100));
        assert!(entity.methods().get("noop").is_some());

        let bare = LocalEntity::new(MailBox::new("b", "127.0.0.1", 1, 1), EntityKind::Root, RpcMethodTable::new());
        assert!(bare.with_tree(|_| ()).is_none());
    }
}
