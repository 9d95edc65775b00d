//! # Property Tree
//!
//! Every entity owns one [`PropertyTree`]: an arena holding all of the entity's
//! replicated containers. Containers refer to each other through [`NodeId`]
//! handles instead of pointers, so reparenting a subtree is a matter of
//! rewriting a few handles.
//!
//! ## Tree invariants
//!
//! - A container attached below another has `parent` set and `is_referred == true`.
//! - Every container reachable from a property root carries that property as
//!   its `top_owner`. Attaching or detaching a subtree rewrites the owner of
//!   the whole subtree in one pass.
//! - A container with no parent and an owner is the root of that property.
//! - Free-standing containers (built but not yet inserted) have neither parent
//!   nor owner and can be mutated without producing notifications.
//!
//! Mutators live in `mutate.rs`, wire conversion in `wire.rs` and shadow-side
//! application of remote deltas in `apply.rs`.

mod apply;
mod mutate;
mod wire;

use crate::error::PropertyError;
use crate::property::notify::{PropertyInfo, PropertyNotification, PropertyOwner, PropertySetting, SyncArg, SyncPolicy};
use crate::property::observer::ContainerObserver;
use crate::property::registry::{FieldKind, TypeRegistry};
use crate::sync::{SyncOperation, SyncType};
use crate::value::{ContainerKind, DictKey, PropValue, ScalarKind};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Generational handle to a container inside a [`PropertyTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// Handle to a property slot of a [`PropertyTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(u32);

impl PropertyId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
enum NodeData {
    Leaf(PropValue),
    List(Vec<NodeId>),
    Dict {
        key_kind: Option<ScalarKind>,
        entries: BTreeMap<DictKey, NodeId>,
    },
    Composite {
        type_name: String,
        fields: Vec<(String, NodeId)>,
    },
}

impl NodeData {
    fn children(&self) -> Vec<NodeId> {
        match self {
            NodeData::Leaf(_) => Vec::new(),
            NodeData::List(items) => items.clone(),
            NodeData::Dict { entries, .. } => entries.values().copied().collect(),
            NodeData::Composite { fields, .. } => fields.iter().map(|(_, id)| *id).collect(),
        }
    }

    fn kind(&self) -> ContainerKind {
        match self {
            NodeData::Leaf(v) => ContainerKind::Leaf(v.kind()),
            NodeData::List(_) => ContainerKind::List,
            NodeData::Dict { .. } => ContainerKind::Dict,
            NodeData::Composite { type_name, .. } => ContainerKind::Composite(type_name.clone()),
        }
    }

    fn sync_type(&self) -> SyncType {
        match self {
            NodeData::Leaf(_) | NodeData::Composite { .. } => SyncType::PlaintAndComposite,
            NodeData::List(_) => SyncType::List,
            NodeData::Dict { .. } => SyncType::Dict,
        }
    }
}

#[derive(Debug)]
struct Node {
    name: Option<String>,
    parent: Option<NodeId>,
    is_referred: bool,
    top_owner: Option<PropertyId>,
    /// Composite field, fixed for the lifetime of its parent
    permanent: bool,
    data: NodeData,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

struct Property {
    info: PropertyInfo,
    shadow: bool,
    root: NodeId,
    owner: Option<Arc<dyn PropertyOwner>>,
}

/// Declaration of a property slot.
#[derive(Debug, Clone)]
pub struct PropertyDecl {
    pub name: String,
    pub kind: FieldKind,
    pub setting: PropertySetting,
    pub policy: SyncPolicy,
    /// Replicated-only mirror; every user mutation fails
    pub shadow: bool,
}

impl PropertyDecl {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            setting: PropertySetting::SERVER_TO_SHADOW,
            policy: SyncPolicy::default(),
            shadow: false,
        }
    }

    pub fn setting(mut self, setting: PropertySetting) -> Self {
        self.setting = setting;
        self
    }

    pub fn policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn shadow(mut self) -> Self {
        self.shadow = true;
        self
    }
}

/// Result of [`PropertyTree::raw_value`]: leaves unwrap to their scalar,
/// containers are addressed further through their handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue<'a> {
    Scalar(&'a PropValue),
    Container(NodeId),
}

/// Arena of replicated containers belonging to one entity.
pub struct PropertyTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    properties: Vec<Property>,
    by_name: HashMap<String, PropertyId>,
    observers: HashMap<NodeId, Arc<dyn ContainerObserver>>,
    registry: Arc<TypeRegistry>,
}

impl fmt::Debug for PropertyTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyTree")
            .field("nodes", &self.node_count())
            .field("properties", &self.by_name.keys().collect::<Vec<_>>())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl PropertyTree {
    /// Creates an empty tree that builds composites from `registry`.
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            properties: Vec::new(),
            by_name: HashMap::new(),
            observers: HashMap::new(),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Arena plumbing
    // ------------------------------------------------------------------

    fn alloc(&mut self, data: NodeData) -> NodeId {
        let node = Node {
            name: None,
            parent: None,
            is_referred: false,
            top_owner: None,
            permanent: false,
            data,
        };

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId { index, generation: 0 }
        }
    }

    fn node(&self, id: NodeId) -> Result<&Node, PropertyError> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or_else(|| PropertyError::NodeNotFound(format!("{:?}", id)))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, PropertyError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or_else(|| PropertyError::NodeNotFound(format!("{:?}", id)))
    }

    /// Releases a container and everything below it.
    fn free_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(slot) = self.slots.get_mut(current.index as usize) else {
                continue;
            };
            if slot.generation != current.generation {
                continue;
            }
            if let Some(node) = slot.node.take() {
                stack.extend(node.data.children());
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(current.index);
                self.observers.remove(&current);
            }
        }
    }

    /// Number of live containers in the arena.
    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.node.is_some()).count()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_ok()
    }

    // ------------------------------------------------------------------
    // Attach / detach
    // ------------------------------------------------------------------

    fn set_top_owner_recursive(&mut self, id: NodeId, owner: Option<PropertyId>) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Ok(node) = self.node_mut(current) {
                node.top_owner = owner;
                stack.extend(node.data.children());
            }
        }
    }

    /// Links `id` under `parent` as child `name` and hands the whole subtree
    /// to `top_owner`.
    pub(crate) fn insert_to_prop_tree(
        &mut self,
        id: NodeId,
        parent: NodeId,
        name: String,
        top_owner: Option<PropertyId>,
    ) -> Result<(), PropertyError> {
        let node = self.node_mut(id)?;
        node.parent = Some(parent);
        node.name = Some(name);
        node.is_referred = true;
        self.set_top_owner_recursive(id, top_owner);
        Ok(())
    }

    /// Inverse of [`Self::insert_to_prop_tree`]. Detaching twice is a no-op.
    pub(crate) fn remove_from_prop_tree(&mut self, id: NodeId) -> Result<(), PropertyError> {
        let node = self.node_mut(id)?;
        if node.parent.is_none() && node.top_owner.is_none() && !node.is_referred {
            return Ok(());
        }
        node.parent = None;
        node.name = None;
        node.is_referred = false;
        self.set_top_owner_recursive(id, None);
        Ok(())
    }

    /// Fails unless `child` is free-standing and not an ancestor of `container`.
    fn ensure_attachable(&self, child: NodeId, container: NodeId) -> Result<(), PropertyError> {
        let node = self.node(child)?;
        if node.permanent {
            return Err(PropertyError::PermanentField(node.name.clone().unwrap_or_default()));
        }
        if node.parent.is_some() || node.top_owner.is_some() {
            return Err(PropertyError::AlreadyAttached);
        }

        let mut current = Some(container);
        while let Some(id) = current {
            if id == child {
                return Err(PropertyError::AlreadyAttached);
            }
            current = self.node(id)?.parent;
        }
        Ok(())
    }

    /// Fails with [`PropertyError::ShadowMutation`] when `id` belongs to a
    /// shadow property.
    pub fn assert_not_shadow_mutable(&self, id: NodeId) -> Result<(), PropertyError> {
        if let Some(owner) = self.node(id)?.top_owner {
            let property = &self.properties[owner.index()];
            if property.shadow {
                return Err(PropertyError::ShadowMutation {
                    property: property.info.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn rename_list_children(&mut self, list: NodeId, from: usize) -> Result<(), PropertyError> {
        let items = match &self.node(list)?.data {
            NodeData::List(items) => items.clone(),
            _ => return Ok(()),
        };
        for (index, child) in items.iter().enumerate().skip(from) {
            self.node_mut(*child)?.name = Some(index.to_string());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Creates a free-standing leaf.
    pub fn new_leaf(&mut self, value: impl Into<PropValue>) -> NodeId {
        self.alloc(NodeData::Leaf(value.into()))
    }

    /// Creates a free-standing empty list.
    pub fn new_list(&mut self) -> NodeId {
        self.alloc(NodeData::List(Vec::new()))
    }

    /// Creates a free-standing empty dictionary.
    pub fn new_dict(&mut self) -> NodeId {
        self.alloc(NodeData::Dict {
            key_kind: None,
            entries: BTreeMap::new(),
        })
    }

    /// Creates a free-standing composite with its declared fields at their
    /// initial values.
    pub fn new_composite(&mut self, type_name: &str) -> Result<NodeId, PropertyError> {
        let descriptor = self.registry.get(type_name)?.clone();
        let composite = self.alloc(NodeData::Composite {
            type_name: descriptor.type_name.clone(),
            fields: Vec::with_capacity(descriptor.fields.len()),
        });

        for (field_name, kind) in &descriptor.fields {
            let child = match self.build_field(kind) {
                Ok(child) => child,
                Err(e) => {
                    self.free_subtree(composite);
                    return Err(e);
                }
            };
            self.node_mut(child)?.permanent = true;
            self.insert_to_prop_tree(child, composite, field_name.clone(), None)?;
            if let NodeData::Composite { fields, .. } = &mut self.node_mut(composite)?.data {
                fields.push((field_name.clone(), child));
            }
        }

        Ok(composite)
    }

    fn build_field(&mut self, kind: &FieldKind) -> Result<NodeId, PropertyError> {
        Ok(match kind {
            FieldKind::Leaf(initial) => self.new_leaf(initial.clone()),
            FieldKind::List => self.new_list(),
            FieldKind::Dict => self.new_dict(),
            FieldKind::Composite(type_name) => self.new_composite(type_name)?,
        })
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    /// Declares a property and builds its root container.
    pub fn declare_property(&mut self, decl: PropertyDecl) -> Result<PropertyId, PropertyError> {
        if decl.name.is_empty() {
            return Err(PropertyError::InvalidDeclaration("empty property name".to_string()));
        }
        if self.by_name.contains_key(&decl.name) {
            return Err(PropertyError::InvalidDeclaration(format!(
                "property '{}' declared twice",
                decl.name
            )));
        }

        let root = self.build_field(&decl.kind)?;
        let id = PropertyId(self.properties.len() as u32);
        self.node_mut(root)?.name = Some(decl.name.clone());
        self.set_top_owner_recursive(root, Some(id));

        self.properties.push(Property {
            info: PropertyInfo {
                name: decl.name.clone(),
                setting: decl.setting,
                policy: decl.policy,
            },
            shadow: decl.shadow,
            root,
            owner: None,
        });
        self.by_name.insert(decl.name, id);
        Ok(id)
    }

    /// Installs the hook that receives this property's notifications.
    pub fn set_owner(&mut self, property: PropertyId, owner: Arc<dyn PropertyOwner>) {
        if let Some(p) = self.properties.get_mut(property.index()) {
            p.owner = Some(owner);
        }
    }

    /// Installs the same hook on every authoritative property.
    pub fn set_owner_all(&mut self, owner: Arc<dyn PropertyOwner>) {
        for property in self.properties.iter_mut().filter(|p| !p.shadow) {
            property.owner = Some(owner.clone());
        }
    }

    pub fn property(&self, name: &str) -> Option<PropertyId> {
        self.by_name.get(name).copied()
    }

    /// Root container of a property.
    pub fn root(&self, property: PropertyId) -> Result<NodeId, PropertyError> {
        self.properties
            .get(property.index())
            .map(|p| p.root)
            .ok_or_else(|| PropertyError::NodeNotFound(format!("{:?}", property)))
    }

    /// Root container of a property, by name.
    pub fn root_of(&self, name: &str) -> Result<NodeId, PropertyError> {
        let id = self
            .property(name)
            .ok_or_else(|| PropertyError::NodeNotFound(format!("property '{name}'")))?;
        self.root(id)
    }

    pub fn property_info(&self, property: PropertyId) -> Option<&PropertyInfo> {
        self.properties.get(property.index()).map(|p| &p.info)
    }

    pub fn is_shadow(&self, property: PropertyId) -> bool {
        self.properties.get(property.index()).map(|p| p.shadow).unwrap_or(false)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|p| p.info.name.as_str())
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn set_observer(&mut self, id: NodeId, observer: Arc<dyn ContainerObserver>) -> Result<(), PropertyError> {
        self.node(id)?;
        self.observers.insert(id, observer);
        Ok(())
    }

    pub fn remove_observer(&mut self, id: NodeId) {
        self.observers.remove(&id);
    }

    fn observer(&self, id: NodeId) -> Option<Arc<dyn ContainerObserver>> {
        self.observers.get(&id).cloned()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>, PropertyError> {
        Ok(self.node(id)?.parent)
    }

    pub fn name(&self, id: NodeId) -> Result<Option<&str>, PropertyError> {
        Ok(self.node(id)?.name.as_deref())
    }

    pub fn top_owner(&self, id: NodeId) -> Result<Option<PropertyId>, PropertyError> {
        Ok(self.node(id)?.top_owner)
    }

    pub fn is_referred(&self, id: NodeId) -> Result<bool, PropertyError> {
        Ok(self.node(id)?.is_referred)
    }

    pub fn kind_of(&self, id: NodeId) -> Result<ContainerKind, PropertyError> {
        Ok(self.node(id)?.data.kind())
    }

    pub fn sync_type_of(&self, id: NodeId) -> Result<SyncType, PropertyError> {
        Ok(self.node(id)?.data.sync_type())
    }

    /// Named children, in container order.
    pub fn children(&self, id: NodeId) -> Result<Vec<(String, NodeId)>, PropertyError> {
        let node = self.node(id)?;
        Ok(match &node.data {
            NodeData::Leaf(_) => Vec::new(),
            NodeData::List(items) => items.iter().enumerate().map(|(i, c)| (i.to_string(), *c)).collect(),
            NodeData::Dict { entries, .. } => entries.iter().map(|(k, c)| (k.to_segment(), *c)).collect(),
            NodeData::Composite { fields, .. } => fields.clone(),
        })
    }

    /// Scalar for leaves, the handle itself for containers.
    pub fn raw_value(&self, id: NodeId) -> Result<RawValue<'_>, PropertyError> {
        Ok(match &self.node(id)?.data {
            NodeData::Leaf(v) => RawValue::Scalar(v),
            _ => RawValue::Container(id),
        })
    }

    pub fn value(&self, id: NodeId) -> Result<&PropValue, PropertyError> {
        let node = self.node(id)?;
        match &node.data {
            NodeData::Leaf(v) => Ok(v),
            other => Err(PropertyError::NotAContainer {
                expected: "leaf",
                actual: other.kind(),
            }),
        }
    }

    fn list_items(&self, id: NodeId) -> Result<&Vec<NodeId>, PropertyError> {
        match &self.node(id)?.data {
            NodeData::List(items) => Ok(items),
            other => Err(PropertyError::NotAContainer {
                expected: "list",
                actual: other.kind(),
            }),
        }
    }

    fn dict_entries(&self, id: NodeId) -> Result<&BTreeMap<DictKey, NodeId>, PropertyError> {
        match &self.node(id)?.data {
            NodeData::Dict { entries, .. } => Ok(entries),
            other => Err(PropertyError::NotAContainer {
                expected: "dict",
                actual: other.kind(),
            }),
        }
    }

    pub fn list_len(&self, list: NodeId) -> Result<usize, PropertyError> {
        Ok(self.list_items(list)?.len())
    }

    pub fn list_get(&self, list: NodeId, index: usize) -> Result<NodeId, PropertyError> {
        let items = self.list_items(list)?;
        items.get(index).copied().ok_or(PropertyError::IndexOutOfRange {
            index,
            len: items.len(),
        })
    }

    pub fn dict_len(&self, dict: NodeId) -> Result<usize, PropertyError> {
        Ok(self.dict_entries(dict)?.len())
    }

    pub fn dict_get(&self, dict: NodeId, key: &DictKey) -> Result<Option<NodeId>, PropertyError> {
        Ok(self.dict_entries(dict)?.get(key).copied())
    }

    pub fn dict_keys(&self, dict: NodeId) -> Result<Vec<DictKey>, PropertyError> {
        Ok(self.dict_entries(dict)?.keys().cloned().collect())
    }

    /// Declared field of a composite.
    pub fn field(&self, composite: NodeId, name: &str) -> Result<NodeId, PropertyError> {
        match &self.node(composite)?.data {
            NodeData::Composite { fields, type_name } => fields
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, id)| *id)
                .ok_or_else(|| PropertyError::KeyNotFound(format!("{type_name}.{name}"))),
            other => Err(PropertyError::NotAContainer {
                expected: "composite",
                actual: other.kind(),
            }),
        }
    }

    /// Child names from the property root down to `id`; empty for a root.
    pub fn path_of(&self, id: NodeId) -> Result<Vec<String>, PropertyError> {
        Ok(self.walk_to_root(id)?.1)
    }

    fn walk_to_root(&self, id: NodeId) -> Result<(NodeId, Vec<String>), PropertyError> {
        let mut path = Vec::new();
        let mut current = id;
        loop {
            let node = self.node(current)?;
            match node.parent {
                Some(parent) => {
                    path.push(node.name.clone().unwrap_or_default());
                    current = parent;
                }
                None => break,
            }
        }
        path.reverse();
        Ok((current, path))
    }

    /// Resolves `[property, child, child, ...]` to a container.
    pub fn resolve_path(&self, path: &[String]) -> Result<NodeId, PropertyError> {
        let (first, rest) = path
            .split_first()
            .ok_or_else(|| PropertyError::NodeNotFound("empty path".to_string()))?;
        let mut current = self.root_of(first)?;

        for segment in rest {
            let not_found = || PropertyError::NodeNotFound(path.join("."));
            current = match &self.node(current)?.data {
                NodeData::List(items) => {
                    let index: usize = segment.parse().map_err(|_| not_found())?;
                    items.get(index).copied().ok_or_else(not_found)?
                }
                NodeData::Dict { entries, .. } => entries
                    .iter()
                    .find(|(k, _)| k.to_segment() == *segment)
                    .map(|(_, id)| *id)
                    .ok_or_else(not_found)?,
                NodeData::Composite { fields, .. } => fields
                    .iter()
                    .find(|(n, _)| n == segment)
                    .map(|(_, id)| *id)
                    .ok_or_else(not_found)?,
                NodeData::Leaf(_) => return Err(not_found()),
            };
        }
        Ok(current)
    }

    // ------------------------------------------------------------------
    // Notification
    // ------------------------------------------------------------------

    /// Walks from `id` to the root and reports the change to the owning
    /// property's hook. Free-standing containers and shadows report nothing.
    fn notify_change(
        &self,
        id: NodeId,
        operation: SyncOperation,
        sync_type: SyncType,
        arg: SyncArg,
    ) -> Result<(), PropertyError> {
        let (root, path) = self.walk_to_root(id)?;
        let Some(owner) = self.node(root)?.top_owner else {
            return Ok(());
        };
        let property = &self.properties[owner.index()];
        if property.shadow {
            return Ok(());
        }

        if let Some(hook) = &property.owner {
            hook.on_notify(&PropertyNotification {
                property: property.info.clone(),
                path,
                operation,
                sync_type,
                arg,
            })?;
        }
        Ok(())
    }
}
