//! Mutators.
//!
//! Each public mutator refuses to touch a shadow property, then defers to an
//! unchecked twin. The unchecked twins are what shadow-side delta application
//! uses. Every mutator commits the structural change first, then fires the
//! container's observer, then reports to the owning property.

use super::{NodeData, NodeId, PropertyTree};
use crate::error::PropertyError;
use crate::property::notify::SyncArg;
use crate::sync::{SyncOperation, SyncType};
use crate::value::{ContainerKind, DictKey, PropValue, WireValue};

impl PropertyTree {
    // ------------------------------------------------------------------
    // Leaf
    // ------------------------------------------------------------------

    /// Sets the value of a leaf.
    ///
    /// # Errors
    ///
    /// - [`PropertyError::ShadowMutation`] on a shadow property
    /// - [`PropertyError::TypeMismatch`] when the scalar kind differs
    pub fn set_value(&mut self, leaf: NodeId, value: impl Into<PropValue>) -> Result<(), PropertyError> {
        self.assert_not_shadow_mutable(leaf)?;
        self.set_value_unchecked(leaf, value.into())
    }

    pub(crate) fn set_value_unchecked(&mut self, leaf: NodeId, value: PropValue) -> Result<(), PropertyError> {
        let old = match &mut self.node_mut(leaf)?.data {
            NodeData::Leaf(current) => {
                if current.kind() != value.kind() {
                    return Err(PropertyError::TypeMismatch {
                        expected: ContainerKind::Leaf(current.kind()),
                        actual: ContainerKind::Leaf(value.kind()),
                    });
                }
                std::mem::replace(current, value.clone())
            }
            other => {
                return Err(PropertyError::NotAContainer {
                    expected: "leaf",
                    actual: other.kind(),
                })
            }
        };

        let old = WireValue::Scalar(old);
        let new = WireValue::Scalar(value);
        if let Some(observer) = self.observer(leaf) {
            observer.on_set_value(Some(&old), &new);
        }
        self.notify_change(leaf, SyncOperation::SetValue, SyncType::PlaintAndComposite, SyncArg::Value(new))
    }

    // ------------------------------------------------------------------
    // List
    // ------------------------------------------------------------------

    fn list_items_mut(&mut self, list: NodeId) -> Result<&mut Vec<NodeId>, PropertyError> {
        match &mut self.node_mut(list)?.data {
            NodeData::List(items) => Ok(items),
            other => Err(PropertyError::NotAContainer {
                expected: "list",
                actual: other.kind(),
            }),
        }
    }

    /// Appends a free-standing container to a list.
    pub fn list_add(&mut self, list: NodeId, child: NodeId) -> Result<(), PropertyError> {
        self.assert_not_shadow_mutable(list)?;
        self.list_add_unchecked(list, child)
    }

    /// Appends a new leaf holding `value`.
    pub fn list_add_value(&mut self, list: NodeId, value: impl Into<PropValue>) -> Result<NodeId, PropertyError> {
        self.assert_not_shadow_mutable(list)?;
        self.list_items(list)?;
        let child = self.new_leaf(value);
        self.list_add_unchecked(list, child)?;
        Ok(child)
    }

    pub(crate) fn list_add_unchecked(&mut self, list: NodeId, child: NodeId) -> Result<(), PropertyError> {
        self.list_items(list)?;
        self.ensure_attachable(child, list)?;

        let owner = self.node(list)?.top_owner;
        let items = self.list_items_mut(list)?;
        let index = items.len();
        items.push(child);
        self.insert_to_prop_tree(child, list, index.to_string(), owner)?;

        let value = self.to_wire(child)?;
        if let Some(observer) = self.observer(list) {
            observer.on_add_elem(index, &value);
        }
        self.notify_change(
            list,
            SyncOperation::AddListElem,
            SyncType::List,
            SyncArg::IndexedValue(index, value),
        )
    }

    /// Inserts a free-standing container at `index`, shifting later elements.
    pub fn list_insert(&mut self, list: NodeId, index: usize, child: NodeId) -> Result<(), PropertyError> {
        self.assert_not_shadow_mutable(list)?;
        self.list_insert_unchecked(list, index, child)
    }

    pub(crate) fn list_insert_unchecked(&mut self, list: NodeId, index: usize, child: NodeId) -> Result<(), PropertyError> {
        let len = self.list_items(list)?.len();
        if index > len {
            return Err(PropertyError::IndexOutOfRange { index, len });
        }
        self.ensure_attachable(child, list)?;

        let owner = self.node(list)?.top_owner;
        self.list_items_mut(list)?.insert(index, child);
        self.insert_to_prop_tree(child, list, index.to_string(), owner)?;
        self.rename_list_children(list, index + 1)?;

        let value = self.to_wire(child)?;
        if let Some(observer) = self.observer(list) {
            observer.on_insert_item(index, &value);
        }
        self.notify_change(
            list,
            SyncOperation::InsertElem,
            SyncType::List,
            SyncArg::IndexedValue(index, value),
        )
    }

    /// Replaces the element at `index`. The previous element is released.
    pub fn list_set(&mut self, list: NodeId, index: usize, child: NodeId) -> Result<(), PropertyError> {
        self.assert_not_shadow_mutable(list)?;
        self.list_set_unchecked(list, index, child)
    }

    pub(crate) fn list_set_unchecked(&mut self, list: NodeId, index: usize, child: NodeId) -> Result<(), PropertyError> {
        let old_child = self.list_get(list, index)?;
        self.ensure_attachable(child, list)?;

        let old = self.to_wire(old_child)?;
        let owner = self.node(list)?.top_owner;
        self.list_items_mut(list)?[index] = child;
        self.remove_from_prop_tree(old_child)?;
        self.free_subtree(old_child);
        self.insert_to_prop_tree(child, list, index.to_string(), owner)?;

        let new = self.to_wire(child)?;
        if let Some(observer) = self.observer(list) {
            observer.on_update_pair(&DictKey::Int(index as i64), Some(&old), &new);
        }
        self.notify_change(
            list,
            SyncOperation::SetValue,
            SyncType::List,
            SyncArg::IndexedValue(index, new),
        )
    }

    /// Removes and releases the element at `index`.
    pub fn list_remove_at(&mut self, list: NodeId, index: usize) -> Result<(), PropertyError> {
        self.assert_not_shadow_mutable(list)?;
        let child = self.list_detach_at(list, index)?;
        self.free_subtree(child);
        Ok(())
    }

    /// Removes the element at `index` and hands it back free-standing, so it
    /// can be inserted elsewhere.
    pub fn list_take_at(&mut self, list: NodeId, index: usize) -> Result<NodeId, PropertyError> {
        self.assert_not_shadow_mutable(list)?;
        self.list_detach_at(list, index)
    }

    pub(crate) fn list_remove_at_unchecked(&mut self, list: NodeId, index: usize) -> Result<(), PropertyError> {
        let child = self.list_detach_at(list, index)?;
        self.free_subtree(child);
        Ok(())
    }

    fn list_detach_at(&mut self, list: NodeId, index: usize) -> Result<NodeId, PropertyError> {
        let child = self.list_get(list, index)?;
        let old = self.to_wire(child)?;

        self.list_items_mut(list)?.remove(index);
        self.remove_from_prop_tree(child)?;
        self.rename_list_children(list, index)?;

        if let Some(observer) = self.observer(list) {
            observer.on_remove_elem(&DictKey::Int(index as i64), &old);
        }
        self.notify_change(list, SyncOperation::RemoveElem, SyncType::List, SyncArg::Index(index))?;
        Ok(child)
    }

    /// Removes and releases every element.
    pub fn list_clear(&mut self, list: NodeId) -> Result<(), PropertyError> {
        self.assert_not_shadow_mutable(list)?;
        self.list_clear_unchecked(list)
    }

    pub(crate) fn list_clear_unchecked(&mut self, list: NodeId) -> Result<(), PropertyError> {
        let items = std::mem::take(self.list_items_mut(list)?);
        for child in items {
            self.remove_from_prop_tree(child)?;
            self.free_subtree(child);
        }

        if let Some(observer) = self.observer(list) {
            observer.on_clear();
        }
        self.notify_change(list, SyncOperation::Clear, SyncType::List, SyncArg::None)
    }

    // ------------------------------------------------------------------
    // Dict
    // ------------------------------------------------------------------

    /// Checks `key` against the dictionary's key type, fixing the key type on
    /// first insertion.
    pub(super) fn check_dict_key(&mut self, dict: NodeId, key: &DictKey) -> Result<(), PropertyError> {
        match &mut self.node_mut(dict)?.data {
            NodeData::Dict { key_kind, .. } => match key_kind {
                Some(kind) if *kind != key.kind() => Err(PropertyError::InvalidKeyType(format!(
                    "expected {}, got {}",
                    kind,
                    key.kind()
                ))),
                Some(_) => Ok(()),
                None => {
                    *key_kind = Some(key.kind());
                    Ok(())
                }
            },
            other => Err(PropertyError::NotAContainer {
                expected: "dict",
                actual: other.kind(),
            }),
        }
    }

    /// Inserts or replaces the entry under `key`. A replaced entry is released.
    pub fn dict_update(&mut self, dict: NodeId, key: impl Into<DictKey>, child: NodeId) -> Result<(), PropertyError> {
        self.assert_not_shadow_mutable(dict)?;
        let key = key.into();
        let new = self.dict_put(dict, key.clone(), child)?;
        self.notify_change(dict, SyncOperation::UpdatePair, SyncType::Dict, SyncArg::Pair(key, new))
    }

    /// Inserts or replaces the entry under `key` with a new leaf.
    pub fn dict_update_value(
        &mut self,
        dict: NodeId,
        key: impl Into<DictKey>,
        value: impl Into<PropValue>,
    ) -> Result<NodeId, PropertyError> {
        self.assert_not_shadow_mutable(dict)?;
        self.dict_entries(dict)?;
        let child = self.new_leaf(value);
        if let Err(e) = self.dict_update(dict, key, child) {
            if self.node(child).map(|n| n.parent.is_none()).unwrap_or(false) {
                self.free_subtree(child);
            }
            return Err(e);
        }
        Ok(child)
    }

    /// Writes several entries and reports them as one batch.
    pub fn dict_update_many(&mut self, dict: NodeId, entries: Vec<(DictKey, NodeId)>) -> Result<(), PropertyError> {
        self.assert_not_shadow_mutable(dict)?;
        self.dict_update_many_unchecked(dict, entries)
    }

    pub(crate) fn dict_update_many_unchecked(
        &mut self,
        dict: NodeId,
        entries: Vec<(DictKey, NodeId)>,
    ) -> Result<(), PropertyError> {
        let mut pairs = Vec::with_capacity(entries.len());
        for (key, child) in entries {
            let value = self.dict_put(dict, key.clone(), child)?;
            pairs.push((key, value));
        }

        match pairs.len() {
            0 => Ok(()),
            1 => {
                let (key, value) = pairs.remove(0);
                self.notify_change(dict, SyncOperation::UpdatePair, SyncType::Dict, SyncArg::Pair(key, value))
            }
            _ => self.notify_change(dict, SyncOperation::UpdateDict, SyncType::Dict, SyncArg::Pairs(pairs)),
        }
    }

    pub(crate) fn dict_update_unchecked(&mut self, dict: NodeId, key: DictKey, child: NodeId) -> Result<(), PropertyError> {
        self.dict_update_many_unchecked(dict, vec![(key, child)])
    }

    /// Structural part of an update plus the observer callback. Returns the
    /// wire form of the new entry.
    fn dict_put(&mut self, dict: NodeId, key: DictKey, child: NodeId) -> Result<WireValue, PropertyError> {
        self.dict_entries(dict)?;
        self.ensure_attachable(child, dict)?;
        self.check_dict_key(dict, &key)?;

        let owner = self.node(dict)?.top_owner;
        let replaced = match &mut self.node_mut(dict)?.data {
            NodeData::Dict { entries, .. } => entries.insert(key.clone(), child),
            _ => None,
        };

        let old = match replaced {
            Some(old_child) => {
                let old = self.to_wire(old_child)?;
                self.remove_from_prop_tree(old_child)?;
                self.free_subtree(old_child);
                Some(old)
            }
            None => None,
        };
        self.insert_to_prop_tree(child, dict, key.to_segment(), owner)?;

        let new = self.to_wire(child)?;
        if let Some(observer) = self.observer(dict) {
            observer.on_update_pair(&key, old.as_ref(), &new);
        }
        Ok(new)
    }

    /// Removes and releases the entry under `key`. Returns `false` without
    /// notifying when the key is absent.
    pub fn dict_remove(&mut self, dict: NodeId, key: &DictKey) -> Result<bool, PropertyError> {
        self.assert_not_shadow_mutable(dict)?;
        self.dict_remove_unchecked(dict, key)
    }

    pub(crate) fn dict_remove_unchecked(&mut self, dict: NodeId, key: &DictKey) -> Result<bool, PropertyError> {
        match self.dict_detach(dict, key)? {
            Some(child) => {
                self.free_subtree(child);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes the entry under `key` and hands it back free-standing.
    pub fn dict_take(&mut self, dict: NodeId, key: &DictKey) -> Result<Option<NodeId>, PropertyError> {
        self.assert_not_shadow_mutable(dict)?;
        self.dict_detach(dict, key)
    }

    fn dict_detach(&mut self, dict: NodeId, key: &DictKey) -> Result<Option<NodeId>, PropertyError> {
        let Some(child) = self.dict_get(dict, key)? else {
            return Ok(None);
        };
        let old = self.to_wire(child)?;

        if let NodeData::Dict { entries, .. } = &mut self.node_mut(dict)?.data {
            entries.remove(key);
        }
        self.remove_from_prop_tree(child)?;

        if let Some(observer) = self.observer(dict) {
            observer.on_remove_elem(key, &old);
        }
        self.notify_change(dict, SyncOperation::RemoveElem, SyncType::Dict, SyncArg::Key(key.clone()))?;
        Ok(Some(child))
    }

    /// Removes and releases every entry.
    pub fn dict_clear(&mut self, dict: NodeId) -> Result<(), PropertyError> {
        self.assert_not_shadow_mutable(dict)?;
        self.dict_clear_unchecked(dict)
    }

    pub(crate) fn dict_clear_unchecked(&mut self, dict: NodeId) -> Result<(), PropertyError> {
        let children: Vec<NodeId> = match &mut self.node_mut(dict)?.data {
            NodeData::Dict { entries, .. } => std::mem::take(entries).into_values().collect(),
            other => {
                return Err(PropertyError::NotAContainer {
                    expected: "dict",
                    actual: other.kind(),
                })
            }
        };
        for child in children {
            self.remove_from_prop_tree(child)?;
            self.free_subtree(child);
        }

        if let Some(observer) = self.observer(dict) {
            observer.on_clear();
        }
        self.notify_change(dict, SyncOperation::Clear, SyncType::Dict, SyncArg::None)
    }

    // ------------------------------------------------------------------
    // Whole-container assignment
    // ------------------------------------------------------------------

    /// Replaces the contents of `target` with those of the free-standing
    /// `source`, which is consumed.
    ///
    /// `target` keeps its identity, name, parent and observers; the moved
    /// children are re-owned by `target`'s property.
    ///
    /// # Errors
    ///
    /// [`PropertyError::TypeMismatch`] when the two containers have different
    /// concrete kinds.
    pub fn assign(&mut self, target: NodeId, source: NodeId) -> Result<(), PropertyError> {
        self.assert_not_shadow_mutable(target)?;
        self.assign_unchecked(target, source)
    }

    pub(crate) fn assign_unchecked(&mut self, target: NodeId, source: NodeId) -> Result<(), PropertyError> {
        let expected = self.kind_of(target)?;
        let actual = self.kind_of(source)?;
        if expected != actual {
            return Err(PropertyError::TypeMismatch { expected, actual });
        }
        self.ensure_attachable(source, target)?;

        let old = self.to_wire(target)?;
        let owner = self.node(target)?.top_owner;

        let moved = std::mem::replace(&mut self.node_mut(source)?.data, NodeData::List(Vec::new()));
        let released = std::mem::replace(&mut self.node_mut(target)?.data, moved).children();
        for child in released {
            self.remove_from_prop_tree(child)?;
            self.free_subtree(child);
        }
        for (name, child) in self.children(target)? {
            self.insert_to_prop_tree(child, target, name, owner)?;
        }
        self.free_subtree(source);

        let new = self.to_wire(target)?;
        if let Some(observer) = self.observer(target) {
            observer.on_set_value(Some(&old), &new);
        }
        let sync_type = self.sync_type_of(target)?;
        self.notify_change(target, SyncOperation::SetValue, sync_type, SyncArg::Value(new))
    }
}
