//! Conversion between container subtrees and [`WireValue`] snapshots.

use super::{NodeData, NodeId, PropertyTree};
use crate::codec;
use crate::error::PropertyError;
use crate::value::{ContainerKind, DictKey, WireValue};

impl PropertyTree {
    /// Snapshots a subtree.
    pub fn to_wire(&self, id: NodeId) -> Result<WireValue, PropertyError> {
        Ok(match &self.node(id)?.data {
            NodeData::Leaf(v) => WireValue::Scalar(v.clone()),
            NodeData::List(items) => WireValue::List(
                items
                    .iter()
                    .map(|child| self.to_wire(*child))
                    .collect::<Result<_, _>>()?,
            ),
            NodeData::Dict { entries, .. } => WireValue::Dict(
                entries
                    .iter()
                    .map(|(key, child)| Ok((key.clone(), self.to_wire(*child)?)))
                    .collect::<Result<_, PropertyError>>()?,
            ),
            NodeData::Composite { type_name, fields } => WireValue::Composite {
                type_name: type_name.clone(),
                fields: fields
                    .iter()
                    .map(|(name, child)| Ok((name.clone(), self.to_wire(*child)?)))
                    .collect::<Result<_, PropertyError>>()?,
            },
        })
    }

    /// Rebuilds a free-standing subtree from a snapshot.
    ///
    /// Composite fields missing from the snapshot keep their declared initial
    /// values. Nothing is left allocated when this fails.
    ///
    /// # Errors
    ///
    /// - [`PropertyError::UnregisteredType`] for an unknown composite type
    /// - [`PropertyError::TypeMismatch`] when a composite field has the wrong shape
    /// - [`PropertyError::InvalidKeyType`] for mixed dictionary key types
    pub fn from_wire(&mut self, value: &WireValue) -> Result<NodeId, PropertyError> {
        match value {
            WireValue::Scalar(v) => Ok(self.new_leaf(v.clone())),
            WireValue::List(items) => {
                let list = self.new_list();
                for item in items {
                    let attached = self.from_wire(item).and_then(|child| {
                        let index = match &mut self.node_mut(list)?.data {
                            NodeData::List(children) => {
                                children.push(child);
                                children.len() - 1
                            }
                            _ => 0,
                        };
                        self.insert_to_prop_tree(child, list, index.to_string(), None)
                    });
                    if let Err(e) = attached {
                        self.free_subtree(list);
                        return Err(e);
                    }
                }
                Ok(list)
            }
            WireValue::Dict(entries) => {
                let dict = self.new_dict();
                for (key, item) in entries {
                    if let Err(e) = self.from_wire_entry(dict, key, item) {
                        self.free_subtree(dict);
                        return Err(e);
                    }
                }
                Ok(dict)
            }
            WireValue::Composite { type_name, fields } => {
                let composite = self.new_composite(type_name)?;
                for (name, item) in fields {
                    if let Err(e) = self.from_wire_field(composite, name, item) {
                        self.free_subtree(composite);
                        return Err(e);
                    }
                }
                Ok(composite)
            }
        }
    }

    fn from_wire_entry(&mut self, dict: NodeId, key: &DictKey, item: &WireValue) -> Result<(), PropertyError> {
        self.check_dict_key(dict, key)?;
        let child = self.from_wire(item)?;
        if let NodeData::Dict { entries, .. } = &mut self.node_mut(dict)?.data {
            if let Some(previous) = entries.insert(key.clone(), child) {
                self.free_subtree(previous);
            }
        }
        self.insert_to_prop_tree(child, dict, key.to_segment(), None)
    }

    fn from_wire_field(&mut self, composite: NodeId, name: &str, item: &WireValue) -> Result<(), PropertyError> {
        let current = self.field(composite, name)?;
        let expected = self.kind_of(current)?;
        let actual = item.kind();
        if expected != actual {
            return Err(PropertyError::TypeMismatch { expected, actual });
        }

        let child = self.from_wire(item)?;
        if let NodeData::Composite { fields, .. } = &mut self.node_mut(composite)?.data {
            if let Some(slot) = fields.iter_mut().find(|(n, _)| n == name) {
                slot.1 = child;
            }
        }
        self.free_subtree(current);
        self.node_mut(child)?.permanent = true;
        self.insert_to_prop_tree(child, composite, name.to_string(), None)
    }

    /// Rebuilds a subtree and checks it has the expected shape.
    pub fn from_wire_expected(&mut self, value: &WireValue, expected: &ContainerKind) -> Result<NodeId, PropertyError> {
        let actual = value.kind();
        if actual != *expected {
            return Err(PropertyError::TypeMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        self.from_wire(value)
    }

    /// Serializes a subtree.
    pub fn encode(&self, id: NodeId) -> Result<Vec<u8>, PropertyError> {
        Ok(codec::encode(&self.to_wire(id)?)?)
    }

    /// Deserializes bytes produced by [`Self::encode`] into a free-standing
    /// subtree of the expected shape.
    pub fn decode(&mut self, bytes: &[u8], expected: &ContainerKind) -> Result<NodeId, PropertyError> {
        let value: WireValue = codec::decode(bytes)?;
        self.from_wire_expected(&value, expected)
    }
}
