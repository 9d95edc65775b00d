//! Static registration of composite container types.
//!
//! Each composite type lists its replicated fields once, up front. The same
//! table doubles as the decode factory: a wire value naming a type that was
//! never registered cannot be rebuilt.

use crate::error::PropertyError;
use crate::value::{ContainerKind, PropValue};
use std::collections::{HashMap, HashSet};

/// Shape of a declared field or property.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Scalar leaf with its initial value
    Leaf(PropValue),
    List,
    Dict,
    /// Nested composite, by registered type name
    Composite(String),
}

impl FieldKind {
    pub fn container_kind(&self) -> ContainerKind {
        match self {
            FieldKind::Leaf(v) => ContainerKind::Leaf(v.kind()),
            FieldKind::List => ContainerKind::List,
            FieldKind::Dict => ContainerKind::Dict,
            FieldKind::Composite(name) => ContainerKind::Composite(name.clone()),
        }
    }
}

/// Declared layout of a composite container type.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeDescriptor {
    pub type_name: String,
    pub fields: Vec<(String, FieldKind)>,
}

impl CompositeDescriptor {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Adds a replicated field.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push((name.into(), kind));
        self
    }

    pub fn field_kind(&self, name: &str) -> Option<&FieldKind> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, k)| k)
    }
}

/// Table of registered composite types.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    types: HashMap<String, CompositeDescriptor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a composite type.
    ///
    /// Nested composite fields must name types that are already registered,
    /// which also rules out self-referencing layouts.
    ///
    /// # Errors
    ///
    /// [`PropertyError::InvalidDeclaration`] for an empty or duplicate type
    /// name, an empty or duplicate field name, or a nested type that is not
    /// registered yet.
    pub fn register(&mut self, descriptor: CompositeDescriptor) -> Result<(), PropertyError> {
        if descriptor.type_name.is_empty() {
            return Err(PropertyError::InvalidDeclaration("empty composite type name".to_string()));
        }
        if self.types.contains_key(&descriptor.type_name) {
            return Err(PropertyError::InvalidDeclaration(format!(
                "composite type '{}' registered twice",
                descriptor.type_name
            )));
        }

        let mut seen = HashSet::new();
        for (name, kind) in &descriptor.fields {
            if name.is_empty() {
                return Err(PropertyError::InvalidDeclaration(format!(
                    "empty field name in '{}'",
                    descriptor.type_name
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(PropertyError::InvalidDeclaration(format!(
                    "field '{}' declared twice in '{}'",
                    name, descriptor.type_name
                )));
            }
            if let FieldKind::Composite(nested) = kind {
                if !self.types.contains_key(nested) {
                    return Err(PropertyError::InvalidDeclaration(format!(
                        "field '{}' of '{}' refers to unregistered type '{}'",
                        name, descriptor.type_name, nested
                    )));
                }
            }
        }

        self.types.insert(descriptor.type_name.clone(), descriptor);
        Ok(())
    }

    /// Looks up a composite type.
    pub fn get(&self, type_name: &str) -> Result<&CompositeDescriptor, PropertyError> {
        self.types
            .get(type_name)
            .ok_or_else(|| PropertyError::UnregisteredType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = TypeRegistry::new();
        registry
            .register(
                CompositeDescriptor::new("Position")
                    .field("x", FieldKind::Leaf(PropValue::Float(0.0)))
                    .field("y", FieldKind::Leaf(PropValue::Float(0.0))),
            )
            .unwrap();
        registry
            .register(
                CompositeDescriptor::new("Avatar")
                    .field("pos", FieldKind::Composite("Position".to_string()))
                    .field("tags", FieldKind::List),
            )
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("Avatar").unwrap().fields.len(), 2);
        assert!(matches!(registry.get("Missing"), Err(PropertyError::UnregisteredType(_))));
    }

    #[test]
    fn test_invalid_declarations() {
        let mut registry = TypeRegistry::new();

        let dup_field = CompositeDescriptor::new("Bad")
            .field("a", FieldKind::List)
            .field("a", FieldKind::Dict);
        assert!(matches!(registry.register(dup_field), Err(PropertyError::InvalidDeclaration(_))));

        let self_ref = CompositeDescriptor::new("Node").field("next", FieldKind::Composite("Node".to_string()));
        assert!(matches!(registry.register(self_ref), Err(PropertyError::InvalidDeclaration(_))));

        registry.register(CompositeDescriptor::new("Ok")).unwrap();
        assert!(registry.register(CompositeDescriptor::new("Ok")).is_err());
    }
}
