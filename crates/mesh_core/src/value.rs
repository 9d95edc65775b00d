//! Scalar values, dictionary keys and the wire representation of property subtrees.

use crate::error::PropertyError;
use crate::mailbox::MailBox;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The scalar types a leaf container may hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum PropValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    MailBox(MailBox),
}

impl PropValue {
    /// Returns the scalar kind of this value.
    pub fn kind(&self) -> ScalarKind {
        match self {
            PropValue::Int(_) => ScalarKind::Int,
            PropValue::Float(_) => ScalarKind::Float,
            PropValue::Str(_) => ScalarKind::Str,
            PropValue::Bool(_) => ScalarKind::Bool,
            PropValue::MailBox(_) => ScalarKind::MailBox,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            PropValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_mailbox(&self) -> Option<&MailBox> {
        match self {
            PropValue::MailBox(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<i32> for PropValue {
    fn from(v: i32) -> Self {
        PropValue::Int(v as i64)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Float(v)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Str(v.to_string())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Str(v)
    }
}

impl From<MailBox> for PropValue {
    fn from(v: MailBox) -> Self {
        PropValue::MailBox(v)
    }
}

/// Scalar type tag, used for type checks on leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Int,
    Float,
    Str,
    Bool,
    MailBox,
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarKind::Int => "int",
            ScalarKind::Float => "float",
            ScalarKind::Str => "string",
            ScalarKind::Bool => "bool",
            ScalarKind::MailBox => "mailbox",
        };
        f.write_str(name)
    }
}

/// Key of a dictionary container. Only ints, strings and mailboxes are allowed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum DictKey {
    Int(i64),
    Str(String),
    MailBox(MailBox),
}

impl DictKey {
    /// The child name used for this key in notification paths.
    pub fn to_segment(&self) -> String {
        match self {
            DictKey::Int(v) => v.to_string(),
            DictKey::Str(v) => v.clone(),
            DictKey::MailBox(mb) => mb.to_string(),
        }
    }

    pub fn kind(&self) -> ScalarKind {
        match self {
            DictKey::Int(_) => ScalarKind::Int,
            DictKey::Str(_) => ScalarKind::Str,
            DictKey::MailBox(_) => ScalarKind::MailBox,
        }
    }
}

impl fmt::Display for DictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_segment())
    }
}

impl TryFrom<PropValue> for DictKey {
    type Error = PropertyError;

    fn try_from(value: PropValue) -> Result<Self, Self::Error> {
        match value {
            PropValue::Int(v) => Ok(DictKey::Int(v)),
            PropValue::Str(v) => Ok(DictKey::Str(v)),
            PropValue::MailBox(v) => Ok(DictKey::MailBox(v)),
            other => Err(PropertyError::InvalidKeyType(other.kind().to_string())),
        }
    }
}

impl From<&str> for DictKey {
    fn from(v: &str) -> Self {
        DictKey::Str(v.to_string())
    }
}

impl From<String> for DictKey {
    fn from(v: String) -> Self {
        DictKey::Str(v)
    }
}

impl From<i64> for DictKey {
    fn from(v: i64) -> Self {
        DictKey::Int(v)
    }
}

impl From<MailBox> for DictKey {
    fn from(v: MailBox) -> Self {
        DictKey::MailBox(v)
    }
}

/// Expected shape of a container, used when decoding and when assigning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerKind {
    Leaf(ScalarKind),
    List,
    Dict,
    Composite(String),
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Leaf(kind) => write!(f, "leaf<{kind}>"),
            ContainerKind::List => f.write_str("list"),
            ContainerKind::Dict => f.write_str("dict"),
            ContainerKind::Composite(name) => write!(f, "composite<{name}>"),
        }
    }
}

/// Serializable snapshot of a container subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum WireValue {
    Scalar(PropValue),
    List(Vec<WireValue>),
    Dict(Vec<(DictKey, WireValue)>),
    Composite {
        type_name: String,
        fields: Vec<(String, WireValue)>,
    },
}

impl WireValue {
    /// Returns the container kind this value decodes into.
    pub fn kind(&self) -> ContainerKind {
        match self {
            WireValue::Scalar(v) => ContainerKind::Leaf(v.kind()),
            WireValue::List(_) => ContainerKind::List,
            WireValue::Dict(_) => ContainerKind::Dict,
            WireValue::Composite { type_name, .. } => ContainerKind::Composite(type_name.clone()),
        }
    }

    pub fn as_scalar(&self) -> Option<&PropValue> {
        match self {
            WireValue::Scalar(v) => Some(v),
            _ => None,
        }
    }
}

impl From<PropValue> for WireValue {
    fn from(v: PropValue) -> Self {
        WireValue::Scalar(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dict_key_conversion() {
        assert_eq!(DictKey::try_from(PropValue::Int(3)).unwrap(), DictKey::Int(3));
        assert_eq!(
            DictKey::try_from(PropValue::from("a")).unwrap(),
            DictKey::Str("a".to_string())
        );

        let err = DictKey::try_from(PropValue::Float(1.5)).unwrap_err();
        assert!(matches!(err, PropertyError::InvalidKeyType(ref k) if k == "float"));
        assert!(DictKey::try_from(PropValue::Bool(true)).is_err());
    }

    #[test]
    fn test_wire_value_kind() {
        let composite = WireValue::Composite {
            type_name: "Position".to_string(),
            fields: vec![("x".to_string(), WireValue::Scalar(PropValue::Float(1.0)))],
        };
        assert_eq!(composite.kind(), ContainerKind::Composite("Position".to_string()));
        assert_eq!(WireValue::List(vec![]).kind(), ContainerKind::List);
        assert_eq!(
            WireValue::Scalar(PropValue::from("x")).kind(),
            ContainerKind::Leaf(ScalarKind::Str)
        );
    }
}
