//! # Replicated Properties
//!
//! Typed, observable state trees attached to entities. Authoritative
//! properties report every committed mutation to their owner, which turns it
//! into a sync delta; shadow properties mirror a remote authoritative copy and
//! only change through [`PropertyTree::apply_sync_command`].
//!
//! ## Example
//!
//! ```rust
//! use mesh_core::property::{FieldKind, PropertyDecl, PropertyTree, TypeRegistry};
//! use std::sync::Arc;
//!
//! let mut tree = PropertyTree::new(Arc::new(TypeRegistry::new()));
//! let id = tree.declare_property(PropertyDecl::new("inventory", FieldKind::List)).unwrap();
//! let inventory = tree.root(id).unwrap();
//!
//! tree.list_add_value(inventory, "sword").unwrap();
//! assert_eq!(tree.list_len(inventory).unwrap(), 1);
//! ```

pub mod notify;
pub mod observer;
pub mod registry;
mod tree;

pub use notify::{PropertyInfo, PropertyNotification, PropertyOwner, PropertySetting, SyncArg, SyncPolicy};
pub use observer::{CallbackObserver, ContainerObserver};
pub use registry::{CompositeDescriptor, FieldKind, TypeRegistry};
pub use tree::{NodeId, PropertyDecl, PropertyId, PropertyTree, RawValue};
