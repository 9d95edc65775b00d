//! # Mesh Core
//!
//! The transport-free half of the entity mesh: replicated property trees, the
//! delta model that keeps shadow copies in step with authoritative ones, the
//! delay scheduler that batches those deltas, and the message model for
//! mailbox-addressed RPC and cluster control.
//!
//! ## Core Features
//!
//! - **Property Trees**: Arena-backed containers (leaf, list, dictionary,
//!   composite) with per-container observers and owner notification
//! - **Shadow Safety**: Replicated mirrors reject local mutation and only
//!   change by applying received deltas
//! - **Delta Scheduling**: A time circle that preserves order or coalesces per
//!   path, fed from any thread
//! - **RPC Model**: Authority checks, reply channels and awaited-call bookkeeping
//! - **Serialization**: JSON packages for every message on the wire
//!
//! ## Data Flow
//!
//! ```text
//! entity mutates a property
//!   -> PropertyTree notifies the property's owner (SyncPublisher)
//!   -> SyncMessage built per subscriber
//!   -> TimeCircle buffers / coalesces
//!   -> tick releases one PropertySyncCommandList per mailbox
//!   -> shadow PropertyTree applies the commands
//! ```
//!
//! ## Quick Start Example
//!
//! ```rust
//! use mesh_core::mailbox::MailBox;
//! use mesh_core::property::{FieldKind, PropertyDecl, PropertyTree, TypeRegistry};
//! use mesh_core::sync::{SubscriberKind, SyncPublisher, TimeCircle, TimeCircleConfig};
//! use std::sync::Arc;
//!
//! let mut circle = TimeCircle::new(TimeCircleConfig::default());
//! let publisher = Arc::new(SyncPublisher::new(circle.handle()));
//! publisher.subscribe(MailBox::new("avatar_1", "10.0.0.2", 7100, 1), SubscriberKind::Shadow);
//!
//! let registry = Arc::new(TypeRegistry::new());
//! let mut authority = PropertyTree::new(registry.clone());
//! let id = authority.declare_property(PropertyDecl::new("inventory", FieldKind::List)).unwrap();
//! authority.set_owner(id, publisher);
//!
//! let inventory = authority.root(id).unwrap();
//! authority.list_add_value(inventory, "sword").unwrap();
//!
//! let mut shadow = PropertyTree::new(registry);
//! shadow.declare_property(PropertyDecl::new("inventory", FieldKind::List).shadow()).unwrap();
//!
//! circle.tick(1000, |_mailbox, commands| {
//!     shadow.apply_sync_commands(&commands).unwrap();
//! });
//! assert_eq!(shadow.list_len(shadow.root_of("inventory").unwrap()).unwrap(), 1);
//! ```

pub mod codec;
pub mod error;
pub mod id;
pub mod mailbox;
pub mod property;
pub mod protocol;
pub mod rpc;
pub mod sync;
pub mod utils;
pub mod value;

pub use error::{PropertyError, RpcError};
pub use mailbox::MailBox;
pub use protocol::{InstanceRole, Package, PackageType};
pub use value::{ContainerKind, DictKey, PropValue, ScalarKind, WireValue};
