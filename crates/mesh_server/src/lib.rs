//! # Mesh Server - Cluster Runtime
//!
//! The networked half of the entity mesh. Where `mesh_core` defines property
//! trees, sync deltas and the message model, this crate moves those messages
//! between processes and keeps the cluster together.
//!
//! ## Roles
//!
//! * **Host manager** - Registration, the mailbox sync barrier, heartbeats and
//!   serialized restarts ([`cluster::HostManager`])
//! * **Gate** - Client-facing edge; routes between clients, servers, other
//!   gates and the service manager
//! * **Server** - Hosts authoritative entities and replicates their
//!   properties through the time circle
//! * **Service manager** - Cluster-wide services reached through the gates
//!
//! ## Message Flow
//!
//! 1. An instance binds its listener and registers with the host manager
//! 2. Once the configured membership is present the host manager sends every
//!    instance the gate, server and service manager mailboxes
//! 3. Gates dial their peers and open the client port
//! 4. RPCs are routed by mailbox: local entities are dispatched in place,
//!    everything else is forwarded one hop closer to its target
//! 5. Property changes on servers are batched by the time circle and routed
//!    to shadows and clients the same way
//!
//! ## Error Handling
//!
//! Drivers report [`ServerError`]; lower layers use [`TransportError`] and
//! [`ClusterError`]. Routing and authority failures never surface as errors
//! to the remote caller: they are logged and the message is dropped.
//!
//! ## Thread Safety
//!
//! * Registration and bootstrap state is owned by one task per process
//! * Connections, peers and entities live in `DashMap`s
//! * Property trees are guarded per entity

pub mod client;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod logging;
pub mod roles;
pub mod routing;
pub mod shutdown;
pub mod transport;

pub use client::{ClientPush, MeshClient};
pub use cluster::HostManager;
pub use config::{load_config, MeshConfig};
pub use entity::{EntityKind, EntityRegistry, LocalEntity, RpcMethodTable};
pub use error::{ClusterError, ServerError, TransportError};
pub use roles::{Instance, Node};
