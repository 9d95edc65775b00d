//! Cluster membership: the host manager and each instance's view of the
//! registration protocol.

pub mod bootstrap;
pub mod host_manager;

pub use bootstrap::{BootstrapAction, BootstrapCore, BootstrapState, ClusterView};
pub use host_manager::{BarrierTarget, HostManager, HostManagerCore, InstanceRecord, InstanceStatus, Outbound};
