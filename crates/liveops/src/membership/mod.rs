//! Cluster membership: the coordinator that tracks live services and groups,
//! and the bus protocol it speaks with service instances.

pub mod coordinator;
pub mod messages;
pub mod partition;
pub mod table;

pub use coordinator::{Coordinator, CoordinatorEvent};
pub use messages::{BusMessage, ManagedService, ServiceGroup, ServiceInfo, ServiceMetadata, SystemStatus};
pub use partition::PartitionAssigner;
pub use table::{MembershipTable, TableEvent};
