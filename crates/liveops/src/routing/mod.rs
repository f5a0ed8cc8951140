//! Action routing: templated rules that derive a resource key (for sharding)
//! and channel names (for fan-out) from an action.

pub mod mapping;
pub mod mapping_set;
pub mod rule;

pub use mapping::{ActionMapping, CustomMapper, SerializedActionMapping};
pub use mapping_set::{ActionMappingSet, SerializedActionMappingSet};
pub use rule::{MappingRule, PathStep};
