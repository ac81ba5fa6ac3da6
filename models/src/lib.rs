//! Shared resource types for the cluster sizing control plane.
//!
//! Every resource the controllers watch or mutate is defined here so that the
//! store and the controllers agree on a single shape. Serialization uses the
//! camelCase wire form throughout.

pub mod autoscaling;
pub mod cluster;
pub mod meta;
pub mod quantity;
pub mod secret;
pub mod sizing;

pub use meta::{find_condition, set_condition, Condition, ConditionStatus, ObjectMeta};
pub use quantity::Quantity;
