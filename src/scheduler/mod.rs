//! Control-side fleet state and placement.
//!
//! - [`FleetRegistry`]: node id → capacity, status and labels, fed by heartbeats
//! - [`RunStore`]: every run and its lifecycle
//! - [`LeastLoadedScheduler`]: picks the viable node with the most free slots

pub mod assigner;
pub mod node;
pub mod registry;
pub mod run;
pub mod run_store;

pub use assigner::{LeastLoadedScheduler, NodeLoad};
pub use node::{Node, NodeCapacity, NodeState, NodeStatus};
pub use registry::FleetRegistry;
pub use run::{Run, RunCosts, RunErrorInfo, RunStatus, RunTimings};
pub use run_store::RunStore;
