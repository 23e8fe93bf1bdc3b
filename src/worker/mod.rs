//! Worker side of the fleet.
//!
//! A worker advertises a fixed number of execution slots and keeps two loops
//! running against the control plane:
//!
//! - [`HeartbeatSender`]: reports active runs and free slots on a fixed interval
//! - [`LeaseLoop`]: long-polls for assignments and executes them
//!
//! # Components
//!
//! - [`NodeCapacityTracker`]: lock-free count of executing runs, clamped to
//!   `[0, max_concurrent]`
//! - [`SandboxExecutor`]: runs one agent execution in a child process group
//!   with a hard deadline
//!
//! # Execution Flow
//!
//! 1. Lease loop waits for a free slot and pulls an assignment
//! 2. Slot is taken and the lease acknowledged
//! 3. [`SandboxExecutor::run`] writes the request to the child's stdin and
//!    reads one JSON response from stdout
//! 4. The outcome is reported and the slot released

pub mod capacity;
pub mod heartbeat;
pub mod lease;
pub mod sandbox;

pub use capacity::NodeCapacityTracker;
pub use heartbeat::HeartbeatSender;
pub use lease::LeaseLoop;
pub use sandbox::SandboxExecutor;
