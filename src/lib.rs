pub mod agent;
pub mod client;
pub mod config;
pub mod connector;
pub mod control;
pub mod error;
pub mod node;
pub mod pipeline;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
