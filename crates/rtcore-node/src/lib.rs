#![warn(missing_docs)]

//! rtcore node: configuration and wiring for a single runtime instance.

pub mod config;
pub mod node;

pub use config::NodeConfig;
pub use node::Node;
