//! Resources: the units users request from pools.
//!
//! - **Volume**: file, block or network backed storage
//! - **Port**: tap device on a linux bridge
//!
//! A resource is created from a configuration document, bound to nodes,
//! allocated (materialized on a node through the agent), released, unbound
//! and finally destroyed by its pool.

mod command;
mod port;
mod traits;
mod types;
mod volume;

pub use command::*;
pub use port::*;
pub use traits::*;
pub use types::*;
pub use volume::*;
