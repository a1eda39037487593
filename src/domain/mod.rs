//! Core domain types shared by every component: the durable `PoolRecord`,
//! the ephemeral `Operation`, and the read-only views of kernel state
//! (`Drive`, `MdArray`) that the agent reconciles against.

pub mod model;

pub use model::*;
