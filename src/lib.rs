//! backy-agent
//!
//! A privileged host-side storage agent for Linux software-RAID (md) pools.
//! Discovers block devices, parses kernel md/mount state, and exposes an
//! authenticated HTTP API for creating, mounting, unmounting and removing
//! RAID-backed storage pools via `mdadm`/`mkfs`/`mount`/`lsof`.
//!
//! # Modules
//!
//! - [`config`]: CLI/environment configuration
//! - [`commands`]: external command execution and output sanitisation
//! - [`fsreader`]: cached `/proc` and `/sys` reads
//! - [`drives`]: periodically refreshed `lsblk` drive inventory
//! - [`mdstat`]: `/proc/mdstat` parser
//! - [`mounts`]: `/proc/mounts` parser and filesystem space reporting
//! - [`metadata`]: durable pool metadata store
//! - [`metrics`]: prometheus metric handles
//! - [`reconcile`]: startup/on-demand reconciliation of metadata against the kernel
//! - [`pool`]: mutating pool lifecycle sequences
//! - [`operations`]: in-memory registry of asynchronous operations
//! - [`inventory`]: read-side composition for the HTTP API
//! - [`api`]: HTTP handlers and server bootstrap
//! - [`agent`]: dependency-injection root
//! - [`domain`]: core domain types
//! - [`error`]: error types and handling

pub mod agent;
pub mod api;
pub mod commands;
pub mod config;
pub mod domain;
pub mod drives;
pub mod error;
pub mod fsreader;
pub mod inventory;
pub mod mdstat;
pub mod metadata;
pub mod metrics;
pub mod mounts;
pub mod operations;
pub mod pool;
pub mod reconcile;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{Error, ErrorAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
