//! Interior-node update engine of a journalled copy-on-write multi-device
//! B-tree storage layer.
//!
//! The tree changes shape only through update transactions: splitting a
//! full node, merging an underfull node with a sibling, rewriting a node in
//! place, or replacing a node's pointer key. A transaction reserves journal
//! space, disk space and fresh nodes up front, builds replacements that
//! shadow the old nodes, writes them out, and makes them reachable only
//! once every child write is durable — so a crash at any point recovers to
//! a consistent tree.
//!
//! Entry points live in [update::interior]; everything runs against a
//! mounted [Filesystem].

use serde::{Deserialize, Serialize};

pub mod alloc;
pub mod bkey;
pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod io;
pub mod iter;
pub mod journal;
pub mod lock;
pub mod node;
pub mod replicas;
pub mod root;
pub mod update;

pub use config::{Config, DeviceConfig};
pub use error::{Error, Result};
pub use fs::Filesystem;

/// Identifies one btree within the filesystem.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BtreeId(pub u32);
