//! # lfcs-node
//!
//! Node contexts for the Lock-Free Convergence Store.
//!
//! - [`library`] - Caller-owned library handle, version info, node registry
//! - [`context`] - Per-node identity, clock, UID minting and set factories
//! - [`config`] - Node and library configuration with builders
//! - [`error`] - Error types
//!
//! ```rust
//! use lfcs_node::{Library, LibraryConfig};
//!
//! let library = Library::new(LibraryConfig::default()).unwrap();
//! let mut node = library.create_node(0).unwrap();
//!
//! let mut set = node.new_orset().unwrap();
//! node.orset_add(&mut set, b"apple").unwrap();
//! assert!(set.contains(b"apple"));
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod library;

pub use config::{LibraryConfig, NodeConfig, NodeConfigBuilder};
pub use context::NodeContext;
pub use error::{NodeError, Result};
pub use library::Library;
