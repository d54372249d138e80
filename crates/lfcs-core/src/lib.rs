//! # lfcs-core
//!
//! Vector clocks and the state-based CRDT family of the Lock-Free
//! Convergence Store. Counters and the register are plain values; the set
//! types keep their entries in pooled, hazard-protected bucket tables.

pub mod codec;
pub mod error;
pub mod gcounter;
pub mod gset;
pub mod lattice;
pub mod lwwreg;
pub mod orset;
pub mod pncounter;
pub mod table;
pub mod twopset;
pub mod uid;
pub mod vclock;

pub use codec::WireCodec;
pub use error::{CrdtError, Result};
pub use gcounter::GCounter;
pub use gset::{content_hash, GSet, GSetReader};
pub use lattice::{CrdtKind, Lattice};
pub use lwwreg::{LwwRegister, LWW_MAX_VALUE_SIZE};
pub use orset::{OrSet, OrSetEntry, OrSetReader};
pub use pncounter::PnCounter;
pub use table::{SetMemory, TableConfig};
pub use twopset::{TwoPSet, TwoPSetReader};
pub use uid::{NodeId, Timestamp, Uid, MAX_NODES};
pub use vclock::{Causality, PrunePolicy, VectorClock};
