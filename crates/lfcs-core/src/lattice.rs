//! Join-semilattice trait - the mathematical foundation of CRDTs
//!
//! A join-semilattice (S, ⊔) satisfies:
//!  - Commutativity: a ⊔ b = b ⊔ a
//!  - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//!  - Idempotence:  a ⊔ a = a
//!
//! These properties guarantee convergence regardless of message order.
//!
//! Merges here are in place and fallible: the set types allocate their
//! entries from a memory pool, so a join can run out of blocks.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Every CRDT family member, including those declared but not yet built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrdtKind {
    GCounter,
    PnCounter,
    LwwRegister,
    GSet,
    TwoPSet,
    OrSet,
    LwwMap,
    Rga,
}

impl CrdtKind {
    pub const ALL: [CrdtKind; 8] = [
        CrdtKind::GCounter,
        CrdtKind::PnCounter,
        CrdtKind::LwwRegister,
        CrdtKind::GSet,
        CrdtKind::TwoPSet,
        CrdtKind::OrSet,
        CrdtKind::LwwMap,
        CrdtKind::Rga,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            CrdtKind::GCounter => "G-Counter",
            CrdtKind::PnCounter => "PN-Counter",
            CrdtKind::LwwRegister => "LWW-Register",
            CrdtKind::GSet => "G-Set",
            CrdtKind::TwoPSet => "2P-Set",
            CrdtKind::OrSet => "OR-Set",
            CrdtKind::LwwMap => "LWW-Map",
            CrdtKind::Rga => "RGA",
        }
    }

    /// Whether this crate ships an implementation of the kind.
    pub const fn is_implemented(&self) -> bool {
        !matches!(self, CrdtKind::LwwMap | CrdtKind::Rga)
    }
}

impl fmt::Display for CrdtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The core CRDT trait. All state-based CRDTs implement this.
pub trait Lattice: PartialEq + Sized {
    const KIND: CrdtKind;

    /// Join-assign: self = self ⊔ other.
    /// Must be commutative, associative, and idempotent.
    fn merge(&mut self, other: &Self) -> Result<()>;

    /// Deep copy. Fallible because pooled entries must be reallocated.
    fn try_clone(&self) -> Result<Self>;

    /// Join operation (least upper bound)
    fn join(&self, other: &Self) -> Result<Self> {
        let mut joined = self.try_clone()?;
        joined.merge(other)?;
        Ok(joined)
    }

    /// Partial order derived from join:  a ≤ b iff a ⊔ b = b
    fn partial_cmp_lattice(&self, other: &Self) -> Result<Option<Ordering>> {
        let joined = self.join(other)?;
        Ok(if &joined == self && &joined == other {
            Some(Ordering::Equal)
        } else if &joined == other {
            Some(Ordering::Less)
        } else if &joined == self {
            Some(Ordering::Greater)
        } else {
            None // Concurrent/incomparable
        })
    }

    /// Check if self ≤ other in the lattice order
    fn leq(&self, other: &Self) -> Result<bool> {
        Ok(matches!(
            self.partial_cmp_lattice(other)?,
            Some(Ordering::Less) | Some(Ordering::Equal)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(CrdtKind::TwoPSet.to_string(), "2P-Set");
        assert_eq!(CrdtKind::Rga.name(), "RGA");
        assert_eq!(CrdtKind::ALL.iter().filter(|k| k.is_implemented()).count(), 6);
    }
}
