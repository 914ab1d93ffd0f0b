//! Security database interface.

use std::collections::BTreeSet;
use std::fmt::Debug;

use crate::le::Addr;
use crate::SyncMutex;

/// Interface to the host's bond database. Services consult it to decide
/// whether peer state survives a disconnect.
pub trait BondStore: Debug + Send + Sync {
    /// Returns whether the peer address belongs to a bonded device.
    fn is_bonded(&self, peer: Addr) -> bool;
}

/// In-memory bond set for hosts that do not persist bonds.
#[derive(Debug, Default)]
pub struct MemoryBonds(SyncMutex<BTreeSet<Addr>>);

impl MemoryBonds {
    /// Creates an empty bond set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a bond with the peer.
    #[inline]
    pub fn insert(&self, peer: Addr) {
        self.0.lock().insert(peer);
    }

    /// Removes the bond with the peer.
    #[inline]
    pub fn remove(&self, peer: Addr) {
        self.0.lock().remove(&peer);
    }
}

impl BondStore for MemoryBonds {
    #[inline]
    fn is_bonded(&self, peer: Addr) -> bool {
        self.0.lock().contains(&peer)
    }
}
