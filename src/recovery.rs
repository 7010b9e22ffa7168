//! Collaborators consulted on the read path: the fingerprint to logical
//! block table, and inode lookup for switching key context.

use alloc::{collections::BTreeMap, sync::Arc};
use spin::RwLock;

use crate::{error::CryptResult, fingerprint::Fingerprint, policy::InodeCryptInfo};

/// Read-only view of the table recording which logical block a ciphertext
/// was first written at.
pub trait LogicalBlockIndex: Send + Sync {
    fn lookup(&self, fingerprint: &Fingerprint) -> Option<u64>;
}

/// Turns an inode number into that inode's key context.
///
/// Fails with [`CryptError::NoKey`](crate::CryptError::NoKey) when the
/// inode is unknown or its key is not loaded.
pub trait InodeResolver: Send + Sync {
    fn resolve(&self, ino: u64) -> CryptResult<Arc<InodeCryptInfo>>;
}

/// Logical block table kept in memory.
#[derive(Default)]
pub struct MemoryBlockIndex {
    blocks: RwLock<BTreeMap<Fingerprint, u64>>,
}

impl MemoryBlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, fingerprint: Fingerprint, lblk_num: u64) {
        self.blocks.write().insert(fingerprint, lblk_num);
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogicalBlockIndex for MemoryBlockIndex {
    fn lookup(&self, fingerprint: &Fingerprint) -> Option<u64> {
        self.blocks.read().get(fingerprint).copied()
    }
}
