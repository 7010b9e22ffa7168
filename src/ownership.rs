//! Fingerprint to owning inode table.
//!
//! A fixed-capacity, open-addressing hash table with linear probing. Each
//! slot records which inode's encryption produced a given ciphertext
//! fingerprint, so a shared block can be decrypted with the right key even
//! when it is read through another file.
//!
//! The whole table is mirrored in a [`TableStorage`] as `capacity`
//! contiguous 24 byte records, in slot order, starting at offset 0:
//!
//! ```text
//! | fingerprint [16] | owner inode, u64 little endian [8] |
//! ```
//!
//! A record whose owner is 0 is an empty slot. There is no header and no
//! checksum.

use alloc::{sync::Arc, vec, vec::Vec};
use log::debug;
use spin::Mutex;

use crate::{
    config::{DedupConfig, SyncPolicy},
    error::{CryptError, CryptResult},
    fingerprint::{Fingerprint, FINGERPRINT_SIZE},
    storage::TableStorage,
};

pub const RECORD_SIZE: usize = FINGERPRINT_SIZE + 8;

/// Records moved per storage call during a full load or persist.
const RECORDS_PER_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipEntry {
    pub fingerprint: Fingerprint,
    pub owner_inode: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Empty,
    Occupied(OwnershipEntry),
}

impl Slot {
    fn encode(&self, out: &mut [u8]) {
        match self {
            Slot::Empty => out[..RECORD_SIZE].fill(0),
            Slot::Occupied(entry) => {
                out[..FINGERPRINT_SIZE].copy_from_slice(entry.fingerprint.as_bytes());
                out[FINGERPRINT_SIZE..RECORD_SIZE].copy_from_slice(&entry.owner_inode.to_le_bytes());
            }
        }
    }

    fn decode(record: &[u8]) -> Slot {
        let mut ino = [0u8; 8];
        ino.copy_from_slice(&record[FINGERPRINT_SIZE..RECORD_SIZE]);
        let owner_inode = u64::from_le_bytes(ino);
        if owner_inode == 0 {
            return Slot::Empty;
        }
        let mut fingerprint = [0u8; FINGERPRINT_SIZE];
        fingerprint.copy_from_slice(&record[..FINGERPRINT_SIZE]);
        Slot::Occupied(OwnershipEntry {
            fingerprint: Fingerprint(fingerprint),
            owner_inode,
        })
    }
}

/// Home slot of a fingerprint: the byte sum modulo the capacity.
///
/// Deliberately cheap. Fingerprints come from ciphertext written through
/// this crate, so there is no hostile input to defend against.
pub fn slot_hash(fingerprint: &Fingerprint, capacity: usize) -> usize {
    let sum: usize = fingerprint.as_bytes().iter().map(|&b| b as usize).sum();
    sum % capacity
}

/// Slot array plus the bookkeeping needed to keep it in step with storage.
pub(crate) struct Table {
    slots: Vec<Slot>,
    /// Set once the slots reflect the backing store.
    loaded: bool,
}

impl Table {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::Empty; capacity],
            loaded: false,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn search(&self, fingerprint: &Fingerprint) -> Option<OwnershipEntry> {
        let capacity = self.capacity();
        let mut index = slot_hash(fingerprint, capacity);
        for _ in 0..capacity {
            match &self.slots[index] {
                Slot::Empty => return None,
                Slot::Occupied(entry) if entry.fingerprint == *fingerprint => return Some(*entry),
                Slot::Occupied(_) => {}
            }
            index = (index + 1) % capacity;
        }
        None
    }

    /// Returns the slot that was written.
    pub(crate) fn insert(&mut self, fingerprint: Fingerprint, owner_inode: u64) -> CryptResult<usize> {
        if owner_inode == 0 {
            return Err(CryptError::InvalidInput);
        }
        let capacity = self.capacity();
        let mut index = slot_hash(&fingerprint, capacity);
        for _ in 0..capacity {
            if let Slot::Empty = self.slots[index] {
                self.slots[index] = Slot::Occupied(OwnershipEntry {
                    fingerprint,
                    owner_inode,
                });
                return Ok(index);
            }
            index = (index + 1) % capacity;
        }
        Err(CryptError::IndexFull)
    }

    pub(crate) fn load(&mut self, storage: &dyn TableStorage) -> CryptResult<()> {
        let mut buf = vec![0u8; RECORDS_PER_CHUNK * RECORD_SIZE];
        let mut first = 0;
        while first < self.slots.len() {
            let count = core::cmp::min(RECORDS_PER_CHUNK, self.slots.len() - first);
            let chunk = &mut buf[..count * RECORD_SIZE];
            let n = storage.read_at((first * RECORD_SIZE) as u64, chunk)?;
            // Whatever lies past the end of the store has never been written.
            chunk[n..].fill(0);
            for (i, record) in chunk.chunks_exact(RECORD_SIZE).enumerate() {
                self.slots[first + i] = Slot::decode(record);
            }
            first += count;
        }
        self.loaded = true;
        Ok(())
    }

    pub(crate) fn persist(&self, storage: &dyn TableStorage) -> CryptResult<()> {
        let mut buf = vec![0u8; RECORDS_PER_CHUNK * RECORD_SIZE];
        for (n, slots) in self.slots.chunks(RECORDS_PER_CHUNK).enumerate() {
            let chunk = &mut buf[..slots.len() * RECORD_SIZE];
            for (slot, record) in slots.iter().zip(chunk.chunks_exact_mut(RECORD_SIZE)) {
                slot.encode(record);
            }
            storage.write_at((n * RECORDS_PER_CHUNK * RECORD_SIZE) as u64, chunk)?;
        }
        storage.flush()
    }

    fn persist_slot(&self, index: usize, storage: &dyn TableStorage) -> CryptResult<()> {
        let mut record = [0u8; RECORD_SIZE];
        self.slots[index].encode(&mut record);
        storage.write_at((index * RECORD_SIZE) as u64, &record)?;
        storage.flush()
    }

    pub(crate) fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Occupied(_)))
            .count()
    }
}

/// The ownership table, its backing store, and the lock that serialises
/// every reload, lookup, insert and write-back against them.
pub struct OwnershipIndex {
    table: Mutex<Table>,
    storage: Arc<dyn TableStorage>,
    sync: SyncPolicy,
}

impl OwnershipIndex {
    /// Full size table with the default (full table) sync policy.
    pub fn new(storage: Arc<dyn TableStorage>) -> Self {
        Self::build(storage, crate::DEDUP_TABLE_SIZE, SyncPolicy::FullTable)
    }

    /// An index of `capacity` slots. A table needs at least one slot.
    pub fn with_capacity(storage: Arc<dyn TableStorage>, capacity: usize, sync: SyncPolicy) -> CryptResult<Self> {
        if capacity == 0 {
            return Err(CryptError::Config("ownership table needs at least one slot".into()));
        }
        Ok(Self::build(storage, capacity, sync))
    }

    pub fn from_config(config: &DedupConfig, storage: Arc<dyn TableStorage>) -> CryptResult<Self> {
        config.validate()?;
        Self::with_capacity(storage, config.capacity, config.sync)
    }

    fn build(storage: Arc<dyn TableStorage>, capacity: usize, sync: SyncPolicy) -> Self {
        debug!("ownership table: {} slots, {:?}", capacity, sync);
        Self {
            table: Mutex::new(Table::new(capacity)),
            storage,
            sync,
        }
    }

    pub fn capacity(&self) -> usize {
        self.table.lock().capacity()
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        self.sync
    }

    /// Number of occupied slots currently in memory.
    pub fn len(&self) -> usize {
        self.table.lock().occupied()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite every slot with the contents of the backing store.
    pub fn load(&self) -> CryptResult<()> {
        self.table.lock().load(&*self.storage)
    }

    /// Write every slot to the backing store.
    pub fn persist(&self) -> CryptResult<()> {
        self.table.lock().persist(&*self.storage)
    }

    /// Search the in-memory slots without touching storage.
    pub fn search(&self, fingerprint: &Fingerprint) -> Option<OwnershipEntry> {
        self.table.lock().search(fingerprint)
    }

    /// Place an entry in memory without touching storage. Performs no
    /// duplicate check; see [`OwnershipIndex::record_owner`] for that.
    pub fn insert(&self, fingerprint: Fingerprint, owner_inode: u64) -> CryptResult<()> {
        self.table.lock().insert(fingerprint, owner_inode).map(|_| ())
    }

    /// Make the in-memory slots current according to the sync policy.
    fn refresh(&self, table: &mut Table) -> CryptResult<()> {
        match self.sync {
            SyncPolicy::FullTable => table.load(&*self.storage),
            SyncPolicy::WriteThrough if !table.loaded => table.load(&*self.storage),
            SyncPolicy::WriteThrough => Ok(()),
        }
    }

    /// Record `owner_inode` as the owner of `fingerprint` unless some inode
    /// already owns it. Returns whether a new mapping was written.
    ///
    /// The table is refreshed from storage first and written back before
    /// returning, whether or not a mapping was added.
    pub fn record_owner(&self, fingerprint: Fingerprint, owner_inode: u64) -> CryptResult<bool> {
        let mut table = self.table.lock();
        self.refresh(&mut table)?;
        if let Some(entry) = table.search(&fingerprint) {
            debug!(
                "{:?} already owned by inode {}, not recording inode {}",
                fingerprint, entry.owner_inode, owner_inode
            );
            if self.sync == SyncPolicy::FullTable {
                table.persist(&*self.storage)?;
            }
            return Ok(false);
        }
        let slot = table.insert(fingerprint, owner_inode)?;
        let res = match self.sync {
            SyncPolicy::FullTable => table.persist(&*self.storage),
            SyncPolicy::WriteThrough => table.persist_slot(slot, &*self.storage),
        };
        if let Err(err) = res {
            // storage may hold part of the write; take it as the truth next time
            table.slots[slot] = Slot::Empty;
            table.loaded = false;
            return Err(err);
        }
        debug!("{:?} -> inode {} at slot {}", fingerprint, owner_inode, slot);
        Ok(true)
    }

    /// Owner of `fingerprint`, if one was recorded. Never writes storage.
    pub fn lookup_owner(&self, fingerprint: &Fingerprint) -> CryptResult<Option<u64>> {
        let mut table = self.table.lock();
        self.refresh(&mut table)?;
        Ok(table.search(fingerprint).map(|entry| entry.owner_inode))
    }

    /// Copy of every slot, in slot order.
    pub fn snapshot(&self) -> Vec<Slot> {
        self.table.lock().slots.clone()
    }
}
