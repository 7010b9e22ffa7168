#![cfg_attr(not(test), no_std)]
extern crate alloc;

#[cfg(all(feature = "std", not(test)))]
extern crate std;

pub mod cipher;
pub mod config;
pub mod crypt;
pub mod error;
pub mod fingerprint;
pub mod ownership;
pub mod policy;
pub mod ratelimit;
pub mod recovery;
pub mod storage;

#[cfg(test)]
mod crypt_test;

pub use cipher::{Aes256Xts, ContentsCipher};
pub use config::{DedupConfig, SyncPolicy};
pub use crypt::{DedupCrypt, Direction};
pub use error::{CryptError, CryptResult};
pub use fingerprint::{Fingerprint, Fingerprinter, Xxh3Fingerprinter};
pub use ownership::{OwnershipEntry, OwnershipIndex, Slot};
pub use policy::{InodeCryptInfo, Iv, PolicyFlags};
pub use recovery::{InodeResolver, LogicalBlockIndex, MemoryBlockIndex};
#[cfg(feature = "std")]
pub use storage::FileTable;
pub use storage::{RamTable, TableStorage};

/// Number of slots in the ownership table.
pub const DEDUP_TABLE_SIZE: usize = 1024 * 1024;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Contents must be encrypted in multiples of this many bytes.
pub const CONTENTS_ALIGNMENT: usize = 16;

/// Default location of the ownership table.
pub const DEFAULT_TABLE_PATH: &str = "/citable";
