//! Encryption policy flags, per-inode key context and IV generation.

use alloc::{format, sync::Arc};
use bitflags::bitflags;
use core::fmt;
use log::warn;

use crate::{
    cipher::ContentsCipher,
    error::{CryptError, CryptResult},
    PAGE_SHIFT,
};

pub const FILE_NONCE_SIZE: usize = 16;
pub const MAX_IV_SIZE: usize = 32;

bitflags! {
    /// IV scheme selection bits of an encryption policy.
    pub struct PolicyFlags: u8 {
        const PAD_MASK = 0x03;
        /// Per-file nonce in the IV, file contents keyed by the master key.
        const DIRECT_KEY = 0x04;
        /// Inode number in the high 32 bits of the IV.
        const IV_INO_LBLK_64 = 0x08;
        /// Hashed inode number added to the block number, 32 bit IV.
        const IV_INO_LBLK_32 = 0x10;
    }
}

/// Initialization vector: the little endian block number followed by the
/// file nonce. Ciphers use the first `iv_size()` bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Iv([u8; MAX_IV_SIZE]);

impl Iv {
    pub fn as_bytes(&self) -> &[u8; MAX_IV_SIZE] {
        &self.0
    }

    /// The block number field.
    pub fn lblk_num(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(raw)
    }

    pub fn nonce(&self) -> &[u8] {
        &self.0[8..8 + FILE_NONCE_SIZE]
    }
}

impl fmt::Debug for Iv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iv")
            .field("lblk_num", &self.lblk_num())
            .finish_non_exhaustive()
    }
}

/// Key context of one encrypted inode.
#[derive(Clone)]
pub struct InodeCryptInfo {
    pub ino: u64,
    pub flags: PolicyFlags,
    pub nonce: [u8; FILE_NONCE_SIZE],
    /// Keyed hash of the inode number, for `IV_INO_LBLK_32` policies.
    pub hashed_ino: u32,
    /// log2 of the filesystem block size.
    pub block_bits: u32,
    pub cipher: Arc<dyn ContentsCipher>,
}

impl InodeCryptInfo {
    /// Context with a plain block number IV and page sized blocks.
    pub fn new(ino: u64, cipher: Arc<dyn ContentsCipher>) -> Self {
        Self {
            ino,
            flags: PolicyFlags::empty(),
            nonce: [0; FILE_NONCE_SIZE],
            hashed_ino: 0,
            block_bits: PAGE_SHIFT,
            cipher,
        }
    }

    pub fn with_flags(mut self, flags: PolicyFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_nonce(mut self, nonce: [u8; FILE_NONCE_SIZE]) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn with_hashed_ino(mut self, hashed_ino: u32) -> Self {
        self.hashed_ino = hashed_ino;
        self
    }

    /// Contents units of `1 << block_bits` bytes, from 16 bytes up to a page.
    pub fn with_block_bits(mut self, block_bits: u32) -> CryptResult<Self> {
        if !(4..=PAGE_SHIFT).contains(&block_bits) {
            return Err(CryptError::Config(format!("block_bits {} out of range", block_bits)));
        }
        self.block_bits = block_bits;
        Ok(self)
    }

    pub fn block_size(&self) -> usize {
        1 << self.block_bits
    }
}

impl fmt::Debug for InodeCryptInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeCryptInfo")
            .field("ino", &self.ino)
            .field("flags", &self.flags)
            .field("block_bits", &self.block_bits)
            .finish_non_exhaustive()
    }
}

/// IV for block `lblk_num` of the file described by `ci`.
pub fn generate_iv(lblk_num: u64, ci: &InodeCryptInfo) -> Iv {
    let mut iv = [0u8; MAX_IV_SIZE];
    let mut lblk_num = lblk_num;

    if ci.flags.contains(PolicyFlags::IV_INO_LBLK_64) {
        if lblk_num > u32::MAX as u64 || ci.ino > u32::MAX as u64 {
            warn!(
                "inode {} block {} does not fit an IV_INO_LBLK_64 IV",
                ci.ino, lblk_num
            );
        }
        lblk_num |= ci.ino << 32;
    } else if ci.flags.contains(PolicyFlags::IV_INO_LBLK_32) {
        if lblk_num > u32::MAX as u64 {
            warn!("block {} does not fit an IV_INO_LBLK_32 IV", lblk_num);
        }
        lblk_num = (ci.hashed_ino as u64).wrapping_add(lblk_num) as u32 as u64;
    } else if ci.flags.contains(PolicyFlags::DIRECT_KEY) {
        iv[8..8 + FILE_NONCE_SIZE].copy_from_slice(&ci.nonce);
    }
    iv[..8].copy_from_slice(&lblk_num.to_le_bytes());
    Iv(iv)
}
