use alloc::string::String;

use crate::crypt::Direction;

#[derive(Debug, onlyerror::Error)]
pub enum CryptError {
    /// Zero length, misaligned length, or a range outside the page.
    #[error("invalid block length or offset")]
    InvalidInput,
    #[error("out of memory")]
    AllocationFailure,
    #[error("{direction} failed for block {lblk_num}")]
    Cipher { direction: Direction, lblk_num: u64 },
    /// Every slot of the ownership table was tried without finding room.
    #[error("ownership table is full")]
    IndexFull,
    #[error("ownership table i/o failed: {0}")]
    Persistence(String),
    #[error("no key available for inode {0}")]
    NoKey(u64),
    #[error("bad configuration: {0}")]
    Config(String),
}

pub type CryptResult<T> = Result<T, CryptError>;
