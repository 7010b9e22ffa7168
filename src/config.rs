use alloc::{format, string::String};
use serde::{Deserialize, Serialize};

use crate::{
    error::{CryptError, CryptResult},
    CONTENTS_ALIGNMENT, DEDUP_TABLE_SIZE, DEFAULT_TABLE_PATH, PAGE_SIZE,
};

/// When the ownership table is read from and written to its backing store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Reload the whole table before every lookup and write all of it back
    /// after every encrypt.
    #[default]
    FullTable,
    /// Load once, then write only the record that changed.
    WriteThrough,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Slots in the ownership table. Fixed for the life of the table file.
    pub capacity: usize,
    pub table_path: String,
    pub sync: SyncPolicy,
    /// Filesystem block size in bytes.
    pub block_size: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: DEDUP_TABLE_SIZE,
            table_path: String::from(DEFAULT_TABLE_PATH),
            sync: SyncPolicy::default(),
            block_size: PAGE_SIZE,
        }
    }
}

impl DedupConfig {
    pub fn from_json(text: &str) -> CryptResult<Self> {
        let config: DedupConfig =
            serde_json::from_str(text).map_err(|e| CryptError::Config(format!("{}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CryptResult<()> {
        if self.capacity == 0 {
            return Err(CryptError::Config(String::from("capacity must be non-zero")));
        }
        if !self.block_size.is_power_of_two()
            || self.block_size < CONTENTS_ALIGNMENT
            || self.block_size > PAGE_SIZE
        {
            return Err(CryptError::Config(format!(
                "block size {} is not a power of two in {}..={}",
                self.block_size, CONTENTS_ALIGNMENT, PAGE_SIZE
            )));
        }
        Ok(())
    }

    /// log2 of the block size.
    pub fn block_bits(&self) -> u32 {
        self.block_size.trailing_zeros()
    }
}
