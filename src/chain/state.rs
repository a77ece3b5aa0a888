use crate::core::Result;
use crate::core::error::ensure_invariant;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub height: i64,
    pub hash: String,
}

impl BlockRef {
    pub fn new(height: i64, hash: impl Into<String>) -> Self {
        Self {
            height,
            hash: hash.into(),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.height, self.hash)
    }
}

/// Persisted status row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub height: i64,
    pub hash: String,
    pub nonce: i64,
}

impl ChainStatus {
    /// Row created on first connect, before any block was processed.
    pub fn initial() -> Self {
        Self {
            height: -1,
            hash: "0x".to_string(),
            nonce: 0,
        }
    }

    pub fn head(&self) -> BlockRef {
        BlockRef::new(self.height, self.hash.clone())
    }
}

/// Finalized head plus the hot (unfinalized) blocks on top of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainState {
    pub height: i64,
    pub hash: String,
    pub nonce: i64,
    pub top: Vec<BlockRef>,
}

impl ChainState {
    pub(crate) fn new(status: ChainStatus, top: Vec<BlockRef>) -> Self {
        Self {
            height: status.height,
            hash: status.hash,
            nonce: status.nonce,
            top,
        }
    }

    pub fn finalized_head(&self) -> BlockRef {
        BlockRef::new(self.height, self.hash.clone())
    }

    /// Highest known block, hot or finalized.
    pub fn head(&self) -> BlockRef {
        self.top
            .last()
            .cloned()
            .unwrap_or_else(|| self.finalized_head())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        ensure_invariant(self.height >= -1, || {
            format!("finalized height {} is below -1", self.height)
        })?;
        assert_chain_continuity(&self.finalized_head(), &self.top)
    }
}

/// Head transition of a finalized-only transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalTxInfo {
    pub prev_head: BlockRef,
    pub next_head: BlockRef,
}

/// New blocks applied on top of `base_head`, with the new finality point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotTxInfo {
    pub base_head: BlockRef,
    pub new_blocks: Vec<BlockRef>,
    pub finalized_head: BlockRef,
}

impl HotTxInfo {
    /// Checks the request shape; performs no I/O.
    pub(crate) fn validate(&self) -> Result<()> {
        assert_chain_continuity(&self.base_head, &self.new_blocks)?;
        let head = self.new_blocks.last().unwrap_or(&self.base_head);
        ensure_invariant(self.finalized_head.height <= head.height, || {
            format!(
                "finalized head {} is above the new chain head {}",
                self.finalized_head, head
            )
        })
    }
}

/// `blocks` must follow `base` at consecutive heights.
pub(crate) fn assert_chain_continuity(base: &BlockRef, blocks: &[BlockRef]) -> Result<()> {
    let mut expected = base.height + 1;
    for block in blocks {
        ensure_invariant(block.height == expected, || {
            format!(
                "blocks are not contiguous: expected height {} after {}, got {}",
                expected, base, block
            )
        })?;
        expected += 1;
    }
    Ok(())
}
