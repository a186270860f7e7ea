//! Block tracker: a sliding window of recently served block headers,
//! used to verify linkage and to find the fork point after a chain switch.

use std::collections::VecDeque;

use crate::types::BlockInfo;

/// Tracks the last N block headers handed to the engine.
///
/// When a new block arrives, the tracker checks whether its
/// `previous_block_hash` matches the hash of the current head.
pub struct BlockTracker {
    /// Sliding window of recent blocks (oldest first).
    window: VecDeque<BlockInfo>,
    /// Maximum number of blocks to retain.
    window_size: usize,
}

impl BlockTracker {
    /// Create a new tracker with the given window size.
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }

    /// Add a new block to the tracker.
    ///
    /// Returns `Ok(())` if the block extends the current head.
    /// Returns `Err(depth)` if it does not, where `depth` is the number of
    /// tracked blocks above its parent (the whole window if the parent is unknown).
    pub fn push(&mut self, block: BlockInfo) -> Result<(), u64> {
        if let Some(head) = self.window.back() {
            if !block.extends(head) {
                return Err(self.depth_to_parent(&block));
            }
        }
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(block);
        Ok(())
    }

    /// Returns the current head (most recently added block).
    pub fn head(&self) -> Option<&BlockInfo> {
        self.window.back()
    }

    /// Oldest block still in the window.
    pub fn oldest(&self) -> Option<&BlockInfo> {
        self.window.front()
    }

    /// Number of blocks in the window.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Returns `true` if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }

    /// Discard everything above `block_number`.
    pub fn rewind_to(&mut self, block_number: u64) {
        while let Some(back) = self.window.back() {
            if back.block_number > block_number {
                self.window.pop_back();
            } else {
                break;
            }
        }
    }

    /// Newest tracked block satisfying `on_chain`, scanning newest to oldest.
    pub fn common_ancestor(&self, on_chain: impl Fn(&BlockInfo) -> bool) -> Option<&BlockInfo> {
        self.window.iter().rev().find(|b| on_chain(b))
    }

    fn depth_to_parent(&self, block: &BlockInfo) -> u64 {
        for (i, tracked) in self.window.iter().enumerate().rev() {
            if tracked.block_hash == block.previous_block_hash {
                return (self.window.len() - 1 - i) as u64;
            }
        }
        self.window.len() as u64
    }
}
