//! Per-block in-memory accumulation of derived rows.
//!
//! A model owns one [`BlockAccumulator`]. The slot for block `n` is created
//! by `setup`, filled while logs are handled, read during commit and root
//! generation, and dropped by `cleanup`. Touching a block that was never
//! set up is a [`StateError::BlockNotInitialized`].

use std::collections::HashMap;

use crate::error::StateError;

#[derive(Debug)]
pub struct BlockAccumulator<T> {
    blocks: HashMap<u64, Vec<T>>,
}

impl<T> Default for BlockAccumulator<T> {
    fn default() -> Self {
        Self {
            blocks: HashMap::new(),
        }
    }
}

impl<T> BlockAccumulator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns [`StateError::BlockAlreadyInitialized`] if `block_number` is
    /// still active.
    pub fn setup(&mut self, block_number: u64) -> Result<(), StateError> {
        if self.blocks.contains_key(&block_number) {
            return Err(StateError::BlockAlreadyInitialized(block_number));
        }
        self.blocks.insert(block_number, Vec::new());
        Ok(())
    }

    pub fn push(&mut self, block_number: u64, row: T) -> Result<(), StateError> {
        self.blocks
            .get_mut(&block_number)
            .ok_or(StateError::BlockNotInitialized(block_number))?
            .push(row);
        Ok(())
    }

    pub fn get(&self, block_number: u64) -> Result<&[T], StateError> {
        self.blocks
            .get(&block_number)
            .map(Vec::as_slice)
            .ok_or(StateError::BlockNotInitialized(block_number))
    }

    pub fn is_active(&self, block_number: u64) -> bool {
        self.blocks.contains_key(&block_number)
    }

    /// Drops the rows of `block_number`. Returns whether anything was active.
    pub fn cleanup(&mut self, block_number: u64) -> bool {
        self.blocks.remove(&block_number).is_some()
    }
}
