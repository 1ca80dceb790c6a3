//! State-root construction.
//!
//! Roots are keccak-256 binary merkle trees. Leaves are hashed, then
//! adjacent nodes are hashed pairwise level by level; an odd node at the end
//! of a level is carried up unchanged.
//!
//! Leaf layout:
//! - model tree: `0x00 || be_u64(block)`, then `0x01 || slot || value` per slot
//! - block tree: `0x02 || be_u64(block)`, `0x03 || block_hash`, then
//!   `0x04 || model_name || model_root` per model

use alloy::hex;
use alloy::primitives::{keccak256, B256};
use eyre::{Context, Result};

use crate::error::StateError;

const MODEL_BLOCK_PREFIX: u8 = 0x00;
const MODEL_SLOT_PREFIX: u8 = 0x01;
const BLOCK_NUMBER_PREFIX: u8 = 0x02;
const BLOCK_HASH_PREFIX: u8 = 0x03;
const BLOCK_MODEL_PREFIX: u8 = 0x04;

/// Computes the root over raw leaves.
pub fn merkle_root(leaves: &[Vec<u8>]) -> B256 {
    let mut level: Vec<B256> = leaves.iter().map(keccak256).collect();
    if level.is_empty() {
        return B256::ZERO;
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut buf = [0u8; 64];
                    buf[..32].copy_from_slice(left.as_slice());
                    buf[32..].copy_from_slice(right.as_slice());
                    keccak256(buf)
                }
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two nodes"),
            })
            .collect();
    }
    level[0]
}

/// Root for one model's rows in a block.
///
/// # Errors
/// Returns [`StateError::DuplicateSlot`] or [`StateError::SlotsOutOfOrder`]
/// unless `slots` is strictly ascending by slot id.
pub fn merkleize_state(block_number: u64, slots: &[(String, Vec<u8>)]) -> Result<B256> {
    let mut leaves = Vec::with_capacity(slots.len() + 1);
    leaves.push(prefixed(MODEL_BLOCK_PREFIX, &block_number.to_be_bytes()));

    let mut previous: Option<&str> = None;
    for (slot, value) in slots {
        if let Some(prev) = previous {
            if prev == slot {
                return Err(StateError::DuplicateSlot(slot.clone()).into());
            }
            if prev > slot.as_str() {
                return Err(StateError::SlotsOutOfOrder {
                    previous: prev.to_string(),
                    current: slot.clone(),
                }
                .into());
            }
        }
        previous = Some(slot);

        let mut leaf = prefixed(MODEL_SLOT_PREFIX, slot.as_bytes());
        leaf.extend_from_slice(value);
        leaves.push(leaf);
    }
    Ok(merkle_root(&leaves))
}

/// Root for a whole block, combining each model's root in registration
/// order.
///
/// # Errors
/// Returns error if `block_hash` is not hex.
pub fn merkleize_block(block_number: u64, block_hash: &str, model_roots: &[(&str, B256)]) -> Result<B256> {
    let hash_bytes = hex::decode(block_hash.trim_start_matches("0x"))
        .wrap_err_with(|| format!("block hash {block_hash} is not hex"))?;

    let mut leaves = vec![
        prefixed(BLOCK_NUMBER_PREFIX, &block_number.to_be_bytes()),
        prefixed(BLOCK_HASH_PREFIX, &hash_bytes),
    ];
    for (name, root) in model_roots {
        let mut leaf = prefixed(BLOCK_MODEL_PREFIX, name.as_bytes());
        leaf.extend_from_slice(root.as_slice());
        leaves.push(leaf);
    }
    Ok(merkle_root(&leaves))
}

fn prefixed(prefix: u8, bytes: &[u8]) -> Vec<u8> {
    let mut leaf = Vec::with_capacity(bytes.len() + 1);
    leaf.push(prefix);
    leaf.extend_from_slice(bytes);
    leaf
}
