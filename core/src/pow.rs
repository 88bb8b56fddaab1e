//! Proof-of-work search.
//!
//! A proof is a string nonce appended to the block header before hashing; a
//! block is mined when its hash falls below the block target. Nonces are
//! searched as decimal strings counting up from zero, so any two miners
//! agree on what a proof looks like.
//!
//! All functions are pure with respect to the block; mining a block that
//! already carries a proof returns that proof unchanged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::block::Block;

/// Searches nonces sequentially until one satisfies the block target.
pub fn find_proof(block: &Block) -> String {
    if !block.proof.is_empty() {
        return block.proof.clone();
    }
    let mut nonce: u64 = 0;
    loop {
        let candidate = nonce.to_string();
        if block.validate_proof_with(&candidate) {
            return candidate;
        }
        nonce += 1;
    }
}

/// Searches for a proof on `workers` threads.
///
/// Each worker strides through the nonce space and the first hit stops the
/// others. Intended to run off the node's reactor, e.g. under
/// `spawn_blocking`.
pub fn mine(block: &Block, workers: usize) -> String {
    if !block.proof.is_empty() {
        return block.proof.clone();
    }
    let workers = workers.max(1);
    let found = AtomicBool::new(false);
    let result: Mutex<Option<String>> = Mutex::new(None);

    std::thread::scope(|s| {
        for start in 0..workers {
            let found = &found;
            let result = &result;
            s.spawn(move || {
                let mut nonce = start as u64;
                while !found.load(Ordering::Relaxed) {
                    let candidate = nonce.to_string();
                    if block.validate_proof_with(&candidate) {
                        let mut slot = result.lock().expect("miner result lock");
                        slot.get_or_insert(candidate);
                        found.store(true, Ordering::Relaxed);
                        return;
                    }
                    nonce += workers as u64;
                }
            });
        }
    });

    result
        .into_inner()
        .expect("miner result lock")
        .expect("a worker found a proof before stopping")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_proof_satisfies_the_target() {
        let mut b = Block::new(0, 0);
        let proof = find_proof(&b);
        assert!(b.validate_proof_with(&proof));
        b.proof = proof;
        assert!(b.validate_proof());
    }

    #[test]
    fn mined_blocks_keep_their_proof() {
        let mut b = Block::new(0, 0);
        b.proof = find_proof(&b);
        let again = find_proof(&b);
        assert_eq!(again, b.proof);
        assert_eq!(mine(&b, 2), b.proof);
    }

    #[test]
    fn parallel_mining_finds_a_valid_proof() {
        let b = Block::new(1, 42);
        let proof = mine(&b, 4);
        assert!(b.validate_proof_with(&proof));
    }
}
