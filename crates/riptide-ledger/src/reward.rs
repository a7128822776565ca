//! Validator rewards and transaction fees.
//!
//! For every applied transaction, the fee is deducted from the sender and
//! credited to one eligible ancestor, selected by a weighted uniform draw
//! whose entropy is the hash of the candidate transaction IDs. Every honest
//! node walking the same ancestry derives the same rewardee.

use std::collections::{HashSet, VecDeque};

use riptide_avl::Tree;
use riptide_ids::Blake2b256;
use tracing::debug;

use blake2::Digest;

use crate::accounts::{read_balance, read_stake, write_balance};
use crate::graph::Graph;
use crate::tx::Transaction;
use crate::{Config, LedgerError, Result};

/// Deducts the transaction fee from `tx`'s sender and credits a weighted
/// random eligible ancestor.
///
/// Ancestors are walked backward through the graph up to the eligible depth
/// window; candidates must have a different sender and stake at or above the
/// configured minimum. When no candidate exists, nobody is rewarded and the
/// transaction still applies.
///
/// # Errors
///
/// Returns `LedgerError::InvalidTransaction` when the sender cannot cover
/// the fee; the caller rejects the whole transaction in that case.
pub fn reward_validators(
    graph: &Graph,
    snapshot: &mut Tree,
    tx: &Transaction,
    config: &Config,
) -> Result<()> {
    let tx_depth = graph.depth(&tx.id).unwrap_or_else(|| graph.height());

    let mut candidates: Vec<Transaction> = Vec::new();
    let mut stakes: Vec<u64> = Vec::new();
    let mut total_stake: u64 = 0;
    let mut hasher = Blake2b256::new();

    let mut visited: HashSet<_> = tx.parents.iter().copied().collect();
    let mut queue: VecDeque<_> = tx
        .parents
        .iter()
        .filter_map(|parent| graph.lookup(parent))
        .collect();

    while let Some(popped) = queue.pop_front() {
        let depth = graph.depth(&popped.id).unwrap_or(0);

        // Stop descending once the candidate window is exhausted.
        if depth + config.max_eligible_parents_depth_diff < tx_depth {
            continue;
        }

        if popped.sender != tx.sender {
            let stake = read_stake(snapshot, &popped.sender)?.unwrap_or(0);

            if stake >= config.minimum_stake {
                hasher.update(popped.id.as_bytes());

                total_stake += stake;
                stakes.push(stake);
                candidates.push((*popped).clone());
            }
        }

        for parent in &popped.parents {
            if visited.insert(*parent) {
                if let Some(parent) = graph.lookup(parent) {
                    queue.push_back(parent);
                }
            }
        }
    }

    // Nobody eligible: no reward, no fee.
    if candidates.is_empty() || total_stake == 0 {
        return Ok(());
    }

    let entropy: [u8; 32] = hasher.finalize().into();
    let low = u64::from_le_bytes(entropy[0..8].try_into().expect("length checked"));
    let threshold = (low % 0xffff) as f64 / 0xffff as f64;

    // Model a weighted uniform distribution: the first candidate whose
    // cumulative stake fraction crosses the threshold wins.
    let mut accumulated = 0.0f64;
    let mut rewardee: Option<&Transaction> = None;

    for (candidate, stake) in candidates.iter().zip(&stakes) {
        accumulated += *stake as f64 / total_stake as f64;

        if accumulated >= threshold {
            rewardee = Some(candidate);
            break;
        }
    }

    // Floating-point rounding can leave the threshold uncrossed; the last
    // candidate wins then.
    let rewardee = match rewardee {
        Some(rewardee) => rewardee,
        None => &candidates[candidates.len() - 1],
    };

    let fee = config.transaction_fee_amount;
    let sender_balance = read_balance(snapshot, &tx.sender)?.unwrap_or(0);
    if sender_balance < fee {
        return Err(LedgerError::InvalidTransaction(format!(
            "sender {} cannot pay the {fee} transaction fee",
            tx.sender
        )));
    }

    let rewardee_balance = read_balance(snapshot, &rewardee.sender)?.unwrap_or(0);

    write_balance(snapshot, &tx.sender, sender_balance - fee)?;
    write_balance(snapshot, &rewardee.sender, rewardee_balance + fee)?;

    debug!(
        sender = %tx.sender,
        recipient = %rewardee.sender,
        rewardee_tx = %rewardee.id,
        threshold,
        "rewarded validator"
    );

    Ok(())
}
