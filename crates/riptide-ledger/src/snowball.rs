//! Snowball repeated-sampling consensus.
//!
//! Each tick feeds the engine the stake-weighted tally of one round of
//! sampling K peers. The engine keeps a lifetime tally per candidate and a
//! consecutive-confirmation counter; it decides once the same candidate has
//! won enough consecutive ticks at or above the quorum fraction.
//!
//! Two instances run in the ledger: one converging on the critical
//! transaction that ends the current round, one converging on the network's
//! root during out-of-sync detection.

use std::collections::HashMap;

use parking_lot::Mutex;
use riptide_ids::TransactionId;

use crate::params::SnowballParams;

/// A candidate with an identity hash.
pub trait Identifiable {
    /// The candidate's identity.
    fn candidate_id(&self) -> TransactionId;
}

impl Identifiable for crate::tx::Transaction {
    fn candidate_id(&self) -> TransactionId {
        self.id
    }
}

struct SnowballState<C> {
    preferred: Option<C>,
    last_id: TransactionId,
    count: u32,
    counts: HashMap<TransactionId, f64>,
    candidates: HashMap<TransactionId, C>,
    decided: bool,
}

impl<C> Default for SnowballState<C> {
    fn default() -> Self {
        Self {
            preferred: None,
            last_id: TransactionId::ZERO,
            count: 0,
            counts: HashMap::new(),
            candidates: HashMap::new(),
            decided: false,
        }
    }
}

/// A Snowball instance, generic over the candidate type.
///
/// The internal mutex is never held across a suspension point.
pub struct Snowball<C: Identifiable + Clone> {
    params: SnowballParams,
    state: Mutex<SnowballState<C>>,
}

impl<C: Identifiable + Clone> Snowball<C> {
    /// Creates an engine with the given parameters.
    #[must_use]
    pub fn new(params: SnowballParams) -> Self {
        Self {
            params,
            state: Mutex::new(SnowballState::default()),
        }
    }

    /// The engine's parameters.
    #[must_use]
    pub fn params(&self) -> SnowballParams {
        self.params
    }

    /// Sets the preferred candidate, unless already decided. Counters are
    /// untouched.
    pub fn prefer(&self, candidate: C) {
        let mut state = self.state.lock();
        if !state.decided {
            state.preferred = Some(candidate);
        }
    }

    /// Feeds one sampling round into the engine.
    ///
    /// `counts` maps candidate IDs to the stake-weighted vote they received;
    /// `candidates` carries the corresponding candidate objects. An empty or
    /// zero-ID tick is harmless and resets the consecutive counter.
    pub fn tick(
        &self,
        counts: &HashMap<TransactionId, f64>,
        candidates: &HashMap<TransactionId, C>,
    ) {
        let mut state = self.state.lock();
        if state.decided {
            return;
        }

        // Argmax of the incoming tallies; ties break toward the
        // lexicographically smaller ID so every node picks the same winner.
        let winner = counts
            .iter()
            .max_by(|(id_a, weight_a), (id_b, weight_b)| {
                weight_a
                    .partial_cmp(weight_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| id_b.cmp(id_a))
            })
            .map(|(id, weight)| (*id, *weight));

        let Some((winner_id, winner_weight)) = winner else {
            state.count = 0;
            state.last_id = TransactionId::ZERO;
            return;
        };

        let Some(candidate) = candidates.get(&winner_id) else {
            state.count = 0;
            state.last_id = TransactionId::ZERO;
            return;
        };

        if winner_id.is_zero() || winner_weight < self.params.alpha {
            state.count = 0;
            state.last_id = TransactionId::ZERO;
            return;
        }

        if winner_id == state.last_id {
            state.count += 1;
        } else {
            state.count = 0;
            state.last_id = winner_id;
        }

        let tally = state.counts.entry(winner_id).or_insert(0.0);
        *tally += winner_weight;
        let tally = *tally;
        state.candidates.insert(winner_id, candidate.clone());

        // Switch preference only when the lifetime tally strictly exceeds
        // the preferred candidate's; ties never switch.
        let switch = match &state.preferred {
            None => true,
            Some(preferred) => {
                let preferred_tally = state
                    .counts
                    .get(&preferred.candidate_id())
                    .copied()
                    .unwrap_or(0.0);
                tally > preferred_tally
            }
        };
        if switch {
            state.preferred = Some(candidate.clone());
        }

        if state.count >= self.params.beta {
            state.decided = true;
        }
    }

    /// Clears everything, the preference included.
    pub fn reset(&self) {
        *self.state.lock() = SnowballState::default();
    }

    /// Consecutive confirmations of the last winner.
    #[must_use]
    pub fn progress(&self) -> u32 {
        self.state.lock().count
    }

    /// Whether the engine has decided.
    #[must_use]
    pub fn decided(&self) -> bool {
        self.state.lock().decided
    }

    /// The currently preferred candidate, if any.
    #[must_use]
    pub fn preferred(&self) -> Option<C> {
        self.state.lock().preferred.clone()
    }

    /// The lifetime tally of a candidate.
    #[must_use]
    pub fn tally(&self, id: &TransactionId) -> f64 {
        self.state.lock().counts.get(id).copied().unwrap_or(0.0)
    }

    /// Number of candidates that have won at least one tick.
    #[must_use]
    pub fn candidate_len(&self) -> usize {
        self.state.lock().candidates.len()
    }
}
