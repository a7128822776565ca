//! The consensus state machine.
//!
//! The machine is a trampoline: each state is an async function that runs a
//! group of cooperating workers and returns the next state. Workers report
//! [`Transition`]s; the first one to fire stops the group.
//!
//! ```text
//!               gossiping ── PreferredSelected ──► querying
//!                   ▲                                  │
//!                   │                           RoundFinished
//!                   └──────────────────────────────────┘
//!     any ── OutOfSync ──► syncing ── (success or fail) ──► gossiping
//! ```
//!
//! Workers suspend only on channel operations, timers and cancellation
//! tokens; every suspension point also watches the process-wide kill token
//! and the state's stop token.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use riptide_ids::{hash256, AccountId, Hash256, TransactionId};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accounts::compute_stake_distribution;
use crate::events::{
    ChunkSource, GossipRequest, OutOfSyncCheck, QueryRequest, SyncChunkRequest, SyncInitMetadata,
    SyncInitRequest,
};
use crate::ledger::Ledger;
use crate::tx::{Tag, Transaction};
use crate::{Interrupt, LedgerError, Transition};

/// The three states of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Admitting gossip and hunting for a critical candidate.
    Gossiping,
    /// Converging on a critical transaction via Snowball.
    Querying,
    /// Catching up to the quorum's view via chunked diffs.
    Syncing,
}

type Worker = Pin<Box<dyn Future<Output = Transition> + Send>>;

/// Runs the ledger until it is killed.
pub async fn run(ledger: Arc<Ledger>) {
    let mut state = State::Gossiping;

    loop {
        let next = match state {
            State::Gossiping => gossiping(&ledger).await,
            State::Querying => querying(&ledger).await,
            State::Syncing => syncing(&ledger).await,
        };

        match next {
            Some(next) => state = next,
            None => return,
        }
    }
}

/// Spawns the workers, waits for the first transition, then quiesces the
/// rest.
async fn run_group(workers: Vec<Worker>, stop: CancellationToken) -> Transition {
    let mut set = JoinSet::new();
    for worker in workers {
        set.spawn(worker);
    }

    let first = match set.join_next().await {
        Some(Ok(transition)) => transition,
        _ => Transition::Stopped,
    };

    stop.cancel();
    while set.join_next().await.is_some() {}

    first
}

fn shared_listeners(ledger: &Arc<Ledger>, stop: &CancellationToken) -> Vec<Worker> {
    vec![
        Box::pin(out_of_sync_detector(ledger.clone(), stop.clone())),
        Box::pin(out_of_sync_responder(ledger.clone(), stop.clone())),
        Box::pin(sync_init_responder(ledger.clone(), stop.clone())),
        Box::pin(sync_chunk_responder(ledger.clone(), stop.clone())),
    ]
}

async fn gossiping(ledger: &Arc<Ledger>) -> Option<State> {
    info!("now gossiping");

    let stop = CancellationToken::new();
    let mut workers: Vec<Worker> = Vec::new();

    let parallelism = std::thread::available_parallelism()
        .map(|parallelism| parallelism.get())
        .unwrap_or(1);
    for _ in 0..parallelism {
        workers.push(Box::pin(gossip_worker(ledger.clone(), stop.clone())));
        workers.push(Box::pin(gossip_listener(ledger.clone(), stop.clone())));
    }
    workers.extend(shared_listeners(ledger, &stop));

    match run_group(workers, stop).await {
        Transition::PreferredSelected => Some(State::Querying),
        Transition::OutOfSync => Some(State::Syncing),
        _ => None,
    }
}

async fn querying(ledger: &Arc<Ledger>) -> Option<State> {
    info!("now querying");

    let stop = CancellationToken::new();
    let finalized = Arc::new(AtomicBool::new(false));

    let mut workers: Vec<Worker> = vec![
        Box::pin(query_worker(ledger.clone(), stop.clone(), finalized)),
        Box::pin(query_listener(ledger.clone(), stop.clone())),
    ];
    workers.extend(shared_listeners(ledger, &stop));

    let transition = run_group(workers, stop).await;

    // Outbound queries must not leak into the next state.
    ledger.channels.query_out.drain();

    match transition {
        Transition::RoundFinished => Some(State::Gossiping),
        Transition::OutOfSync => Some(State::Syncing),
        _ => None,
    }
}

async fn syncing(ledger: &Arc<Ledger>) -> Option<State> {
    info!("now syncing");

    let Some(target) = ledger.sync.preferred() else {
        return Some(State::Gossiping);
    };
    ledger.sync.reset();

    let stop = CancellationToken::new();
    match sync_up(ledger, &stop, target).await {
        Ok(()) => {}
        Err(Interrupt::Transition(Transition::Stopped)) => return None,
        Err(Interrupt::Transition(_)) => {}
        Err(Interrupt::Fault(err)) => warn!(%err, "failed to sync"),
    }

    Some(State::Gossiping)
}

/// Outcome of one worker iteration.
enum Step {
    Continue,
    Done(Transition),
}

/// Timeouts retry; transitions end the worker; any other fault stops the
/// machine.
fn step(result: Result<(), Interrupt>, worker: &str) -> Step {
    match result {
        Ok(()) => Step::Continue,
        Err(Interrupt::Fault(LedgerError::Timeout(reason))) => {
            debug!(worker, %reason, "worker iteration timed out");
            Step::Continue
        }
        Err(Interrupt::Fault(err)) => {
            warn!(worker, %err, "worker fault");
            Step::Done(Transition::Stopped)
        }
        Err(Interrupt::Transition(transition)) => Step::Done(transition),
    }
}

fn stopped(ledger: &Ledger, stop: &CancellationToken) -> bool {
    ledger.kill.is_cancelled() || stop.is_cancelled()
}

/// Sleeps, or returns `Stopped` when cancelled first.
async fn pause(
    ledger: &Ledger,
    stop: &CancellationToken,
    duration: Duration,
) -> Result<(), Interrupt> {
    tokio::select! {
        _ = ledger.kill.cancelled() => Err(Transition::Stopped.into()),
        _ = stop.cancelled() => Err(Transition::Stopped.into()),
        _ = sleep(duration) => Ok(()),
    }
}

// ---- gossiping ----

async fn gossip_worker(ledger: Arc<Ledger>, stop: CancellationToken) -> Transition {
    let mut broadcast_nops = false;

    loop {
        if stopped(&ledger, &stop) {
            return Transition::Stopped;
        }
        match step(gossip_once(&ledger, &stop, &mut broadcast_nops).await, "gossip") {
            Step::Continue => {}
            Step::Done(transition) => return transition,
        }
    }
}

async fn gossip_once(
    ledger: &Arc<Ledger>,
    stop: &CancellationToken,
    broadcast_nops: &mut bool,
) -> Result<(), Interrupt> {
    let snapshot = ledger.accounts.snapshot();

    let (tx, reply) = match ledger.channels.broadcast_rx.try_recv() {
        Some(request) => {
            let mut tx = Transaction {
                id: TransactionId::ZERO,
                tag: request.tag,
                payload: request.payload,
                creator: request.creator,
                creator_signature: request.signature,
                sender: AccountId::ZERO,
                sender_signature: riptide_crypto::Signature::ZERO,
                parents: Vec::new(),
                timestamp: 0,
                view_id: 0,
                accounts_checksum: [0u8; 32],
                difficulty_timestamps: Vec::new(),
            };
            tx.rehash();
            (tx, Some(request.reply))
        }
        None => {
            if !*broadcast_nops {
                pause(ledger, stop, ledger.config.broadcast_idle_interval).await?;
                return Ok(());
            }

            // Nops only make sense while we can afford their fees.
            let balance =
                crate::accounts::read_balance(&snapshot, &ledger.account())?.unwrap_or(0);
            if balance < ledger.config.transaction_fee_amount {
                pause(ledger, stop, ledger.config.broadcast_idle_interval).await?;
                return Ok(());
            }

            (Transaction::new(&ledger.keys, Tag::Nop, Vec::new()), None)
        }
    };

    let tx = match ledger.attach_sender(tx) {
        Ok(tx) => tx,
        Err(err) => {
            if let Some(reply) = reply {
                let _ = reply.send(Err(err));
            }
            return Ok(());
        }
    };

    let (vote_tx, vote_rx) = oneshot::channel();
    let request = GossipRequest {
        tx: tx.clone(),
        reply: vote_tx,
    };

    tokio::select! {
        _ = ledger.kill.cancelled() => return Err(Transition::Stopped.into()),
        _ = stop.cancelled() => return Err(Transition::Stopped.into()),
        _ = sleep(ledger.config.gossip_timeout) => {
            if let Some(reply) = reply {
                let _ = reply.send(Err(LedgerError::Timeout("gossip queue is full".to_string())));
            }
            return Ok(());
        }
        result = ledger.channels.gossip_out_tx.send(request) => {
            if result.is_err() {
                return Err(Transition::Stopped.into());
            }
        }
    }

    let votes = tokio::select! {
        _ = ledger.kill.cancelled() => return Err(Transition::Stopped.into()),
        _ = stop.cancelled() => return Err(Transition::Stopped.into()),
        _ = sleep(ledger.config.gossip_timeout) => {
            if let Some(reply) = reply {
                let _ = reply.send(Err(LedgerError::Timeout(
                    "did not get back a gossip response".to_string(),
                )));
            }
            return Ok(());
        }
        result = vote_rx => match result {
            Ok(Ok(votes)) => votes,
            Ok(Err(err)) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
                return Ok(());
            }
            Err(_) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(LedgerError::Timeout(
                        "transport dropped the gossip request".to_string(),
                    )));
                }
                return Ok(());
            }
        },
    };

    if !votes.is_empty() {
        let voters: Vec<AccountId> = votes.iter().map(|vote| vote.voter).collect();
        let weights = compute_stake_distribution(
            &snapshot,
            &voters,
            ledger.config.query.k,
            ledger.config.minimum_stake,
        );

        let positives: f64 = votes
            .iter()
            .filter(|vote| vote.ok)
            .filter_map(|vote| weights.get(&vote.voter))
            .sum();

        if positives < ledger.config.query.alpha {
            if let Some(reply) = reply {
                let _ = reply.send(Err(LedgerError::QuorumFailed {
                    got: positives,
                    required: ledger.config.query.alpha,
                }));
            }
        } else {
            // Double-check that the transaction is still admissible after
            // the round trip.
            match ledger.add_transaction(tx.clone()) {
                Ok(()) => {
                    let queue_len = ledger.channels.broadcast.max_capacity()
                        - ledger.channels.broadcast.capacity();
                    if queue_len == 0 && !*broadcast_nops {
                        *broadcast_nops = true;
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(tx));
                    }
                }
                Err(err) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(err));
                    }
                }
            }
        }
    }

    if ledger.round.preferred().is_some() {
        return Err(Transition::PreferredSelected.into());
    }

    Ok(())
}

async fn gossip_listener(ledger: Arc<Ledger>, stop: CancellationToken) -> Transition {
    loop {
        if stopped(&ledger, &stop) {
            return Transition::Stopped;
        }
        match step(gossip_listen_once(&ledger, &stop).await, "gossip-listener") {
            Step::Continue => {}
            Step::Done(transition) => return transition,
        }
    }
}

async fn gossip_listen_once(
    ledger: &Arc<Ledger>,
    stop: &CancellationToken,
) -> Result<(), Interrupt> {
    tokio::select! {
        _ = ledger.kill.cancelled() => return Err(Transition::Stopped.into()),
        _ = stop.cancelled() => return Err(Transition::Stopped.into()),
        event = ledger.channels.query_in_rx.recv() => {
            let Some(event) = event else {
                return Err(Transition::Stopped.into());
            };

            // A query arrived while we were still gossiping. Answer with the
            // prior round's root when the querier lags a round, otherwise
            // admit and prefer their critical transaction.
            let root = ledger.graph.root();
            if root.view_id != 0 && event.tx.view_id == root.view_id {
                let _ = event.response.send(Ok(Some((*root).clone())));
            } else if !event.tx.is_critical(ledger.graph.difficulty()) {
                let _ = event.response.send(Err(LedgerError::InvalidTransaction(
                    "queried transaction is not critical".to_string(),
                )));
            } else if let Err(err) = ledger.add_transaction(event.tx.clone()) {
                let _ = event.response.send(Err(err));
            } else {
                let _ = event.response.send(Ok(ledger.round.preferred()));
            }
        }
        event = ledger.channels.gossip_in_rx.recv() => {
            let Some(event) = event else {
                return Err(Transition::Stopped.into());
            };

            if ledger.graph.lookup(&event.tx.id).is_some() {
                let _ = event.vote.send(Ok(()));
            } else {
                match ledger.add_transaction(event.tx) {
                    Ok(()) => {
                        let _ = event.vote.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = event.vote.send(Err(err));
                    }
                }
            }
        }
    }

    if ledger.round.preferred().is_some() {
        return Err(Transition::PreferredSelected.into());
    }

    Ok(())
}

// ---- querying ----

async fn query_worker(
    ledger: Arc<Ledger>,
    stop: CancellationToken,
    finalized: Arc<AtomicBool>,
) -> Transition {
    loop {
        if stopped(&ledger, &stop) {
            return Transition::Stopped;
        }
        match step(query_once(&ledger, &stop, &finalized).await, "query") {
            Step::Continue => {}
            Step::Done(transition) => return transition,
        }
    }
}

async fn query_once(
    ledger: &Arc<Ledger>,
    stop: &CancellationToken,
    finalized: &AtomicBool,
) -> Result<(), Interrupt> {
    let snapshot = ledger.accounts.snapshot();

    let Some(preferred) = ledger.round.preferred() else {
        return Err(Transition::RoundFinished.into());
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let request = QueryRequest {
        tx: preferred,
        reply: reply_tx,
    };

    tokio::select! {
        _ = ledger.kill.cancelled() => return Err(Transition::Stopped.into()),
        _ = stop.cancelled() => return Err(Transition::Stopped.into()),
        _ = sleep(ledger.config.query_timeout) => {
            return Err(LedgerError::Timeout("query queue is full".to_string()).into());
        }
        result = ledger.channels.query_out_tx.send(request) => {
            if result.is_err() {
                return Err(Transition::Stopped.into());
            }
        }
    }

    let votes = tokio::select! {
        _ = ledger.kill.cancelled() => return Err(Transition::Stopped.into()),
        _ = stop.cancelled() => return Err(Transition::Stopped.into()),
        _ = sleep(ledger.config.query_timeout) => {
            return Err(LedgerError::Timeout(
                "did not get back a query response".to_string(),
            ).into());
        }
        result = reply_rx => match result {
            Ok(Ok(votes)) => votes,
            Ok(Err(err)) => {
                warn!(%err, "error while querying");
                return Ok(());
            }
            Err(_) => {
                return Err(LedgerError::Timeout(
                    "transport dropped the query".to_string(),
                ).into());
            }
        },
    };

    if votes.is_empty() {
        return Ok(());
    }

    let our_view = ledger.graph.view_id();

    let mut voters: Vec<AccountId> = Vec::new();
    let mut candidates: HashMap<TransactionId, Transaction> = HashMap::new();

    for vote in &votes {
        if let Some(preferred) = &vote.preferred {
            if preferred.view_id == our_view && !preferred.id.is_zero() {
                candidates.insert(preferred.id, preferred.clone());
                voters.push(vote.voter);
            }
        }
    }

    let weights = compute_stake_distribution(
        &snapshot,
        &voters,
        ledger.config.query.k,
        ledger.config.minimum_stake,
    );

    let mut counts: HashMap<TransactionId, f64> = HashMap::new();
    for vote in &votes {
        if let Some(preferred) = &vote.preferred {
            if preferred.view_id == our_view && !preferred.id.is_zero() {
                if let Some(weight) = weights.get(&vote.voter) {
                    *counts.entry(preferred.id).or_insert(0.0) += weight;
                }
            }
        }
    }

    ledger.round.tick(&counts, &candidates);

    // Once Snowball finalizes, collapse the winner's ancestry, commit, and
    // reset for the next round. Exactly once per querying cycle.
    if ledger.round.decided() {
        if finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let Some(new_root) = ledger.round.preferred() else {
                return Err(Transition::RoundFinished.into());
            };
            let old_root = ledger.graph.root();

            let state = ledger
                .collapse_transactions(&new_root, true)
                .map_err(Interrupt::Fault)?;
            ledger
                .install_root(new_root.clone(), state)
                .map_err(Interrupt::Fault)?;

            info!(
                old_view_id = old_root.view_id + 1,
                new_view_id = new_root.view_id + 1,
                old_root = %old_root.id,
                new_root = %new_root.id,
                new_accounts_checksum = %hex::encode(new_root.accounts_checksum),
                "finalized consensus round, and incremented view ID"
            );
        }

        return Err(Transition::RoundFinished.into());
    }

    Ok(())
}

async fn query_listener(ledger: Arc<Ledger>, stop: CancellationToken) -> Transition {
    loop {
        if stopped(&ledger, &stop) {
            return Transition::Stopped;
        }
        match step(query_listen_once(&ledger, &stop).await, "query-listener") {
            Step::Continue => {}
            Step::Done(transition) => return transition,
        }
    }
}

async fn query_listen_once(
    ledger: &Arc<Ledger>,
    stop: &CancellationToken,
) -> Result<(), Interrupt> {
    tokio::select! {
        _ = ledger.kill.cancelled() => return Err(Transition::Stopped.into()),
        _ = stop.cancelled() => return Err(Transition::Stopped.into()),
        event = ledger.channels.query_in_rx.recv() => {
            let Some(event) = event else {
                return Err(Transition::Stopped.into());
            };

            // Answer with the prior-round root for laggards, else our own
            // preference, else nothing.
            let root = ledger.graph.root();
            if root.view_id != 0 && event.tx.view_id == root.view_id {
                let _ = event.response.send(Ok(Some((*root).clone())));
            } else {
                let _ = event.response.send(Ok(ledger.round.preferred()));
            }
        }
    }

    if ledger.round.preferred().is_none() {
        return Err(Transition::RoundFinished.into());
    }

    Ok(())
}

// ---- out-of-sync detection ----

async fn out_of_sync_detector(ledger: Arc<Ledger>, stop: CancellationToken) -> Transition {
    loop {
        if stopped(&ledger, &stop) {
            return Transition::Stopped;
        }
        match step(out_of_sync_once(&ledger, &stop).await, "out-of-sync") {
            Step::Continue => {}
            Step::Done(transition) => return transition,
        }
    }
}

async fn out_of_sync_once(
    ledger: &Arc<Ledger>,
    stop: &CancellationToken,
) -> Result<(), Interrupt> {
    pause(ledger, stop, ledger.config.idle_poll_interval).await?;

    let snapshot = ledger.accounts.snapshot();

    let (reply_tx, reply_rx) = oneshot::channel();
    let request = OutOfSyncCheck {
        root: (*ledger.graph.root()).clone(),
        reply: reply_tx,
    };

    tokio::select! {
        _ = ledger.kill.cancelled() => return Err(Transition::Stopped.into()),
        _ = stop.cancelled() => return Err(Transition::Stopped.into()),
        result = ledger.channels.out_of_sync_out_tx.send(request) => {
            if result.is_err() {
                return Err(Transition::Stopped.into());
            }
        }
    }

    let votes = tokio::select! {
        _ = ledger.kill.cancelled() => return Err(Transition::Stopped.into()),
        _ = stop.cancelled() => return Err(Transition::Stopped.into()),
        result = reply_rx => match result {
            Ok(Ok(votes)) => votes,
            Ok(Err(err)) => {
                debug!(%err, "got error while checking if out of sync");
                return Ok(());
            }
            Err(_) => return Ok(()),
        },
    };

    if votes.is_empty() {
        return Ok(());
    }

    let mut voters: Vec<AccountId> = Vec::new();
    let mut candidates: HashMap<TransactionId, Transaction> = HashMap::new();

    for vote in &votes {
        if let Some(root) = &vote.root {
            if !root.id.is_zero() {
                candidates.insert(root.id, root.clone());
                voters.push(vote.voter);
            }
        }
    }

    let weights = compute_stake_distribution(
        &snapshot,
        &voters,
        ledger.config.sync.k,
        ledger.config.minimum_stake,
    );

    let mut counts: HashMap<TransactionId, f64> = HashMap::new();
    for vote in &votes {
        if let Some(root) = &vote.root {
            if !root.id.is_zero() {
                if let Some(weight) = weights.get(&vote.voter) {
                    *counts.entry(root.id).or_insert(0.0) += weight;
                }
            }
        }
    }

    ledger.sync.tick(&counts, &candidates);

    if ledger.sync.decided() {
        let Some(root) = ledger.sync.preferred() else {
            return Ok(());
        };

        // The network's agreed root is not actually ahead of us; back off
        // and start sampling over.
        if ledger.graph.root().id == root.id || ledger.graph.view_id() >= root.view_id + 1 {
            pause(ledger, stop, ledger.config.out_of_sync_backoff).await?;
            ledger.sync.reset();
            return Ok(());
        }

        return Err(Transition::OutOfSync.into());
    }

    Ok(())
}

async fn out_of_sync_responder(ledger: Arc<Ledger>, stop: CancellationToken) -> Transition {
    loop {
        if stopped(&ledger, &stop) {
            return Transition::Stopped;
        }

        tokio::select! {
            _ = ledger.kill.cancelled() => return Transition::Stopped,
            _ = stop.cancelled() => return Transition::Stopped,
            event = ledger.channels.out_of_sync_in_rx.recv() => {
                let Some(event) = event else {
                    return Transition::Stopped;
                };
                let _ = event.response.send((*ledger.graph.root()).clone());
            }
        }
    }
}

// ---- sync serving ----

async fn sync_init_responder(ledger: Arc<Ledger>, stop: CancellationToken) -> Transition {
    loop {
        if stopped(&ledger, &stop) {
            return Transition::Stopped;
        }

        tokio::select! {
            _ = ledger.kill.cancelled() => return Transition::Stopped,
            _ = stop.cancelled() => return Transition::Stopped,
            event = ledger.channels.sync_init_in_rx.recv() => {
                let Some(event) = event else {
                    return Transition::Stopped;
                };

                let mut chunk_hashes = Vec::new();
                match ledger.accounts.snapshot().dump_diff(event.view_id) {
                    Ok(diff) => {
                        let mut cache = ledger.chunk_cache.lock();
                        for chunk in diff.chunks(ledger.config.sync_chunk_size) {
                            let hash = hash256(chunk);
                            cache.put(hash, chunk.to_vec());
                            chunk_hashes.push(hash);
                        }
                    }
                    Err(err) => {
                        warn!(%err, "failed to dump diff for a sync init");
                    }
                }

                let _ = event.response.send(SyncInitMetadata {
                    peer: ledger.account(),
                    view_id: ledger.graph.view_id(),
                    chunk_hashes,
                });
            }
        }
    }
}

async fn sync_chunk_responder(ledger: Arc<Ledger>, stop: CancellationToken) -> Transition {
    loop {
        if stopped(&ledger, &stop) {
            return Transition::Stopped;
        }

        tokio::select! {
            _ = ledger.kill.cancelled() => return Transition::Stopped,
            _ = stop.cancelled() => return Transition::Stopped,
            event = ledger.channels.sync_chunk_in_rx.recv() => {
                let Some(event) = event else {
                    return Transition::Stopped;
                };

                let chunk = ledger.chunk_cache.lock().get(&event.hash).cloned();
                if let Some(chunk) = &chunk {
                    debug!(
                        requested = %hex::encode(event.hash),
                        provided = %hex::encode(hash256(chunk)),
                        "responded to sync chunk request"
                    );
                }
                let _ = event.response.send(chunk);
            }
        }
    }
}

// ---- syncing ----

async fn sync_up(
    ledger: &Arc<Ledger>,
    stop: &CancellationToken,
    target: Transaction,
) -> Result<(), Interrupt> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let request = SyncInitRequest {
        view_id: ledger.graph.view_id(),
        reply: reply_tx,
    };

    tokio::select! {
        _ = ledger.kill.cancelled() => return Err(Transition::Stopped.into()),
        _ = stop.cancelled() => return Err(Transition::Stopped.into()),
        result = ledger.channels.sync_init_out_tx.send(request) => {
            if result.is_err() {
                return Err(Transition::Stopped.into());
            }
        }
    }

    let votes = tokio::select! {
        _ = ledger.kill.cancelled() => return Err(Transition::Stopped.into()),
        _ = stop.cancelled() => return Err(Transition::Stopped.into()),
        result = reply_rx => match result {
            Ok(Ok(votes)) => votes,
            Ok(Err(err)) => {
                return Err(LedgerError::SyncFailed(err.to_string()).into());
            }
            Err(_) => {
                return Err(LedgerError::SyncFailed(
                    "transport dropped the sync init".to_string(),
                ).into());
            }
        },
    };

    let selected = select_sync_quorum(&votes).ok_or_else(|| {
        Interrupt::from(LedgerError::SyncFailed(
            "no consensus on which view ID to sync towards".to_string(),
        ))
    })?;

    let sources = collect_chunk_sources(&selected).map_err(Interrupt::Fault)?;

    let (reply_tx, reply_rx) = oneshot::channel();
    let request = SyncChunkRequest {
        sources,
        reply: reply_tx,
    };

    tokio::select! {
        _ = ledger.kill.cancelled() => return Err(Transition::Stopped.into()),
        _ = stop.cancelled() => return Err(Transition::Stopped.into()),
        _ = sleep(ledger.config.query_timeout) => {
            return Err(LedgerError::SyncFailed(
                "timed out while waiting for the sync chunk queue to empty up".to_string(),
            ).into());
        }
        result = ledger.channels.sync_chunk_out_tx.send(request) => {
            if result.is_err() {
                return Err(Transition::Stopped.into());
            }
        }
    }

    let chunks = tokio::select! {
        _ = ledger.kill.cancelled() => return Err(Transition::Stopped.into()),
        _ = stop.cancelled() => return Err(Transition::Stopped.into()),
        result = reply_rx => match result {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(err)) => {
                return Err(LedgerError::SyncFailed(err.to_string()).into());
            }
            Err(_) => {
                return Err(LedgerError::SyncFailed(
                    "transport dropped the chunk fetch".to_string(),
                ).into());
            }
        },
    };

    let diff: Vec<u8> = chunks.concat();

    // Apply against a fresh snapshot and verify before committing anything.
    let mut snapshot = ledger.accounts.snapshot();
    snapshot
        .apply_diff(&diff)
        .map_err(|err| Interrupt::from(LedgerError::SyncFailed(err.to_string())))?;

    if snapshot.checksum() != target.accounts_checksum {
        return Err(LedgerError::SyncFailed(
            "applying the diff yielded an unexpected accounts checksum".to_string(),
        )
        .into());
    }

    ledger
        .install_root(target, snapshot)
        .map_err(Interrupt::Fault)?;

    info!(num_chunks = chunks.len(), "successfully synced to the network's state");

    Ok(())
}

/// Groups responders by view ID and returns the group holding at least two
/// thirds of the responses, preferring the highest such view.
fn select_sync_quorum(votes: &[SyncInitMetadata]) -> Option<Vec<SyncInitMetadata>> {
    if votes.is_empty() {
        return None;
    }

    let mut by_view: HashMap<u64, Vec<SyncInitMetadata>> = HashMap::new();
    for vote in votes {
        by_view.entry(vote.view_id).or_default().push(vote.clone());
    }

    let needed = (votes.len() * 2).div_ceil(3);

    let mut views: Vec<u64> = by_view.keys().copied().collect();
    views.sort_unstable_by(|a, b| b.cmp(a));

    views.into_iter().find_map(|view| {
        let group = &by_view[&view];
        (group.len() >= needed).then(|| group.clone())
    })
}

/// For each chunk index, picks the hash held by at least two thirds of the
/// selected responders. Any gap fails the sync.
fn collect_chunk_sources(selected: &[SyncInitMetadata]) -> Result<Vec<ChunkSource>, LedgerError> {
    let mut sources = Vec::new();
    let needed = ((selected.len() * 2).div_ceil(3)).max(1);

    for index in 0.. {
        let mut holders: HashMap<Hash256, Vec<AccountId>> = HashMap::new();
        let mut in_range = false;

        for vote in selected {
            if let Some(hash) = vote.chunk_hashes.get(index) {
                holders.entry(*hash).or_default().push(vote.peer);
                in_range = true;
            }
        }

        if !in_range {
            break;
        }

        // Deterministic pick: most holders first, then lowest hash.
        let consistent = holders
            .into_iter()
            .filter(|(_, peers)| peers.len() >= needed)
            .min_by(|(hash_a, peers_a), (hash_b, peers_b)| {
                peers_b
                    .len()
                    .cmp(&peers_a.len())
                    .then_with(|| hash_a.cmp(hash_b))
            });

        match consistent {
            Some((hash, peers)) => sources.push(ChunkSource { hash, peers }),
            None => {
                return Err(LedgerError::SyncFailed(
                    "chunk hashes are not consistent across the quorum".to_string(),
                ))
            }
        }
    }

    Ok(sources)
}
