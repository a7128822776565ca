//! Bounded-queue contracts between the core and the transport collaborator.
//!
//! Every request event carries a oneshot reply slot: the `Result`/`Error`
//! pair a client observes is modeled as a single-use promise. Outbound
//! queues (`*_out`) are consumed by the transport; inbound queues (`*_in`)
//! are consumed by the core's workers. All queues are bounded, and the
//! state machine drains its outbound queues when leaving a state.

use riptide_crypto::Signature;
use riptide_ids::{AccountId, Hash256};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::tx::{Tag, Transaction};
use crate::Result;

/// A client's request to broadcast a transaction.
///
/// On success the reply carries the fully attached transaction; on failure
/// it carries a quorum, timeout or validity error.
pub struct BroadcastRequest {
    /// Transaction tag.
    pub tag: Tag,
    /// Transaction payload.
    pub payload: Vec<u8>,
    /// Creator account.
    pub creator: AccountId,
    /// Creator's signature over tag and payload.
    pub signature: Signature,
    /// Single-use reply slot.
    pub reply: oneshot::Sender<Result<Transaction>>,
}

/// One peer's verdict on a gossiped transaction.
#[derive(Debug, Clone)]
pub struct GossipVote {
    /// The voting peer.
    pub voter: AccountId,
    /// Whether the peer accepted the transaction.
    pub ok: bool,
}

/// Outbound: ask the transport to gossip a transaction and collect votes.
pub struct GossipRequest {
    /// The transaction to gossip.
    pub tx: Transaction,
    /// Per-peer votes, or a transport error.
    pub reply: oneshot::Sender<Result<Vec<GossipVote>>>,
}

/// Inbound: a peer gossiped a transaction to us.
pub struct IncomingGossip {
    /// The gossiped transaction.
    pub tx: Transaction,
    /// Our accept/reject vote.
    pub vote: oneshot::Sender<Result<()>>,
}

/// One peer's answer to a consensus query.
#[derive(Debug, Clone)]
pub struct QueryVote {
    /// The answering peer.
    pub voter: AccountId,
    /// The peer's preferred critical transaction, if it has one.
    pub preferred: Option<Transaction>,
}

/// Outbound: query K stake-weighted peers for their preferred critical
/// transaction.
pub struct QueryRequest {
    /// Our preferred critical transaction.
    pub tx: Transaction,
    /// Per-peer answers, or a transport error.
    pub reply: oneshot::Sender<Result<Vec<QueryVote>>>,
}

/// Inbound: a peer queried us for our preference.
pub struct IncomingQuery {
    /// The querier's preferred critical transaction.
    pub tx: Transaction,
    /// Our answer: prior-round root, local preference, or nothing.
    pub response: oneshot::Sender<Result<Option<Transaction>>>,
}

/// One peer's root, reported during out-of-sync detection.
#[derive(Debug, Clone)]
pub struct OutOfSyncVote {
    /// The reporting peer.
    pub voter: AccountId,
    /// The peer's current root.
    pub root: Option<Transaction>,
}

/// Outbound: sample peers for their roots.
pub struct OutOfSyncCheck {
    /// Our current root.
    pub root: Transaction,
    /// Per-peer roots, or a transport error.
    pub reply: oneshot::Sender<Result<Vec<OutOfSyncVote>>>,
}

/// Inbound: a peer asked for our root.
pub struct IncomingOutOfSyncCheck {
    /// Our current root.
    pub response: oneshot::Sender<Transaction>,
}

/// A responder's view ID and the chunk hashes of its diff since ours.
#[derive(Debug, Clone)]
pub struct SyncInitMetadata {
    /// The responding peer.
    pub peer: AccountId,
    /// The responder's view ID.
    pub view_id: u64,
    /// Ordered hashes over the responder's diff chunks.
    pub chunk_hashes: Vec<Hash256>,
}

/// Outbound: broadcast our view ID and collect sync metadata.
pub struct SyncInitRequest {
    /// Our view ID.
    pub view_id: u64,
    /// Responder metadata, or a transport error.
    pub reply: oneshot::Sender<Result<Vec<SyncInitMetadata>>>,
}

/// Inbound: a lagging peer started a sync against us.
pub struct IncomingSyncInit {
    /// The peer's view ID.
    pub view_id: u64,
    /// Our metadata answer.
    pub response: oneshot::Sender<SyncInitMetadata>,
}

/// A chunk hash and the peers known to hold it.
#[derive(Debug, Clone)]
pub struct ChunkSource {
    /// Content hash of the chunk.
    pub hash: Hash256,
    /// Peers holding it.
    pub peers: Vec<AccountId>,
}

/// Outbound: fetch the given chunks from any of their holders.
pub struct SyncChunkRequest {
    /// Chunks to fetch, in order.
    pub sources: Vec<ChunkSource>,
    /// Chunk bytes in request order, or a transport error.
    pub reply: oneshot::Sender<Result<Vec<Vec<u8>>>>,
}

/// Inbound: a peer requested a chunk by hash.
pub struct IncomingSyncChunk {
    /// The requested chunk hash.
    pub hash: Hash256,
    /// The chunk bytes, if we hold them.
    pub response: oneshot::Sender<Option<Vec<u8>>>,
}

/// A bounded receiver shared by several workers.
///
/// The lock is held across the receive suspension, so exactly one worker
/// consumes each event.
pub struct SharedReceiver<T> {
    inner: Mutex<mpsc::Receiver<T>>,
}

impl<T> SharedReceiver<T> {
    fn new(receiver: mpsc::Receiver<T>) -> Self {
        Self {
            inner: Mutex::new(receiver),
        }
    }

    /// Receives the next event; `None` when all senders are gone.
    pub async fn recv(&self) -> Option<T> {
        self.inner.lock().await.recv().await
    }

    /// Receives without suspending.
    pub fn try_recv(&self) -> Option<T> {
        self.inner.try_lock().ok()?.try_recv().ok()
    }

    /// Drops every queued event.
    pub fn drain(&self) {
        if let Ok(mut receiver) = self.inner.try_lock() {
            while receiver.try_recv().is_ok() {}
        }
    }
}

/// All channel endpoints between the core and its collaborators.
pub struct Channels {
    /// Clients enqueue broadcasts here.
    pub broadcast: mpsc::Sender<BroadcastRequest>,
    pub(crate) broadcast_rx: SharedReceiver<BroadcastRequest>,

    /// Transport delivers peer gossip here.
    pub gossip_in: mpsc::Sender<IncomingGossip>,
    pub(crate) gossip_in_rx: SharedReceiver<IncomingGossip>,

    pub(crate) gossip_out_tx: mpsc::Sender<GossipRequest>,
    /// Transport consumes outbound gossip requests here.
    pub gossip_out: SharedReceiver<GossipRequest>,

    /// Transport delivers peer queries here.
    pub query_in: mpsc::Sender<IncomingQuery>,
    pub(crate) query_in_rx: SharedReceiver<IncomingQuery>,

    pub(crate) query_out_tx: mpsc::Sender<QueryRequest>,
    /// Transport consumes outbound queries here.
    pub query_out: SharedReceiver<QueryRequest>,

    /// Transport delivers peer root requests here.
    pub out_of_sync_in: mpsc::Sender<IncomingOutOfSyncCheck>,
    pub(crate) out_of_sync_in_rx: SharedReceiver<IncomingOutOfSyncCheck>,

    pub(crate) out_of_sync_out_tx: mpsc::Sender<OutOfSyncCheck>,
    /// Transport consumes outbound root samplings here.
    pub out_of_sync_out: SharedReceiver<OutOfSyncCheck>,

    /// Transport delivers peer sync-inits here.
    pub sync_init_in: mpsc::Sender<IncomingSyncInit>,
    pub(crate) sync_init_in_rx: SharedReceiver<IncomingSyncInit>,

    pub(crate) sync_init_out_tx: mpsc::Sender<SyncInitRequest>,
    /// Transport consumes outbound sync-inits here.
    pub sync_init_out: SharedReceiver<SyncInitRequest>,

    /// Transport delivers peer chunk requests here.
    pub sync_chunk_in: mpsc::Sender<IncomingSyncChunk>,
    pub(crate) sync_chunk_in_rx: SharedReceiver<IncomingSyncChunk>,

    pub(crate) sync_chunk_out_tx: mpsc::Sender<SyncChunkRequest>,
    /// Transport consumes outbound chunk fetches here.
    pub sync_chunk_out: SharedReceiver<SyncChunkRequest>,
}

impl Channels {
    /// Builds every queue at its bound.
    #[must_use]
    pub fn new() -> Self {
        let (broadcast, broadcast_rx) = mpsc::channel(1024);
        let (gossip_in, gossip_in_rx) = mpsc::channel(128);
        let (gossip_out_tx, gossip_out) = mpsc::channel(128);
        let (query_in, query_in_rx) = mpsc::channel(128);
        let (query_out_tx, query_out) = mpsc::channel(128);
        let (out_of_sync_in, out_of_sync_in_rx) = mpsc::channel(16);
        let (out_of_sync_out_tx, out_of_sync_out) = mpsc::channel(16);
        let (sync_init_in, sync_init_in_rx) = mpsc::channel(16);
        let (sync_init_out_tx, sync_init_out) = mpsc::channel(16);
        let (sync_chunk_in, sync_chunk_in_rx) = mpsc::channel(128);
        let (sync_chunk_out_tx, sync_chunk_out) = mpsc::channel(128);

        Self {
            broadcast,
            broadcast_rx: SharedReceiver::new(broadcast_rx),
            gossip_in,
            gossip_in_rx: SharedReceiver::new(gossip_in_rx),
            gossip_out_tx,
            gossip_out: SharedReceiver::new(gossip_out),
            query_in,
            query_in_rx: SharedReceiver::new(query_in_rx),
            query_out_tx,
            query_out: SharedReceiver::new(query_out),
            out_of_sync_in,
            out_of_sync_in_rx: SharedReceiver::new(out_of_sync_in_rx),
            out_of_sync_out_tx,
            out_of_sync_out: SharedReceiver::new(out_of_sync_out),
            sync_init_in,
            sync_init_in_rx: SharedReceiver::new(sync_init_in_rx),
            sync_init_out_tx,
            sync_init_out: SharedReceiver::new(sync_init_out),
            sync_chunk_in,
            sync_chunk_in_rx: SharedReceiver::new(sync_chunk_in_rx),
            sync_chunk_out_tx,
            sync_chunk_out: SharedReceiver::new(sync_chunk_out),
        }
    }
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}
