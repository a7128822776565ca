//! Batch-debounced gossip fan-out.
//!
//! Transactions to be gossiped are buffered and flushed when either the
//! debounce interval elapses since the first buffered item, or the buffered
//! byte count crosses the configured bound. A flush sends the batch to
//! every currently-closest peer, creating streams on demand and tearing
//! them down on send failure. Ordering within a batch is preserved; batches
//! across peers are fire-and-forget.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use riptide_ids::AccountId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tx::Transaction;
use crate::{Config, Result};

/// Bound on each peer's send queue, in batches. A peer that cannot drain
/// this many pending batches is dropped.
const PEER_QUEUE_BATCHES: usize = 32;

/// The transport's view of its peer set.
#[async_trait]
pub trait GossipSink: Send + Sync {
    /// Currently-closest peers, in preference order.
    fn closest_peers(&self) -> Vec<AccountId>;

    /// Opens a gossip stream to a peer.
    async fn open_stream(&self, peer: AccountId) -> Result<Box<dyn GossipStream>>;
}

/// An open per-peer gossip stream. Batches sent on one stream are delivered
/// in order.
#[async_trait]
pub trait GossipStream: Send {
    /// Sends one batch of marshaled transactions.
    async fn send(&mut self, batch: &[Vec<u8>]) -> Result<()>;
}

struct PeerHandle {
    queue: mpsc::Sender<Arc<Vec<Vec<u8>>>>,
}

/// The gossiper: a time-and-size debouncer in front of per-peer streams.
pub struct Gossiper {
    sink: Arc<dyn GossipSink>,
    pending: mpsc::UnboundedSender<Vec<u8>>,
    peers: Arc<Mutex<HashMap<AccountId, PeerHandle>>>,
    kill: CancellationToken,
}

impl Gossiper {
    /// Creates a gossiper and spawns its flush task. The task stops when
    /// `kill` is cancelled.
    #[must_use]
    pub fn new(sink: Arc<dyn GossipSink>, config: &Config, kill: CancellationToken) -> Arc<Self> {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();

        let gossiper = Arc::new(Self {
            sink,
            pending: pending_tx,
            peers: Arc::new(Mutex::new(HashMap::new())),
            kill,
        });

        tokio::spawn(debounce_loop(
            gossiper.clone(),
            pending_rx,
            config.debounce_interval,
            config.debounce_max_bytes,
        ));

        gossiper
    }

    /// Queues a transaction for gossip.
    pub fn push(&self, tx: &Transaction) {
        let data = tx.marshal();
        debug!(tx = %tx.id, units = tx.logical_units(), "queued transaction for gossip");
        let _ = self.pending.send(data);
    }

    /// Number of peers with a live stream.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Fans a batch out to every currently-closest peer. Streams are
    /// created on demand; a peer whose queue is full is dropped.
    fn flush(self: &Arc<Self>, batch: Vec<Vec<u8>>) {
        let batch = Arc::new(batch);

        for peer in self.sink.closest_peers() {
            let handle_queue = {
                let mut peers = self.peers.lock();
                match peers.get(&peer) {
                    Some(handle) => handle.queue.clone(),
                    None => {
                        let (queue_tx, queue_rx) = mpsc::channel(PEER_QUEUE_BATCHES);
                        peers.insert(
                            peer,
                            PeerHandle {
                                queue: queue_tx.clone(),
                            },
                        );
                        tokio::spawn(peer_loop(self.clone(), peer, queue_rx));
                        queue_tx
                    }
                }
            };

            if handle_queue.try_send(batch.clone()).is_err() {
                // Back-pressure: the peer cannot keep up.
                warn!(%peer, "peer send queue is full, dropping it");
                self.drop_peer(&peer);
            }
        }
    }

    fn drop_peer(&self, peer: &AccountId) {
        self.peers.lock().remove(peer);
    }
}

async fn debounce_loop(
    gossiper: Arc<Gossiper>,
    mut pending: mpsc::UnboundedReceiver<Vec<u8>>,
    interval: std::time::Duration,
    max_bytes: usize,
) {
    loop {
        // Wait for the first item of the next batch.
        let first = tokio::select! {
            _ = gossiper.kill.cancelled() => return,
            item = pending.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };

        let mut bytes = first.len();
        let mut batch = vec![first];

        let deadline = tokio::time::sleep(interval);
        tokio::pin!(deadline);

        // Accumulate until the interval elapses or the byte bound trips.
        while bytes < max_bytes {
            tokio::select! {
                _ = gossiper.kill.cancelled() => return,
                _ = &mut deadline => break,
                item = pending.recv() => match item {
                    Some(item) => {
                        bytes += item.len();
                        batch.push(item);
                    }
                    None => break,
                },
            }
        }

        gossiper.flush(batch);
    }
}

async fn peer_loop(
    gossiper: Arc<Gossiper>,
    peer: AccountId,
    mut queue: mpsc::Receiver<Arc<Vec<Vec<u8>>>>,
) {
    let mut stream = match gossiper.sink.open_stream(peer).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%peer, %err, "failed to open gossip stream");
            gossiper.drop_peer(&peer);
            return;
        }
    };

    loop {
        let batch = tokio::select! {
            _ = gossiper.kill.cancelled() => return,
            batch = queue.recv() => match batch {
                Some(batch) => batch,
                None => return,
            },
        };

        if let Err(err) = stream.send(&batch).await {
            warn!(%peer, %err, "failed to send gossip batch, tearing stream down");
            gossiper.drop_peer(&peer);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::Tag;
    use crate::LedgerError;
    use parking_lot::Mutex as SyncMutex;
    use riptide_crypto::Keypair;
    use std::time::Duration;

    struct RecordingSink {
        peers: Vec<AccountId>,
        sent: Arc<SyncMutex<Vec<(AccountId, Vec<Vec<u8>>)>>>,
        fail_for: Option<AccountId>,
    }

    struct RecordingStream {
        peer: AccountId,
        sent: Arc<SyncMutex<Vec<(AccountId, Vec<Vec<u8>>)>>>,
        fail: bool,
    }

    #[async_trait]
    impl GossipSink for RecordingSink {
        fn closest_peers(&self) -> Vec<AccountId> {
            self.peers.clone()
        }

        async fn open_stream(&self, peer: AccountId) -> Result<Box<dyn GossipStream>> {
            Ok(Box::new(RecordingStream {
                peer,
                sent: self.sent.clone(),
                fail: self.fail_for == Some(peer),
            }))
        }
    }

    #[async_trait]
    impl GossipStream for RecordingStream {
        async fn send(&mut self, batch: &[Vec<u8>]) -> Result<()> {
            if self.fail {
                return Err(LedgerError::Timeout("stream broken".to_string()));
            }
            self.sent.lock().push((self.peer, batch.to_vec()));
            Ok(())
        }
    }

    fn sample_tx(byte: u8) -> Transaction {
        let keys = Keypair::from_secret_bytes([byte; 32]);
        Transaction::new(&keys, Tag::Nop, Vec::new())
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.debounce_interval = Duration::from_millis(20);
        config.debounce_max_bytes = 16_384;
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_interval_flush_reaches_all_peers() {
        let peer_a = AccountId::from_bytes([1u8; 32]);
        let peer_b = AccountId::from_bytes([2u8; 32]);
        let sent = Arc::new(SyncMutex::new(Vec::new()));

        let sink = Arc::new(RecordingSink {
            peers: vec![peer_a, peer_b],
            sent: sent.clone(),
            fail_for: None,
        });

        let kill = CancellationToken::new();
        let gossiper = Gossiper::new(sink, &test_config(), kill.clone());

        gossiper.push(&sample_tx(1));
        gossiper.push(&sample_tx(2));

        tokio::time::sleep(Duration::from_millis(200)).await;

        let sent = sent.lock();
        let batches_a: Vec<_> = sent.iter().filter(|(peer, _)| *peer == peer_a).collect();
        let batches_b: Vec<_> = sent.iter().filter(|(peer, _)| *peer == peer_b).collect();

        // Both pushes landed in one debounced batch, in order.
        assert_eq!(batches_a.len(), 1);
        assert_eq!(batches_b.len(), 1);
        assert_eq!(batches_a[0].1.len(), 2);
        assert_eq!(batches_a[0].1[0], sample_tx(1).marshal());
        assert_eq!(batches_a[0].1[1], sample_tx(2).marshal());

        kill.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_byte_bound_forces_early_flush() {
        let peer = AccountId::from_bytes([1u8; 32]);
        let sent = Arc::new(SyncMutex::new(Vec::new()));

        let sink = Arc::new(RecordingSink {
            peers: vec![peer],
            sent: sent.clone(),
            fail_for: None,
        });

        let mut config = test_config();
        config.debounce_interval = Duration::from_secs(60);
        config.debounce_max_bytes = 1; // every push trips the bound

        let kill = CancellationToken::new();
        let gossiper = Gossiper::new(sink, &config, kill.clone());

        gossiper.push(&sample_tx(1));

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(sent.lock().len(), 1);
        kill.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_stream_is_torn_down() {
        let healthy = AccountId::from_bytes([1u8; 32]);
        let broken = AccountId::from_bytes([2u8; 32]);
        let sent = Arc::new(SyncMutex::new(Vec::new()));

        let sink = Arc::new(RecordingSink {
            peers: vec![healthy, broken],
            sent: sent.clone(),
            fail_for: Some(broken),
        });

        let kill = CancellationToken::new();
        let gossiper = Gossiper::new(sink, &test_config(), kill.clone());

        gossiper.push(&sample_tx(1));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(gossiper.stream_count(), 1);
        assert!(sent.lock().iter().all(|(peer, _)| *peer == healthy));

        kill.cancel();
    }
}
