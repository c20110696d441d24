//! Completion detection of the all-to-all exchange.

use log;
use std::collections::BTreeSet;

use tokio::sync::mpsc;

use crate::cluster::NodeId;
use crate::codec::{Frame, Framing};
use crate::record::Record;
use crate::shuffle::{Inbound, ShuffleError};

/// Tracks which peers have finished sending.
///
/// Completions signaled by an in-band sentinel carry no sender and are only counted. Completions carrying a
/// sender id are tracked per peer so that duplicates and strangers are detected.
#[derive(Debug)]
struct Completion {
    expected: usize,
    anonymous: usize,
    peers: BTreeSet<NodeId>,
    membership: Option<(NodeId, usize)>,
}

impl Completion {
    fn new(expected: usize) -> Self {
        Completion {
            expected,
            anonymous: 0,
            peers: BTreeSet::new(),
            membership: None,
        }
    }

    fn with_membership(local: NodeId, cluster_size: usize) -> Self {
        Completion {
            membership: Some((local, cluster_size)),
            ..Completion::new(cluster_size.saturating_sub(1))
        }
    }

    fn anonymous(&mut self) {
        self.anonymous += 1;
    }

    fn peer(&mut self, id: NodeId) -> Result<(), ShuffleError> {
        if let Some((local, cluster_size)) = self.membership {
            if id == local || id as usize >= cluster_size {
                return Err(ShuffleError::UnknownPeer(id));
            }
        }
        if !self.peers.insert(id) {
            return Err(ShuffleError::DuplicateCompletion(id));
        }
        return Ok(());
    }

    fn count(&self) -> usize {
        self.anonymous + self.peers.len()
    }

    fn is_done(&self) -> bool {
        self.count() >= self.expected
    }
}

/// Collects the records sent by the peers of a node.
#[derive(Debug)]
pub struct Aggregator {
    framing: Framing,
    completion: Completion,
}

impl Aggregator {
    /// Creates an aggregator for the `local` node of a cluster. It waits for every other node of the cluster.
    pub fn new(local: NodeId, cluster_size: usize, framing: Framing) -> Self {
        Aggregator {
            framing,
            completion: Completion::with_membership(local, cluster_size),
        }
    }

    /// Number of peer completions the aggregator waits for.
    pub fn num_peers(&self) -> usize {
        self.completion.expected
    }

    /// Receives frames until every peer has completed. Returns the received records without end-of-stream markers.
    ///
    /// Records of different peers are returned in arrival order; records of one peer keep the order they were sent.
    pub async fn aggregate(mut self, rx: &mut mpsc::Receiver<Inbound>) -> Result<Vec<Record>, ShuffleError> {
        let mut records = Vec::new();

        while !self.completion.is_done() {
            let frame = match rx.recv().await {
                Some(inbound) => inbound?,
                None => {
                    return Err(ShuffleError::ChannelClosed {
                        completed: self.completion.count(),
                        expected: self.completion.expected,
                    })
                }
            };

            match frame {
                Frame::Data(record) if self.framing.in_band_sentinel() && record.is_sentinel() => {
                    self.completion.anonymous();
                    log::info!(
                        "peer completed ({}/{})",
                        self.completion.count(),
                        self.completion.expected
                    );
                }
                Frame::Data(record) => records.push(record),
                Frame::End(id) => {
                    self.completion.peer(id)?;
                    log::info!(
                        "server {} completed ({}/{})",
                        id,
                        self.completion.count(),
                        self.completion.expected
                    );
                }
            }
        }

        log::debug!("aggregation done ({} records)", records.len());
        return Ok(records);
    }
}

/// Receives records until `num_peers` end-of-stream signals are observed.
///
/// Sentinel records are counted as completions, whoever sent them; end frames must come from distinct senders.
pub async fn aggregate(rx: &mut mpsc::Receiver<Inbound>, num_peers: usize) -> Result<Vec<Record>, ShuffleError> {
    let aggregator = Aggregator {
        framing: Framing::Sentinel,
        completion: Completion::new(num_peers),
    };
    aggregator.aggregate(rx).await
}
