//! All-to-all record exchange.

use log;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

use crate::aggregator::Aggregator;
use crate::cluster::{Cluster, ConfigError, NodeId};
use crate::codec::{CodecError, Frame, Framing};
use crate::dispatcher::{Backoff, Dispatcher};
use crate::listener::Listener;
use crate::partition::PartitionMap;
use crate::record::Record;

/// Item of the aggregation channel: a decoded frame or the error that terminated a connection.
pub type Inbound = Result<Frame, ShuffleError>;

/// Exchange error.
#[derive(Debug)]
pub enum ShuffleError {
    /// Cluster configuration error.
    Config(ConfigError),
    /// Listening socket creation error.
    Bind(String, io::Error),
    /// Incoming connection accepting error.
    Accept(io::Error),
    /// Incoming stream reading error.
    Receive(SocketAddr, io::Error),
    /// Incoming stream decoding error.
    Decode(SocketAddr, CodecError),
    /// Outgoing stream writing error.
    Send(NodeId, io::Error),
    /// Node signaled the end of its stream more than once.
    DuplicateCompletion(NodeId),
    /// End of stream signaled by a node which is not a peer.
    UnknownPeer(NodeId),
    /// Aggregation channel closed before all peers completed.
    ChannelClosed { completed: usize, expected: usize },
    /// Exchange did not finish in time.
    Timeout(Duration),
    /// Exchange task panicked or was cancelled.
    Task(JoinError),
}

impl Error for ShuffleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            ShuffleError::Config(err) => Some(err),
            ShuffleError::Bind(_, err) => Some(err),
            ShuffleError::Accept(err) => Some(err),
            ShuffleError::Receive(_, err) => Some(err),
            ShuffleError::Decode(_, err) => Some(err),
            ShuffleError::Send(_, err) => Some(err),
            ShuffleError::Task(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for ShuffleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ShuffleError::Config(err) => write!(f, "configuration error: {}", err),
            ShuffleError::Bind(addr, err) => write!(f, "listening on {} failed: {}", addr, err),
            ShuffleError::Accept(err) => write!(f, "connection accepting failed: {}", err),
            ShuffleError::Receive(addr, err) => write!(f, "receiving from {} failed: {}", addr, err),
            ShuffleError::Decode(addr, err) => write!(f, "malformed stream from {}: {}", addr, err),
            ShuffleError::Send(id, err) => write!(f, "sending to server {} failed: {}", id, err),
            ShuffleError::DuplicateCompletion(id) => write!(f, "server {} completed its stream twice", id),
            ShuffleError::UnknownPeer(id) => write!(f, "end of stream from unexpected server {}", id),
            ShuffleError::ChannelClosed { completed, expected } => write!(
                f,
                "aggregation channel closed after {} of {} peer completions",
                completed, expected
            ),
            ShuffleError::Timeout(timeout) => write!(f, "exchange not finished in {:?}", timeout),
            ShuffleError::Task(err) => write!(f, "exchange task failed: {}", err),
        }
    }
}

impl From<ConfigError> for ShuffleError {
    fn from(err: ConfigError) -> Self {
        ShuffleError::Config(err)
    }
}

/// Records a node ends up with after the exchange.
#[derive(Debug)]
pub struct ShuffleOutput {
    /// Records received from the peers.
    pub received: Vec<Record>,
    /// Records of the local shard owned by the local node.
    pub local: Vec<Record>,
}

/// Shuffle builder. Provides methods for [`Shuffle`] initialization.
#[derive(Clone)]
pub struct ShuffleBuilder {
    /// Wire framing shared by all nodes.
    framing: Framing,
    /// Deadline of the whole exchange.
    timeout: Option<Duration>,
    /// Connection retry delays.
    backoff: Backoff,
    /// Aggregation channel capacity in frames.
    channel_capacity: usize,
    /// Socket read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Address to listen on instead of the one declared in the cluster config.
    listen_addr: Option<String>,
}

impl ShuffleBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ShuffleBuilder::default()
    }

    /// Builds a [`Shuffle`] instance for the given node.
    pub fn build(self, local: NodeId, cluster: Cluster) -> Result<Shuffle, ShuffleError> {
        let node = cluster.node(local)?;
        let listen_addr = self.listen_addr.unwrap_or_else(|| node.address());

        return Ok(Shuffle {
            local,
            listen_addr,
            framing: self.framing,
            timeout: self.timeout,
            channel_capacity: self.channel_capacity.max(1),
            dispatcher: Dispatcher::new(local, self.framing, self.backoff, self.rw_buf_size),
            rw_buf_size: self.rw_buf_size,
            cluster,
        });
    }

    /// Sets wire framing.
    pub fn with_framing(mut self, framing: Framing) -> ShuffleBuilder {
        self.framing = framing;
        return self;
    }

    /// Sets the deadline of the exchange. Without it a node waits for its peers forever.
    pub fn with_timeout(mut self, timeout: Duration) -> ShuffleBuilder {
        self.timeout = Some(timeout);
        return self;
    }

    /// Sets connection retry delays.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> ShuffleBuilder {
        self.backoff = Backoff::new(initial, max);
        return self;
    }

    /// Sets aggregation channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> ShuffleBuilder {
        self.channel_capacity = capacity;
        return self;
    }

    /// Sets socket read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ShuffleBuilder {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets address to listen on.
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> ShuffleBuilder {
        self.listen_addr = Some(addr.into());
        return self;
    }
}

impl Default for ShuffleBuilder {
    fn default() -> Self {
        ShuffleBuilder {
            framing: Framing::default(),
            timeout: None,
            backoff: Backoff::default(),
            channel_capacity: 1024,
            rw_buf_size: None,
            listen_addr: None,
        }
    }
}

/// Exchanges partitions between the nodes of a cluster.
///
/// Every node listens for its peers, sends every peer its partition and waits until every peer has sent its
/// partition in return. There is no coordinator: completion is detected by counting end-of-stream frames.
pub struct Shuffle {
    local: NodeId,
    cluster: Cluster,
    listen_addr: String,
    framing: Framing,
    timeout: Option<Duration>,
    channel_capacity: usize,
    rw_buf_size: Option<usize>,
    dispatcher: Dispatcher,
}

impl Shuffle {
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Binds the listening socket. Once it returns, peers can connect to this node.
    pub async fn bind(&self) -> Result<Listener, ShuffleError> {
        Listener::bind(&self.listen_addr, self.framing, self.rw_buf_size).await
    }

    /// Binds the listening socket and runs the exchange.
    pub async fn run(&self, partitions: PartitionMap) -> Result<ShuffleOutput, ShuffleError> {
        let listener = self.bind().await?;
        self.run_with_listener(listener, partitions).await
    }

    /// Runs the exchange accepting peer connections on an already bound listener.
    pub async fn run_with_listener(
        &self,
        listener: Listener,
        partitions: PartitionMap,
    ) -> Result<ShuffleOutput, ShuffleError> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.exchange(listener, partitions))
                .await
                .map_err(|_| ShuffleError::Timeout(timeout))?,
            None => self.exchange(listener, partitions).await,
        }
    }

    async fn exchange(&self, listener: Listener, mut partitions: PartitionMap) -> Result<ShuffleOutput, ShuffleError> {
        let (tx, mut rx) = mpsc::channel(self.channel_capacity);

        // dropping the sets aborts whatever is still running
        let mut background = JoinSet::new();
        background.spawn(listener.serve(tx));

        let mut dispatchers = JoinSet::new();
        for peer in self.cluster.peers(self.local) {
            let peer = peer.clone();
            let records = partitions.take(peer.id);
            let dispatcher = self.dispatcher.clone();
            dispatchers.spawn(async move { dispatcher.dispatch(&peer, records).await });
        }
        let local = partitions.take(self.local);

        let aggregator = Aggregator::new(self.local, self.cluster.size(), self.framing);
        log::info!(
            "exchange started (server: {}, peers: {}, framing: {})",
            self.local,
            aggregator.num_peers(),
            self.framing
        );

        let aggregate = aggregator.aggregate(&mut rx);
        tokio::pin!(aggregate);

        let mut sent = 0;
        let received = loop {
            tokio::select! {
                result = &mut aggregate => break result?,
                Some(joined) = dispatchers.join_next() => {
                    sent += joined.map_err(ShuffleError::Task)??;
                }
            }
        };

        // peers still depend on the partitions this node sends
        while let Some(joined) = dispatchers.join_next().await {
            sent += joined.map_err(ShuffleError::Task)??;
        }

        log::info!(
            "exchange finished (sent: {}, received: {}, kept: {})",
            sent,
            received.len(),
            local.len()
        );

        return Ok(ShuffleOutput { received, local });
    }
}
