//! `netsort` is a distributed external sort of fixed-width records.
//!
//! A fixed set of nodes, each holding a shard of [`RECORD_SIZE`](record::RECORD_SIZE) byte records, redistributes
//! the records by key range so that every node ends up with exactly the records whose key falls into its range.
//! Then every node sorts its records and persists them. Concatenating the outputs of the nodes in node id order
//! yields the whole data set sorted by key.
//!
//! # Overview
//!
//! A run of a node goes through the following steps:
//!
//! * **Partitioning:**
//!   the local shard is split by the top `ceil(log2(cluster size))` bits of the first key byte
//!   (see [`partition_owner`]).
//! * **Exchange:**
//!   the node listens for its peers and concurrently sends every peer its partition over a dedicated TCP
//!   connection followed by an end-of-stream marker (see [`Shuffle`]). There is no coordinator; a node knows the
//!   exchange is over once it has seen an end-of-stream marker from every peer and delivered its own partitions.
//! * **Merging:**
//!   received records and the locally owned partition are sorted by key in parallel (see [`FinalMerger`]).
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::time::Duration;
//!
//! use netsort::{load_shard, write_shard, Cluster, FinalMerger, PartitionMap, ShuffleBuilder};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cluster = Cluster::load(Path::new("cluster.yaml")).unwrap();
//!     let records = load_shard(Path::new("input.dat"), None).unwrap();
//!     let partitions = PartitionMap::build(records, cluster.size());
//!
//!     let shuffle = ShuffleBuilder::new()
//!         .with_timeout(Duration::from_secs(600))
//!         .build(0, cluster)
//!         .unwrap();
//!     let output = shuffle.run(partitions).await.unwrap();
//!
//!     let merger = FinalMerger::new(None).unwrap();
//!     let sorted = merger.merge(output.received, output.local);
//!     write_shard(Path::new("output.dat"), &sorted, None).unwrap();
//! }
//! ```

pub mod aggregator;
pub mod cluster;
pub mod codec;
pub mod dispatcher;
pub mod listener;
pub mod merge;
pub mod partition;
pub mod record;
pub mod shard;
pub mod shuffle;

pub use aggregator::{aggregate, Aggregator};
pub use cluster::{Cluster, ConfigError, Node, NodeId};
pub use codec::{CodecError, Frame, FrameDecoder, Framing};
pub use dispatcher::{Backoff, Dispatcher};
pub use listener::Listener;
pub use merge::{FinalMerger, MergeError};
pub use partition::{partition_bits, partition_owner, PartitionMap};
pub use record::{Record, KEY_SIZE, RECORD_SIZE};
pub use shard::{load_shard, read_records, write_shard};
pub use shuffle::{Inbound, Shuffle, ShuffleBuilder, ShuffleError, ShuffleOutput};
