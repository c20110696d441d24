//! Outgoing partition streams.

use log;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use crate::cluster::{Node, NodeId};
use crate::codec::Framing;
use crate::record::{Record, RECORD_SIZE};
use crate::shuffle::ShuffleError;

/// Shortest delay between two connection attempts.
pub const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Connection retry delays: start with `initial`, double after every failed attempt, never exceed `max`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    /// Creates a backoff policy. Delays shorter than [`MIN_BACKOFF`] are raised to it.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(MIN_BACKOFF);
        Backoff {
            initial,
            max: max.max(initial),
        }
    }

    /// Returns the delay following the given one.
    pub fn next(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).clamp(self.initial, self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_millis(10), Duration::from_secs(1))
    }
}

/// Sends partitions to peers.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    local: NodeId,
    framing: Framing,
    backoff: Backoff,
    buf_size: Option<usize>,
}

impl Dispatcher {
    /// Creates a dispatcher sending on behalf of the `local` node.
    pub fn new(local: NodeId, framing: Framing, backoff: Backoff, buf_size: Option<usize>) -> Self {
        Dispatcher {
            local,
            framing,
            backoff,
            buf_size,
        }
    }

    /// Delivers the records to the peer followed by a single end-of-stream frame.
    /// Returns the number of records sent.
    ///
    /// The peer is dialed until it accepts the connection. Once the stream is written the write side is shut down
    /// and the call returns only after the peer closes the connection, so nothing written is lost on close.
    pub async fn dispatch(&self, peer: &Node, records: Vec<Record>) -> Result<usize, ShuffleError> {
        let stream = self.connect(peer).await;
        let send_err = |err| ShuffleError::Send(peer.id, err);

        let mut writer = match self.buf_size {
            Some(buf_size) => BufWriter::with_capacity(buf_size, stream),
            None => BufWriter::new(stream),
        };

        let mut frame = Vec::with_capacity(RECORD_SIZE + 1);
        for record in &records {
            frame.clear();
            self.framing.encode_record(record, &mut frame);
            writer.write_all(&frame).await.map_err(send_err)?;
        }

        frame.clear();
        self.framing.encode_end(self.local, &mut frame);
        writer.write_all(&frame).await.map_err(send_err)?;
        writer.flush().await.map_err(send_err)?;
        writer.shutdown().await.map_err(send_err)?;

        log::debug!("sent {} records to server {}, waiting for close", records.len(), peer.id);
        let mut stream = writer.into_inner();
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => log::warn!("server {} unexpectedly sent {} bytes", peer.id, n),
                Err(err) => {
                    // the end of stream is already flushed, a reset here does not lose data
                    log::debug!("server {} closed connection abruptly: {}", peer.id, err);
                    break;
                }
            }
        }

        log::info!("partition delivered to server {} ({} records)", peer.id, records.len());
        return Ok(records.len());
    }

    /// Dials the peer until a connection is established.
    async fn connect(&self, peer: &Node) -> TcpStream {
        let address = peer.address();
        let mut delay = self.backoff.initial;
        let mut attempt = 1u64;

        loop {
            match TcpStream::connect(&address).await {
                Ok(stream) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        log::debug!("TCP_NODELAY not set for {}: {}", address, err);
                    }
                    log::debug!("connected to server {} at {} (attempt {})", peer.id, address, attempt);
                    return stream;
                }
                Err(err) => {
                    log::debug!(
                        "server {} at {} not reachable (attempt {}): {}, retrying in {:?}",
                        peer.id,
                        address,
                        attempt,
                        err,
                        delay
                    );
                }
            }

            tokio::time::sleep(delay).await;
            delay = self.backoff.next(delay);
            attempt += 1;
        }
    }
}
