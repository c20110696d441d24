//! Incoming partition streams.

use log;
use std::io;
use std::net::SocketAddr;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::codec::{FrameDecoder, Framing};
use crate::shuffle::{Inbound, ShuffleError};

const DEFAULT_READ_BUF_SIZE: usize = 64 * 1024;

/// Accepts peer connections and forwards decoded frames onto the aggregation channel.
pub struct Listener {
    inner: TcpListener,
    framing: Framing,
    buf_size: usize,
}

impl Listener {
    /// Binds the listening socket. Peers can connect as soon as this returns.
    pub async fn bind(addr: &str, framing: Framing, buf_size: Option<usize>) -> Result<Self, ShuffleError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|err| ShuffleError::Bind(addr.to_string(), err))?;

        match inner.local_addr() {
            Ok(local_addr) => log::info!("listening on {}", local_addr),
            Err(_) => log::info!("listening on {}", addr),
        }

        return Ok(Listener {
            inner,
            framing,
            buf_size: buf_size.unwrap_or(DEFAULT_READ_BUF_SIZE).max(1),
        });
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts connections until the channel is closed or accepting fails.
    ///
    /// Every connection is decoded by its own task. A connection error is sent onto the channel in place of the
    /// frames the connection could not deliver.
    pub async fn serve(self, tx: mpsc::Sender<Inbound>) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.inner.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        log::debug!("accepted connection from {}", peer_addr);
                        let tx = tx.clone();
                        let framing = self.framing;
                        let buf_size = self.buf_size;
                        connections.spawn(async move {
                            if let Err(err) = receive(stream, peer_addr, framing, buf_size, &tx).await {
                                let _ = tx.send(Err(err)).await;
                            }
                        });
                    }
                    Err(err) => {
                        let _ = tx.send(Err(ShuffleError::Accept(err))).await;
                        return;
                    }
                },
                Some(_) = connections.join_next() => {}
                _ = tx.closed() => return,
            }
        }
    }
}

/// Decodes one connection until the remote side closes it.
async fn receive(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    framing: Framing,
    buf_size: usize,
    tx: &mpsc::Sender<Inbound>,
) -> Result<(), ShuffleError> {
    let mut decoder = FrameDecoder::new(framing);
    let mut buf = vec![0u8; buf_size];
    let mut frames = 0usize;

    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|err| ShuffleError::Receive(peer_addr, err))?;
        if n == 0 {
            break;
        }

        decoder.extend(&buf[..n]);
        while let Some(frame) = decoder.decode().map_err(|err| ShuffleError::Decode(peer_addr, err))? {
            if tx.send(Ok(frame)).await.is_err() {
                // aggregation is over
                return Ok(());
            }
            frames += 1;
        }
    }

    if let Err(err) = decoder.finish() {
        log::warn!("connection from {} closed: {}", peer_addr, err);
    }
    if decoder.is_finished() {
        log::debug!("connection from {} completed ({} frames)", peer_addr, frames);
    } else {
        log::warn!(
            "connection from {} closed without end of stream after {} frames, its sender will never complete",
            peer_addr,
            frames
        );
    }

    return Ok(());
}
