use crate::codec::Codec;
use crate::error::{FramingError, ServiceError};
use crate::protocol::Message;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One framed TCP session.
///
/// A reader task decodes frames into a channel so `recv` can sit inside
/// `select!` safely. A single writer task owns the write half; every
/// `FrameSender` feeds it already-encoded frames, so concurrent senders never
/// interleave bytes.
pub struct Connection {
    peer: SocketAddr,
    inbound: mpsc::Receiver<Result<Message, FramingError>>,
    sender: FrameSender,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    pub fn new(stream: TcpStream, codec: Codec, buffer: usize) -> Result<Self, ServiceError> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();
        let buffer = buffer.max(1);

        let (inbound_tx, inbound) = mpsc::channel(buffer);
        let reader = tokio::spawn(async move {
            loop {
                match codec.read_frame(&mut read_half).await {
                    Ok(Some(message)) => {
                        if inbound_tx.send(Ok(message)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = inbound_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let (outbound_tx, mut outbound) = mpsc::channel::<Vec<u8>>(buffer);
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    warn!("Write to {} failed: {}", peer, e);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
            debug!("Writer for {} finished", peer);
        });

        Ok(Self {
            peer,
            inbound,
            sender: FrameSender {
                codec,
                tx: outbound_tx,
            },
            reader,
            writer,
        })
    }

    pub async fn connect(addr: SocketAddr, codec: Codec, buffer: usize) -> Result<Self, ServiceError> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream, codec, buffer)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub async fn send(&self, message: &Message) -> Result<(), ServiceError> {
        self.sender.send(message).await
    }

    /// Stop both I/O tasks without flushing queued frames. Senders see
    /// `ConnectionClosed` from then on.
    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }

    /// Next inbound message. `None` once the peer closed the stream cleanly.
    pub async fn recv(&mut self) -> Option<Result<Message, FramingError>> {
        self.inbound.recv().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Cloneable handle that queues frames for the connection's writer task.
#[derive(Clone)]
pub struct FrameSender {
    codec: Codec,
    tx: mpsc::Sender<Vec<u8>>,
}

impl FrameSender {
    /// Encode in the caller's task, then queue. An encoding failure affects
    /// only this message, never the connection.
    pub async fn send(&self, message: &Message) -> Result<(), ServiceError> {
        let frame = self.codec.encode(message)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| ServiceError::ConnectionClosed)
    }

    /// Queue a frame produced by `Codec::encode`.
    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ServiceError> {
        self.tx.send(frame).await.map_err(|_| ServiceError::ConnectionClosed)
    }

    /// Queue without waiting. A full queue means the peer stopped reading.
    pub fn try_send(&self, message: &Message) -> Result<(), ServiceError> {
        let frame = self.codec.encode(message)?;
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ServiceError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => ServiceError::ConnectionClosed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
