//! TCP simulation transport talking to `car-sim`
//!
//! Each command is sent as one length-prefixed frame; the write completes
//! when the simulator answers with an ack byte, mirroring a GATT
//! write-with-response.

use crate::transport::traits::{CommandLink, Connection, LinkConnector, TransportError};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rabbit_shared::framing::{self, ACK_OK, ACK_REJECTED};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Writer half plus the acks read back by the reader task
struct TcpIo {
    writer: OwnedWriteHalf,
    acks: mpsc::UnboundedReceiver<u8>,
    /// Frames sent whose ack has not been read yet, including those of
    /// writes that were cancelled while waiting
    unacked: usize,
}

/// Command link over a TCP stream
pub struct TcpLink {
    io: Mutex<TcpIo>,
    write_timeout: Duration,
}

impl TcpLink {
    /// Wrap a connected stream, returning the link and its disconnect notification
    pub fn new(stream: TcpStream, write_timeout: Duration) -> (Self, oneshot::Receiver<String>) {
        let (reader, writer) = stream.into_split();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (disconnected_tx, disconnected_rx) = oneshot::channel();

        tokio::spawn(read_acks(reader, ack_tx, disconnected_tx));

        let link = Self {
            io: Mutex::new(TcpIo {
                writer,
                acks: ack_rx,
                unacked: 0,
            }),
            write_timeout,
        };
        (link, disconnected_rx)
    }
}

#[async_trait]
impl CommandLink for TcpLink {
    async fn write(&self, payload: Bytes) -> Result<(), TransportError> {
        let frame =
            framing::encode_frame(&payload).map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let deadline = Instant::now() + self.write_timeout;
        let mut io = self.io.lock().await;

        io.writer
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        io.unacked += 1;

        // The peer acks in order: ours is the last one still owed
        let ack = loop {
            match timeout_at(deadline, io.acks.recv()).await {
                Ok(Some(ack)) => {
                    io.unacked -= 1;
                    if io.unacked == 0 {
                        break ack;
                    }
                    debug!("[TCP] Discarding ack 0x{:02x} of an abandoned write", ack);
                }
                Ok(None) => return Err(TransportError::Disconnected),
                Err(_) => return Err(TransportError::Timeout(self.write_timeout)),
            }
        };

        match ack {
            ACK_OK => Ok(()),
            ACK_REJECTED => Err(TransportError::WriteFailed("rejected by peer".into())),
            other => Err(TransportError::WriteFailed(format!(
                "unexpected ack byte 0x{:02x}",
                other
            ))),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut io = self.io.lock().await;
        io.writer
            .shutdown()
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

/// Forward ack bytes until the stream closes, then report the disconnect
async fn read_acks(
    mut reader: OwnedReadHalf,
    ack_tx: mpsc::UnboundedSender<u8>,
    disconnected_tx: oneshot::Sender<String>,
) {
    let mut buf = [0u8; 64];
    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "peer closed connection".to_string(),
            Ok(n) => {
                for &byte in &buf[..n] {
                    let _ = ack_tx.send(byte);
                }
            }
            Err(e) => break format!("read error: {}", e),
        }
    };
    debug!("[TCP] Reader stopped: {}", reason);
    let _ = disconnected_tx.send(reason);
}

/// TCP connector for the car simulator
pub struct TcpConnector {
    address: String,
    write_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: String, write_timeout: Duration) -> Self {
        Self {
            address,
            write_timeout,
        }
    }
}

#[async_trait]
impl LinkConnector for TcpConnector {
    async fn connect(&self) -> Result<Connection> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| anyhow!("TCP connect to {} failed: {}", self.address, e))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("[TCP] Could not disable Nagle: {}", e);
        }

        let (link, disconnected) = TcpLink::new(stream, self.write_timeout);
        Ok(Connection {
            link: Arc::new(link),
            disconnected,
            peer: self.address.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rabbit_shared::framing::FrameDecoder;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// Accept one connection and answer each frame with the given ack bytes in turn
    async fn spawn_peer(acks: Vec<u8>) -> (String, mpsc::UnboundedReceiver<Bytes>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 256];
            let mut acks = acks.into_iter();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                decoder.extend(&buf[..n]);
                while let Ok(Some(frame)) = decoder.decode_next() {
                    let _ = frames_tx.send(frame);
                    match acks.next() {
                        Some(ack) => socket.write_all(&[ack]).await.unwrap(),
                        // Out of acks: hang up
                        None => return,
                    }
                }
            }
        });

        (addr, frames_rx)
    }

    #[tokio::test]
    async fn test_write_waits_for_ack() {
        let (addr, mut frames) = spawn_peer(vec![ACK_OK, ACK_REJECTED]).await;
        let connector = TcpConnector::new(addr, Duration::from_secs(1));
        let conn = connector.connect().await.expect("connect failed");

        conn.link
            .write(Bytes::from_static(b"running$ running:true"))
            .await
            .expect("first write should be acked");
        assert_eq!(frames.recv().await.unwrap().as_ref(), b"running$ running:true");

        let err = conn
            .link
            .write(Bytes::from_static(b"movement$ X:90,Y:0"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::WriteFailed("rejected by peer".into()));
    }

    #[tokio::test]
    async fn test_peer_hangup_reports_disconnect() {
        let (addr, _frames) = spawn_peer(vec![]).await;
        let connector = TcpConnector::new(addr, Duration::from_secs(1));
        let conn = connector.connect().await.expect("connect failed");

        let err = conn
            .link
            .write(Bytes::from_static(b"running$ running:false"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Disconnected);

        let reason = conn.disconnected.await.expect("no disconnect reported");
        assert_eq!(reason, "peer closed connection");
    }

    /// Accept one connection and ack the first `acked` frames, each after `delay`
    async fn spawn_slow_peer(delay: Duration, acked: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 256];
            let mut seen = 0;
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                decoder.extend(&buf[..n]);
                while let Ok(Some(_)) = decoder.decode_next() {
                    seen += 1;
                    if seen <= acked {
                        tokio::time::sleep(delay).await;
                        socket.write_all(&[ACK_OK]).await.unwrap();
                    }
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_late_ack_of_cancelled_write_not_credited() {
        // Only the first frame is ever acked, and late
        let addr = spawn_slow_peer(Duration::from_millis(100), 1).await;
        let connector = TcpConnector::new(addr, Duration::from_millis(300));
        let conn = connector.connect().await.expect("connect failed");

        let cancelled = timeout(
            Duration::from_millis(20),
            conn.link.write(Bytes::from_static(b"running$ running:true")),
        )
        .await;
        assert!(cancelled.is_err());

        let stop = conn
            .link
            .write(Bytes::from_static(b"running$ running:false"))
            .await;
        assert_eq!(stop, Err(TransportError::Timeout(Duration::from_millis(300))));
    }

    #[tokio::test]
    async fn test_write_after_cancelled_write_gets_its_own_ack() {
        let addr = spawn_slow_peer(Duration::from_millis(100), usize::MAX).await;
        let connector = TcpConnector::new(addr, Duration::from_secs(1));
        let conn = connector.connect().await.expect("connect failed");

        let cancelled = timeout(
            Duration::from_millis(20),
            conn.link.write(Bytes::from_static(b"movement$ X:90,Y:0")),
        )
        .await;
        assert!(cancelled.is_err());

        let started = tokio::time::Instant::now();
        conn.link
            .write(Bytes::from_static(b"running$ running:false"))
            .await
            .expect("second frame should be acked");
        // Both acks were consumed, the second one about 100ms after the first
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = TcpConnector::new(addr, Duration::from_secs(1));
        assert!(connector.connect().await.is_err());
        assert_eq!(connector.name(), "TCP");
    }
}
