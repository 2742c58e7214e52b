//! Typed frame transport over a TCP socket.
//!
//! Owns the stream, the incremental decoder and the read buffer. The
//! protocol state machine holds the transport exclusively until a session
//! reaches READY, at which point a shared handle is passed to the
//! data-plane; REPLACING swaps the whole transport for a new one.

use crate::error::ProtoError;
use bytes::BytesMut;
use msgr_wire::{Frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

/// Shared handle used once the data-plane co-owns the socket
pub type SharedTransport = Arc<Mutex<FrameTransport>>;

/// A TCP stream speaking typed msgr frames
#[derive(Debug)]
pub struct FrameTransport {
    stream: TcpStream,
    decoder: FrameDecoder,
    read_buf: BytesMut,
    peer_addr: SocketAddr,
    valid: bool,
}

impl FrameTransport {
    /// Wrap an accepted stream
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            read_buf: BytesMut::with_capacity(64 * 1024),
            peer_addr,
            valid: true,
        })
    }

    /// Dial a peer
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream)
    }

    /// Address of the remote end
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The socket exists and has not been shut down
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Send one frame
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), ProtoError> {
        let bytes = frame.encode(DEFAULT_MAX_FRAME_SIZE)?;
        self.stream.write_all(&bytes).await?;
        trace!(peer = %self.peer_addr, typ = %frame.typ, len = bytes.len(), "sent frame");
        Ok(())
    }

    /// Receive one frame, reading more bytes as needed.
    ///
    /// Partial reads stay in the internal buffer, so dropping a pending
    /// receive is harmless.
    pub async fn recv_frame(&mut self) -> Result<Frame, ProtoError> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                trace!(peer = %self.peer_addr, typ = %frame.typ, "received frame");
                return Ok(frame);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                self.valid = false;
                return Err(ProtoError::ClosedByPeer);
            }
        }
    }

    /// Receive one frame within a handshake window
    pub async fn recv_frame_timeout(
        &mut self,
        window: Duration,
        phase: &'static str,
    ) -> Result<Frame, ProtoError> {
        match tokio::time::timeout(window, self.recv_frame()).await {
            Ok(result) => result,
            Err(_) => Err(ProtoError::Timeout(phase)),
        }
    }

    /// Shut down the socket; subsequent sends and receives fail
    pub async fn shutdown(&mut self) {
        self.valid = false;
        let _ = self.stream.shutdown().await;
    }

    /// Wrap into the shared handle handed to the data-plane
    pub fn into_shared(self) -> SharedTransport {
        Arc::new(Mutex::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use msgr_wire::FrameType;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut transport = FrameTransport::new(socket).unwrap();
            transport.recv_frame().await.unwrap()
        });

        let mut client = FrameTransport::connect(bound).await.unwrap();
        let frame = Frame::new(FrameType::Keepalive, Bytes::from_static(b"ping"));
        client.send_frame(&frame).await.unwrap();

        let received = timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn test_recv_timeout_reports_phase() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();

        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut client = FrameTransport::connect(bound).await.unwrap();
        let err = client
            .recv_frame_timeout(Duration::from_millis(50), "banner_exchange")
            .await
            .unwrap_err();
        assert!(matches!(err, ProtoError::Timeout("banner_exchange")));
    }

    #[tokio::test]
    async fn test_peer_close_is_distinct_error() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut client = FrameTransport::connect(bound).await.unwrap();
        let err = client.recv_frame().await.unwrap_err();
        assert!(matches!(err, ProtoError::ClosedByPeer));
        assert!(!client.is_valid());
    }
}
