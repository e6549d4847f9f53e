//! Length-framed TCP transport for the daemon's command channel.
//!
//! Each frame is a 4-byte unsigned big-endian length followed by that
//! many bytes of UTF-8. Both ends of the channel use this module, so the
//! framing can never drift apart.

use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};

use crate::error::SocketError;

/// Default timeout applied to client-side connections. Accepted
/// (server-side) connections run without an application timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Length of the frame header: a 4-byte big-endian body length.
const HEADER_LEN: usize = 4;

/// A TCP connection speaking length-prefixed UTF-8 frames.
#[derive(Debug)]
pub struct FramedConnection {
    stream: TcpStream,
    peer: SocketAddr,
    timeout: Option<Duration>,
}

impl FramedConnection {
    /// Connects to a daemon, applying [`DEFAULT_TIMEOUT`] to the connect
    /// and to every frame.
    pub async fn connect(addr: SocketAddr) -> Result<Self, SocketError> {
        Self::connect_with_timeout(addr, DEFAULT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, SocketError> {
        let stream = time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SocketError::ConnectTimeout)?
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::ConnectionRefused => SocketError::Refused,
                _ => SocketError::Io(error),
            })?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream,
            peer,
            timeout: Some(timeout),
        })
    }

    /// Wraps a connection accepted by the daemon's listener.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            timeout: None,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Sends one frame.
    pub async fn send(&mut self, message: &str) -> Result<(), SocketError> {
        let frame = encode_frame(message);
        match self.timeout {
            Some(timeout) =>
                time::timeout(timeout, self.stream.write_all(&frame))
                    .await
                    .map_err(|_| SocketError::SendTimeout)??,
            None => self.stream.write_all(&frame).await?,
        }
        Ok(())
    }

    /// Receives one frame. Returns `None` if the peer closed the
    /// connection, whether cleanly, mid-frame, or with a zero-length
    /// frame.
    pub async fn receive(&mut self) -> Result<Option<String>, SocketError> {
        match self.timeout {
            Some(timeout) => time::timeout(timeout, self.receive_frame())
                .await
                .map_err(|_| SocketError::ReceiveTimeout)?,
            None => self.receive_frame().await,
        }
    }

    async fn receive_frame(&mut self) -> Result<Option<String>, SocketError> {
        let mut header = [0u8; HEADER_LEN];
        let mut read = 0;
        while read < HEADER_LEN {
            let n = self.stream.read(&mut header[read..]).await?;
            if n == 0 {
                return Ok(None);
            }
            read += n;
        }

        let len = u64::from(u32::from_be_bytes(header));
        if len == 0 {
            return Ok(None);
        }

        let mut body = Vec::new();
        (&mut self.stream).take(len).read_to_end(&mut body).await?;
        if (body.len() as u64) < len {
            // The peer went away mid-frame.
            return Ok(None);
        }

        String::from_utf8(body)
            .map(Some)
            .map_err(|_| SocketError::Encoding)
    }

    /// Flushes and shuts down the write half of the connection.
    pub async fn close(&mut self) -> Result<(), SocketError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Prefixes `message` with its 4-byte big-endian length. The body must
/// fit the length prefix, i.e. be shorter than 4 GiB.
pub fn encode_frame(message: &str) -> Vec<u8> {
    let body = message.as_bytes();
    assert!(
        u32::try_from(body.len()).is_ok(),
        "Frame body exceeds the u32 length prefix"
    );
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    /// A listener whose accepted connections echo one frame back.
    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = listener.accept().await.unwrap();
                let mut connection =
                    FramedConnection::from_stream(stream, peer);
                tokio::spawn(async move {
                    if let Ok(Some(message)) = connection.receive().await {
                        connection.send(&message).await.unwrap();
                    }
                    let _ = connection.close().await;
                });
            }
        });
        addr
    }

    #[test]
    fn frame_layout() {
        assert_eq!(encode_frame(""), vec![0, 0, 0, 0]);
        assert_eq!(
            encode_frame("hi"),
            vec![0, 0, 0, 2, b'h', b'i'],
        );
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let addr = spawn_echo_server().await;
        let mut connection = FramedConnection::connect(addr).await.unwrap();

        let message = "héllo dæmon".repeat(100);
        connection.send(&message).await.unwrap();
        let echoed = connection.receive().await.unwrap();
        assert_eq!(echoed.as_deref(), Some(message.as_str()));
    }

    #[tokio::test]
    async fn clean_close_yields_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut connection = FramedConnection::connect(addr).await.unwrap();
        assert!(connection.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mid_frame_close_yields_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // A header promising 100 bytes, followed by only 3.
            stream.write_all(&100u32.to_be_bytes()).await.unwrap();
            stream.write_all(b"abc").await.unwrap();
            drop(stream);
        });

        let mut connection = FramedConnection::connect(addr).await.unwrap();
        assert!(connection.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_length_frame_reads_as_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&encode_frame("")).await.unwrap();
            // Keep the connection open so this cannot be mistaken for a
            // plain close.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let mut connection = FramedConnection::connect_with_timeout(
            addr,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert!(connection.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let mut connection = FramedConnection::connect_with_timeout(
            addr,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        let error = connection.receive().await.unwrap_err();
        assert!(matches!(error, SocketError::ReceiveTimeout));
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let error = FramedConnection::connect(addr).await.unwrap_err();
        assert!(matches!(error, SocketError::Refused));
    }
}
