//! Length-prefixed TCP carrier.

use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, ErrorKind, Result},
    msg::Message,
    transport::{
        FRAME_HEADER_SIZE, Transport, TransportRx, TransportTx, decode_frame_header,
        encode_frame_header,
    },
};

const MAX_MSG_SIZE: usize = 64 << 20;

/// A connected TCP carrier. Each message travels as the 12-byte frame header
/// (packed header plus payload size) followed by the payload bytes.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    cancel: CancellationToken,
}

impl TcpTransport {
    /// # Errors
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, e.to_string()))?;
        Ok(Self::from_stream(stream))
    }

    /// Wraps an already-established stream (an accepted connection).
    #[must_use]
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            cancel: CancellationToken::new(),
        }
    }
}

impl Transport for TcpTransport {
    type Tx = TcpTx;
    type Rx = TcpRx;

    fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancel = token.child_token();
    }

    fn split(self) -> (Self::Tx, Self::Rx) {
        let (read_half, write_half) = self.stream.into_split();
        (
            TcpTx { stream: write_half },
            TcpRx {
                stream: read_half,
                buffer: BytesMut::with_capacity(4096),
                cancel: self.cancel,
            },
        )
    }
}

pub struct TcpTx {
    stream: OwnedWriteHalf,
}

impl TransportTx for TcpTx {
    async fn write(&mut self, message: Message) -> Result<()> {
        if message.payload.len() >= MAX_MSG_SIZE {
            return Err(Error::new(
                ErrorKind::TcpSendFailed,
                format!("message is too long: {}", message.payload.len()),
            ));
        }

        let head = encode_frame_header(message.header, message.payload.len() as u32);
        self.stream
            .write_all(&head)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpSendFailed, e.to_string()))?;
        self.stream
            .write_all(&message.payload)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpSendFailed, e.to_string()))
    }
}

pub struct TcpRx {
    stream: OwnedReadHalf,
    buffer: BytesMut,
    cancel: CancellationToken,
}

impl TcpRx {
    /// Extracts one complete message from the receive buffer, if present.
    fn parse_message(buffer: &mut BytesMut) -> Result<Option<Message>> {
        if buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let (header, payload_size) =
            decode_frame_header(buffer[..FRAME_HEADER_SIZE].try_into().unwrap());
        let payload_size = payload_size as usize;
        if payload_size >= MAX_MSG_SIZE {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                format!("message is too long: {payload_size}"),
            ));
        }
        if buffer.len() < FRAME_HEADER_SIZE + payload_size {
            return Ok(None);
        }

        buffer.advance(FRAME_HEADER_SIZE);
        let payload = buffer.split_to(payload_size).to_vec();
        Ok(Some(Message::new(header, payload)))
    }
}

impl TransportRx for TcpRx {
    async fn read(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = Self::parse_message(&mut self.buffer)? {
                return Ok(message);
            }

            let read = tokio::select! {
                () = self.cancel.cancelled() => return Err(Error::kind(ErrorKind::Cancelled)),
                read = self.stream.read_buf(&mut self.buffer) => read,
            };
            let n = read.map_err(|e| Error::new(ErrorKind::TcpRecvFailed, e.to_string()))?;
            if n == 0 {
                // A close between messages is an ordinary disconnect; inside
                // a frame it means the header or payload was cut short.
                return if self.buffer.is_empty() {
                    Err(Error::new(
                        ErrorKind::TcpRecvFailed,
                        "peer disconnected".to_string(),
                    ))
                } else {
                    Err(Error::new(
                        ErrorKind::ProtocolError,
                        format!("peer disconnected mid-frame with {} bytes", self.buffer.len()),
                    ))
                };
            }
        }
    }
}

/// Accepts inbound TCP carriers, one per client.
#[derive(Debug)]
pub struct TcpListener {
    inner: tokio::net::TcpListener,
}

impl TcpListener {
    /// # Errors
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;
        Ok(Self { inner })
    }

    /// # Errors
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))
    }

    /// Waits for the next client and wraps it into a transport.
    ///
    /// # Errors
    pub async fn accept(&self) -> Result<TcpTransport> {
        let (stream, _addr) = self
            .inner
            .accept()
            .await
            .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, e.to_string()))?;
        Ok(TcpTransport::from_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::{CallType, Header, MethodId};

    async fn connected_pair() -> (TcpTransport, TcpTransport) {
        let listener = TcpListener::bind(SocketAddr::from_str("127.0.0.1:0").unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpTransport::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (client, server) = connected_pair().await;
        let (mut tx, _) = client.split();
        let (_, mut rx) = server.split();

        for payload in [Vec::new(), b"hello".to_vec(), vec![7u8; 1 << 20]] {
            let message = Message::new(
                Header::new(3, CallType::Request, MethodId::from_name("echo")),
                payload,
            );
            tx.write(message.clone()).await.unwrap();
            assert_eq!(rx.read().await.unwrap(), message);
        }
    }

    #[tokio::test]
    async fn test_messages_do_not_interleave() {
        let (client, server) = connected_pair().await;
        let (mut tx, _) = client.split();
        let (_, mut rx) = server.split();

        let messages: Vec<_> = (0..16u32)
            .map(|i| {
                Message::new(
                    Header::new(i, CallType::VoidRequest, MethodId::from_name("burst")),
                    vec![i as u8; 1000],
                )
            })
            .collect();
        for message in &messages {
            tx.write(message.clone()).await.unwrap();
        }
        for message in &messages {
            assert_eq!(rx.read().await.unwrap(), *message);
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_a_read_error() {
        let (client, server) = connected_pair().await;
        drop(client);
        let (_, mut rx) = server.split();
        assert_eq!(rx.read().await.unwrap_err().kind, ErrorKind::TcpRecvFailed);
    }

    #[tokio::test]
    async fn test_short_frame_is_a_protocol_error() {
        let (client, server) = connected_pair().await;
        let (_, mut rx) = server.split();

        // Write half a frame header, then hang up.
        let (_, mut write_half) = client.stream.into_split();
        write_half.write_all(&[1, 2, 3, 4]).await.unwrap();
        drop(write_half);

        assert_eq!(rx.read().await.unwrap_err().kind, ErrorKind::ProtocolError);
    }
}
